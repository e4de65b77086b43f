// Process CPU session
// Session that samples per-process CPU time from /proc

use crate::components::profile::{ProfileSample, Session, SessionError, SessionOptions, Target, PID_LABEL};

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use tracing::debug;

/// CPU ticks of one process as read from `/proc/<pid>/stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTicks {
    pub user: u64,
    pub system: u64,
}

/// Parse the command name and CPU ticks out of a `stat` line
pub fn parse_stat(stat: &str) -> Option<(String, CpuTicks)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let comm = stat.get(open + 1..close)?.to_string();
    let fields: Vec<&str> = stat.get(close + 1..)?.split_whitespace().collect();
    // fields[0] is the state (field 3); utime and stime are fields 14 and 15
    let user = fields.get(11)?.parse().ok()?;
    let system = fields.get(12)?.parse().ok()?;
    Some((comm, CpuTicks { user, system }))
}

/// Reports, for every target with a pid label, the CPU ticks spent since the
/// previous collection as a single `<comm>;user` and `<comm>;kernel` stack.
pub struct ProcSession {
    root: PathBuf,
    options: SessionOptions,
    targets: BTreeMap<u32, Target>,
    previous: BTreeMap<u32, CpuTicks>,
    collections: u64,
}

impl Default for ProcSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcSession {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            options: SessionOptions::default(),
            targets: BTreeMap::new(),
            previous: BTreeMap::new(),
            collections: 0,
        }
    }

    fn read(&self, pid: u32) -> Result<Option<(String, CpuTicks)>, SessionError> {
        let path = self.root.join(pid.to_string()).join("stat");
        match fs::read_to_string(&path) {
            Ok(stat) => Ok(parse_stat(&stat)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SessionError::new(format!("reading {}: {}", path.display(), e))),
        }
    }
}

impl Session for ProcSession {
    fn collect_profiles(
        &mut self,
        sink: &mut dyn FnMut(ProfileSample),
    ) -> Result<(), SessionError> {
        self.collections += 1;
        let mut current = BTreeMap::new();

        for (pid, target) in &self.targets {
            let Some((comm, ticks)) = self.read(*pid)? else {
                debug!(pid, "target process is gone");
                continue;
            };
            current.insert(*pid, ticks);

            // The first observation only establishes a baseline
            let Some(before) = self.previous.get(pid) else {
                continue;
            };
            let mut emit = |kind: &str, value: u64| {
                if value > 0 {
                    sink(ProfileSample {
                        target: target.clone(),
                        stack: vec![comm.clone(), kind.to_string()],
                        value,
                    });
                }
            };
            if self.options.collect_user_profile {
                emit("user", ticks.user.saturating_sub(before.user));
            }
            if self.options.collect_kernel_profile {
                emit("kernel", ticks.system.saturating_sub(before.system));
            }
        }

        self.previous = current;
        Ok(())
    }

    fn update(&mut self, options: SessionOptions) -> Result<(), SessionError> {
        if options.sample_rate == 0 {
            return Err(SessionError::new("sample rate must be greater than 0"));
        }
        self.options = options;
        Ok(())
    }

    fn update_targets(&mut self, targets: &[Target]) {
        self.targets = targets
            .iter()
            .filter_map(|t| {
                let pid = t.get(PID_LABEL)?.parse().ok()?;
                Some((pid, t.clone()))
            })
            .collect();
        self.previous.retain(|pid, _| self.targets.contains_key(pid));
    }

    fn debug_info(&self) -> serde_json::Value {
        serde_json::json!({
            "root": self.root.display().to_string(),
            "pids": self.targets.keys().collect::<Vec<_>>(),
            "collections": self.collections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn write_stat(root: &TempDir, pid: u32, user: u64, system: u64) {
        let dir = root.path().join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("stat"),
            format!(
                "{} (my app) S 1 1 1 0 -1 4194560 100 0 0 0 {} {} 0 0 20 0 1 0 100 0 0\n",
                pid, user, system
            ),
        )
        .unwrap();
    }

    fn target(pid: u32) -> Target {
        [
            (PID_LABEL.to_string(), pid.to_string()),
            ("service_name".to_string(), "app".to_string()),
        ]
        .into()
    }

    fn collect(session: &mut ProcSession) -> Vec<ProfileSample> {
        let mut samples = Vec::new();
        session
            .collect_profiles(&mut |s| samples.push(s))
            .unwrap();
        samples
    }

    #[test]
    fn test_parse_stat() {
        let (comm, ticks) =
            parse_stat("42 (a) b) R 1 1 1 0 -1 0 0 0 0 0 7 3 0 0 20 0 1 0").unwrap();
        assert_eq!(comm, "a) b");
        assert_eq!(ticks, CpuTicks { user: 7, system: 3 });
        assert!(parse_stat("garbage").is_none());
    }

    #[test]
    fn test_deltas_between_collections() {
        let root = TempDir::new().unwrap();
        write_stat(&root, 10, 100, 50);

        let mut session = ProcSession::with_root(root.path());
        session.update_targets(&[target(10), target(11)]);
        assert!(collect(&mut session).is_empty());

        write_stat(&root, 10, 130, 55);
        let samples = collect(&mut session);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].stack, vec!["my app".to_string(), "user".to_string()]);
        assert_eq!(samples[0].value, 30);
        assert_eq!(samples[1].value, 5);

        session
            .update(SessionOptions {
                collect_kernel_profile: false,
                ..SessionOptions::default()
            })
            .unwrap();
        write_stat(&root, 10, 140, 70);
        let samples = collect(&mut session);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 10);
    }

    #[test]
    fn test_rejects_zero_sample_rate() {
        let mut session = ProcSession::new();
        let err = session
            .update(SessionOptions {
                sample_rate: 0,
                ..SessionOptions::default()
            })
            .unwrap_err();
        assert!(err.message.contains("sample rate"));
    }
}
