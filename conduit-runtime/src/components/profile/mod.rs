// Profiling
// Profile types, the session contract samplers drive, and the profile channel handle

pub mod proc_session;
pub mod sampler;

use crate::value::{Capsule, Value};

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Labels identifying one profiled process or container
pub type Target = BTreeMap<String, String>;

/// Label carrying the process id of a target
pub const PID_LABEL: &str = "__process_pid__";

/// Capacity of each profile receiver channel
pub const PROFILES_CAPACITY: usize = 64;

/// One observed stack for one target
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileSample {
    pub target: Target,
    /// Outermost frame first
    pub stack: Vec<String>,
    pub value: u64,
}

/// Samples of one target from one collection, aggregated by stack
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub target: Target,
    pub collected_at: DateTime<Utc>,
    pub samples: BTreeMap<Vec<String>, u64>,
}

impl Profile {
    /// Group samples per target, summing values of identical stacks
    pub fn aggregate(samples: Vec<ProfileSample>, collected_at: DateTime<Utc>) -> Vec<Profile> {
        let mut by_target: BTreeMap<Target, BTreeMap<Vec<String>, u64>> = BTreeMap::new();
        for sample in samples {
            *by_target
                .entry(sample.target)
                .or_default()
                .entry(sample.stack)
                .or_default() += sample.value;
        }
        by_target
            .into_iter()
            .map(|(target, samples)| Profile {
                target,
                collected_at,
                samples,
            })
            .collect()
    }

    pub fn total(&self) -> u64 {
        self.samples.values().sum()
    }
}

/// Settings pushed into a session on every update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionOptions {
    /// Samples per second
    pub sample_rate: u32,
    pub collect_user_profile: bool,
    pub collect_kernel_profile: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            sample_rate: 97,
            collect_user_profile: true,
            collect_kernel_profile: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SessionError {
    pub message: String,
}

impl SessionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A profiling backend.
///
/// Calls may block; the sampler runs them on the blocking pool and never
/// calls two of them at once.
pub trait Session: Send + 'static {
    /// Report everything gathered since the previous call through `sink`
    fn collect_profiles(
        &mut self,
        sink: &mut dyn FnMut(ProfileSample),
    ) -> Result<(), SessionError>;

    fn update(&mut self, options: SessionOptions) -> Result<(), SessionError>;

    fn update_targets(&mut self, targets: &[Target]);

    fn debug_info(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Write side of a profile channel, passed in `forward_to`
#[derive(Debug, Clone)]
pub struct ProfilesReceiver {
    sender: mpsc::Sender<Profile>,
}

impl ProfilesReceiver {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Profile>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    pub async fn send(&self, profile: Profile) -> bool {
        self.sender.send(profile).await.is_ok()
    }

    pub fn into_value(self) -> Value {
        Value::Capsule(Capsule::new(self))
    }
}

pub async fn fanout_profiles(forward_to: &[Arc<ProfilesReceiver>], profiles: Vec<Profile>) {
    for profile in profiles {
        for receiver in forward_to {
            if !receiver.send(profile.clone()).await {
                debug!("dropping profile for closed receiver");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str) -> Target {
        [("service_name".to_string(), name.to_string())].into()
    }

    fn sample(t: &str, stack: &[&str], value: u64) -> ProfileSample {
        ProfileSample {
            target: target(t),
            stack: stack.iter().map(|s| s.to_string()).collect(),
            value,
        }
    }

    #[test]
    fn test_aggregate_by_target_and_stack() {
        let profiles = Profile::aggregate(
            vec![
                sample("a", &["main", "work"], 1),
                sample("a", &["main", "work"], 2),
                sample("a", &["main", "idle"], 1),
                sample("b", &["main"], 5),
            ],
            Utc::now(),
        );
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].target, target("a"));
        assert_eq!(profiles[0].samples.len(), 2);
        assert_eq!(profiles[0].total(), 4);
        assert_eq!(profiles[1].total(), 5);
    }

    #[test]
    fn test_default_session_options() {
        let options = SessionOptions::default();
        assert_eq!(options.sample_rate, 97);
        assert!(options.collect_user_profile);
        assert!(options.collect_kernel_profile);
    }
}
