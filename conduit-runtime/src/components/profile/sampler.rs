// profile.sampler
// Periodically collects profiles from a session and forwards them

use crate::component::{Arguments, Body, Component, ComponentError, DecodeError, Options};
use crate::components::profile::proc_session::ProcSession;
use crate::components::profile::{
    fanout_profiles, Profile, ProfileSample, ProfilesReceiver, Session, SessionError,
    SessionOptions, Target,
};
use crate::controller::health::Health;
use crate::value::Value;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const NAME: &str = "profile.sampler";

pub const DEFAULT_COLLECT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct SamplerArguments {
    pub targets: Vec<Target>,
    pub forward_to: Vec<Arc<ProfilesReceiver>>,
    pub collect_interval: Duration,
    pub session: SessionOptions,
}

impl Default for SamplerArguments {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            forward_to: Vec::new(),
            collect_interval: DEFAULT_COLLECT_INTERVAL,
            session: SessionOptions::default(),
        }
    }
}

impl Arguments for SamplerArguments {
    fn decode(body: &Body<'_>) -> Result<Self, DecodeError> {
        body.check_known(&[
            "targets",
            "forward_to",
            "collect_interval",
            "sample_rate",
            "collect_user_profile",
            "collect_kernel_profile",
        ])?;
        let defaults = SessionOptions::default();

        let collect_interval = body.duration_or("collect_interval", DEFAULT_COLLECT_INTERVAL)?;
        if collect_interval.is_zero() {
            return Err(DecodeError::invalid("collect_interval", "must be greater than 0"));
        }

        let sample_rate = body.i64_or("sample_rate", i64::from(defaults.sample_rate))?;
        let sample_rate = u32::try_from(sample_rate)
            .ok()
            .filter(|rate| *rate > 0)
            .ok_or_else(|| DecodeError::invalid("sample_rate", "must be greater than 0"))?;

        let targets = body
            .list("targets")?
            .iter()
            .map(decode_target)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            targets,
            forward_to: body.capsules::<ProfilesReceiver>("forward_to")?,
            collect_interval,
            session: SessionOptions {
                sample_rate,
                collect_user_profile: body
                    .bool_or("collect_user_profile", defaults.collect_user_profile)?,
                collect_kernel_profile: body
                    .bool_or("collect_kernel_profile", defaults.collect_kernel_profile)?,
            },
        })
    }
}

fn decode_target(value: &Value) -> Result<Target, DecodeError> {
    let wrong = |found: &'static str| DecodeError::WrongType {
        attr: "targets".to_string(),
        expected: "a list of string maps",
        found,
    };
    let Value::Object(fields) = value else {
        return Err(wrong(value.kind()));
    };
    fields
        .iter()
        .map(|(k, v)| match v {
            Value::String(s) => Ok((k.clone(), s.clone())),
            Value::Number(_) | Value::Bool(_) => Ok((k.clone(), v.as_string())),
            other => Err(wrong(other.kind())),
        })
        .collect()
}

pub struct ProfileSampler {
    id: String,
    session: Arc<Mutex<Box<dyn Session>>>,
    arguments: watch::Sender<SamplerArguments>,
    health: RwLock<Health>,
    session_debug: RwLock<serde_json::Value>,
    collections: Mutex<u64>,
}

impl ProfileSampler {
    /// Sampler over the built-in `/proc` session
    pub fn new(opts: Options, args: SamplerArguments) -> Result<Self, ComponentError> {
        Self::with_session(opts, args, Box::new(ProcSession::new()))
    }

    pub fn with_session(
        opts: Options,
        args: SamplerArguments,
        mut session: Box<dyn Session>,
    ) -> Result<Self, ComponentError> {
        session
            .update(args.session)
            .map_err(|e| ComponentError::new(format!("session update: {}", e)))?;
        session.update_targets(&args.targets);
        let session_debug = session.debug_info();

        Ok(Self {
            id: opts.id,
            session: Arc::new(Mutex::new(session)),
            arguments: watch::channel(args).0,
            health: RwLock::new(Health::unknown()),
            session_debug: RwLock::new(session_debug),
            collections: Mutex::new(0),
        })
    }

    pub fn collections(&self) -> u64 {
        *self.collections.lock()
    }

    fn set_health(&self, health: Health) {
        *self.health.write() = health;
    }

    /// Push new options and targets into the session, between collections
    async fn apply(&self, args: &SamplerArguments) -> Result<(), SessionError> {
        let session = self.session.clone();
        let options = args.session;
        let targets = args.targets.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SessionError> {
            let mut session = session.lock();
            session.update(options)?;
            session.update_targets(&targets);
            Ok(())
        })
        .await
        .map_err(|e| SessionError::new(format!("session task failed: {}", e)))?
    }

    /// Run one collection; `None` if cancelled first
    async fn collect(&self, cancel: &CancellationToken) -> Option<Result<Vec<ProfileSample>, SessionError>> {
        let session = self.session.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut session = session.lock();
            let mut samples = Vec::new();
            let result = session.collect_profiles(&mut |sample| samples.push(sample));
            (result.map(|()| samples), session.debug_info())
        });

        let joined = tokio::select! {
            _ = cancel.cancelled() => return None,
            joined = task => joined,
        };
        match joined {
            Ok((result, debug)) => {
                *self.session_debug.write() = debug;
                Some(result)
            }
            Err(e) => Some(Err(SessionError::new(format!("collection task failed: {}", e)))),
        }
    }

    async fn collect_and_forward(&self, args: &SamplerArguments, cancel: &CancellationToken) -> bool {
        let Some(result) = self.collect(cancel).await else {
            return false;
        };
        *self.collections.lock() += 1;

        match result {
            Ok(samples) => {
                let profiles = Profile::aggregate(samples, Utc::now());
                debug!(component = %self.id, profiles = profiles.len(), "collected profiles");
                fanout_profiles(&args.forward_to, profiles).await;
                self.set_health(Health::healthy("collected profiles"));
            }
            Err(e) => {
                error!(component = %self.id, error = %e, "failed to collect profiles");
                self.set_health(Health::unhealthy(format!("session collect_profiles: {}", e)));
            }
        }
        true
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[async_trait]
impl Component for ProfileSampler {
    type Arguments = SamplerArguments;

    async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), ComponentError> {
        let mut updates = self.arguments.subscribe();
        let mut args = updates.borrow_and_update().clone();
        let mut collect = ticker(args.collect_interval);
        info!(component = %self.id, interval = ?args.collect_interval, "profile sampler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                changed = updates.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    let next = updates.borrow_and_update().clone();
                    if let Err(e) = self.apply(&next).await {
                        error!(component = %self.id, error = %e, "failed to update session");
                        self.set_health(Health::unhealthy(format!("session update: {}", e)));
                    }
                    if next.collect_interval != args.collect_interval {
                        collect = ticker(next.collect_interval);
                    }
                    args = next;
                }
                _ = collect.tick() => {
                    if !self.collect_and_forward(&args, &cancel).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Never waits for an in-flight collection; the latest arguments win.
    async fn update(&self, args: SamplerArguments) -> Result<(), ComponentError> {
        self.arguments.send_replace(args);
        Ok(())
    }

    fn current_health(&self) -> Option<Health> {
        Some(self.health.read().clone())
    }

    fn debug_info(&self) -> Option<serde_json::Value> {
        let args = self.arguments.borrow();
        Some(serde_json::json!({
            "targets": args.targets,
            "options": args.session,
            "collections": self.collections(),
            "session": self.session_debug.read().clone(),
        }))
    }
}
