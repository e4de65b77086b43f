use crate::output;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use color_eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use conduit_runtime::{
    default_registry, event_channel, Controller, ControllerConfig, ControllerEvent,
    ControllerEventReceiver, LoadError, RuntimeError, UpdateReport,
};

/// Run a pipeline configuration until interrupted
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the pipeline configuration YAML file
    pub config: PathBuf,

    /// Directory for per-component state (default: local data directory)
    #[arg(long, value_name = "DIR")]
    pub storage_path: Option<PathBuf>,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let config_path = &args.config;

    if !config_path.exists() {
        color_eyre::eyre::bail!("Configuration file not found: {}", config_path.display());
    }

    let (events_tx, mut events) = event_channel();
    let mut config = ControllerConfig::default().with_events(events_tx);
    if let Some(dir) = &args.storage_path {
        config = config.with_data_path(dir);
    }
    let controller = Arc::new(Controller::new(config, default_registry())?);

    output::status("Loading", &format!("{}", config_path.display()));
    let report = match controller.load_file(config_path).await {
        Ok(report) => report,
        Err(err) => {
            report_error(&err);
            std::process::exit(1);
        }
    };
    drain_events(&mut events);
    output::success(&format!(
        "Loaded {} nodes, started {} components",
        controller.order().len(),
        report.started.len()
    ));

    let cancel = CancellationToken::new();
    let running = {
        let controller = controller.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { controller.run(cancel).await })
    };

    let mut reload = ReloadSignal::new()?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                output::status("Stopping", "waiting for components to exit");
                cancel.cancel();
                break;
            }
            _ = reload.recv() => {
                info!(config = %config_path.display(), "reload requested");
                reload_config(&controller, config_path).await;
            }
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
        }
    }

    running.await??;
    drain_events(&mut events);
    output::success("All components stopped");

    Ok(())
}

async fn reload_config(controller: &Controller, path: &Path) {
    output::status("Reloading", &format!("{}", path.display()));
    match controller.update_file(path).await {
        Ok(report) => print_update(&report),
        Err(err) => {
            report_error(&err);
            output::warning("Keeping the running configuration");
        }
    }
}

fn print_update(report: &UpdateReport) {
    if report.is_noop() {
        output::info("Configuration unchanged");
        return;
    }
    output::header(&format!(
        "Update: {} added, {} removed, {} changed",
        report.added.len(),
        report.removed.len(),
        report.changed.len()
    ));
    for failure in &report.pass.failed {
        output::failure(&failure.to_string());
    }
    for id in &report.pass.skipped {
        output::warning(&format!("{} skipped", id));
    }
}

fn report_error(err: &RuntimeError) {
    match err {
        RuntimeError::Load(LoadError::Structural(errors)) => {
            output::error(&format!("{} configuration error(s):", errors.len()));
            for error in errors {
                output::error(&format!("  - {}", error));
            }
        }
        RuntimeError::Load(LoadError::Evaluation(failures)) => {
            output::error(&format!("{} node(s) failed to evaluate:", failures.len()));
            for failure in failures {
                output::error(&format!("  - {}", failure));
            }
        }
        other => output::error(&other.to_string()),
    }
}

fn drain_events(events: &mut ControllerEventReceiver) {
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
}

fn print_event(event: &ControllerEvent) {
    match event {
        ControllerEvent::NodeEvaluated { node_id } => {
            output::dim(&format!("    evaluated {}", node_id));
        }
        ControllerEvent::NodeEvaluationFailed { node_id, error } => {
            output::failure(&format!("{}: {}", node_id, error));
        }
        ControllerEvent::NodeSkipped { node_id, reason } => {
            output::warning(&format!("{} skipped: {}", node_id, reason));
        }
        ControllerEvent::ComponentStarted { node_id } => {
            output::check(&format!("started {}", node_id));
        }
        ControllerEvent::ComponentStopped { node_id } => {
            output::dim(&format!("    stopped {}", node_id));
        }
        ControllerEvent::ComponentExited { node_id, health } => {
            output::failure(&format!("{} exited: {}", node_id, health.message));
        }
        ControllerEvent::UpdateApplied { failed, .. } if *failed > 0 => {
            output::warning(&format!("update applied with {} failed node(s)", failed));
        }
        ControllerEvent::UpdateApplied { .. } => {}
    }
}

/// SIGHUP on unix; never fires elsewhere
struct ReloadSignal {
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
}

impl ReloadSignal {
    fn new() -> Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            hangup: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?,
        })
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        if self.hangup.recv().await.is_some() {
            return;
        }
        std::future::pending::<()>().await
    }
}
