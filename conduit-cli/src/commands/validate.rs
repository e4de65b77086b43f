use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use conduit_runtime::{
    default_registry, Controller, ControllerConfig, Document, LoadError, RuntimeError,
};

/// Check a pipeline configuration without starting it
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the pipeline configuration YAML file
    pub config: PathBuf,

    /// Only report errors, not the evaluation order
    #[arg(long, short = 'q')]
    pub quiet: bool,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    let config_path = &args.config;

    if !config_path.exists() {
        color_eyre::eyre::bail!("Configuration file not found: {}", config_path.display());
    }

    // Step 1: Parse YAML syntax and block structure
    output::status("Validating", &format!("{}", config_path.display()));

    let document = match Document::from_file(config_path) {
        Ok(document) => document,
        Err(e) => {
            output::error(&format!("Parse error: {}", e));
            std::process::exit(1);
        }
    };

    output::check(&format!("Syntax valid: {} blocks", document.blocks.len()));

    // Step 2: Components, references, cycles and evaluation order
    let controller = Controller::new(ControllerConfig::default(), default_registry())?;
    let plan = match controller.plan(&document) {
        Ok(plan) => plan,
        Err(RuntimeError::Load(LoadError::Structural(errors))) => {
            output::error(&format!("{} validation error(s):", errors.len()));
            for error in &errors {
                output::error(&format!("  - {}", error));
            }
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    output::check("Components and references resolved, no cycles");

    if !args.quiet {
        println!();
        output::header("Evaluation order");
        for (index, id) in plan.order().iter().enumerate() {
            output::item(index + 1, id);
        }
    }

    println!();
    output::success("Configuration is valid");

    Ok(())
}
