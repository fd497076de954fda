mod config;
mod runs;

pub use config::ConfigCommand;
pub use runs::RunsCommand;

use std::path::Path;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use sagaflow_core::config::EngineConfig;

/// sagaflow - inspect workflow runs and engine configuration
#[derive(Parser)]
#[command(name = "sagaflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, default_value = "sagaflow.toml", global = true)]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Inspect persisted workflow runs.
    Runs(RunsCommand),

    /// Validate the configuration file.
    Config(ConfigCommand),
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Runs(cmd) => cmd.execute(&self.config).await,
            Commands::Config(cmd) => cmd.execute(&self.config).await,
        }
    }
}

/// Load the engine configuration and install logging from it.
fn load_config(path: &str) -> Result<EngineConfig> {
    if !Path::new(path).exists() {
        anyhow::bail!("Configuration file not found: {}", path);
    }
    let config = EngineConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path))?;
    sagaflow_runtime::init_tracing(&config.logging);
    Ok(config)
}
