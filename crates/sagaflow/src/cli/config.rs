use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;

use sagaflow_core::config::{Durability, StoreBackend};

/// Validate the configuration file.
#[derive(Parser)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Parse the configuration and open the configured store.
    Check,
}

impl ConfigCommand {
    pub async fn execute(self, config_path: &str) -> Result<()> {
        match self.action {
            ConfigAction::Check => check(config_path).await,
        }
    }
}

async fn check(config_path: &str) -> Result<()> {
    let config = super::load_config(config_path)?;

    println!();
    println!("  {} {}", style("sagaflow").bold().cyan(), style(config_path).dim());
    println!();

    let durability = match config.engine.durability {
        Durability::Durable => style("durable").green(),
        Durability::Ephemeral => style("ephemeral").yellow(),
    };
    println!("  {:<22} {}", "durability", durability);
    println!(
        "  {:<22} {}",
        "retain completed runs", config.engine.retain_completed_runs
    );
    println!("  {:<22} {:?}", "recovery", config.engine.recovery);
    if let Some(timeout) = config.engine.workflow_timeout() {
        println!("  {:<22} {:?}", "workflow timeout", timeout);
    }
    if let Some(timeout) = config.engine.step_timeout() {
        println!("  {:<22} {:?}", "step timeout", timeout);
    }

    let location = match config.store.backend {
        StoreBackend::Memory => "memory".to_string(),
        StoreBackend::File => format!(
            "file ({})",
            config
                .store
                .path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        ),
        StoreBackend::Postgres => "postgres".to_string(),
    };
    println!("  {:<22} {}", "store", location);

    sagaflow::open_store(&config.store).await?;

    println!();
    println!("  {} Configuration is valid", style("✓").green());
    println!();
    Ok(())
}
