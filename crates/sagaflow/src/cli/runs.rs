use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::{style, StyledObject};
use uuid::Uuid;

use sagaflow_core::workflow::{RunStatus, StepStatus};
use sagaflow_runtime::workflow::{RunFilter, WorkflowRun};

/// Inspect persisted workflow runs.
#[derive(Parser)]
pub struct RunsCommand {
    #[command(subcommand)]
    pub action: RunsAction,
}

#[derive(Subcommand)]
pub enum RunsAction {
    /// List runs, oldest first.
    List {
        /// Only runs in this status (repeatable).
        #[arg(short, long)]
        status: Vec<RunStatus>,

        /// Only runs of this workflow.
        #[arg(short, long)]
        workflow: Option<String>,

        /// Maximum number of runs to show.
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show one run with its step history.
    Show {
        /// Run id.
        id: Uuid,

        /// Print the raw JSON record.
        #[arg(long)]
        json: bool,
    },
}

impl RunsCommand {
    pub async fn execute(self, config_path: &str) -> Result<()> {
        let config = super::load_config(config_path)?;
        let store = sagaflow::open_store(&config.store)
            .await
            .context("Failed to open run store")?;

        match self.action {
            RunsAction::List {
                status,
                workflow,
                limit,
            } => {
                let filter = RunFilter {
                    workflow,
                    statuses: status,
                    limit,
                };
                let runs = store.list(&filter).await?;
                print_list(&runs);
            }
            RunsAction::Show { id, json } => {
                let run = store
                    .load(id)
                    .await?
                    .with_context(|| format!("Workflow run {} not found", id))?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&run)?);
                } else {
                    print_run(&run);
                }
            }
        }
        Ok(())
    }
}

fn status_style(status: RunStatus) -> StyledObject<&'static str> {
    let label = status.as_str();
    match status {
        RunStatus::Succeeded => style(label).green(),
        RunStatus::Failed | RunStatus::CompensationFailed => style(label).red(),
        RunStatus::Compensating => style(label).yellow(),
        RunStatus::Pending | RunStatus::Running => style(label).cyan(),
    }
}

fn print_list(runs: &[WorkflowRun]) {
    println!();
    if runs.is_empty() {
        println!("  {} No workflow runs found", style("ℹ").blue());
        println!();
        return;
    }

    for run in runs {
        println!(
            "  {}  {:<20} v{:<3} {:<20} {}",
            style(run.id).dim(),
            run.workflow_name,
            run.version,
            status_style(run.status),
            run.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!();
    println!("  {} run(s)", runs.len());
    println!();
}

fn print_run(run: &WorkflowRun) {
    println!();
    println!(
        "  {} {} v{}",
        style("Run").bold(),
        style(run.id).cyan(),
        run.version
    );
    println!("  {:<10} {}", "workflow", run.workflow_name);
    println!("  {:<10} {}", "status", status_style(run.status));
    println!("  {:<10} {}", "created", run.created_at.to_rfc3339());
    if let Some(completed) = run.completed_at {
        println!("  {:<10} {}", "finished", completed.to_rfc3339());
    }

    if !run.steps.is_empty() {
        println!();
        println!("  {}", style("Steps").bold());
        for step in &run.steps {
            let marker = match step.status {
                StepStatus::Completed => style("✓").green(),
                StepStatus::Compensated => style("↺").yellow(),
                StepStatus::Failed | StepStatus::CompensationFailed => style("✗").red(),
                StepStatus::Pending | StepStatus::Running => style("•").cyan(),
            };
            println!(
                "  {} {:<28} {:<20} attempts: {}",
                marker,
                step.node,
                step.status.as_str(),
                step.attempts
            );
            if let Some(error) = &step.error {
                println!("      {}", style(error).dim());
            }
        }
    }

    if let Some(failure) = &run.failure {
        println!();
        println!("  {} {}", style("trigger").red(), failure);
    }
    if let Some(compensation) = &run.compensation_failure {
        println!("  {} {}", style("rollback").red(), compensation);
    }
    println!();
}
