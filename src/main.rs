use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use faber::config::FaberConfig;
use faber::logs::WorkflowStatus;
use faber::{list_workflows, resume_workflow, run_workflow, view_workflow, WorkflowOptions};

#[derive(Parser)]
#[command(name = "faber")]
#[command(version, about = "Multi-phase AI workflow engine")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Path to the engine config. Defaults to <project>/.faber/config.yaml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the workflow for a work item
    Run {
        /// Work item id (e.g. "42", "PROJ-456")
        work_id: String,
        /// Autonomy level: assisted, guarded, autonomous
        #[arg(long)]
        autonomy: Option<String>,
        /// Retry bound for the evaluate → build loop
        #[arg(long)]
        max_retries: Option<u32>,
        /// Budget in USD for this run
        #[arg(long)]
        budget: Option<f64>,
        /// Phases to skip (repeatable)
        #[arg(long = "skip-phase")]
        skip_phases: Vec<String>,
        /// Custom workflow YAML instead of the default pipeline
        #[arg(long)]
        workflow: Option<PathBuf>,
        /// Attach the observability project span to the run
        #[arg(long)]
        trace: bool,
    },
    /// Resume a checkpointed workflow
    Resume {
        workflow_id: String,
    },
    /// List workflow executions
    List {
        /// Filter by status: running, completed, failed, cancelled
        #[arg(long)]
        status: Option<String>,
        /// Filter by work item id
        #[arg(long)]
        work_id: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show a workflow's log
    View {
        workflow_id: String,
    },
    /// Inspect or initialize configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Write the default .faber/config.yaml
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Validate the configuration and report problems
    Validate,
    /// Print the resolved configuration
    Show,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let filter = if cli.verbose { "faber=debug" } else { "faber=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match cli.command {
        Commands::Run {
            work_id,
            autonomy,
            max_retries,
            budget,
            skip_phases,
            workflow,
            trace,
        } => {
            let options = WorkflowOptions {
                autonomy: autonomy
                    .as_deref()
                    .map(|s| s.parse::<faber::config::AutonomyLevel>())
                    .transpose()?,
                max_retries,
                budget_usd: budget,
                skip_phases,
                workflow_path: workflow,
                config_path: cli.config,
                project_root: Some(project_dir),
                trace,
                ..Default::default()
            };

            let result = run_workflow(&work_id, options).await?;
            print_result(&result);
            Ok(exit_for(result.status))
        }
        Commands::Resume { workflow_id } => {
            let options = WorkflowOptions {
                config_path: cli.config,
                project_root: Some(project_dir),
                ..Default::default()
            };
            let result = resume_workflow(&workflow_id, options).await?;
            print_result(&result);
            Ok(exit_for(result.status))
        }
        Commands::List {
            status,
            work_id,
            limit,
        } => {
            let status = status
                .as_deref()
                .map(|s| s.parse::<WorkflowStatus>())
                .transpose()?;
            let summaries =
                list_workflows(Some(&project_dir), status, work_id.as_deref(), limit)?;
            if summaries.is_empty() {
                println!("No workflows found");
            }
            for summary in summaries {
                println!(
                    "{}  {}  work:{}  phase:{}  entries:{}",
                    summary.workflow_id,
                    summary.status,
                    summary.work_id.as_deref().unwrap_or("-"),
                    summary.current_phase,
                    summary.entry_count
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::View { workflow_id } => {
            match view_workflow(Some(&project_dir), &workflow_id)? {
                Some(log) => {
                    println!("Workflow: {}", log.workflow_id);
                    println!("Status:   {}", log.status);
                    println!("Started:  {}", log.started_at);
                    if let Some(ended) = log.ended_at {
                        println!("Ended:    {}", ended);
                    }
                    println!();
                    for entry in &log.entries {
                        println!(
                            "[{}] [{:?}] [{}] {}",
                            entry.timestamp, entry.level, entry.phase, entry.message
                        );
                    }
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    eprintln!("Workflow not found: {}", workflow_id);
                    Ok(ExitCode::from(1))
                }
            }
        }
        Commands::Config { command } => match command {
            ConfigCommands::Init { force } => {
                let path = FaberConfig::init(&project_dir, force)?;
                println!("Created configuration at {}", path.display());
                Ok(ExitCode::SUCCESS)
            }
            ConfigCommands::Validate => {
                let config = FaberConfig::load(&project_dir, cli.config.as_deref())?;
                let problems = config.validate();
                if problems.is_empty() {
                    println!("Configuration is valid");
                    Ok(ExitCode::SUCCESS)
                } else {
                    for problem in problems {
                        eprintln!("  • {}", problem);
                    }
                    Ok(ExitCode::from(1))
                }
            }
            ConfigCommands::Show => {
                let config = FaberConfig::load(&project_dir, cli.config.as_deref())?;
                println!("{}", serde_yaml::to_string(&config)?);
                Ok(ExitCode::SUCCESS)
            }
        },
    }
}

fn print_result(result: &faber::WorkflowResult) {
    println!();
    println!("Workflow:  {}", result.workflow_id);
    println!("Status:    {}", result.status);
    println!("Phases:    {}", result.completed_phases.join(" → "));
    println!("Retries:   {}", result.retry_count);
    if let Some(evaluation) = result.evaluation_result {
        println!("Decision:  {}", evaluation);
    }
    if let Some(pr_url) = &result.pr_url {
        println!("PR:        {}", pr_url);
    }
    println!("Cost:      ${:.4} ({} tokens)", result.total_cost_usd, result.total_tokens);
    if let Some(error) = &result.error {
        println!(
            "Error:     {} (phase: {})",
            error,
            result.error_phase.as_deref().unwrap_or("unknown")
        );
    }
}

/// 0 on success or graceful cancellation; 1 on workflow failure.
fn exit_for(status: WorkflowStatus) -> ExitCode {
    match status {
        WorkflowStatus::Completed | WorkflowStatus::Cancelled => ExitCode::SUCCESS,
        WorkflowStatus::Failed | WorkflowStatus::Running => ExitCode::from(1),
    }
}
