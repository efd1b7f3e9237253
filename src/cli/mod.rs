//! CLI argument structures and command routing
//!
//! The `step` subcommands form the text protocol agents speak: `peek` and
//! `claim` write `HAS_WORK`/`NO_WORK` or a claim JSON object to stdout,
//! `complete` reads the raw agent output from stdin. Exit codes: 0 success
//! (including `NO_WORK`), 1 user-visible error, 2 invalid arguments (clap).

use crate::app::AppConfig;
use crate::cron::{self, CommandCronGateway, CronGateway};
use crate::engine::{CompleteOutcome, Engine};
use crate::error::Error;
use crate::medic::Medic;
use crate::storage::Store;
use crate::workflow::WorkflowSpec;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tracing::warn;

/// Multi-agent workflow engine over a shared task queue
#[derive(Parser)]
#[command(name = "setfarm")]
#[command(about = "setfarm - multi-agent workflows over a shared task queue", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage workflow runs
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Agent claim protocol (peek/claim/complete/fail)
    Step {
        #[command(subcommand)]
        command: StepCommands,
    },
    /// Watchdog reconciliation
    Medic {
        #[command(subcommand)]
        command: MedicCommands,
    },
    /// Scheduler job management
    Cron {
        #[command(subcommand)]
        command: CronCommands,
    },
    /// Inspect workflow specs
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    /// Print a run's event log
    Events {
        run_id: String,
        #[arg(long, default_value = "200")]
        limit: i64,
    },
}

#[derive(Subcommand)]
pub enum RunCommands {
    /// Start a run of a workflow against a task description
    Start {
        workflow_id: String,
        /// Task description; reads stdin when omitted
        #[arg(long)]
        task: Option<String>,
    },
    /// List runs, newest first
    List {
        #[arg(long, default_value = "50")]
        limit: i64,
    },
    /// Show one run with its steps and stories
    Show { run_id: String },
    /// Manually resume a failed run
    Resume { run_id: String },
}

#[derive(Subcommand)]
pub enum StepCommands {
    /// Print HAS_WORK or NO_WORK for a role, without side effects
    Peek { role: String },
    /// Atomically claim the next unit for a role
    Claim { role: String },
    /// Report a unit's output (raw output on stdin)
    Complete { unit_id: String },
    /// Report a unit failure
    Fail { unit_id: String, reason: String },
}

#[derive(Subcommand)]
pub enum MedicCommands {
    /// One reconciliation pass
    Run {
        /// Override the clock (RFC 3339), for drills and tests
        #[arg(long)]
        now: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum CronCommands {
    /// Ensure scheduler jobs exist for a workflow (idempotent)
    Sync { workflow_id: String },
    /// Delete a workflow's scheduler jobs
    Teardown { workflow_id: String },
    /// List scheduler jobs
    List,
}

#[derive(Subcommand)]
pub enum WorkflowCommands {
    /// List workflow ids in the workflows directory
    List,
    /// Print a workflow spec
    Show { id: String },
}

/// Execute the requested command against the engine.
pub async fn execute_command(command: Commands, config: &AppConfig) -> Result<()> {
    let store = Store::open(&config.db_path()).await?;
    let engine = Engine::new(store, config.settings.clone()).with_runs_dir(config.runs_dir());
    let gateway = CommandCronGateway::new(&config.settings.gateway);
    let now = Utc::now();

    match command {
        Commands::Run { command } => run_command(command, config, &engine, &gateway, now).await,
        Commands::Step { command } => step_command(command, &engine, now).await,
        Commands::Medic { command } => medic_command(command, config, &engine, &gateway).await,
        Commands::Cron { command } => cron_command(command, config, &engine, &gateway).await,
        Commands::Workflow { command } => workflow_command(command, config),
        Commands::Events { run_id, limit } => {
            for event in engine.store().events_for_run(&run_id, limit).await? {
                let step = event.step_id.as_deref().unwrap_or("-");
                println!("{}  {:<16} {:<12} {}", event.ts.to_rfc3339(), event.kind, step, event.detail);
            }
            Ok(())
        }
    }
}

async fn run_command(
    command: RunCommands,
    config: &AppConfig,
    engine: &Engine,
    gateway: &dyn CronGateway,
    now: DateTime<Utc>,
) -> Result<()> {
    match command {
        RunCommands::Start { workflow_id, task } => {
            let spec = WorkflowSpec::load(&config.workflows_dir(), &workflow_id)?;
            let task = match task {
                Some(task) => task,
                None => read_stdin().await?,
            };
            let run = engine.start_run(&spec, task.trim(), now).await?;
            println!("{}", run.id);
            // jobs are best effort here: the store already holds the run and
            // the medic restores crons when the scheduler was unreachable
            match cron::sync_workflow_jobs(gateway, &spec, &config.settings).await {
                Ok(created) if created > 0 => {
                    eprintln!("created {created} cron jobs for workflow {workflow_id}");
                }
                Ok(_) => {}
                Err(Error::Upstream(detail)) => {
                    warn!("scheduler unreachable, jobs not created: {detail}");
                    eprintln!("warning: scheduler unreachable, cron jobs not created");
                }
                Err(e) => return Err(e.into()),
            }
            Ok(())
        }
        RunCommands::List { limit } => {
            for run in engine.store().list_runs(limit).await? {
                println!(
                    "{}  {:<8} {:<20} {}",
                    run.id, run.status, run.workflow_id, run.task
                );
            }
            Ok(())
        }
        RunCommands::Show { run_id } => {
            let snapshot = engine
                .store()
                .snapshot_run(&run_id)
                .await?
                .with_context(|| format!("no run {run_id}"))?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        RunCommands::Resume { run_id } => {
            if engine.store().resume_run(&run_id, now).await? {
                println!("resumed {run_id}");
                Ok(())
            } else {
                bail!("run {run_id} is not resumable");
            }
        }
    }
}

async fn step_command(command: StepCommands, engine: &Engine, now: DateTime<Utc>) -> Result<()> {
    match command {
        StepCommands::Peek { role } => {
            let token = if engine.peek(&role).await? {
                "HAS_WORK"
            } else {
                "NO_WORK"
            };
            println!("{token}");
            Ok(())
        }
        StepCommands::Claim { role } => {
            match engine.claim(&role, now).await? {
                Some(claimed) => println!("{}", serde_json::to_string(&claimed)?),
                None => println!("NO_WORK"),
            }
            Ok(())
        }
        StepCommands::Complete { unit_id } => {
            let raw_output = read_stdin().await?;
            match engine.complete(&unit_id, &raw_output, now).await? {
                CompleteOutcome::Accepted => Ok(()),
                CompleteOutcome::Ignored { reason } => {
                    // idempotent no-op, still success for the agent
                    eprintln!("note: {reason}");
                    Ok(())
                }
                CompleteOutcome::Rejected { reason } => bail!("output rejected: {reason}"),
            }
        }
        StepCommands::Fail { unit_id, reason } => {
            engine.fail(&unit_id, &reason, now).await?;
            Ok(())
        }
    }
}

async fn medic_command(
    command: MedicCommands,
    config: &AppConfig,
    engine: &Engine,
    gateway: &dyn CronGateway,
) -> Result<()> {
    match command {
        MedicCommands::Run { now } => {
            let now = match now {
                Some(raw) => DateTime::parse_from_rfc3339(&raw)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| Error::BadInput(format!("invalid --now timestamp: {e}")))?,
                None => Utc::now(),
            };
            let medic = Medic::new(engine, gateway, config.workflows_dir());
            let report = medic.run_pass(now).await?;
            println!("{}", report.summary);
            for finding in &report.findings {
                println!(
                    "  [{:?}] {:?}: {} ({})",
                    finding.severity, finding.check, finding.detail, finding.action
                );
            }
            Ok(())
        }
    }
}

async fn cron_command(
    command: CronCommands,
    config: &AppConfig,
    engine: &Engine,
    gateway: &dyn CronGateway,
) -> Result<()> {
    match command {
        CronCommands::Sync { workflow_id } => {
            let spec = WorkflowSpec::load(&config.workflows_dir(), &workflow_id)?;
            let created = cron::sync_workflow_jobs(gateway, &spec, &config.settings).await?;
            println!("created {created} jobs");
            Ok(())
        }
        CronCommands::Teardown { workflow_id } => {
            let running = engine
                .store()
                .count_running_runs_for_workflow(&workflow_id)
                .await?;
            if running > 0 {
                bail!("workflow {workflow_id} still has {running} running runs");
            }
            let deleted = cron::teardown_workflow_jobs(gateway, &workflow_id).await?;
            println!("deleted {deleted} jobs");
            Ok(())
        }
        CronCommands::List => {
            for job in gateway.list_jobs().await? {
                println!("{}  {}", job.id, job.name);
            }
            Ok(())
        }
    }
}

fn workflow_command(command: WorkflowCommands, config: &AppConfig) -> Result<()> {
    match command {
        WorkflowCommands::List => {
            for id in WorkflowSpec::list(&config.workflows_dir())? {
                println!("{id}");
            }
            Ok(())
        }
        WorkflowCommands::Show { id } => {
            // validate before echoing the file back
            WorkflowSpec::load(&config.workflows_dir(), &id)?;
            let path = config.workflows_dir().join(format!("{id}.yaml"));
            print!("{}", std::fs::read_to_string(path)?);
            Ok(())
        }
    }
}

async fn read_stdin() -> Result<String> {
    let mut raw = String::new();
    tokio::io::stdin()
        .read_to_string(&mut raw)
        .await
        .context("failed to read stdin")?;
    Ok(raw)
}
