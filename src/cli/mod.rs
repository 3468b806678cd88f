//! Command-line interface for conveyor.
//!
//! Provides commands for running a work item through the pipeline,
//! inspecting its persisted state, clearing locks and showing the resolved
//! configuration.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::adapters::{command_registry, dry_run_registry};
use crate::config::{self, ResolvedConfig};
use crate::core::{
    exit_code, ConfigError, ConfigOverrides, ConsoleReporter, FanoutReporter, LockManager,
    NullReporter, Orchestrator, OrchestratorError, PipelineConfig, ProgressReporter, RunRequest,
    StateError, StateStore, TracingReporter,
};
use crate::domain::{OrchestrationState, WorkItemId};

/// conveyor - Resumable, lock-protected stage pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "conveyor")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a work item through the pipeline
    Run(RunArgs),

    /// Show the persisted state of a work item
    Status {
        /// Work item ID
        id: String,

        /// Print the raw state as JSON
        #[arg(long)]
        json: bool,
    },

    /// Clear a stale lock (or any lock with --force)
    Unlock {
        /// Work item ID
        id: String,

        /// Remove the lock even if its owner looks alive
        #[arg(long)]
        force: bool,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Where progress events go
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressSink {
    /// Lines on stderr
    Console,
    /// Structured log events
    Log,
    /// Nowhere
    #[value(name = "none")]
    Quiet,
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Work item ID
    pub id: String,

    /// Continue from persisted state
    #[arg(long)]
    pub resume: bool,

    /// Resume at this stage (implies --resume)
    #[arg(long, value_name = "STAGE")]
    pub from: Option<String>,

    /// Print the plan without executing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Approve a gated stage
    #[arg(long = "approve", value_name = "STAGE")]
    pub approve: Vec<String>,

    /// Require approval before a stage
    #[arg(long = "gate", value_name = "STAGE")]
    pub gate: Vec<String>,

    /// Remove a configured gate
    #[arg(long = "no-gate", value_name = "STAGE")]
    pub no_gate: Vec<String>,

    /// Skip a stage when its artifact exists
    #[arg(long = "skip-existing", value_name = "STAGE")]
    pub skip_existing: Vec<String>,

    /// Always run a stage, even if its artifact exists
    #[arg(long = "no-skip-existing", value_name = "STAGE")]
    pub no_skip_existing: Vec<String>,

    /// Disable artifact-based skipping for every stage
    #[arg(long)]
    pub no_skip: bool,

    /// Override a configuration value (e.g. stages.build.max_retries=3)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub set: Vec<String>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Progress output; repeat to combine (default: console)
    #[arg(long = "progress", value_enum, value_name = "SINK")]
    pub progress: Vec<ProgressSink>,
}

impl RunArgs {
    /// Overrides expressed by flags, applied over the config file
    pub fn overrides(&self) -> Result<ConfigOverrides, ConfigError> {
        let mut overrides = ConfigOverrides::default();
        for stage in &self.gate {
            overrides.stage_mut(stage).gate = Some(true);
        }
        for stage in &self.no_gate {
            overrides.stage_mut(stage).gate = Some(false);
        }
        for stage in &self.skip_existing {
            overrides.stage_mut(stage).skip_existing = Some(true);
        }
        for stage in &self.no_skip_existing {
            overrides.stage_mut(stage).skip_existing = Some(false);
        }
        for assignment in &self.set {
            overrides.set_assignment(assignment)?;
        }
        Ok(overrides)
    }

    /// Orchestrator request for these flags
    pub fn request(&self, work_item: WorkItemId) -> RunRequest {
        let mut request = RunRequest::new(work_item).skip_existing(!self.no_skip);
        if self.resume {
            request = request.resume();
        }
        if let Some(stage) = &self.from {
            request = request.resume_from(stage.clone());
        }
        if self.dry_run {
            request = request.dry_run();
        }
        for stage in &self.approve {
            request = request.approve(stage.clone());
        }
        request
    }

    /// Requested progress sinks, deduplicated, console when none given
    pub fn progress_sinks(&self) -> Vec<ProgressSink> {
        let mut sinks = Vec::new();
        for sink in &self.progress {
            if !sinks.contains(sink) {
                sinks.push(*sink);
            }
        }
        if sinks.is_empty() {
            sinks.push(ProgressSink::Console);
        }
        sinks
    }

    /// Reporter feeding every requested sink
    pub fn reporter(&self) -> Arc<dyn ProgressReporter> {
        let mut fanout = FanoutReporter::new();
        for sink in self.progress_sinks() {
            let reporter: Arc<dyn ProgressReporter> = match sink {
                ProgressSink::Console => Arc::new(ConsoleReporter::stderr().json(self.json)),
                ProgressSink::Log => Arc::new(TracingReporter),
                ProgressSink::Quiet => Arc::new(NullReporter),
            };
            fanout = fanout.with(reporter);
        }
        Arc::new(fanout)
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<ExitCode> {
        match self.command {
            Commands::Run(args) => run(args).await,
            Commands::Status { id, json } => show_status(&id, json).await,
            Commands::Unlock { id, force } => unlock(&id, force),
            Commands::Config => show_config(),
        }
    }
}

/// Exit code for an error that escaped a command
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(e) = err.downcast_ref::<OrchestratorError>() {
        return e.exit_code();
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return exit_code::CONFIG;
    }
    if let Some(StateError::Corrupt(_)) = err.downcast_ref::<StateError>() {
        return exit_code::CORRUPT_STATE;
    }
    exit_code::INTERNAL
}

fn parse_work_item(id: &str) -> Result<WorkItemId, ConfigError> {
    WorkItemId::new(id).map_err(|e| ConfigError::InvalidValue {
        field: "work_item".to_string(),
        reason: e.to_string(),
    })
}

/// Run a work item through the pipeline
async fn run(args: RunArgs) -> Result<ExitCode> {
    let work_item = parse_work_item(&args.id)?;
    let resolved = config::config()?;

    let overrides = resolved.pipeline.clone().merge(args.overrides()?);
    let pipeline = PipelineConfig::resolve(&overrides)?;
    let registry = if args.dry_run {
        dry_run_registry(&pipeline)?
    } else {
        command_registry(&pipeline)?
    };

    let orchestrator = Orchestrator::builder(pipeline, registry)
        .home(&resolved.home)
        .artifacts_root(&resolved.artifacts)
        .reporter(args.reporter())
        .build()?;

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            // No signal handler available: never interrupt
            std::future::pending::<()>().await;
        }
    };

    let report = orchestrator
        .run_until(args.request(work_item), shutdown)
        .await?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to encode report")?
        );
    } else {
        println!("{}", report);
    }

    Ok(ExitCode::from(report.exit_code()))
}

/// Show the persisted state of a work item
async fn show_status(id: &str, json: bool) -> Result<ExitCode> {
    let work_item = parse_work_item(id)?;
    let resolved = config::config()?;
    let store = StateStore::new(resolved.state_dir());

    let Some(state) = store.load(&work_item).await? else {
        println!("No state recorded for work item {}", work_item);
        return Ok(ExitCode::SUCCESS);
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&state).context("Failed to encode state")?
        );
        return Ok(ExitCode::SUCCESS);
    }

    print_state(&state, resolved);
    Ok(ExitCode::SUCCESS)
}

fn print_state(state: &OrchestrationState, resolved: &ResolvedConfig) {
    println!("Work item: {}", state.work_item);
    println!("Run ID: {}", state.run_id);
    println!("Status: {}", state.status);
    println!("Started: {}", state.started_at);
    if let Some(completed) = state.completed_at {
        println!("Completed: {}", completed);
    }
    if let Some(stage) = &state.current_stage {
        println!("Current stage: {}", stage);
    }
    if let Some(in_flight) = &state.in_flight {
        println!(
            "In flight: {} ({} attempt(s) started)",
            in_flight.stage, in_flight.attempts
        );
    }
    if !state.approvals.is_empty() {
        let approvals: Vec<&str> = state.approvals.iter().map(String::as_str).collect();
        println!("Approved gates: {}", approvals.join(", "));
    }

    let locks = LockManager::new(resolved.locks_dir());
    if let Some(holder) = locks.holder(&state.work_item) {
        println!("Locked by pid {} since {}", holder.pid, holder.acquired_at);
    }

    println!("\nStages:");
    for settings in &state.config.stages {
        let (status, attempts) = match state.last_result(&settings.name) {
            Some(result) => (result.status.to_string(), result.attempts),
            None => ("pending".to_string(), 0),
        };
        let artifact = state
            .artifacts
            .get(&settings.name)
            .map(|a| a.location.as_str())
            .unwrap_or("-");
        println!(
            "  {:<12} {:<8} {:>2} attempt(s)  {}",
            settings.name, status, attempts, artifact
        );
    }
}

/// Clear a work item lock
fn unlock(id: &str, force: bool) -> Result<ExitCode> {
    let work_item = parse_work_item(id)?;
    let locks = LockManager::new(config::config()?.locks_dir());

    if force {
        if locks.force_release(&work_item)? {
            println!("Lock for {} removed", work_item);
        } else {
            println!("No lock held for {}", work_item);
        }
        return Ok(ExitCode::SUCCESS);
    }

    if locks.reclaim_if_stale(&work_item)? {
        println!("Stale lock for {} reclaimed", work_item);
        return Ok(ExitCode::SUCCESS);
    }

    match locks.holder(&work_item) {
        Some(holder) => {
            println!(
                "Lock for {} is held by live process {} (since {}); use --force to remove it",
                work_item, holder.pid, holder.acquired_at
            );
            Ok(ExitCode::from(exit_code::LOCKED))
        }
        None if locks.lock_path(&work_item).exists() => {
            println!("Lock for {} is being acquired; try again", work_item);
            Ok(ExitCode::from(exit_code::LOCKED))
        }
        None => {
            println!("No lock held for {}", work_item);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<ExitCode> {
    let cfg = config::reload_config()?;
    let pipeline = PipelineConfig::resolve(&cfg.pipeline)?;

    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:      {}", cfg.home.display());
    println!("  State:     {}", cfg.state_dir().display());
    println!("  Locks:     {}", cfg.locks_dir().display());
    println!("  Artifacts: {}", cfg.artifacts.display());
    println!();
    println!("Pipeline:");
    for line in pipeline.to_yaml().lines() {
        println!("  {}", line);
    }

    Ok(ExitCode::SUCCESS)
}
