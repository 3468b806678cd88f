//! Main orchestrator for pipeline execution.
//!
//! Drives one work item through the configured stages: takes the lock,
//! loads or creates state, plans skips and gates, executes stages in order
//! and persists every transition before reporting it.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};

use crate::domain::{
    ArtifactRef, OrchestrationState, PlanAction, PlannedStage, ProgressEvent, RunStatus, StageResult,
    StageStatus, WorkItemId,
};

use super::artifacts::{ArtifactResolver, FsArtifactResolver};
use super::error::{ConcurrencyError, OrchestratorError};
use super::executor::StageExecutor;
use super::lock::LockManager;
use super::pipeline::{ConfigError, PipelineConfig};
use super::report::{resume_command, RunOutcome, RunReport};
use super::reporter::{report_safely, NullReporter, ProgressReporter};
use super::stage::{StageDescriptor, StageRegistry};
use super::state_store::StateStore;

/// What the caller wants done with a work item
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub work_item: WorkItemId,

    /// Continue from persisted state
    pub resume: bool,

    /// Explicit stage to resume at (implies `resume`)
    pub resume_from: Option<String>,

    /// Plan only, execute nothing
    pub dry_run: bool,

    /// Gates approved for this invocation (persisted with the state)
    pub approvals: BTreeSet<String>,

    /// Global switch for artifact-based skipping
    pub skip_existing: bool,
}

impl RunRequest {
    pub fn new(work_item: WorkItemId) -> Self {
        Self {
            work_item,
            resume: false,
            resume_from: None,
            dry_run: false,
            approvals: BTreeSet::new(),
            skip_existing: true,
        }
    }

    pub fn resume(mut self) -> Self {
        self.resume = true;
        self
    }

    pub fn resume_from(mut self, stage: impl Into<String>) -> Self {
        self.resume = true;
        self.resume_from = Some(stage.into());
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn approve(mut self, stage: impl Into<String>) -> Self {
        self.approvals.insert(stage.into());
        self
    }

    pub fn skip_existing(mut self, enabled: bool) -> Self {
        self.skip_existing = enabled;
        self
    }
}

/// Releases the work item lock when the run ends or is dropped
struct LockGuard<'a> {
    locks: &'a LockManager,
    work_item: WorkItemId,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.work_item);
    }
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    config: PipelineConfig,
    registry: StageRegistry,
    store: Option<StateStore>,
    locks: Option<LockManager>,
    artifacts: Option<Arc<dyn ArtifactResolver>>,
    reporter: Arc<dyn ProgressReporter>,
}

impl OrchestratorBuilder {
    /// Use `<home>/state` and `<home>/locks`
    pub fn home(self, home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        self.state_store(StateStore::new(home.join("state")))
            .lock_manager(LockManager::new(home.join("locks")))
    }

    pub fn state_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn lock_manager(mut self, locks: LockManager) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Detect artifacts on disk under `<root>/<work_item>/`
    pub fn artifacts_root(self, root: impl Into<PathBuf>) -> Self {
        self.artifact_resolver(Arc::new(FsArtifactResolver::new(root)))
    }

    pub fn artifact_resolver(mut self, resolver: Arc<dyn ArtifactResolver>) -> Self {
        self.artifacts = Some(resolver);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Bind stages to the configuration and assemble the orchestrator
    pub fn build(self) -> Result<Orchestrator, ConfigError> {
        let stages = self.registry.bind(&self.config)?;
        let store = self.store.ok_or_else(|| ConfigError::MissingField {
            field: "paths.home".to_string(),
        })?;
        let locks = self.locks.ok_or_else(|| ConfigError::MissingField {
            field: "paths.home".to_string(),
        })?;
        let artifacts = self.artifacts.ok_or_else(|| ConfigError::MissingField {
            field: "paths.artifacts".to_string(),
        })?;
        let executor = StageExecutor::new(store.clone()).with_reporter(Arc::clone(&self.reporter));

        Ok(Orchestrator {
            config: self.config,
            stages,
            store,
            locks,
            artifacts,
            reporter: self.reporter,
            executor,
        })
    }
}

/// Main pipeline orchestrator
pub struct Orchestrator {
    config: PipelineConfig,
    stages: Vec<StageDescriptor>,
    store: StateStore,
    locks: LockManager,
    artifacts: Arc<dyn ArtifactResolver>,
    reporter: Arc<dyn ProgressReporter>,
    executor: StageExecutor,
}

impl Orchestrator {
    pub fn builder(config: PipelineConfig, registry: StageRegistry) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            registry,
            store: None,
            locks: None,
            artifacts: None,
            reporter: Arc::new(NullReporter),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state_store(&self) -> &StateStore {
        &self.store
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    /// Persisted state of a work item, if any
    pub async fn status(
        &self,
        work_item: &WorkItemId,
    ) -> Result<Option<OrchestrationState>, OrchestratorError> {
        Ok(self.store.load(work_item).await?)
    }

    /// Run a work item through the pipeline
    pub async fn run(&self, request: RunRequest) -> Result<RunReport, OrchestratorError> {
        self.run_until(request, std::future::pending()).await
    }

    /// Run a work item, racing it against a shutdown signal. On shutdown
    /// the in-flight stage is aborted, pending state writes are allowed to
    /// land, and only then is the lock released.
    #[instrument(skip(self, request, shutdown), fields(work_item = %request.work_item))]
    pub async fn run_until<F>(
        &self,
        request: RunRequest,
        shutdown: F,
    ) -> Result<RunReport, OrchestratorError>
    where
        F: Future<Output = ()>,
    {
        self.validate_request(&request)?;

        let work_item = request.work_item.clone();
        if !self.locks.acquire(&work_item).await? {
            let holder = self.locks.holder(&work_item);
            warn!(holder_pid = ?holder.as_ref().map(|h| h.pid), "Work item is locked");
            return Err(ConcurrencyError { work_item, holder }.into());
        }
        let _lock = LockGuard {
            locks: &self.locks,
            work_item: work_item.clone(),
        };

        tokio::select! {
            result = self.run_locked(request) => result,
            _ = shutdown => {
                warn!(%work_item, "Shutdown requested, abandoning run");
                self.store.settle().await;
                Err(OrchestratorError::Interrupted {
                    resume_command: resume_command(&work_item, None),
                    work_item,
                })
            }
        }
    }

    fn validate_request(&self, request: &RunRequest) -> Result<(), ConfigError> {
        if let Some(stage) = &request.resume_from {
            if self.config.stage_index(stage).is_none() {
                return Err(ConfigError::UnknownStage {
                    field: "resume_from".to_string(),
                    stage: stage.clone(),
                });
            }
        }
        for stage in &request.approvals {
            if self.config.stage_index(stage).is_none() {
                return Err(ConfigError::UnknownStage {
                    field: "approve".to_string(),
                    stage: stage.clone(),
                });
            }
        }
        Ok(())
    }

    /// Persisted stage order must match the resolved one
    fn check_snapshot(&self, state: &OrchestrationState) -> Result<(), ConfigError> {
        let persisted = state.config.stage_names();
        let resolved = self.config.stage_names();
        if persisted != resolved {
            return Err(ConfigError::InvalidValue {
                field: "order".to_string(),
                reason: format!(
                    "persisted run uses [{}] but configuration resolves to [{}]",
                    persisted.join(", "),
                    resolved.join(", ")
                ),
            });
        }
        Ok(())
    }

    async fn run_locked(&self, request: RunRequest) -> Result<RunReport, OrchestratorError> {
        let clock = Instant::now();
        let work_item = request.work_item.clone();

        let loaded = if request.resume {
            self.store.load(&work_item).await?
        } else {
            None
        };

        let (mut state, start, resumed) = match loaded {
            Some(mut state) => {
                self.check_snapshot(&state)?;
                let start = match &request.resume_from {
                    Some(stage) => self.config.stage_index(stage).unwrap_or(0),
                    None if state.status == RunStatus::Done => self.stages.len(),
                    None => state.resume_index(),
                };
                state.config = self.config.clone();
                info!(start, status = state.status.label(), "Resuming from persisted state");
                (state, start, true)
            }
            None => {
                if request.resume {
                    warn!("No persisted state to resume, starting fresh");
                }
                (
                    OrchestrationState::new(work_item.clone(), self.config.clone()),
                    0,
                    false,
                )
            }
        };
        state.approvals.extend(request.approvals.iter().cloned());

        let plan = self
            .plan(&state, start, resumed, request.skip_existing)
            .await;

        if request.dry_run {
            info!("Dry run, nothing will be executed");
            self.emit(ProgressEvent::PlanReady {
                work_item: work_item.clone(),
                plan: plan.clone(),
            });
            return Ok(RunReport {
                work_item,
                run_id: state.run_id,
                outcome: RunOutcome::Planned { stages: plan },
                history: state.history,
                elapsed_ms: elapsed_ms(clock),
                resume_command: None,
            });
        }

        if start >= self.stages.len() && state.status == RunStatus::Done {
            info!("Pipeline already complete");
            self.emit(ProgressEvent::RunFinished {
                work_item: work_item.clone(),
                status: state.status.label().to_string(),
                stage: None,
                elapsed_ms: elapsed_ms(clock),
            });
            return Ok(self.report(
                &state,
                RunOutcome::Done {
                    artifact: state.terminal_artifact().cloned(),
                },
                clock,
            ));
        }

        self.store.save(&state).await?;
        self.emit(ProgressEvent::RunStarted {
            work_item: work_item.clone(),
            run_id: state.run_id,
            resumed,
            start_stage: self.stages.get(start).map(|d| d.name.clone()),
            total_stages: self.stages.len(),
        });

        for planned in plan.into_iter().skip(start) {
            let Some(descriptor) = self.stages.iter().find(|d| d.name == planned.stage) else {
                continue;
            };

            match planned.action {
                PlanAction::Complete => continue,
                PlanAction::Skip { artifact } => {
                    info!(stage = %descriptor.name, location = %artifact.location, "Artifact exists, skipping stage");
                    state.begin_stage(&descriptor.name);
                    state.record(StageResult::skipped(artifact.clone()));
                    self.store.save(&state).await?;
                    self.emit(ProgressEvent::StageSkipped {
                        work_item: work_item.clone(),
                        stage: descriptor.name.clone(),
                        artifact,
                        elapsed_ms: elapsed_ms(clock),
                    });
                }
                PlanAction::Gated => {
                    let reason = format!("stage '{}' requires approval", descriptor.name);
                    warn!(stage = %descriptor.name, "Gate not approved, blocking");
                    state.finish(RunStatus::Blocked {
                        stage: descriptor.name.clone(),
                        reason: reason.clone(),
                    });
                    self.store.save(&state).await?;
                    self.emit(ProgressEvent::GateBlocked {
                        work_item: work_item.clone(),
                        stage: descriptor.name.clone(),
                        reason: reason.clone(),
                    });
                    return Ok(self.conclude(
                        &state,
                        RunOutcome::Blocked {
                            stage: descriptor.name.clone(),
                            reason,
                        },
                        Some(resume_command(&work_item, Some(&descriptor.name))),
                        clock,
                    ));
                }
                PlanAction::Execute => {
                    state.begin_stage(&descriptor.name);
                    self.store.save(&state).await?;
                    self.emit(ProgressEvent::StageStarted {
                        work_item: work_item.clone(),
                        stage: descriptor.name.clone(),
                        position: descriptor.ordinal + 1,
                        total_stages: self.stages.len(),
                        elapsed_ms: elapsed_ms(clock),
                        artifacts: self.produced_so_far(&state),
                    });

                    let result = self
                        .executor
                        .run(descriptor, &mut state, self.artifacts.artifact_dir(&work_item))
                        .await?;
                    state.record(result.clone());
                    self.store.save(&state).await?;
                    self.emit(ProgressEvent::StageFinished {
                        work_item: work_item.clone(),
                        result: result.clone(),
                        elapsed_ms: elapsed_ms(clock),
                    });

                    match result.status {
                        StageStatus::Passed | StageStatus::Skipped => {}
                        StageStatus::Blocked => {
                            let reason = result.error.unwrap_or_default();
                            state.finish(RunStatus::Blocked {
                                stage: descriptor.name.clone(),
                                reason: reason.clone(),
                            });
                            self.store.save(&state).await?;
                            return Ok(self.conclude(
                                &state,
                                RunOutcome::Blocked {
                                    stage: descriptor.name.clone(),
                                    reason,
                                },
                                Some(resume_command(&work_item, None)),
                                clock,
                            ));
                        }
                        StageStatus::Failed => {
                            let error_message = result.error.unwrap_or_default();
                            error!(stage = %descriptor.name, attempts = result.attempts, "Pipeline failed");
                            state.finish(RunStatus::Failed {
                                stage: descriptor.name.clone(),
                                error: error_message.clone(),
                            });
                            self.store.save(&state).await?;
                            return Ok(self.conclude(
                                &state,
                                RunOutcome::Failed {
                                    stage: descriptor.name.clone(),
                                    error: error_message,
                                    attempts: result.attempts,
                                },
                                Some(resume_command(&work_item, None)),
                                clock,
                            ));
                        }
                    }
                }
            }
        }

        state.finish(RunStatus::Done);
        self.store.save(&state).await?;
        info!(
            passed = state.count(StageStatus::Passed),
            skipped = state.count(StageStatus::Skipped),
            "Pipeline completed"
        );
        let outcome = RunOutcome::Done {
            artifact: state.terminal_artifact().cloned(),
        };
        Ok(self.conclude(&state, outcome, None, clock))
    }

    /// Decide what happens to every stage, in order
    async fn plan(
        &self,
        state: &OrchestrationState,
        start: usize,
        resumed: bool,
        skip_existing: bool,
    ) -> Vec<PlannedStage> {
        let mut plan = Vec::with_capacity(self.stages.len());
        for descriptor in &self.stages {
            let idx = descriptor.ordinal;
            let action = if idx < start {
                PlanAction::Complete
            } else if let Some(artifact) = self
                .detect_skip(state, descriptor, skip_existing && !(resumed && idx == start))
                .await
            {
                PlanAction::Skip { artifact }
            } else if descriptor.gate && !state.approvals.contains(&descriptor.name) {
                PlanAction::Gated
            } else {
                PlanAction::Execute
            };
            plan.push(PlannedStage {
                stage: descriptor.name.clone(),
                action,
            });
        }
        plan
    }

    /// Ask the resolver for an existing artifact. Detection globs and hashes
    /// files, so it runs on the blocking pool.
    async fn detect_skip(
        &self,
        state: &OrchestrationState,
        descriptor: &StageDescriptor,
        enabled: bool,
    ) -> Option<ArtifactRef> {
        if !enabled || !descriptor.skip_existing {
            return None;
        }
        let resolver = Arc::clone(&self.artifacts);
        let work_item = state.work_item.clone();
        let target = descriptor.clone();
        let found = match tokio::task::spawn_blocking(move || resolver.detect(&work_item, &target)).await {
            Ok(found) => found,
            Err(e) => {
                warn!(stage = %descriptor.name, error = %e, "Artifact detection task failed, treating as absent");
                None
            }
        };
        match &found {
            Some(artifact) if artifact.is_valid() => {}
            Some(_) => {
                debug!(stage = %descriptor.name, "Ignoring invalid artifact reference");
                return None;
            }
            None => {}
        }
        found
    }

    /// Names of stages with artifacts, in pipeline order
    fn produced_so_far(&self, state: &OrchestrationState) -> Vec<String> {
        self.stages
            .iter()
            .filter(|d| state.artifacts.contains_key(&d.name))
            .map(|d| d.name.clone())
            .collect()
    }

    /// Report the final status and build the run report
    fn conclude(
        &self,
        state: &OrchestrationState,
        outcome: RunOutcome,
        resume: Option<String>,
        clock: Instant,
    ) -> RunReport {
        let stage = match &state.status {
            RunStatus::Blocked { stage, .. } | RunStatus::Failed { stage, .. } => Some(stage.clone()),
            _ => None,
        };
        self.emit(ProgressEvent::RunFinished {
            work_item: state.work_item.clone(),
            status: state.status.label().to_string(),
            stage,
            elapsed_ms: elapsed_ms(clock),
        });

        let mut report = self.report(state, outcome, clock);
        report.resume_command = resume;
        report
    }

    fn report(&self, state: &OrchestrationState, outcome: RunOutcome, clock: Instant) -> RunReport {
        RunReport {
            work_item: state.work_item.clone(),
            run_id: state.run_id,
            outcome,
            history: state.history.clone(),
            elapsed_ms: elapsed_ms(clock),
            resume_command: None,
        }
    }

    fn emit(&self, event: ProgressEvent) {
        report_safely(self.reporter.as_ref(), &event);
    }
}

fn elapsed_ms(clock: Instant) -> u64 {
    clock.elapsed().as_millis() as u64
}
