//! Orchestration Integration Tests
//!
//! End-to-end runs of the orchestrator with scripted stages: skipping,
//! retries, gates, resume, mutual exclusion and lock release.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use conveyor::core::{
    ConfigOverrides, LockRecord, Orchestrator, OrchestratorError, PipelineConfig,
    ProgressReporter, RunOutcome, RunRequest, Stage, StageContext, StageOutcome, StageRegistry,
    StateStore,
};
use conveyor::domain::{
    ArtifactRef, OrchestrationState, PlanAction, ProgressEvent, RunStatus, StageResult,
    StageStatus, WorkItemId,
};
use filetime::FileTime;
use tempfile::TempDir;
use tokio::sync::Notify;

// ============================================================================
// Test doubles
// ============================================================================

#[derive(Clone)]
enum Behavior {
    Produce,
    Fail,
    Block(&'static str),
    Hang,
    Wait {
        started: Arc<Notify>,
        release: Arc<Notify>,
    },
}

struct Scripted {
    behavior: Behavior,
    calls: Arc<Mutex<Vec<String>>>,
}

fn produce(ctx: &StageContext) -> Result<StageOutcome> {
    fs::create_dir_all(&ctx.artifact_dir)?;
    let path = ctx.artifact_dir.join(format!("{}.md", ctx.stage));
    fs::write(&path, format!("# {}\n", ctx.stage))?;
    Ok(StageOutcome::Produced(ArtifactRef::new(
        &ctx.stage,
        path.to_string_lossy(),
    )))
}

#[async_trait]
impl Stage for Scripted {
    async fn run(&self, ctx: StageContext) -> Result<StageOutcome> {
        self.calls.lock().unwrap().push(ctx.stage.clone());
        match &self.behavior {
            Behavior::Produce => produce(&ctx),
            Behavior::Fail => bail!("{} always fails", ctx.stage),
            Behavior::Block(reason) => Ok(StageOutcome::blocked(*reason)),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                bail!("unreachable")
            }
            Behavior::Wait { started, release } => {
                started.notify_one();
                release.notified().await;
                produce(&ctx)
            }
        }
    }
}

/// Keeps every event it receives
#[derive(Default)]
struct Collect(Mutex<Vec<ProgressEvent>>);

impl Collect {
    fn kinds(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().iter().map(|e| e.kind()).collect()
    }
}

impl ProgressReporter for Collect {
    fn report(&self, event: &ProgressEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

struct Panicking;

impl ProgressReporter for Panicking {
    fn report(&self, _event: &ProgressEvent) {
        panic!("reporter bug");
    }
}

/// Checks that the state file already reflects each reported transition
struct StateAuditor {
    path: PathBuf,
    violations: Mutex<Vec<String>>,
}

impl ProgressReporter for StateAuditor {
    fn report(&self, event: &ProgressEvent) {
        let persisted: Option<OrchestrationState> = fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok());
        let Some(state) = persisted else {
            self.violations
                .lock()
                .unwrap()
                .push(format!("{}: no state file", event.kind()));
            return;
        };

        let ok = match event {
            ProgressEvent::StageStarted { stage, .. } => {
                state.current_stage.as_deref() == Some(stage.as_str())
            }
            ProgressEvent::StageFinished { result, .. } => state
                .history
                .last()
                .is_some_and(|last| last.stage == result.stage && last.status == result.status),
            ProgressEvent::RunFinished { status, .. } => state.status.label() == status,
            _ => true,
        };
        if !ok {
            self.violations
                .lock()
                .unwrap()
                .push(format!("{} reported before it was persisted", event.kind()));
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    temp: TempDir,
    calls: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    fn new() -> Self {
        Self {
            temp: TempDir::new().unwrap(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn home(&self) -> PathBuf {
        self.temp.path().join("home")
    }

    fn artifacts(&self) -> PathBuf {
        self.temp.path().join("artifacts")
    }

    fn store(&self) -> StateStore {
        StateStore::new(self.home().join("state"))
    }

    fn state_path(&self) -> PathBuf {
        self.home().join("state").join("42.json")
    }

    fn lock_path(&self) -> PathBuf {
        self.home().join("locks").join("42.lock")
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn orchestrator(
        &self,
        config: PipelineConfig,
        behaviors: &[(&str, Behavior)],
        reporter: Arc<dyn ProgressReporter>,
    ) -> Orchestrator {
        let behaviors: HashMap<&str, Behavior> = behaviors.iter().cloned().collect();
        let mut registry = StageRegistry::new();
        for name in config.stage_names() {
            let behavior = behaviors.get(name).cloned().unwrap_or(Behavior::Produce);
            registry.register(
                name,
                Arc::new(Scripted {
                    behavior,
                    calls: Arc::clone(&self.calls),
                }),
            );
        }
        Orchestrator::builder(config, registry)
            .home(self.home())
            .artifacts_root(self.artifacts())
            .reporter(reporter)
            .build()
            .unwrap()
    }

    fn simple(&self, behaviors: &[(&str, Behavior)]) -> Orchestrator {
        self.orchestrator(config(&[]), behaviors, Arc::new(Collect::default()))
    }

    fn write_artifact(&self, stage: &str) {
        let dir = self.artifacts().join("42");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{}.md", stage)), format!("# {} (existing)\n", stage)).unwrap();
    }
}

/// Resolved config with fast backoff plus `key=value` overrides
fn config(sets: &[&str]) -> PipelineConfig {
    let mut overrides = ConfigOverrides::default();
    overrides.set("backoff.initial_delay_ms", "1").unwrap();
    overrides.set("backoff.max_delay_ms", "5").unwrap();
    for assignment in sets {
        overrides.set_assignment(assignment).unwrap();
    }
    PipelineConfig::resolve(&overrides).unwrap()
}

fn id() -> WorkItemId {
    WorkItemId::new("42").unwrap()
}

fn passed(stage: &str) -> StageResult {
    StageResult::new(stage, StageStatus::Passed, Utc::now())
        .with_artifact(ArtifactRef::new(stage, format!("{}.md", stage)))
        .with_attempts(1)
}

// ============================================================================
// Core scenarios
// ============================================================================

#[tokio::test]
async fn test_dry_run_plans_without_side_effects() {
    let h = Harness::new();
    let orch = h.simple(&[]);

    let report = orch.run(RunRequest::new(id()).dry_run()).await.unwrap();

    let RunOutcome::Planned { stages } = &report.outcome else {
        panic!("expected a plan, got {:?}", report.outcome);
    };
    let names: Vec<&str> = stages.iter().map(|p| p.stage.as_str()).collect();
    assert_eq!(names, vec!["triage", "design", "spec", "build", "publish"]);
    assert!(stages.iter().all(|p| p.action == PlanAction::Execute));

    assert!(h.calls().is_empty());
    assert!(!h.state_path().exists());
    assert!(!h.lock_path().exists());
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn test_existing_artifact_skips_stage() {
    let h = Harness::new();
    h.write_artifact("design");
    let orch = h.simple(&[]);

    let report = orch.run(RunRequest::new(id())).await.unwrap();

    assert!(report.is_done());
    assert_eq!(h.calls(), vec!["triage", "spec", "build", "publish"]);

    let design = report.history.iter().find(|r| r.stage == "design").unwrap();
    assert_eq!(design.status, StageStatus::Skipped);
    assert_eq!(design.attempts, 0);
    let artifact = design.artifact.as_ref().unwrap();
    assert!(artifact.location.ends_with("design.md"));
    assert!(artifact.digest.is_some());
}

#[tokio::test]
async fn test_failing_stage_exhausts_retries() {
    let h = Harness::new();
    let orch = h.simple(&[("spec", Behavior::Fail)]);

    let report = orch.run(RunRequest::new(id())).await.unwrap();

    match &report.outcome {
        RunOutcome::Failed {
            stage,
            error,
            attempts,
        } => {
            assert_eq!(stage, "spec");
            assert_eq!(*attempts, 3);
            assert!(error.contains("always fails"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    let spec = report.history.last().unwrap();
    assert_eq!(spec.stage, "spec");
    assert_eq!(spec.status, StageStatus::Failed);
    assert_eq!(spec.attempts, 3);
    assert_eq!(h.calls().iter().filter(|s| *s == "spec").count(), 3);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.resume_command.as_deref(), Some("conveyor run 42 --resume"));

    let state = h.store().load(&id()).await.unwrap().unwrap();
    assert!(matches!(state.status, RunStatus::Failed { ref stage, .. } if stage == "spec"));
    assert!(!h.lock_path().exists());
}

#[tokio::test]
async fn test_resume_after_crash_starts_at_next_stage() {
    let h = Harness::new();

    // State as left by a process killed right after design was persisted
    let mut state = OrchestrationState::new(id(), config(&[]));
    state.begin_stage("triage");
    state.record(passed("triage"));
    state.begin_stage("design");
    state.record(passed("design"));
    h.store().save(&state).await.unwrap();

    let orch = h.simple(&[]);
    let report = orch.run(RunRequest::new(id()).resume()).await.unwrap();

    assert!(report.is_done());
    assert_eq!(h.calls(), vec!["spec", "build", "publish"]);
    assert_eq!(report.run_id, state.run_id);
}

#[tokio::test]
async fn test_concurrent_invocation_is_refused() {
    let h = Harness::new();
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let first = h.simple(&[(
        "triage",
        Behavior::Wait {
            started: Arc::clone(&started),
            release: Arc::clone(&release),
        },
    )]);
    let second = h.simple(&[]);

    let run_first = first.run(RunRequest::new(id()));
    let run_second = async {
        started.notified().await;
        let before = fs::read_to_string(h.state_path()).unwrap();
        let result = second.run(RunRequest::new(id())).await;
        let after = fs::read_to_string(h.state_path()).unwrap();
        release.notify_one();
        (result, before, after)
    };

    let (first_result, (second_result, before, after)) = tokio::join!(run_first, run_second);

    assert!(first_result.unwrap().is_done());
    match second_result {
        Err(OrchestratorError::Concurrency(e)) => {
            assert_eq!(e.work_item, id());
            assert_eq!(e.holder.map(|record| record.pid), Some(std::process::id()));
        }
        other => panic!("expected concurrency error, got {:?}", other.map(|r| r.outcome)),
    }
    assert_eq!(before, after);
    assert!(!h.lock_path().exists());
}

// ============================================================================
// Gates and blocking
// ============================================================================

#[tokio::test]
async fn test_gate_blocks_until_approved() {
    let h = Harness::new();
    let collect = Arc::new(Collect::default());
    let orch = h.orchestrator(config(&["stages.spec.gate=true"]), &[], collect.clone());

    let report = orch.run(RunRequest::new(id())).await.unwrap();

    match &report.outcome {
        RunOutcome::Blocked { stage, reason } => {
            assert_eq!(stage, "spec");
            assert!(reason.contains("approval"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(report.exit_code(), 2);
    assert_eq!(
        report.resume_command.as_deref(),
        Some("conveyor run 42 --resume --approve spec")
    );
    assert_eq!(h.calls(), vec!["triage", "design"]);
    assert!(collect.kinds().contains(&"gate_blocked"));
    assert!(!h.lock_path().exists());

    // Without approval the gate still holds
    let report = orch.run(RunRequest::new(id()).resume()).await.unwrap();
    assert!(matches!(report.outcome, RunOutcome::Blocked { .. }));
    assert_eq!(h.calls(), vec!["triage", "design"]);

    let report = orch
        .run(RunRequest::new(id()).resume().approve("spec"))
        .await
        .unwrap();
    assert!(report.is_done());
    assert_eq!(h.calls(), vec!["triage", "design", "spec", "build", "publish"]);

    let state = h.store().load(&id()).await.unwrap().unwrap();
    assert!(state.approvals.contains("spec"));
}

#[tokio::test]
async fn test_gate_does_not_apply_to_skipped_stage() {
    let h = Harness::new();
    h.write_artifact("spec");
    let orch = h.orchestrator(config(&["stages.spec.gate=true"]), &[], Arc::new(Collect::default()));

    let report = orch.run(RunRequest::new(id())).await.unwrap();

    assert!(report.is_done());
    assert!(!h.calls().contains(&"spec".to_string()));
}

#[tokio::test]
async fn test_blocked_stage_is_not_retried() {
    let h = Harness::new();
    let orch = h.simple(&[("build", Behavior::Block("waiting on vendor"))]);

    let report = orch.run(RunRequest::new(id())).await.unwrap();

    match &report.outcome {
        RunOutcome::Blocked { stage, reason } => {
            assert_eq!(stage, "build");
            assert_eq!(reason, "waiting on vendor");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(h.calls().iter().filter(|s| *s == "build").count(), 1);
    assert_eq!(report.history.last().unwrap().status, StageStatus::Blocked);
    assert!(!h.lock_path().exists());
}

// ============================================================================
// Resume
// ============================================================================

#[tokio::test]
async fn test_resume_of_done_run_executes_nothing() {
    let h = Harness::new();
    let orch = h.simple(&[]);
    orch.run(RunRequest::new(id())).await.unwrap();
    h.clear_calls();

    let report = orch.run(RunRequest::new(id()).resume()).await.unwrap();

    assert!(report.is_done());
    assert!(h.calls().is_empty());
    assert_eq!(report.history.len(), 5);
}

#[tokio::test]
async fn test_resume_from_explicit_stage() {
    let h = Harness::new();
    let orch = h.simple(&[]);
    orch.run(RunRequest::new(id())).await.unwrap();
    h.clear_calls();

    let report = orch
        .run(RunRequest::new(id()).resume_from("build"))
        .await
        .unwrap();

    assert!(report.is_done());
    // build re-runs even though its artifact exists; publish is skipped
    assert_eq!(h.calls(), vec!["build"]);
    assert_eq!(report.history.last().unwrap().status, StageStatus::Skipped);
}

#[tokio::test]
async fn test_resume_after_failure_retries_failed_stage() {
    let h = Harness::new();
    let failing = h.simple(&[("build", Behavior::Fail)]);
    failing.run(RunRequest::new(id())).await.unwrap();
    drop(failing);
    h.clear_calls();

    let fixed = h.simple(&[]);
    let report = fixed
        .run(RunRequest::new(id()).resume().skip_existing(false))
        .await
        .unwrap();

    assert!(report.is_done());
    assert_eq!(h.calls(), vec!["build", "publish"]);
}

#[tokio::test]
async fn test_resume_without_state_starts_fresh() {
    let h = Harness::new();
    let orch = h.simple(&[]);

    let report = orch.run(RunRequest::new(id()).resume()).await.unwrap();

    assert!(report.is_done());
    assert_eq!(h.calls().len(), 5);
}

#[tokio::test]
async fn test_interrupted_budget_carries_over() {
    let h = Harness::new();

    // Crash while spec was on its third (last) attempt
    let mut state = OrchestrationState::new(id(), config(&[]));
    state.begin_stage("triage");
    state.record(passed("triage"));
    state.begin_stage("design");
    state.record(passed("design"));
    state.begin_stage("spec");
    state.begin_attempt("spec", 3);
    h.store().save(&state).await.unwrap();

    let orch = h.simple(&[]);
    let report = orch.run(RunRequest::new(id()).resume()).await.unwrap();

    match &report.outcome {
        RunOutcome::Failed { stage, attempts, .. } => {
            assert_eq!(stage, "spec");
            assert_eq!(*attempts, 3);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(h.calls().is_empty());
}

#[tokio::test]
async fn test_corrupt_state_is_a_hard_stop() {
    let h = Harness::new();
    fs::create_dir_all(h.state_path().parent().unwrap()).unwrap();
    fs::write(h.state_path(), "{ \"work_item\": ").unwrap();
    let orch = h.simple(&[]);

    let err = orch.run(RunRequest::new(id()).resume()).await.unwrap_err();

    assert!(err.is_corruption());
    assert_eq!(err.exit_code(), 5);
    assert!(h.calls().is_empty());
    assert!(!h.lock_path().exists());
}

// ============================================================================
// Lock release and recovery
// ============================================================================

#[tokio::test]
async fn test_interrupt_releases_lock_and_resumes() {
    let h = Harness::new();
    let hanging = h.simple(&[("design", Behavior::Hang)]);

    let err = hanging
        .run_until(
            RunRequest::new(id()),
            tokio::time::sleep(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();

    match &err {
        OrchestratorError::Interrupted { resume_command, .. } => {
            assert_eq!(resume_command, "conveyor run 42 --resume");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.exit_code(), 6);
    assert!(!h.lock_path().exists());

    let state = h.store().load(&id()).await.unwrap().unwrap();
    assert_eq!(state.current_stage.as_deref(), Some("design"));
    assert_eq!(state.attempts_in_flight("design"), 1);
    drop(hanging);

    h.clear_calls();
    let report = h
        .simple(&[])
        .run(RunRequest::new(id()).resume())
        .await
        .unwrap();
    assert!(report.is_done());
    assert_eq!(h.calls(), vec!["design", "spec", "build", "publish"]);
}

#[tokio::test]
async fn test_stale_lock_from_dead_process_is_reclaimed() {
    let h = Harness::new();
    fs::create_dir_all(h.lock_path().parent().unwrap()).unwrap();
    let record = LockRecord {
        work_item: id(),
        pid: 999_999,
        token: uuid::Uuid::new_v4(),
        acquired_at: Utc::now() - chrono::Duration::hours(3),
    };
    fs::write(h.lock_path(), serde_json::to_vec(&record).unwrap()).unwrap();
    let old = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(3 * 3600));
    filetime::set_file_mtime(h.lock_path(), old).unwrap();

    let report = h.simple(&[]).run(RunRequest::new(id())).await.unwrap();

    assert!(report.is_done());
    assert!(!h.lock_path().exists());
}

#[tokio::test]
async fn test_abandoned_empty_lock_file_is_reclaimed() {
    let h = Harness::new();
    fs::create_dir_all(h.lock_path().parent().unwrap()).unwrap();
    fs::write(h.lock_path(), b"").unwrap();
    let old = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(60));
    filetime::set_file_mtime(h.lock_path(), old).unwrap();

    let report = h.simple(&[]).run(RunRequest::new(id())).await.unwrap();

    assert!(report.is_done());
}

// ============================================================================
// Reporting
// ============================================================================

#[tokio::test]
async fn test_all_skipped_pipeline_still_finalizes() {
    let h = Harness::new();
    for stage in ["triage", "design", "spec", "build", "publish"] {
        h.write_artifact(stage);
    }
    let collect = Arc::new(Collect::default());
    let orch = h.orchestrator(config(&[]), &[], collect.clone());

    let report = orch.run(RunRequest::new(id())).await.unwrap();

    assert!(h.calls().is_empty());
    let RunOutcome::Done { artifact } = &report.outcome else {
        panic!("expected done, got {:?}", report.outcome);
    };
    assert!(artifact.as_ref().unwrap().location.ends_with("publish.md"));
    assert_eq!(
        collect.kinds(),
        vec![
            "run_started",
            "stage_skipped",
            "stage_skipped",
            "stage_skipped",
            "stage_skipped",
            "stage_skipped",
            "run_finished"
        ]
    );

    let state = h.store().load(&id()).await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Done);
    assert_eq!(state.count(StageStatus::Skipped), 5);
}

#[tokio::test]
async fn test_no_skip_runs_every_stage() {
    let h = Harness::new();
    h.write_artifact("design");
    let orch = h.simple(&[]);

    orch.run(RunRequest::new(id()).skip_existing(false))
        .await
        .unwrap();

    assert_eq!(h.calls().len(), 5);
}

#[tokio::test]
async fn test_panicking_reporter_does_not_abort_run() {
    let h = Harness::new();
    let orch = h.orchestrator(config(&[]), &[], Arc::new(Panicking));

    let report = orch.run(RunRequest::new(id())).await.unwrap();

    assert!(report.is_done());
    assert!(!h.lock_path().exists());
}

#[tokio::test]
async fn test_transitions_are_persisted_before_reported() {
    let h = Harness::new();
    let auditor = Arc::new(StateAuditor {
        path: h.state_path(),
        violations: Mutex::new(Vec::new()),
    });
    let orch = h.orchestrator(
        config(&["stages.build.max_retries=1"]),
        &[("build", Behavior::Fail)],
        auditor.clone(),
    );

    orch.run(RunRequest::new(id())).await.unwrap();

    let violations = auditor.violations.lock().unwrap();
    assert!(violations.is_empty(), "violations: {:?}", *violations);
}

#[tokio::test]
async fn test_attempt_failures_are_reported() {
    let h = Harness::new();
    let collect = Arc::new(Collect::default());
    let orch = h.orchestrator(
        config(&["stages.triage.max_retries=2"]),
        &[("triage", Behavior::Fail)],
        collect.clone(),
    );

    orch.run(RunRequest::new(id())).await.unwrap();

    let kinds = collect.kinds();
    // two retries announced, the final failure is a stage result
    assert_eq!(kinds.iter().filter(|k| **k == "attempt_failed").count(), 2);
    assert_eq!(kinds.last(), Some(&"run_finished"));
}
