//! Stage execution with deadline, retry and classification.
//!
//! Each attempt runs on its own task under `tokio::time::timeout`. The
//! attempt number is persisted before the stage is invoked, so a crash in
//! the middle of a retry sequence resumes with the remaining budget only.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{ArtifactRef, OrchestrationState, ProgressEvent, StageResult, StageStatus};

use super::reporter::{report_safely, NullReporter, ProgressReporter};
use super::stage::{StageContext, StageDescriptor, StageOutcome};
use super::state_store::{StateError, StateStore};

/// Aborts the stage task when the attempt is abandoned
struct AbortGuard(AbortHandle);

impl Drop for AbortGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Classified result of a single attempt
#[derive(Debug)]
enum Attempt {
    Passed(ArtifactRef),
    Blocked(String),
    Failed(String),
}

/// Runs one stage to a conclusive `StageResult`
pub struct StageExecutor {
    store: StateStore,
    reporter: Arc<dyn ProgressReporter>,
}

impl StageExecutor {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            reporter: Arc::new(NullReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Execute a stage, retrying failures within its budget.
    ///
    /// Only persistence failures are errors; stage failures come back as a
    /// `failed` result. The result is not recorded into `state`.
    #[instrument(skip_all, fields(work_item = %state.work_item, stage = %descriptor.name))]
    pub async fn run(
        &self,
        descriptor: &StageDescriptor,
        state: &mut OrchestrationState,
        artifact_dir: PathBuf,
    ) -> Result<StageResult, StateError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let max_attempts = descriptor.max_attempts();
        let consumed = state.attempts_in_flight(&descriptor.name);

        if consumed >= max_attempts {
            error!(
                attempts = consumed,
                max_attempts, "Retry budget already exhausted by interrupted attempts"
            );
            return Ok(StageResult::new(&descriptor.name, StageStatus::Failed, started_at)
                .with_attempts(consumed)
                .with_duration(elapsed_ms(clock))
                .with_error(format!(
                    "retry budget exhausted: {} of {} attempts used before interruption",
                    consumed, max_attempts
                )));
        }
        if consumed > 0 {
            info!(consumed, max_attempts, "Continuing interrupted stage");
        }

        let mut last_error = String::new();
        for attempt in (consumed + 1)..=max_attempts {
            state.begin_attempt(&descriptor.name, attempt);
            self.store.save(state).await?;

            let ctx = StageContext {
                work_item: state.work_item.clone(),
                stage: descriptor.name.clone(),
                ordinal: descriptor.ordinal,
                attempt,
                max_attempts,
                artifact_dir: artifact_dir.clone(),
                state: Arc::new(state.clone()),
            };

            debug!(attempt, max_attempts, "Invoking stage");
            match invoke(descriptor, ctx).await {
                Attempt::Passed(artifact) => {
                    return Ok(StageResult::new(&descriptor.name, StageStatus::Passed, started_at)
                        .with_artifact(artifact)
                        .with_attempts(attempt)
                        .with_duration(elapsed_ms(clock)));
                }
                Attempt::Blocked(reason) => {
                    warn!(attempt, reason = %reason, "Stage blocked");
                    return Ok(StageResult::new(&descriptor.name, StageStatus::Blocked, started_at)
                        .with_error(reason)
                        .with_attempts(attempt)
                        .with_duration(elapsed_ms(clock)));
                }
                Attempt::Failed(message) => {
                    if attempt < max_attempts {
                        let delay = descriptor.backoff.delay_for_attempt(attempt);
                        warn!(
                            attempt,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %message,
                            "Stage attempt failed, retrying"
                        );
                        report_safely(
                            self.reporter.as_ref(),
                            &ProgressEvent::AttemptFailed {
                                work_item: state.work_item.clone(),
                                stage: descriptor.name.clone(),
                                attempt,
                                max_attempts,
                                error: message.clone(),
                                retry_in_ms: delay.as_millis() as u64,
                            },
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = message;
                }
            }
        }

        error!(attempts = max_attempts, error = %last_error, "Stage failed after all attempts");
        Ok(StageResult::new(&descriptor.name, StageStatus::Failed, started_at)
            .with_error(last_error)
            .with_attempts(max_attempts)
            .with_duration(elapsed_ms(clock)))
    }
}

/// One attempt on its own task, bounded by the stage timeout
async fn invoke(descriptor: &StageDescriptor, ctx: StageContext) -> Attempt {
    let stage = Arc::clone(&descriptor.stage);
    let handle = tokio::spawn(async move { stage.run(ctx).await });
    let _guard = AbortGuard(handle.abort_handle());

    match tokio::time::timeout(descriptor.timeout, handle).await {
        Err(_) => Attempt::Failed(format!(
            "timed out after {}s",
            descriptor.timeout.as_secs_f64()
        )),
        Ok(Err(join)) if join.is_panic() => {
            Attempt::Failed(format!("stage panicked: {}", panic_message(join.into_panic())))
        }
        Ok(Err(join)) => Attempt::Failed(format!("stage task cancelled: {}", join)),
        Ok(Ok(Err(e))) => Attempt::Failed(format!("{:#}", e)),
        Ok(Ok(Ok(StageOutcome::Blocked { reason }))) => Attempt::Blocked(reason),
        Ok(Ok(Ok(StageOutcome::Produced(artifact)))) => check_artifact(&descriptor.name, artifact),
    }
}

fn check_artifact(stage: &str, mut artifact: ArtifactRef) -> Attempt {
    if artifact.stage.trim().is_empty() {
        artifact.stage = stage.to_string();
    }
    if artifact.stage != stage {
        return Attempt::Failed(format!(
            "invalid artifact: produced for stage '{}'",
            artifact.stage
        ));
    }
    if !artifact.is_valid() {
        return Attempt::Failed("invalid artifact: empty location".to_string());
    }
    Attempt::Passed(artifact)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn elapsed_ms(clock: Instant) -> u64 {
    clock.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipeline::{PipelineConfig, RetryPolicy};
    use crate::core::stage::Stage;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    use crate::domain::WorkItemId;

    /// Fails `failures` times, then produces an artifact
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Stage for Flaky {
        async fn run(&self, ctx: StageContext) -> Result<StageOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                bail!("transient failure {}", call);
            }
            Ok(StageOutcome::Produced(ArtifactRef::new(ctx.stage, "out.md")))
        }
    }

    struct Sleepy;

    #[async_trait]
    impl Stage for Sleepy {
        async fn run(&self, _ctx: StageContext) -> Result<StageOutcome> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(StageOutcome::blocked("unreachable"))
        }
    }

    struct Panics;

    #[async_trait]
    impl Stage for Panics {
        async fn run(&self, _ctx: StageContext) -> Result<StageOutcome> {
            panic!("stage exploded");
        }
    }

    struct WrongStage;

    #[async_trait]
    impl Stage for WrongStage {
        async fn run(&self, _ctx: StageContext) -> Result<StageOutcome> {
            Ok(StageOutcome::Produced(ArtifactRef::new("other", "x.md")))
        }
    }

    fn descriptor(stage: Arc<dyn Stage>, max_retries: u32, timeout: Duration) -> StageDescriptor {
        StageDescriptor {
            name: "build".to_string(),
            ordinal: 3,
            stage,
            timeout,
            max_retries,
            backoff: RetryPolicy {
                initial_delay_ms: 1,
                max_delay_ms: 5,
                multiplier: 2.0,
            },
            gate: false,
            skip_existing: false,
            artifact_pattern: "{stage}.md".to_string(),
        }
    }

    fn setup() -> (TempDir, StageExecutor, OrchestrationState) {
        let temp = TempDir::new().unwrap();
        let executor = StageExecutor::new(StateStore::new(temp.path()));
        let mut state =
            OrchestrationState::new(WorkItemId::new("42").unwrap(), PipelineConfig::default());
        state.begin_stage("build");
        (temp, executor, state)
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let (temp, executor, mut state) = setup();
        let flaky = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let desc = descriptor(flaky.clone(), 2, Duration::from_secs(5));

        let result = executor.run(&desc, &mut state, temp.path().into()).await.unwrap();

        assert_eq!(result.status, StageStatus::Passed);
        assert_eq!(result.attempts, 3);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_bounded_by_max_retries() {
        let (temp, executor, mut state) = setup();
        let flaky = Arc::new(Flaky {
            failures: 100,
            calls: AtomicU32::new(0),
        });
        let desc = descriptor(flaky.clone(), 1, Duration::from_secs(5));

        let result = executor.run(&desc, &mut state, temp.path().into()).await.unwrap();

        assert_eq!(result.status, StageStatus::Failed);
        assert_eq!(result.attempts, 2);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
        assert!(result.error.unwrap().contains("transient failure 2"));
    }

    #[tokio::test]
    async fn test_attempt_count_is_persisted() {
        let (temp, executor, mut state) = setup();
        let flaky = Arc::new(Flaky {
            failures: 100,
            calls: AtomicU32::new(0),
        });
        let desc = descriptor(flaky, 0, Duration::from_secs(5));
        executor.run(&desc, &mut state, temp.path().into()).await.unwrap();

        let saved = StateStore::new(temp.path())
            .load(&state.work_item)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.attempts_in_flight("build"), 1);
    }

    #[tokio::test]
    async fn test_interrupted_budget_is_honoured() {
        let (temp, executor, mut state) = setup();
        state.begin_attempt("build", 2);
        let flaky = Arc::new(Flaky {
            failures: 100,
            calls: AtomicU32::new(0),
        });

        // one retry allowed: two attempts, both already used
        let desc = descriptor(flaky.clone(), 1, Duration::from_secs(5));
        let result = executor.run(&desc, &mut state, temp.path().into()).await.unwrap();

        assert_eq!(result.status, StageStatus::Failed);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure() {
        let (temp, executor, mut state) = setup();
        let desc = descriptor(Arc::new(Sleepy), 0, Duration::from_millis(20));

        let result = executor.run(&desc, &mut state, temp.path().into()).await.unwrap();

        assert_eq!(result.status, StageStatus::Failed);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_panic_is_a_failure() {
        let (temp, executor, mut state) = setup();
        let desc = descriptor(Arc::new(Panics), 0, Duration::from_secs(5));

        let result = executor.run(&desc, &mut state, temp.path().into()).await.unwrap();

        assert_eq!(result.status, StageStatus::Failed);
        assert!(result.error.unwrap().contains("stage exploded"));
    }

    #[tokio::test]
    async fn test_artifact_for_other_stage_is_invalid() {
        let (temp, executor, mut state) = setup();
        let desc = descriptor(Arc::new(WrongStage), 0, Duration::from_secs(5));

        let result = executor.run(&desc, &mut state, temp.path().into()).await.unwrap();

        assert_eq!(result.status, StageStatus::Failed);
        assert!(result.error.unwrap().contains("invalid artifact"));
    }

    #[test]
    fn test_blank_artifact_stage_is_filled_in() {
        match check_artifact("spec", ArtifactRef::new("", "spec.md")) {
            Attempt::Passed(artifact) => assert_eq!(artifact.stage, "spec"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
