//! Command stage adapter.
//!
//! Runs a configured program as a pipeline stage. The program receives a
//! JSON `StageInput` on stdin and the stage context in `CONVEYOR_*`
//! environment variables. Its stdout becomes the stage artifact.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::core::artifacts::file_digest;
use crate::core::pipeline::{StageSettings, DEFAULT_BLOCKED_EXIT_CODE};
use crate::core::stage::{Stage, StageContext, StageOutcome};
use crate::core::state_store::write_atomic;
use crate::domain::{ArtifactRef, WorkItemId};

/// Lines of stderr kept in failure messages
const STDERR_TAIL_LINES: usize = 20;

/// Document written to the command's stdin
#[derive(Debug, Clone, Serialize)]
pub struct StageInput {
    pub work_item: WorkItemId,
    pub stage: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub artifact_dir: PathBuf,
    pub prior_artifacts: Vec<ArtifactRef>,
}

impl From<&StageContext> for StageInput {
    fn from(ctx: &StageContext) -> Self {
        Self {
            work_item: ctx.work_item.clone(),
            stage: ctx.stage.clone(),
            attempt: ctx.attempt,
            max_attempts: ctx.max_attempts,
            artifact_dir: ctx.artifact_dir.clone(),
            prior_artifacts: ctx.prior_artifacts().into_iter().cloned().collect(),
        }
    }
}

/// Stage backed by an external program
#[derive(Debug, Clone)]
pub struct CommandStage {
    program: String,
    args: Vec<String>,
    blocked_exit_code: i32,
}

impl CommandStage {
    /// Create a command stage from an argv (program first)
    pub fn new(argv: Vec<String>) -> Result<Self> {
        let mut parts = argv.into_iter();
        let Some(program) = parts.next().filter(|p| !p.trim().is_empty()) else {
            bail!("command stage needs a program to run");
        };
        Ok(Self {
            program,
            args: parts.collect(),
            blocked_exit_code: DEFAULT_BLOCKED_EXIT_CODE,
        })
    }

    /// Command stage for a configured stage, if it has a command
    pub fn from_settings(settings: &StageSettings) -> Option<Result<Self>> {
        settings.command.as_ref().map(|argv| {
            Self::new(argv.clone()).map(|stage| stage.with_blocked_exit_code(settings.blocked_exit_code))
        })
    }

    /// Exit code that signals "blocked" instead of failure
    pub fn with_blocked_exit_code(mut self, code: i32) -> Self {
        self.blocked_exit_code = code;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl Stage for CommandStage {
    #[instrument(skip_all, fields(stage = %ctx.stage, attempt = ctx.attempt, program = %self.program))]
    async fn run(&self, ctx: StageContext) -> Result<StageOutcome> {
        tokio::fs::create_dir_all(&ctx.artifact_dir)
            .await
            .with_context(|| format!("Failed to create artifact dir {}", ctx.artifact_dir.display()))?;

        let input = serde_json::to_vec(&StageInput::from(&ctx)).context("Failed to encode stage input")?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("CONVEYOR_WORK_ITEM", ctx.work_item.as_str())
            .env("CONVEYOR_STAGE", &ctx.stage)
            .env("CONVEYOR_ATTEMPT", ctx.attempt.to_string())
            .env("CONVEYOR_ARTIFACT_DIR", &ctx.artifact_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}' for stage '{}'", self.program, ctx.stage))?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&input).await {
                Ok(()) => {}
                // The program does not read its input
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    debug!("Command closed stdin early");
                }
                Err(e) => return Err(e).context("Failed to write stage input"),
            }
            // Drop stdin to signal EOF
        }

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for '{}'", self.program))?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        match output.status.code() {
            Some(0) => {}
            Some(code) if code == self.blocked_exit_code => {
                let reason = stderr.trim();
                let reason = if reason.is_empty() {
                    format!("'{}' exited with blocked code {}", self.program, code)
                } else {
                    reason.to_string()
                };
                return Ok(StageOutcome::Blocked { reason });
            }
            Some(code) => bail!(
                "'{}' exited with code {}: {}",
                self.program,
                code,
                tail(&stderr, STDERR_TAIL_LINES)
            ),
            None => bail!(
                "'{}' was terminated by a signal: {}",
                self.program,
                tail(&stderr, STDERR_TAIL_LINES)
            ),
        }

        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            bail!("'{}' succeeded but produced no output", self.program);
        }

        let path = ctx.artifact_dir.join(format!("{}.md", ctx.stage));
        let dir = ctx.artifact_dir.clone();
        let target = path.clone();
        let bytes = output.stdout;
        tokio::task::spawn_blocking(move || -> io::Result<(String, u64)> {
            write_atomic(&dir, &target, &bytes)?;
            Ok((file_digest(&target)?, bytes.len() as u64))
        })
        .await
        .context("Artifact writer task failed")?
        .map(|(digest, size)| {
            debug!(path = %path.display(), size, "Artifact written");
            StageOutcome::Produced(
                ArtifactRef::new(&ctx.stage, path.to_string_lossy()).with_content(digest, size),
            )
        })
        .with_context(|| format!("Failed to write artifact {}", path.display()))
    }
}

/// Last `lines` lines of a text, trimmed
fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
