//! Progress reporting.
//!
//! Reporters are observers: they must never fail a run. Write errors are
//! logged and swallowed here, and the orchestrator additionally shields
//! itself from reporter panics.

use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use crate::domain::ProgressEvent;

/// Receives progress notifications from the orchestrator
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

/// Deliver an event, containing any panic raised by the reporter
pub fn report_safely(reporter: &dyn ProgressReporter, event: &ProgressEvent) {
    let delivered = panic::catch_unwind(AssertUnwindSafe(|| reporter.report(event)));
    if delivered.is_err() {
        error!(event = event.kind(), work_item = %event.work_item(), "Progress reporter panicked, event dropped");
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl ProgressReporter for NullReporter {
    fn report(&self, _event: &ProgressEvent) {}
}

/// Human-readable lines to a writer (stderr by default)
pub struct ConsoleReporter {
    out: Mutex<Box<dyn Write + Send>>,
    json: bool,
}

impl ConsoleReporter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            json: false,
        }
    }

    pub fn stderr() -> Self {
        Self::new(Box::new(io::stderr()))
    }

    /// Emit one JSON object per line instead of text
    pub fn json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    fn write_event(&self, event: &ProgressEvent) -> io::Result<()> {
        let line = if self.json {
            serde_json::to_string(event).map_err(io::Error::other)?
        } else {
            event.to_string()
        };
        let mut out = self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        writeln!(out, "{}", line)?;
        out.flush()
    }
}

impl ProgressReporter for ConsoleReporter {
    fn report(&self, event: &ProgressEvent) {
        if let Err(e) = self.write_event(event) {
            warn!(event = event.kind(), error = %e, "Failed to write progress");
        }
    }
}

/// Structured `tracing` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn report(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::StageStarted {
                work_item,
                stage,
                position,
                total_stages,
                elapsed_ms,
                ..
            } => info!(%work_item, stage = %stage, position, total_stages, elapsed_ms, "Stage started"),
            ProgressEvent::StageFinished {
                work_item,
                result,
                elapsed_ms,
            } => info!(
                %work_item,
                stage = %result.stage,
                status = %result.status,
                attempts = result.attempts,
                duration_ms = result.duration_ms,
                elapsed_ms,
                "Stage finished"
            ),
            ProgressEvent::AttemptFailed {
                work_item,
                stage,
                attempt,
                max_attempts,
                error,
                retry_in_ms,
            } => warn!(
                %work_item,
                stage = %stage,
                attempt,
                max_attempts,
                retry_in_ms,
                error = %error,
                "Stage attempt failed"
            ),
            other => info!(work_item = %other.work_item(), event = other.kind(), "{}", other),
        }
    }
}

/// Forwards every event to several reporters
#[derive(Default, Clone)]
pub struct FanoutReporter {
    reporters: Vec<Arc<dyn ProgressReporter>>,
}

impl FanoutReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporters.push(reporter);
        self
    }
}

impl ProgressReporter for FanoutReporter {
    fn report(&self, event: &ProgressEvent) {
        for reporter in &self.reporters {
            reporter.report(event);
        }
    }
}
