//! Run reporting
//!
//! Turns the lifecycle events relayed from the test host into per-run
//! summaries. Only `specDone` payloads are inspected; the other events mark
//! run boundaries.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::transport::{HostMessage, TransportBridge};

// ---------------------------------------------------------------------------
// SpecStatus
// ---------------------------------------------------------------------------

/// Outcome of a single spec as reported by the framework.
#[derive(Debug, Clone, PartialEq)]
pub enum SpecStatus {
    Passed,
    /// Failed with the messages of every failed expectation.
    Failed { messages: Vec<String> },
    /// `xit`, `pending()` or an empty body.
    Pending,
    /// Filtered out (focused run, id filter).
    Excluded,
}

impl SpecStatus {
    /// Decode the `status` / `failedExpectations` fields of a spec result
    pub fn from_result(result: &Value) -> Self {
        match result.get("status").and_then(Value::as_str) {
            Some("passed") => SpecStatus::Passed,
            Some("failed") => {
                let messages = result
                    .get("failedExpectations")
                    .and_then(Value::as_array)
                    .map(|list| {
                        list.iter()
                            .filter_map(|e| e.get("message").and_then(Value::as_str))
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                SpecStatus::Failed { messages }
            }
            Some("excluded") => SpecStatus::Excluded,
            _ => SpecStatus::Pending,
        }
    }
}

impl fmt::Display for SpecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecStatus::Passed => write!(f, "PASSED"),
            SpecStatus::Failed { messages } => write!(f, "FAILED: {}", messages.join("; ")),
            SpecStatus::Pending => write!(f, "PENDING"),
            SpecStatus::Excluded => write!(f, "EXCLUDED"),
        }
    }
}

// ---------------------------------------------------------------------------
// RunSummary
// ---------------------------------------------------------------------------

/// Summary of one run inside the host (from `started` to `done`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub pending: usize,
    pub excluded: usize,
    /// Full names and messages of failed specs, in completion order.
    pub failures: Vec<(String, Vec<String>)>,
    /// `overallStatus` from the `done` payload.
    pub overall_status: Option<String>,
    /// Set when the host aborted the run.
    pub aborted: Option<String>,
    pub duration: Duration,
}

impl RunSummary {
    fn record(&mut self, full_name: String, status: SpecStatus) {
        self.total += 1;
        match status {
            SpecStatus::Passed => self.passed += 1,
            SpecStatus::Failed { messages } => {
                self.failed += 1;
                self.failures.push((full_name, messages));
            }
            SpecStatus::Pending => self.pending += 1,
            SpecStatus::Excluded => self.excluded += 1,
        }
    }

    /// Whether the run finished without failures or abort
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.aborted.is_none()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(f, "  Spec Run")?;
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;

        for (name, messages) in &self.failures {
            writeln!(f, "\n  ✗ {}", name)?;
            for message in messages {
                writeln!(f, "      {}", message)?;
            }
        }
        if let Some(reason) = &self.aborted {
            writeln!(f, "\n  ⚠ run aborted: {}", reason)?;
        }

        writeln!(f, "\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(
            f,
            "  Total: {}  Passed: {}  Failed: {}  Pending: {}  Excluded: {}",
            self.total, self.passed, self.failed, self.pending, self.excluded
        )?;
        writeln!(f, "  Duration: {:?}", self.duration)?;
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

/// Sink for host lifecycle events
pub trait Reporter: Send {
    fn on_host_message(&mut self, message: &HostMessage);
}

/// Reporter that logs progress and prints a summary after every run.
#[derive(Debug, Default)]
pub struct ConsoleReporter {
    current: RunSummary,
    started_at: Option<Instant>,
    finished: Vec<RunSummary>,
    /// Errors the host raised while applying updates
    pub hmr_errors: Vec<String>,
    /// Print the rendered summary to stdout when a run ends
    pub echo: bool,
}

impl ConsoleReporter {
    pub fn new(echo: bool) -> Self {
        Self {
            echo,
            ..Self::default()
        }
    }

    /// Summaries of every finished run, oldest first
    pub fn runs(&self) -> &[RunSummary] {
        &self.finished
    }

    /// The run in progress
    pub fn current(&self) -> &RunSummary {
        &self.current
    }

    fn finish(&mut self) {
        if let Some(started) = self.started_at.take() {
            self.current.duration = started.elapsed();
        }
        let summary = std::mem::take(&mut self.current);
        info!(
            total = summary.total,
            passed = summary.passed,
            failed = summary.failed,
            "spec run finished"
        );
        if self.echo {
            print!("{}", summary);
        }
        self.finished.push(summary);
    }
}

impl Reporter for ConsoleReporter {
    fn on_host_message(&mut self, message: &HostMessage) {
        match message {
            HostMessage::Ready => debug!("host ready"),
            HostMessage::Error { error } => {
                warn!("host failed to apply update: {}", error);
                self.hmr_errors.push(error.clone());
            }
            HostMessage::Started { .. } => {
                self.current = RunSummary::default();
                self.started_at = Some(Instant::now());
            }
            HostMessage::SpecDone { result } => {
                let name = result
                    .get("fullName")
                    .and_then(Value::as_str)
                    .unwrap_or("<unnamed spec>")
                    .to_string();
                let status = SpecStatus::from_result(result);
                debug!(spec = %name, %status, "spec done");
                self.current.record(name, status);
            }
            HostMessage::Done { result } => {
                self.current.overall_status = result
                    .get("overallStatus")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.finish();
            }
            HostMessage::TestsAborted { message } => {
                let reason = message.clone().unwrap_or_else(|| "no reason given".to_string());
                warn!("tests aborted: {}", reason);
                self.current.aborted = Some(reason);
                self.finish();
            }
            HostMessage::SuiteStarted { .. }
            | HostMessage::SpecStarted { .. }
            | HostMessage::SuiteDone { .. } => {}
        }
    }
}

/// Route every host message arriving on `bridge` into `reporter`
pub fn attach<R: Reporter + 'static>(bridge: &TransportBridge, reporter: Arc<Mutex<R>>) {
    bridge.on_host_message(move |message| reporter.lock().on_host_message(message));
}
