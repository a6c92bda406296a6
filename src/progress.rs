//! Human readable progress output.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::readiness::Phase;

/// Kind of progress notice.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressKind {
    /// A phase began.
    PhaseStarted,
    /// A phase completed successfully.
    PhaseFinished,
    /// A message relayed from the instance's progress stream.
    StreamMessage,
    /// A non-fatal problem.
    Warning,
    /// A fatal problem.
    Failure,
}

/// One timestamped progress notice.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProgressEvent {
    /// When the notice was raised.
    pub timestamp: DateTime<Utc>,
    /// Phase the notice belongs to.
    pub phase: Phase,
    /// Notice kind.
    pub kind: ProgressKind,
    /// Notice text.
    pub message: String,
}

impl ProgressEvent {
    /// Creates a notice stamped with the current time.
    #[must_use]
    pub fn now(phase: Phase, kind: ProgressKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            phase,
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = self.timestamp.format("%H:%M:%S");
        match self.kind {
            ProgressKind::Warning => write!(f, "[{time}] warning: {}", self.message),
            ProgressKind::Failure => write!(f, "[{time}] error: {}", self.message),
            ProgressKind::StreamMessage => write!(f, "[{time}]   {}", self.message),
            ProgressKind::PhaseStarted | ProgressKind::PhaseFinished => {
                write!(f, "[{time}] {}: {}", self.phase, self.message)
            }
        }
    }
}

/// Receives progress notices. Reporting never affects control flow.
pub trait ProgressReporter {
    /// Handles one notice.
    fn report(&self, event: &ProgressEvent);
}

/// Writes notices to standard error. When silent, relayed stream messages
/// are dropped while phase notices, warnings and failures still print.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsoleReporter {
    silent: bool,
}

impl ConsoleReporter {
    /// Creates a console reporter.
    #[must_use]
    pub const fn new(silent: bool) -> Self {
        Self { silent }
    }
}

impl ProgressReporter for ConsoleReporter {
    fn report(&self, event: &ProgressEvent) {
        info!(phase = %event.phase, kind = ?event.kind, message = %event.message);
        if self.silent && event.kind == ProgressKind::StreamMessage {
            return;
        }
        writeln!(io::stderr(), "{event}").ok();
    }
}

/// Keeps every notice in memory.
#[derive(Clone, Debug, Default)]
pub struct RecordingReporter {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl RecordingReporter {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the recorded notices.
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the text of every notice of `kind`.
    #[must_use]
    pub fn messages(&self, kind: ProgressKind) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|event| event.kind == kind)
            .map(|event| event.message)
            .collect()
    }
}

impl ProgressReporter for RecordingReporter {
    fn report(&self, event: &ProgressEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
