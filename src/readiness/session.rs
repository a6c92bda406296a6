//! Per-run deployment session state.

use chrono::Utc;
use tokio::time::Instant;

use crate::backend::InstanceHandle;
use crate::config::ApiToken;

use super::error::ReadinessError;
use super::phase::{DeploymentState, Phase, PhaseOutcome, PhaseRecord};

/// Token returned when a phase starts; handed back when it finishes.
#[derive(Debug)]
#[must_use = "a started phase must be finished"]
pub struct PhaseStart {
    phase: Phase,
    started_wall: chrono::DateTime<Utc>,
    started_at: Instant,
}

impl PhaseStart {
    /// Phase this token belongs to.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Monotonic start instant.
    #[must_use]
    pub const fn started_at(&self) -> Instant {
        self.started_at
    }
}

/// Identity, credential, and phase history of one deployment run.
///
/// Only the readiness monitor mutates a session, and only through
/// [`DeploymentSession::begin`] and [`DeploymentSession::finish`], which
/// enforce strict phase ordering.
#[derive(Debug)]
pub struct DeploymentSession {
    handle: InstanceHandle,
    // Provider calls authenticate through the backend's own copy; this one
    // records which token the run was started with.
    credential: ApiToken,
    topic: String,
    state: DeploymentState,
    history: Vec<PhaseRecord>,
}

impl DeploymentSession {
    /// Creates a session for a freshly provisioned instance.
    #[must_use]
    pub const fn new(handle: InstanceHandle, credential: ApiToken, topic: String) -> Self {
        Self {
            handle,
            credential,
            topic,
            state: DeploymentState::Provisioned,
            history: Vec::new(),
        }
    }

    /// Identity of the instance.
    #[must_use]
    pub const fn handle(&self) -> &InstanceHandle {
        &self.handle
    }

    /// Token the deployment was started with. It is never rendered by
    /// `Debug`; the provider backend holds the copy it authenticates with.
    #[must_use]
    pub const fn credential(&self) -> &ApiToken {
        &self.credential
    }

    /// Event stream topic the instance publishes progress to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> DeploymentState {
        self.state
    }

    /// Ordered phase history.
    #[must_use]
    pub fn history(&self) -> &[PhaseRecord] {
        &self.history
    }

    /// Starts `phase`.
    ///
    /// # Errors
    ///
    /// Returns [`ReadinessError::OutOfOrder`] unless the session is in the
    /// phase's source state, so phases can be neither skipped nor reordered.
    pub fn begin(&mut self, phase: Phase) -> Result<PhaseStart, ReadinessError> {
        if self.state != phase.source() {
            return Err(ReadinessError::OutOfOrder {
                phase,
                state: self.state,
            });
        }
        Ok(PhaseStart {
            phase,
            started_wall: Utc::now(),
            started_at: Instant::now(),
        })
    }

    /// Records the end of a phase and applies its transition.
    pub fn finish(&mut self, start: PhaseStart, outcome: PhaseOutcome) -> PhaseRecord {
        self.state = match outcome {
            PhaseOutcome::Succeeded | PhaseOutcome::Degraded(_) => start.phase.target(),
            PhaseOutcome::Failed(_) => DeploymentState::Failed,
        };
        let record = PhaseRecord {
            phase: start.phase,
            started_wall: start.started_wall,
            started_at: start.started_at,
            finished_at: Instant::now(),
            outcome,
        };
        self.history.push(record.clone());
        record
    }
}
