//! Errors and warnings raised by the readiness pipeline.

use std::time::Duration;

use thiserror::Error;

use crate::recovery::RecoveryDecision;

use super::phase::{DeploymentState, Phase};

/// Fatal outcomes of a readiness run.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ReadinessError {
    /// A hard phase did not complete within its bound.
    #[error(
        "{phase} phase did not complete within {}s: {detail}; {recovery}",
        timeout.as_secs()
    )]
    HardTimeout {
        /// Phase that gave up.
        phase: Phase,
        /// Bound that was exceeded.
        timeout: Duration,
        /// Last observation before giving up.
        detail: String,
        /// What happened to the instance afterwards.
        recovery: RecoveryDecision,
    },
    /// A phase was started from the wrong state.
    #[error("{phase} phase cannot start while the deployment is {state}")]
    OutOfOrder {
        /// Phase that was requested.
        phase: Phase,
        /// State the session was in.
        state: DeploymentState,
    },
}

/// Non-fatal problem recorded against a phase.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PhaseWarning {
    /// A soft phase did not complete within its bound.
    #[error("{phase} phase did not complete within {}s: {detail}", timeout.as_secs())]
    SoftTimeout {
        /// Phase that gave up.
        phase: Phase,
        /// Bound that was exceeded.
        timeout: Duration,
        /// Last observation before giving up.
        detail: String,
    },
    /// A one-shot soft check did not pass.
    #[error("{phase} check failed: {detail}")]
    CheckFailed {
        /// Phase that ran the check.
        phase: Phase,
        /// What was observed.
        detail: String,
    },
    /// The progress stream ended before a reboot notice arrived.
    #[error("progress stream ended after {messages} message(s) without a reboot notice")]
    StreamEnded {
        /// Messages received before the stream ended.
        messages: usize,
    },
}

impl PhaseWarning {
    /// Phase the warning belongs to.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        match self {
            Self::SoftTimeout { phase, .. } | Self::CheckFailed { phase, .. } => *phase,
            Self::StreamEnded { .. } => Phase::AwaitPackages,
        }
    }
}
