//! Cleanup offered after a hard readiness failure.
//!
//! The operator is asked whether the failed instance should be deleted. The
//! default answer is yes, so an unattended run does not leave a billable GPU
//! instance behind.

use std::fmt;
use std::future::Future;
use std::io::{self, BufRead, Write};
use std::pin::Pin;

use tokio::task;
use tracing::{info, warn};

use crate::backend::{InstanceHandle, Provisioner};

/// Boxed future returned by [`Confirm::confirm`].
pub type ConfirmFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Asks the operator a yes/no question.
pub trait Confirm {
    /// Resolves to the operator's answer, or `default` when none was given.
    /// The question is abandoned when the future is dropped.
    fn confirm<'a>(&'a self, prompt: &'a str, default: bool) -> ConfirmFuture<'a>;
}

/// Reads answers from standard input and writes prompts to standard error.
///
/// The read happens on the blocking pool so a pending prompt never holds up
/// the runtime; an interrupted deployment exits without waiting for it.
#[derive(Clone, Copy, Debug, Default)]
pub struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm<'a>(&'a self, prompt: &'a str, default: bool) -> ConfirmFuture<'a> {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        let mut stderr = io::stderr();
        write!(stderr, "{prompt} {hint} ").ok();
        stderr.flush().ok();

        Box::pin(async move {
            task::spawn_blocking(move || read_answer(io::stdin().lock(), default))
                .await
                .unwrap_or(default)
        })
    }
}

/// Reads one line from `reader` and interprets it. End of input, read errors
/// and unrecognised text all yield `default`.
#[must_use]
pub fn read_answer(mut reader: impl BufRead, default: bool) -> bool {
    let mut answer = String::new();
    match reader.read_line(&mut answer) {
        Ok(0) | Err(_) => default,
        Ok(_) => parse_answer(&answer).unwrap_or(default),
    }
}

/// Interprets a typed answer. Blank or unrecognised input yields `None`.
#[must_use]
pub fn parse_answer(answer: &str) -> Option<bool> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

/// What happened to an instance after a hard failure.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecoveryDecision {
    /// The operator chose to keep the instance.
    Retained {
        /// Provider identifier of the instance.
        id: String,
    },
    /// The instance was deleted.
    Deleted {
        /// Provider identifier of the instance.
        id: String,
    },
    /// Deletion was requested but failed, including when the instance no
    /// longer exists.
    DeletionFailed {
        /// Provider identifier of the instance.
        id: String,
        /// Provider error text.
        reason: String,
    },
}

impl fmt::Display for RecoveryDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retained { id } => write!(
                f,
                "instance {id} was kept for inspection and must be deleted manually"
            ),
            Self::Deleted { id } => write!(f, "instance {id} was deleted"),
            Self::DeletionFailed { id, reason } => write!(
                f,
                "deleting instance {id} failed ({reason}); delete it manually to stop billing"
            ),
        }
    }
}

/// Offers deletion of a failed instance and carries it out.
#[derive(Debug)]
pub struct FailureRecoveryHandler<'a, P: ?Sized, C: ?Sized> {
    provisioner: &'a P,
    confirm: &'a C,
}

impl<'a, P, C> FailureRecoveryHandler<'a, P, C>
where
    P: Provisioner + ?Sized,
    C: Confirm + ?Sized,
{
    /// Creates a handler.
    #[must_use]
    pub const fn new(provisioner: &'a P, confirm: &'a C) -> Self {
        Self {
            provisioner,
            confirm,
        }
    }

    /// Asks whether `handle` should be deleted and acts on the answer.
    /// Failures are reported in the returned decision, never raised.
    pub async fn recover(&self, handle: &InstanceHandle) -> RecoveryDecision {
        let prompt = format!(
            "Deployment of {} ({}) failed. Delete the instance?",
            handle.label, handle.id
        );
        if !self.confirm.confirm(&prompt, true).await {
            info!(id = %handle.id, "keeping failed instance");
            return RecoveryDecision::Retained {
                id: handle.id.clone(),
            };
        }

        match self.provisioner.delete(&handle.id).await {
            Ok(()) => {
                info!(id = %handle.id, "deleted failed instance");
                RecoveryDecision::Deleted {
                    id: handle.id.clone(),
                }
            }
            Err(err) if P::is_missing(&err) => {
                warn!(id = %handle.id, "instance to delete does not exist");
                RecoveryDecision::DeletionFailed {
                    id: handle.id.clone(),
                    reason: String::from("instance does not exist"),
                }
            }
            Err(err) => {
                warn!(id = %handle.id, error = %err, "failed to delete instance");
                RecoveryDecision::DeletionFailed {
                    id: handle.id.clone(),
                    reason: err.to_string(),
                }
            }
        }
    }
}
