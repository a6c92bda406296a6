//! Generic deadline-bounded polling and the instance status poller.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep, timeout_at};
use tracing::debug;

use crate::backend::Provisioner;

use super::phase::{Phase, PhasePolicy};

/// Result of one readiness check.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Check {
    /// The condition holds.
    Ready,
    /// The condition does not hold yet.
    NotReady(String),
    /// The check itself failed; treated as transient.
    Error(String),
}

/// Returned when a poll loop exhausts its deadline.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PollTimeout {
    /// Time spent polling.
    pub elapsed: Duration,
    /// Last non-ready observation.
    pub last: String,
}

/// Calls `check` until it reports [`Check::Ready`] or `policy.timeout`
/// elapses, sleeping `policy.interval` between calls.
///
/// The first check runs immediately. Each check races the deadline and sleeps
/// are clamped to it, so the loop returns within one interval of the bound
/// even when a check hangs. Check errors are logged and retried.
///
/// # Errors
///
/// Returns [`PollTimeout`] with the last observation once the deadline passes.
pub async fn poll_until<F, Fut>(
    phase: Phase,
    policy: PhasePolicy,
    mut check: F,
) -> Result<Duration, PollTimeout>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Check>,
{
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut last = String::from("check did not finish before the deadline");
    loop {
        match timeout_at(deadline, check()).await {
            Ok(Check::Ready) => return Ok(started.elapsed()),
            Ok(Check::NotReady(observed)) => last = observed,
            Ok(Check::Error(message)) => {
                debug!(%phase, error = %message, "transient check failure");
                last = message;
            }
            Err(_) => {
                debug!(%phase, "check abandoned at the deadline");
                return Err(PollTimeout {
                    elapsed: started.elapsed(),
                    last,
                });
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(PollTimeout {
                elapsed: now.saturating_duration_since(started),
                last,
            });
        }
        sleep(policy.interval.min(deadline.saturating_duration_since(now))).await;
    }
}

/// Polls the provider until an instance reports a target status.
#[derive(Debug)]
pub struct StatusPoller<'a, P: ?Sized> {
    provisioner: &'a P,
    policy: PhasePolicy,
}

impl<'a, P> StatusPoller<'a, P>
where
    P: Provisioner + ?Sized,
{
    /// Creates a poller over `provisioner`.
    #[must_use]
    pub const fn new(provisioner: &'a P, policy: PhasePolicy) -> Self {
        Self {
            provisioner,
            policy,
        }
    }

    /// Waits until `id` reports `target`. Status request failures are
    /// transient and do not end the wait early.
    ///
    /// # Errors
    ///
    /// Returns [`PollTimeout`] carrying the last seen status.
    pub async fn wait_for(&self, id: &str, target: &str) -> Result<Duration, PollTimeout> {
        poll_until(Phase::AwaitRunning, self.policy, || async move {
            match self.provisioner.status(id).await {
                Ok(status) if status == target => Check::Ready,
                Ok(status) => {
                    debug!(id, %status, "instance not ready");
                    Check::NotReady(format!("last status was {status}"))
                }
                Err(err) => Check::Error(format!("status request failed: {err}")),
            }
        })
        .await
    }
}
