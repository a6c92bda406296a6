//! TCP reachability probe used to detect the end of a reboot.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use tracing::debug;

use super::poll::PollTimeout;

/// Repeatedly attempts a TCP connection until one succeeds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortProbe {
    interval: Duration,
    timeout: Duration,
    connect_timeout: Duration,
}

impl PortProbe {
    /// Creates a probe.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            connect_timeout,
        }
    }

    /// Waits until `addr` accepts a connection. Each attempt is bounded by the
    /// smaller of the connect timeout and the time left, so the probe as a
    /// whole never outlives its deadline by more than one interval.
    ///
    /// # Errors
    ///
    /// Returns [`PollTimeout`] once the deadline passes.
    pub async fn wait_until_open(&self, addr: SocketAddr) -> Result<Duration, PollTimeout> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut last = String::from("no connection attempt made");
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let attempt_bound = self.connect_timeout.min(remaining);
            match timeout(attempt_bound, TcpStream::connect(addr)).await {
                Ok(Ok(_stream)) => return Ok(started.elapsed()),
                Ok(Err(err)) => {
                    debug!(%addr, error = %err, "port closed");
                    last = format!("connect to {addr} failed: {err}");
                }
                Err(_) => {
                    debug!(%addr, "connect attempt timed out");
                    last = format!("connect to {addr} timed out");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PollTimeout {
                    elapsed: now.saturating_duration_since(started),
                    last,
                });
            }
            sleep(self.interval.min(deadline.saturating_duration_since(now))).await;
        }
    }
}
