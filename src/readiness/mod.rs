//! Phased readiness monitoring for a freshly provisioned GPU instance.
//!
//! A deployment is not usable the moment the provider accepts the create
//! call. The instance boots, installs drivers and containers, reboots, starts
//! its services and finally downloads the model. [`ReadinessMonitor`] walks
//! through six ordered phases, each with its own readiness condition, polling
//! interval and timeout:
//!
//! 1. provider status reports `running` (hard)
//! 2. the progress stream announces the reboot (hard)
//! 3. the SSH port answers again (hard)
//! 4. both service containers are listed (soft)
//! 5. the liveness endpoint returns HTTP 200 (soft)
//! 6. the catalog endpoint lists the workload (soft)
//!
//! Hard phases that time out stop the pipeline and offer to delete the
//! instance. Soft phases that time out are recorded as warnings and the
//! pipeline carries on, so a deployment can end ready with warnings.

use std::net::SocketAddr;
use std::time::Duration;

use regex::Regex;
use tokio::time::{sleep, timeout};

use crate::backend::{InstanceHandle, Provisioner};
use crate::progress::{ConsoleReporter, ProgressEvent, ProgressKind, ProgressReporter};
use crate::recovery::{Confirm, FailureRecoveryHandler, TerminalConfirm};
use crate::remote::{CommandRunner, RemoteShell};

mod checks;
mod error;
mod events;
mod phase;
mod poll;
mod port_probe;
mod session;

pub use checks::{CONTAINERS_COMMAND, ServiceExpectations, is_http_ok};
pub use error::{PhaseWarning, ReadinessError};
pub use events::{
    DEFAULT_COMPLETION_PATTERN, EventConnector, EventSource, EventStreamWatcher,
    HttpEventConnector, HttpEventSource, LineBuffer, StreamError, StreamEvent, StreamFuture,
    WatchEnd, WatchSummary, parse_message,
};
pub use phase::{
    DeploymentState, Phase, PhaseOutcome, PhasePolicy, PhaseRecord, PhaseTimings, Severity,
};
pub use poll::{Check, PollTimeout, StatusPoller, poll_until};
pub use port_probe::PortProbe;
pub use session::{DeploymentSession, PhaseStart};

/// Provider status that ends the first phase.
pub const RUNNING_STATUS: &str = "running";

/// Final result of a readiness run that reached the end of the pipeline.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeploymentReport {
    /// Identity of the deployed instance.
    pub handle: InstanceHandle,
    /// Ordered phase history.
    pub history: Vec<PhaseRecord>,
    /// Warnings raised by degraded phases.
    pub warnings: Vec<PhaseWarning>,
}

impl DeploymentReport {
    /// Returns `true` when at least one phase degraded.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Drives a [`DeploymentSession`] through every readiness phase.
pub struct ReadinessMonitor<P, R: CommandRunner, E> {
    provisioner: P,
    shell: RemoteShell<R>,
    events: E,
    expectations: ServiceExpectations,
    timings: PhaseTimings,
    completion: Regex,
    reporter: Box<dyn ProgressReporter>,
    confirm: Box<dyn Confirm>,
}

impl<P, R, E> ReadinessMonitor<P, R, E>
where
    P: Provisioner,
    R: CommandRunner,
    E: EventConnector,
{
    /// Creates a monitor with default timings, console output and an
    /// interactive cleanup prompt.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::InvalidPattern`] if the built-in completion
    /// pattern fails to compile.
    pub fn new(
        provisioner: P,
        shell: RemoteShell<R>,
        events: E,
        expectations: ServiceExpectations,
    ) -> Result<Self, StreamError> {
        Ok(Self {
            provisioner,
            shell,
            events,
            expectations,
            timings: PhaseTimings::default(),
            completion: compile_pattern(DEFAULT_COMPLETION_PATTERN)?,
            reporter: Box::new(ConsoleReporter::default()),
            confirm: Box::new(TerminalConfirm),
        })
    }

    /// Overrides phase intervals and timeouts.
    #[must_use]
    pub const fn with_timings(mut self, timings: PhaseTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Replaces the progress reporter.
    #[must_use]
    pub fn with_reporter(mut self, reporter: impl ProgressReporter + 'static) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    /// Replaces the cleanup prompt.
    #[must_use]
    pub fn with_confirm(mut self, confirm: impl Confirm + 'static) -> Self {
        self.confirm = Box::new(confirm);
        self
    }

    /// Replaces the pattern that recognises the reboot notice.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::InvalidPattern`] when `pattern` does not compile.
    pub fn with_completion_pattern(mut self, pattern: &str) -> Result<Self, StreamError> {
        self.completion = compile_pattern(pattern)?;
        Ok(self)
    }

    /// Provisioner used for status checks and cleanup.
    #[must_use]
    pub const fn provisioner(&self) -> &P {
        &self.provisioner
    }

    /// Active phase timings.
    #[must_use]
    pub const fn timings(&self) -> &PhaseTimings {
        &self.timings
    }

    /// Runs every phase in order.
    ///
    /// # Errors
    ///
    /// Returns [`ReadinessError::HardTimeout`] when a hard phase gives up,
    /// after the cleanup offer has been resolved, or
    /// [`ReadinessError::OutOfOrder`] when the session is not freshly
    /// provisioned.
    pub async fn run(
        &self,
        session: &mut DeploymentSession,
    ) -> Result<DeploymentReport, ReadinessError> {
        self.await_running(session).await?;
        self.await_packages(session).await?;
        self.await_reboot(session).await?;
        self.check_containers(session).await?;
        self.await_health(session).await?;
        self.await_catalog(session).await?;

        let history = session.history().to_vec();
        let warnings = history
            .iter()
            .filter_map(|record| match &record.outcome {
                PhaseOutcome::Degraded(warning) => Some(warning.clone()),
                PhaseOutcome::Succeeded | PhaseOutcome::Failed(_) => None,
            })
            .collect();
        Ok(DeploymentReport {
            handle: session.handle().clone(),
            history,
            warnings,
        })
    }

    async fn await_running(&self, session: &mut DeploymentSession) -> Result<(), ReadinessError> {
        let phase = Phase::AwaitRunning;
        let start = self.start(session, phase, "waiting for the instance to report running")?;
        let policy = self.timings.policy(phase);
        let id = session.handle().id.clone();

        match StatusPoller::new(&self.provisioner, policy)
            .wait_for(&id, RUNNING_STATUS)
            .await
        {
            Ok(_) => {
                self.succeed(session, start, "instance is running");
                Ok(())
            }
            Err(timeout) => Err(self
                .fail_hard(session, start, policy.timeout, timeout.last)
                .await),
        }
    }

    async fn await_packages(&self, session: &mut DeploymentSession) -> Result<(), ReadinessError> {
        let phase = Phase::AwaitPackages;
        let start = self.start(session, phase, "following first-boot progress")?;
        let topic = session.topic().to_owned();
        let watcher = EventStreamWatcher::new(
            &self.events,
            self.timings.first_event_timeout,
            self.timings.stream_retry_interval,
            &self.completion,
        );

        let result = watcher
            .watch(&topic, |message| {
                self.report(phase, ProgressKind::StreamMessage, message);
            })
            .await;
        match result {
            Ok(WatchSummary {
                end: WatchEnd::Completed { .. },
                ..
            }) => {
                self.succeed(session, start, "packages installed; instance is rebooting");
                Ok(())
            }
            Ok(WatchSummary { messages, .. }) => {
                self.degrade(session, start, PhaseWarning::StreamEnded { messages });
                Ok(())
            }
            Err(err) => Err(self
                .fail_hard(
                    session,
                    start,
                    self.timings.first_event_timeout,
                    err.to_string(),
                )
                .await),
        }
    }

    async fn await_reboot(&self, session: &mut DeploymentSession) -> Result<(), ReadinessError> {
        let phase = Phase::AwaitReboot;
        let start = self.start(session, phase, "waiting for SSH after the reboot")?;
        let policy = self.timings.policy(phase);
        let grace = self.timings.reboot_grace.min(policy.timeout);
        sleep(grace).await;

        let addr = SocketAddr::new(session.handle().address, self.shell.settings().port);
        let probe = PortProbe::new(
            policy.interval,
            policy.timeout.saturating_sub(grace),
            self.timings.port_connect_timeout,
        );
        match probe.wait_until_open(addr).await {
            Ok(_) => {
                self.succeed(session, start, "SSH is reachable");
                Ok(())
            }
            Err(timeout) => Err(self
                .fail_hard(session, start, policy.timeout, timeout.last)
                .await),
        }
    }

    async fn check_containers(
        &self,
        session: &mut DeploymentSession,
    ) -> Result<(), ReadinessError> {
        let phase = Phase::CheckContainers;
        let start = self.start(session, phase, "listing running containers")?;
        let host = session.handle().address;
        let bound = self.timings.policy(phase).timeout;

        let listing = match timeout(bound, self.shell.capture(host, CONTAINERS_COMMAND)).await {
            Ok(Some(listing)) => listing,
            Ok(None) => {
                let detail = String::from("could not list containers over SSH");
                self.degrade(session, start, PhaseWarning::CheckFailed { phase, detail });
                return Ok(());
            }
            Err(_) => {
                let detail = format!("listing containers took longer than {bound:?}");
                self.degrade(session, start, PhaseWarning::CheckFailed { phase, detail });
                return Ok(());
            }
        };
        let missing = self.expectations.missing_services(&listing);
        if missing.is_empty() {
            self.succeed(session, start, "service containers are running");
        } else {
            let detail = format!("containers not running: {}", missing.join(", "));
            self.degrade(session, start, PhaseWarning::CheckFailed { phase, detail });
        }
        Ok(())
    }

    async fn await_health(&self, session: &mut DeploymentSession) -> Result<(), ReadinessError> {
        let phase = Phase::AwaitHealth;
        let url = self.expectations.health_url();
        let start = self.start(session, phase, format!("waiting for {url}"))?;
        let policy = self.timings.policy(phase);
        let host = session.handle().address;
        let command = self.expectations.health_command();
        let (endpoint, command_line) = (url.as_str(), command.as_str());

        let result = poll_until(phase, policy, || async move {
            match self.shell.capture(host, command_line).await {
                Some(output) if is_http_ok(&output) => Check::Ready,
                Some(output) => Check::NotReady(format!("{endpoint} answered {}", output.trim())),
                None => Check::Error(format!("{endpoint} could not be queried")),
            }
        })
        .await;
        self.settle_soft(session, start, policy, result, "liveness endpoint is healthy");
        Ok(())
    }

    async fn await_catalog(&self, session: &mut DeploymentSession) -> Result<(), ReadinessError> {
        let phase = Phase::AwaitCatalog;
        let workload = self.expectations.workload_id.clone();
        let start = self.start(session, phase, format!("waiting for {workload} to be served"))?;
        let policy = self.timings.policy(phase);
        let host = session.handle().address;
        let command = self.expectations.catalog_command();
        let (workload_id, command_line) = (workload.as_str(), command.as_str());

        let result = poll_until(phase, policy, || async move {
            match self.shell.capture(host, command_line).await {
                Some(body) if self.expectations.catalog_lists_workload(&body) => Check::Ready,
                Some(_) => Check::NotReady(format!("catalog does not list {workload_id} yet")),
                None => Check::Error(String::from("catalog endpoint could not be queried")),
            }
        })
        .await;
        self.settle_soft(session, start, policy, result, "workload is available");
        Ok(())
    }

    fn settle_soft(
        &self,
        session: &mut DeploymentSession,
        start: PhaseStart,
        policy: PhasePolicy,
        result: Result<Duration, PollTimeout>,
        success: &str,
    ) {
        match result {
            Ok(_) => self.succeed(session, start, success),
            Err(timeout) => {
                let phase = start.phase();
                self.degrade(
                    session,
                    start,
                    PhaseWarning::SoftTimeout {
                        phase,
                        timeout: policy.timeout,
                        detail: timeout.last,
                    },
                );
            }
        }
    }

    fn start(
        &self,
        session: &mut DeploymentSession,
        phase: Phase,
        message: impl Into<String>,
    ) -> Result<PhaseStart, ReadinessError> {
        let start = session.begin(phase)?;
        self.report(phase, ProgressKind::PhaseStarted, message);
        Ok(start)
    }

    fn succeed(&self, session: &mut DeploymentSession, start: PhaseStart, message: &str) {
        let phase = start.phase();
        let record = session.finish(start, PhaseOutcome::Succeeded);
        self.report(
            phase,
            ProgressKind::PhaseFinished,
            format!("{message} ({}s)", record.elapsed().as_secs()),
        );
    }

    fn degrade(&self, session: &mut DeploymentSession, start: PhaseStart, warning: PhaseWarning) {
        let phase = start.phase();
        self.report(phase, ProgressKind::Warning, warning.to_string());
        session.finish(start, PhaseOutcome::Degraded(warning));
    }

    async fn fail_hard(
        &self,
        session: &mut DeploymentSession,
        start: PhaseStart,
        timeout: Duration,
        detail: String,
    ) -> ReadinessError {
        let phase = start.phase();
        session.finish(start, PhaseOutcome::Failed(detail.clone()));
        self.report(
            phase,
            ProgressKind::Failure,
            format!(
                "{phase} phase did not complete within {}s: {detail}",
                timeout.as_secs()
            ),
        );
        let recovery = FailureRecoveryHandler::new(&self.provisioner, self.confirm.as_ref())
            .recover(session.handle())
            .await;
        ReadinessError::HardTimeout {
            phase,
            timeout,
            detail,
            recovery,
        }
    }

    fn report(&self, phase: Phase, kind: ProgressKind, message: impl Into<String>) {
        self.reporter
            .report(&ProgressEvent::now(phase, kind, message));
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, StreamError> {
    Regex::new(pattern).map_err(|err| StreamError::InvalidPattern(err.to_string()))
}

#[cfg(test)]
mod tests;
