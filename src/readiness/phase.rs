//! Phase and state definitions for the readiness pipeline.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::error::PhaseWarning;

/// Lifecycle state of a deployment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeploymentState {
    /// The create call succeeded.
    Provisioned,
    /// The provider reports the instance as running.
    Running,
    /// First-boot package installation finished and a reboot is starting.
    PackagesInstalled,
    /// The SSH port answers again after the reboot.
    Rebooted,
    /// Both service containers were listed (or the check was skipped).
    ContainersUp,
    /// The liveness endpoint answered (or its wait degraded).
    ServiceHealthy,
    /// Every phase has run.
    Ready,
    /// A hard phase failed.
    Failed,
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Provisioned => "provisioned",
            Self::Running => "running",
            Self::PackagesInstalled => "packages-installed",
            Self::Rebooted => "rebooted",
            Self::ContainersUp => "containers-up",
            Self::ServiceHealthy => "service-healthy",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Whether a phase timeout aborts the pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Severity {
    /// Timeout fails the deployment and offers cleanup.
    Hard,
    /// Timeout is reported as a warning and the pipeline continues.
    Soft,
}

/// One ordered stage of the readiness pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Poll the provider until the instance is running.
    AwaitRunning,
    /// Follow first-boot progress until the reboot notice.
    AwaitPackages,
    /// Wait for SSH to come back after the reboot.
    AwaitReboot,
    /// List running containers once.
    CheckContainers,
    /// Poll the liveness endpoint.
    AwaitHealth,
    /// Poll the catalog endpoint for the workload.
    AwaitCatalog,
}

impl Phase {
    /// Every phase, in execution order.
    pub const ALL: [Self; 6] = [
        Self::AwaitRunning,
        Self::AwaitPackages,
        Self::AwaitReboot,
        Self::CheckContainers,
        Self::AwaitHealth,
        Self::AwaitCatalog,
    ];

    /// Short name used in logs and reports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::AwaitRunning => "status",
            Self::AwaitPackages => "packages",
            Self::AwaitReboot => "reboot",
            Self::CheckContainers => "containers",
            Self::AwaitHealth => "health",
            Self::AwaitCatalog => "catalog",
        }
    }

    /// State the session must be in for this phase to start.
    #[must_use]
    pub const fn source(self) -> DeploymentState {
        match self {
            Self::AwaitRunning => DeploymentState::Provisioned,
            Self::AwaitPackages => DeploymentState::Running,
            Self::AwaitReboot => DeploymentState::PackagesInstalled,
            Self::CheckContainers => DeploymentState::Rebooted,
            Self::AwaitHealth => DeploymentState::ContainersUp,
            Self::AwaitCatalog => DeploymentState::ServiceHealthy,
        }
    }

    /// State reached when this phase completes.
    #[must_use]
    pub const fn target(self) -> DeploymentState {
        match self {
            Self::AwaitRunning => DeploymentState::Running,
            Self::AwaitPackages => DeploymentState::PackagesInstalled,
            Self::AwaitReboot => DeploymentState::Rebooted,
            Self::CheckContainers => DeploymentState::ContainersUp,
            Self::AwaitHealth => DeploymentState::ServiceHealthy,
            Self::AwaitCatalog => DeploymentState::Ready,
        }
    }

    /// Hard phases gate existence and reachability; soft ones gate the
    /// application running on an already reachable instance.
    #[must_use]
    pub const fn severity(self) -> Severity {
        match self {
            Self::AwaitRunning | Self::AwaitPackages | Self::AwaitReboot => Severity::Hard,
            Self::CheckContainers | Self::AwaitHealth | Self::AwaitCatalog => Severity::Soft,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Polling interval and timeout for one phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PhasePolicy {
    /// Delay between checks.
    pub interval: Duration,
    /// Overall bound for the phase. For the packages phase this bounds the
    /// wait for the first message only.
    pub timeout: Duration,
}

/// Intervals and timeouts for every phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PhaseTimings {
    /// Status poll interval.
    pub status_interval: Duration,
    /// Status poll timeout.
    pub status_timeout: Duration,
    /// Bound on the wait for the first progress message.
    pub first_event_timeout: Duration,
    /// Delay before reopening a stream that failed before its first message.
    pub stream_retry_interval: Duration,
    /// Delay before probing, so the reboot has actually begun.
    pub reboot_grace: Duration,
    /// Port probe interval.
    pub port_interval: Duration,
    /// Port probe timeout.
    pub port_timeout: Duration,
    /// Bound on a single TCP connect attempt.
    pub port_connect_timeout: Duration,
    /// Bound on the one-shot container listing.
    pub containers_timeout: Duration,
    /// Liveness poll interval.
    pub health_interval: Duration,
    /// Liveness poll timeout.
    pub health_timeout: Duration,
    /// Catalog poll interval.
    pub catalog_interval: Duration,
    /// Catalog poll timeout; the longest because it covers a model download.
    pub catalog_timeout: Duration,
}

impl Default for PhaseTimings {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(5),
            status_timeout: Duration::from_secs(180),
            first_event_timeout: Duration::from_secs(300),
            stream_retry_interval: Duration::from_secs(2),
            reboot_grace: Duration::from_secs(5),
            port_interval: Duration::from_secs(2),
            port_timeout: Duration::from_secs(120),
            port_connect_timeout: Duration::from_secs(2),
            containers_timeout: Duration::from_secs(30),
            health_interval: Duration::from_secs(2),
            health_timeout: Duration::from_secs(30),
            catalog_interval: Duration::from_secs(2),
            catalog_timeout: Duration::from_secs(600),
        }
    }
}

impl PhaseTimings {
    /// Returns the polling policy for `phase`. The container check is
    /// one-shot, so it reports a zero interval.
    #[must_use]
    pub const fn policy(&self, phase: Phase) -> PhasePolicy {
        match phase {
            Phase::AwaitRunning => PhasePolicy {
                interval: self.status_interval,
                timeout: self.status_timeout,
            },
            Phase::AwaitPackages => PhasePolicy {
                interval: self.stream_retry_interval,
                timeout: self.first_event_timeout,
            },
            Phase::AwaitReboot => PhasePolicy {
                interval: self.port_interval,
                timeout: self.port_timeout,
            },
            Phase::CheckContainers => PhasePolicy {
                interval: Duration::ZERO,
                timeout: self.containers_timeout,
            },
            Phase::AwaitHealth => PhasePolicy {
                interval: self.health_interval,
                timeout: self.health_timeout,
            },
            Phase::AwaitCatalog => PhasePolicy {
                interval: self.catalog_interval,
                timeout: self.catalog_timeout,
            },
        }
    }
}

/// How a phase ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PhaseOutcome {
    /// The readiness condition was observed.
    Succeeded,
    /// A soft phase gave up; the pipeline continued.
    Degraded(PhaseWarning),
    /// A hard phase gave up; the pipeline stopped.
    Failed(String),
}

/// Entry in the session's phase history.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PhaseRecord {
    /// Phase that ran.
    pub phase: Phase,
    /// Wall-clock start, for reports.
    pub started_wall: DateTime<Utc>,
    /// Monotonic start.
    pub started_at: Instant,
    /// Monotonic end.
    pub finished_at: Instant,
    /// Result of the phase.
    pub outcome: PhaseOutcome,
}

impl PhaseRecord {
    /// Time spent in the phase.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.finished_at.saturating_duration_since(self.started_at)
    }
}
