//! Core library for the `gpulaunch` GPU provisioning tool.
//!
//! The crate creates a GPU virtual machine through a [`Provisioner`], then
//! follows it through an ordered set of readiness phases until its model
//! services answer. Hard phases that time out offer to delete the instance;
//! soft phases degrade into warnings so a deployment can finish ready with
//! warnings.

pub mod backend;
pub mod cloud_init;
pub mod config;
pub mod deploy;
pub mod linode;
pub mod progress;
pub mod readiness;
pub mod record_store;
pub mod recovery;
pub mod remote;
pub mod test_support;

pub use backend::{
    InstanceHandle, InstanceRequest, InstanceRequestBuilder, ProvisionedInstance, Provisioner,
};
pub use config::{ApiToken, ConfigError, DeployConfig};
pub use deploy::{DeployError, DeployOrchestrator, DeployOutcome, DeployPlan, PlanError};
pub use linode::{LinodeBackend, LinodeError};
pub use progress::{ConsoleReporter, ProgressEvent, ProgressKind, ProgressReporter};
pub use readiness::{
    DeploymentReport, DeploymentSession, DeploymentState, Phase, PhaseTimings, ReadinessError,
    ReadinessMonitor,
};
pub use record_store::{AuditLog, DeploymentRecord, RecordStore, RecordStoreError, TempArtifacts};
pub use recovery::{
    Confirm, ConfirmFuture, FailureRecoveryHandler, RecoveryDecision, TerminalConfirm,
};
pub use remote::{CommandRunner, ProcessCommandRunner, RemoteError, RemoteShell, SshSettings};
