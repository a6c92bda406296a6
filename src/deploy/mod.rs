//! Orchestrates a complete deployment.
//!
//! The deploy workflow creates the instance, persists its record, and hands
//! a fresh [`DeploymentSession`] to the readiness monitor. The credential is
//! carried by the session for the lifetime of the run and never written to
//! disk.

use camino::Utf8PathBuf;
use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::backend::Provisioner;
use crate::config::ApiToken;
use crate::readiness::{
    DeploymentReport, DeploymentSession, EventConnector, ReadinessError, ReadinessMonitor,
};
use crate::record_store::{AuditLog, DeploymentRecord, RecordStoreError, RecordWriter};
use crate::remote::CommandRunner;

mod plan;

pub use plan::{
    DeployPlan, GENERATED_PASSWORD_LEN, NAME_PREFIX, PlanError, generate_label,
    generate_root_password, generate_topic,
};

/// Errors surfaced while deploying.
#[derive(Debug, Error)]
pub enum DeployError<ProvisionError>
where
    ProvisionError: std::error::Error + 'static,
{
    /// Raised when the provider rejects the create call.
    #[error("failed to create instance: {0}")]
    Provision(#[source] ProvisionError),
    /// Raised when a hard readiness phase fails.
    #[error(transparent)]
    Readiness(#[from] ReadinessError),
}

/// Result of a deployment that reached the end of the readiness pipeline.
#[derive(Debug)]
pub struct DeployOutcome {
    /// Readiness report, including any warnings.
    pub report: DeploymentReport,
    /// Where the record was written, or why it was not.
    pub record: Result<Utf8PathBuf, RecordStoreError>,
}

/// Executes the deploy flow using the provided monitor and record writer.
pub struct DeployOrchestrator<P, R: CommandRunner, E, W> {
    monitor: ReadinessMonitor<P, R, E>,
    records: W,
    audit: Option<AuditLog>,
}

impl<P, R, E, W> DeployOrchestrator<P, R, E, W>
where
    P: Provisioner,
    R: CommandRunner,
    E: EventConnector,
    W: RecordWriter,
{
    /// Creates a new orchestrator.
    #[must_use]
    pub const fn new(monitor: ReadinessMonitor<P, R, E>, records: W) -> Self {
        Self {
            monitor,
            records,
            audit: None,
        }
    }

    /// Records recovery outcomes in `audit`.
    #[must_use]
    pub fn with_audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Creates the instance described by `plan` and follows it to readiness.
    ///
    /// A record that cannot be written is reported in the outcome rather
    /// than failing the deployment, since the instance already exists.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Provision`] when creation fails, and
    /// [`DeployError::Readiness`] when a hard phase gives up.
    pub async fn execute(
        &self,
        plan: &DeployPlan,
        credential: ApiToken,
    ) -> Result<DeployOutcome, DeployError<P::Error>> {
        let provisioned = self
            .monitor
            .provisioner()
            .create(&plan.request)
            .await
            .map_err(DeployError::Provision)?;
        let handle = provisioned.handle;
        info!(id = %handle.id, address = %handle.address, label = %handle.label, "instance created");

        let record = self.records.write_record(&DeploymentRecord {
            created_at: Utc::now(),
            id: handle.id.clone(),
            label: handle.label.clone(),
            address: handle.address,
            region: plan.request.region.clone(),
            instance_type: plan.request.instance_type.clone(),
            topic: plan.topic.clone(),
            root_password: plan.request.root_password.clone(),
            response: provisioned.response,
        });
        if let Err(ref err) = record {
            warn!(error = %err, "deployment record was not written");
        }

        let mut session = DeploymentSession::new(handle, credential, plan.topic.clone());
        match self.monitor.run(&mut session).await {
            Ok(report) => Ok(DeployOutcome { report, record }),
            Err(err) => {
                if let ReadinessError::HardTimeout { ref recovery, .. } = err {
                    self.audit("recovery", &recovery.to_string());
                }
                Err(err.into())
            }
        }
    }

    fn audit(&self, kind: &str, message: &str) {
        if let Some(ref audit) = self.audit
            && let Err(err) = audit.append(kind, message)
        {
            warn!(path = %audit.path(), error = %err, "audit log entry not written");
        }
    }
}

#[cfg(test)]
mod tests;
