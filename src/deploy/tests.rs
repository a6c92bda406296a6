//! Tests for the deploy orchestrator.

use std::cell::RefCell;
use std::time::Duration;

use camino::Utf8Path;
use rstest::{fixture, rstest};
use tempfile::TempDir;
use tokio::net::TcpListener;

use super::*;
use crate::backend::InstanceHandle;
use crate::readiness::ServiceExpectations;
use crate::recovery::RecoveryDecision;
use crate::remote::{RemoteShell, SshSettings};
use crate::test_support::{
    FixedConfirm, ScriptedConnector, ScriptedProvisioner, ScriptedRunner, StreamTail,
    message_line,
};

#[derive(Debug, Default)]
struct MemoryRecords {
    written: RefCell<Vec<DeploymentRecord>>,
    fail: bool,
}

impl RecordWriter for MemoryRecords {
    fn write_record(&self, record: &DeploymentRecord) -> Result<Utf8PathBuf, RecordStoreError> {
        if self.fail {
            return Err(RecordStoreError::Io {
                path: Utf8PathBuf::from("/read-only"),
                message: String::from("permission denied"),
            });
        }
        self.written.borrow_mut().push(record.clone());
        Ok(Utf8PathBuf::from(format!("gpulaunch-{}.json", record.label)))
    }
}

fn handle(port_host: std::net::IpAddr) -> InstanceHandle {
    InstanceHandle {
        id: String::from("4242"),
        address: port_host,
        label: String::from("gpulaunch-test"),
    }
}

fn expectations() -> ServiceExpectations {
    ServiceExpectations {
        primary_service: String::from("ollama"),
        secondary_service: String::from("open-webui"),
        health_port: 8080,
        catalog_port: 11434,
        workload_id: String::from("llama3.1:8b"),
    }
}

#[fixture]
fn plan() -> DeployPlan {
    let request = crate::backend::InstanceRequest::builder()
        .label("gpulaunch-test")
        .region("us-ord")
        .instance_type("g2-gpu-rtx4000a1-s")
        .image("linode/ubuntu22.04")
        .root_password("Gen3rated-Passw0rd")
        .authorized_key("ssh-ed25519 AAAA test")
        .user_data(Some(String::from("#cloud-config")))
        .build()
        .expect("request");
    DeployPlan {
        request,
        topic: String::from("gpulaunch-topic"),
        expectations: expectations(),
    }
}

struct Parts {
    provisioner: ScriptedProvisioner,
    runner: ScriptedRunner,
    connector: ScriptedConnector,
    _listener: TcpListener,
    port: u16,
}

async fn healthy_parts() -> Parts {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let provisioner = ScriptedProvisioner::new(handle(std::net::IpAddr::from([127, 0, 0, 1])));
    let connector = ScriptedConnector::new();
    connector.push_stream(
        vec![(Duration::from_secs(3), message_line("Rebooting"))],
        StreamTail::Idle,
    );
    let runner = ScriptedRunner::new();
    runner.respond_to("docker ps", "ollama\nopen-webui");
    runner.respond_to("/health", "200");
    runner.respond_to("/api/tags", r#"{"models":[{"name":"llama3.1:8b"}]}"#);
    Parts {
        provisioner,
        runner,
        connector,
        _listener: listener,
        port,
    }
}

fn orchestrator<W: RecordWriter>(
    parts: &Parts,
    records: W,
    confirm: FixedConfirm,
) -> DeployOrchestrator<ScriptedProvisioner, ScriptedRunner, ScriptedConnector, W> {
    let settings = SshSettings {
        port: parts.port,
        ..SshSettings::new("root", None)
    };
    let shell = RemoteShell::new(settings, parts.runner.clone()).expect("shell");
    let monitor = ReadinessMonitor::new(
        parts.provisioner.clone(),
        shell,
        parts.connector.clone(),
        expectations(),
    )
    .expect("monitor")
    .with_reporter(crate::progress::RecordingReporter::new())
    .with_confirm(confirm);
    DeployOrchestrator::new(monitor, records)
}

fn token() -> ApiToken {
    ApiToken::new("secret-token").expect("token")
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn successful_deploy_writes_record_and_reports_ready(plan: DeployPlan) {
    let parts = healthy_parts().await;
    let records = MemoryRecords::default();
    let orchestrator = orchestrator(&parts, records, FixedConfirm::new(true));

    let outcome = orchestrator.execute(&plan, token()).await.expect("deploy");

    assert!(!outcome.report.is_degraded());
    assert_eq!(
        outcome.record.as_ref().map(|path| path.as_str()),
        Ok("gpulaunch-gpulaunch-test.json")
    );
    let written = orchestrator.records.written.borrow();
    let record = written.first().expect("record written");
    assert_eq!(record.root_password, "Gen3rated-Passw0rd");
    assert_eq!(record.topic, "gpulaunch-topic");
    assert!(!serde_json::to_string(record).expect("json").contains("secret-token"));
    assert_eq!(parts.provisioner.created().len(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn record_failure_does_not_fail_the_deploy(plan: DeployPlan) {
    let parts = healthy_parts().await;
    let records = MemoryRecords {
        fail: true,
        ..MemoryRecords::default()
    };
    let orchestrator = orchestrator(&parts, records, FixedConfirm::new(true));

    let outcome = orchestrator.execute(&plan, token()).await.expect("deploy");

    assert!(outcome.record.is_err());
    assert_eq!(
        outcome.report.history.last().map(|record| record.phase),
        Some(crate::readiness::Phase::AwaitCatalog)
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn rejected_create_stops_before_monitoring(plan: DeployPlan) {
    let parts = healthy_parts().await;
    parts.provisioner.fail_create("quota exceeded");
    let orchestrator = orchestrator(&parts, MemoryRecords::default(), FixedConfirm::new(true));

    let err = orchestrator
        .execute(&plan, token())
        .await
        .expect_err("create fails");

    assert!(matches!(err, DeployError::Provision(_)), "{err}");
    assert!(err.to_string().contains("quota exceeded"), "{err}");
    assert_eq!(parts.provisioner.status_calls(), 0);
    assert!(orchestrator.records.written.borrow().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn hard_failure_is_audited(plan: DeployPlan) {
    let parts = healthy_parts().await;
    parts.provisioner.push_status("offline");
    let tmp = TempDir::new().expect("tempdir");
    let dir = Utf8Path::from_path(tmp.path()).expect("utf8 path");
    let audit = AuditLog::in_dir(dir);
    let orchestrator = orchestrator(&parts, MemoryRecords::default(), FixedConfirm::new(false))
        .with_audit_log(audit.clone());

    let err = orchestrator
        .execute(&plan, token())
        .await
        .expect_err("instance never runs");

    let DeployError::Readiness(ReadinessError::HardTimeout { ref recovery, .. }) = err else {
        panic!("expected hard timeout, got {err}");
    };
    assert_eq!(
        *recovery,
        RecoveryDecision::Retained {
            id: String::from("4242")
        }
    );
    let log = std::fs::read_to_string(audit.path()).expect("audit log");
    assert!(log.contains("recovery: instance 4242 was kept"), "{log}");
    assert_eq!(parts.provisioner.delete_calls(), 0);
}
