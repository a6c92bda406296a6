//! Scenario tests for the readiness monitor, run on a paused clock.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::net::TcpListener;

use super::*;
use crate::config::ApiToken;
use crate::progress::RecordingReporter;
use crate::recovery::RecoveryDecision;
use crate::remote::SshSettings;
use crate::test_support::{
    FixedConfirm, ScriptedConnector, ScriptedProvisioner, ScriptedRunner, StreamTail,
    message_line,
};

const WORKLOAD: &str = "llama3.1:8b";

struct Harness {
    provisioner: ScriptedProvisioner,
    runner: ScriptedRunner,
    connector: ScriptedConnector,
    reporter: RecordingReporter,
    confirm: FixedConfirm,
    listener: Option<TcpListener>,
    port: u16,
}

impl Harness {
    /// Everything healthy: the instance runs at once, the stream announces
    /// the reboot, SSH answers, and every remote check passes.
    async fn healthy() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let provisioner = ScriptedProvisioner::new(handle());
        provisioner.push_status("running");
        let connector = ScriptedConnector::new();
        connector.push_stream(
            vec![
                (Duration::from_secs(20), message_line("Installing NVIDIA drivers")),
                (Duration::from_secs(40), message_line("Starting containers")),
                (Duration::from_secs(10), message_line("Rebooting now")),
            ],
            StreamTail::Idle,
        );
        let runner = ScriptedRunner::new();
        runner.respond_to("docker ps", "ollama\nopen-webui\n");
        runner.respond_to("/health", "200");
        runner.respond_to(
            "/api/tags",
            format!(r#"{{"models":[{{"name":"{WORKLOAD}"}}]}}"#),
        );
        Self {
            provisioner,
            runner,
            connector,
            reporter: RecordingReporter::new(),
            confirm: FixedConfirm::new(true),
            listener: Some(listener),
            port,
        }
    }

    fn close_ssh_port(&mut self) {
        self.listener = None;
    }

    fn monitor(&self) -> ReadinessMonitor<ScriptedProvisioner, ScriptedRunner, ScriptedConnector> {
        let settings = SshSettings {
            port: self.port,
            ..SshSettings::new("root", None)
        };
        let shell = RemoteShell::new(settings, self.runner.clone()).expect("settings validate");
        ReadinessMonitor::new(
            self.provisioner.clone(),
            shell,
            self.connector.clone(),
            expectations(),
        )
        .expect("monitor builds")
        .with_reporter(self.reporter.clone())
        .with_confirm(self.confirm.clone())
    }
}

fn handle() -> InstanceHandle {
    InstanceHandle {
        id: String::from("4242"),
        address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        label: String::from("gpulaunch-test"),
    }
}

fn expectations() -> ServiceExpectations {
    ServiceExpectations {
        primary_service: String::from("ollama"),
        secondary_service: String::from("open-webui"),
        health_port: 8080,
        catalog_port: 11434,
        workload_id: String::from(WORKLOAD),
    }
}

fn session() -> DeploymentSession {
    DeploymentSession::new(
        handle(),
        ApiToken::new("token").expect("token"),
        String::from("gpulaunch-topic"),
    )
}

fn phases(report: &[PhaseRecord]) -> Vec<Phase> {
    report.iter().map(|record| record.phase).collect()
}

fn assert_within_bounds(history: &[PhaseRecord]) {
    let timings = PhaseTimings::default();
    for record in history {
        if record.phase == Phase::AwaitPackages {
            continue;
        }
        let policy = timings.policy(record.phase);
        assert!(
            record.elapsed() <= policy.timeout + policy.interval,
            "{} took {:?}",
            record.phase,
            record.elapsed()
        );
    }
}

#[tokio::test(start_paused = true)]
async fn healthy_instance_becomes_ready_without_warnings() {
    let mut harness = Harness::healthy().await;
    harness.provisioner = ScriptedProvisioner::new(handle());
    harness.provisioner.push_status("provisioning");
    harness.provisioner.push_status("booting");
    harness.provisioner.push_status("running");
    let mut session = session();

    let report = harness.monitor().run(&mut session).await.expect("ready");

    assert_eq!(session.state(), DeploymentState::Ready);
    assert!(!report.is_degraded(), "{:?}", report.warnings);
    assert_eq!(phases(&report.history), Phase::ALL.to_vec());
    assert!(
        report
            .history
            .iter()
            .all(|record| record.outcome == PhaseOutcome::Succeeded)
    );
    let status = report.history.first().expect("status phase");
    assert_eq!(status.elapsed(), Duration::from_secs(10));
    assert_eq!(harness.provisioner.status_calls(), 3);
    assert_eq!(harness.connector.closes(), 1);
    assert_eq!(harness.provisioner.delete_calls(), 0);
    assert_within_bounds(&report.history);
}

#[tokio::test(start_paused = true)]
async fn stream_messages_are_relayed_in_order() {
    let harness = Harness::healthy().await;
    let mut session = session();

    harness.monitor().run(&mut session).await.expect("ready");

    assert_eq!(
        harness.reporter.messages(ProgressKind::StreamMessage),
        vec![
            String::from("Installing NVIDIA drivers"),
            String::from("Starting containers"),
            String::from("Rebooting now"),
        ]
    );
    let packages = session
        .history()
        .get(1)
        .expect("packages phase recorded");
    assert_eq!(packages.elapsed(), Duration::from_secs(70));
}

#[tokio::test(start_paused = true)]
async fn instance_that_never_runs_fails_hard_and_is_deleted() {
    let mut harness = Harness::healthy().await;
    harness.provisioner = ScriptedProvisioner::new(handle());
    harness.provisioner.push_status("provisioning");
    let mut session = session();

    let err = harness
        .monitor()
        .run(&mut session)
        .await
        .expect_err("status never reaches running");

    match err {
        ReadinessError::HardTimeout {
            phase,
            timeout,
            ref detail,
            ref recovery,
        } => {
            assert_eq!(phase, Phase::AwaitRunning);
            assert_eq!(timeout, Duration::from_secs(180));
            assert!(detail.contains("provisioning"), "{detail}");
            assert_eq!(
                *recovery,
                RecoveryDecision::Deleted {
                    id: String::from("4242")
                }
            );
        }
        ReadinessError::OutOfOrder { .. } => panic!("unexpected ordering error: {err}"),
    }
    assert_eq!(session.state(), DeploymentState::Failed);
    assert_eq!(session.history().len(), 1);
    let record = session.history().first().expect("status phase");
    assert_eq!(record.elapsed(), Duration::from_secs(180));
    assert_eq!(harness.provisioner.status_calls(), 37);
    assert_eq!(harness.provisioner.delete_calls(), 1);
    assert_eq!(harness.connector.opens(), 0, "later phases must not start");
    assert!(harness.runner.invocations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_status_errors_do_not_end_the_wait() {
    let mut harness = Harness::healthy().await;
    harness.provisioner = ScriptedProvisioner::new(handle());
    harness.provisioner.push_status_error();
    harness.provisioner.push_status_error();
    harness.provisioner.push_status("running");
    let mut session = session();

    harness.monitor().run(&mut session).await.expect("ready");

    assert_eq!(harness.provisioner.status_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn silent_event_stream_fails_hard_and_can_keep_the_instance() {
    let mut harness = Harness::healthy().await;
    harness.connector = ScriptedConnector::new();
    harness.connector.push_stream(Vec::new(), StreamTail::Idle);
    harness.confirm = FixedConfirm::new(false);
    let mut session = session();

    let err = harness
        .monitor()
        .run(&mut session)
        .await
        .expect_err("no progress message arrives");

    assert!(
        matches!(
            err,
            ReadinessError::HardTimeout {
                phase: Phase::AwaitPackages,
                recovery: RecoveryDecision::Retained { .. },
                ..
            }
        ),
        "{err}"
    );
    assert!(err.to_string().contains("deleted manually"), "{err}");
    assert_eq!(harness.provisioner.delete_calls(), 0);
    assert_eq!(harness.confirm.prompts().len(), 1);
    assert_eq!(harness.connector.closes(), 1);
    let packages = session.history().get(1).expect("packages phase");
    assert_eq!(packages.elapsed(), Duration::from_secs(300));
}

#[tokio::test(start_paused = true)]
async fn unreachable_ssh_after_reboot_fails_hard() {
    let mut harness = Harness::healthy().await;
    harness.close_ssh_port();
    let mut session = session();

    let err = harness
        .monitor()
        .run(&mut session)
        .await
        .expect_err("port never opens");

    assert!(
        matches!(
            err,
            ReadinessError::HardTimeout {
                phase: Phase::AwaitReboot,
                ..
            }
        ),
        "{err}"
    );
    assert_eq!(harness.provisioner.delete_calls(), 1);
    assert!(harness.runner.invocations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stream_ending_early_is_a_warning() {
    let mut harness = Harness::healthy().await;
    harness.connector = ScriptedConnector::new();
    harness.connector.push_stream(
        vec![(Duration::from_secs(5), message_line("Installing drivers"))],
        StreamTail::Eof,
    );
    let mut session = session();

    let report = harness.monitor().run(&mut session).await.expect("ready");

    assert_eq!(
        report.warnings,
        vec![PhaseWarning::StreamEnded { messages: 1 }]
    );
    assert_eq!(session.state(), DeploymentState::Ready);
}

#[tokio::test(start_paused = true)]
async fn missing_containers_warn_and_continue() {
    let harness = Harness::healthy().await;
    harness.runner.push_stdout("ollama\n");
    let mut session = session();

    let report = harness.monitor().run(&mut session).await.expect("ready");

    assert_eq!(report.warnings.len(), 1);
    let warning = report.warnings.first().expect("warning");
    assert_eq!(warning.phase(), Phase::CheckContainers);
    assert!(warning.to_string().contains("open-webui"), "{warning}");
    assert_eq!(harness.runner.count_matching("docker ps"), 1);
    assert_eq!(harness.runner.count_matching("/api/tags"), 1);
}

#[tokio::test(start_paused = true)]
async fn health_answering_late_in_the_window_succeeds_without_warning() {
    let harness = Harness::healthy().await;
    harness.runner.push_stdout("ollama\nopen-webui\n");
    for _ in 0..15 {
        harness.runner.push_stdout("503");
    }
    harness.runner.push_stdout("200");
    let mut session = session();

    let report = harness.monitor().run(&mut session).await.expect("ready");

    assert!(!report.is_degraded(), "{:?}", report.warnings);
    let health = report.history.get(4).expect("health phase");
    assert_eq!(health.phase, Phase::AwaitHealth);
    assert_eq!(health.outcome, PhaseOutcome::Succeeded);
    assert_eq!(health.elapsed(), Duration::from_secs(30));
    assert_eq!(harness.runner.count_matching("/health"), 16);
}

#[tokio::test(start_paused = true)]
async fn phases_start_after_their_predecessor_ends() {
    let harness = Harness::healthy().await;
    let mut session = session();

    let report = harness.monitor().run(&mut session).await.expect("ready");

    for pair in report.history.windows(2) {
        if let [previous, next] = pair {
            assert!(next.started_at >= previous.finished_at);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn unhealthy_service_degrades_and_catalog_still_runs() {
    let harness = Harness::healthy().await;
    let runner = ScriptedRunner::new();
    runner.respond_to("docker ps", "ollama\nopen-webui\n");
    runner.respond_to("/health", "503");
    runner.respond_to("/api/tags", format!(r#"{{"models":[{{"name":"{WORKLOAD}"}}]}}"#));
    let harness = Harness { runner, ..harness };
    let mut session = session();

    let report = harness.monitor().run(&mut session).await.expect("ready");

    assert_eq!(session.state(), DeploymentState::Ready);
    assert_eq!(report.warnings.len(), 1);
    match report.warnings.first() {
        Some(PhaseWarning::SoftTimeout {
            phase,
            timeout,
            detail,
        }) => {
            assert_eq!(*phase, Phase::AwaitHealth);
            assert_eq!(*timeout, Duration::from_secs(30));
            assert!(detail.contains("503"), "{detail}");
        }
        other => panic!("expected a soft timeout, got {other:?}"),
    }
    assert_eq!(harness.runner.count_matching("/health"), 16);
    assert_eq!(harness.runner.count_matching("/api/tags"), 1);
    assert_eq!(harness.provisioner.delete_calls(), 0);
    assert_within_bounds(&report.history);
}

#[tokio::test(start_paused = true)]
async fn stalled_ssh_sessions_cannot_outlast_their_phase() {
    let harness = Harness::healthy().await;
    let runner = ScriptedRunner::new().with_delay(Duration::from_secs(45));
    runner.respond_to("docker ps", "ollama\nopen-webui\n");
    runner.respond_to("/health", "200");
    runner.respond_to("/api/tags", format!(r#"{{"models":[{{"name":"{WORKLOAD}"}}]}}"#));
    let harness = Harness { runner, ..harness };
    let mut session = session();

    let report = harness.monitor().run(&mut session).await.expect("ready");

    assert_eq!(session.state(), DeploymentState::Ready);
    let degraded: Vec<Phase> = report.warnings.iter().map(PhaseWarning::phase).collect();
    assert_eq!(degraded, vec![Phase::CheckContainers, Phase::AwaitHealth]);
    let elapsed: Vec<(Phase, Duration)> = report
        .history
        .iter()
        .skip(3)
        .map(|record| (record.phase, record.elapsed()))
        .collect();
    assert_eq!(
        elapsed,
        vec![
            (Phase::CheckContainers, Duration::from_secs(30)),
            (Phase::AwaitHealth, Duration::from_secs(30)),
            (Phase::AwaitCatalog, Duration::from_secs(45)),
        ]
    );
    assert_within_bounds(&report.history);
}

#[tokio::test(start_paused = true)]
async fn workload_never_listed_degrades_after_the_catalog_bound() {
    let harness = Harness::healthy().await;
    let runner = ScriptedRunner::new();
    runner.respond_to("docker ps", "ollama\nopen-webui\n");
    runner.respond_to("/health", "200");
    runner.respond_to("/api/tags", r#"{"models":[{"name":"llama3.1:70b-preview"}]}"#);
    let harness = Harness { runner, ..harness };
    let mut session = session();

    let report = harness.monitor().run(&mut session).await.expect("ready");

    assert_eq!(session.state(), DeploymentState::Ready);
    let catalog = report.history.last().expect("catalog phase");
    assert_eq!(catalog.phase, Phase::AwaitCatalog);
    assert!(matches!(catalog.outcome, PhaseOutcome::Degraded(_)));
    assert_eq!(catalog.elapsed(), Duration::from_secs(600));
    assert_eq!(harness.runner.count_matching("/api/tags"), 301);
    assert_within_bounds(&report.history);
}

#[tokio::test(start_paused = true)]
async fn sessions_cannot_be_run_twice() {
    let harness = Harness::healthy().await;
    let mut session = session();
    harness.monitor().run(&mut session).await.expect("ready");

    let err = harness
        .monitor()
        .run(&mut session)
        .await
        .expect_err("session already finished");

    assert_eq!(
        err,
        ReadinessError::OutOfOrder {
            phase: Phase::AwaitRunning,
            state: DeploymentState::Ready,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn custom_timings_shorten_the_status_bound() {
    let mut harness = Harness::healthy().await;
    harness.provisioner = ScriptedProvisioner::new(handle());
    harness.provisioner.push_status("offline");
    let timings = PhaseTimings {
        status_interval: Duration::from_secs(1),
        status_timeout: Duration::from_secs(3),
        ..PhaseTimings::default()
    };
    let mut session = session();

    let err = harness
        .monitor()
        .with_timings(timings)
        .run(&mut session)
        .await
        .expect_err("instance stays offline");

    assert!(matches!(err, ReadinessError::HardTimeout { .. }), "{err}");
    assert_eq!(harness.provisioner.status_calls(), 4);
}

#[test]
fn invalid_completion_pattern_is_rejected() {
    let harness_runner = ScriptedRunner::new();
    let shell = RemoteShell::new(SshSettings::new("root", None), harness_runner)
        .expect("settings validate");
    let result = ReadinessMonitor::new(
        ScriptedProvisioner::new(handle()),
        shell,
        ScriptedConnector::new(),
        expectations(),
    )
    .expect("monitor builds")
    .with_completion_pattern("(unclosed");
    assert!(matches!(result, Err(StreamError::InvalidPattern(_))));
}
