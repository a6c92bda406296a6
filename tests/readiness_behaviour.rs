//! Behavioural tests for the readiness building blocks, driven on a paused
//! clock through the public API.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use gpulaunch::readiness::{
    Check, DEFAULT_COMPLETION_PATTERN, EventStreamWatcher, Phase, PhasePolicy, PortProbe,
    StatusPoller, WatchEnd, poll_until,
};
use gpulaunch::test_support::{
    ScriptedConnector, ScriptedProvisioner, StreamTail, keepalive_line, message_line,
    sample_handle,
};
use regex::Regex;
use rstest::rstest;
use tokio::net::TcpListener;
use tokio::time::Instant;

const fn policy(interval: u64, timeout: u64) -> PhasePolicy {
    PhasePolicy {
        interval: Duration::from_secs(interval),
        timeout: Duration::from_secs(timeout),
    }
}

#[tokio::test(start_paused = true)]
async fn status_reaches_running_on_third_poll() {
    let provisioner = ScriptedProvisioner::new(sample_handle());
    provisioner.push_status("provisioning");
    provisioner.push_status("provisioning");
    provisioner.push_status("running");

    let elapsed = StatusPoller::new(&provisioner, policy(5, 180))
        .wait_for("4242", "running")
        .await
        .expect("instance runs");

    assert_eq!(elapsed, Duration::from_secs(10));
    assert_eq!(provisioner.status_calls(), 3);
}

#[rstest]
#[case::status(policy(5, 180))]
#[case::health(policy(2, 30))]
#[case::catalog(policy(2, 600))]
#[tokio::test(start_paused = true)]
async fn poll_never_overshoots_timeout_by_more_than_one_interval(#[case] policy: PhasePolicy) {
    let started = Instant::now();
    let timeout = poll_until(Phase::AwaitHealth, policy, || async {
        Check::NotReady(String::from("still starting"))
    })
    .await
    .expect_err("never ready");

    assert!(timeout.elapsed >= policy.timeout);
    assert!(started.elapsed() <= policy.timeout + policy.interval);
    assert_eq!(timeout.last, "still starting");
}

#[tokio::test(start_paused = true)]
async fn health_turning_green_at_29_seconds_succeeds() {
    let started = Instant::now();
    let elapsed = poll_until(Phase::AwaitHealth, policy(2, 30), || async move {
        if started.elapsed() >= Duration::from_secs(29) {
            Check::Ready
        } else {
            Check::NotReady(String::from("HTTP 503"))
        }
    })
    .await
    .expect("health turns green");

    assert_eq!(elapsed, Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn closed_port_probe_is_bounded() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr: SocketAddr = listener.local_addr().expect("addr");
    drop(listener);

    let probe = PortProbe::new(
        Duration::from_secs(2),
        Duration::from_secs(10),
        Duration::from_secs(2),
    );
    let started = Instant::now();
    let err = probe.wait_until_open(addr).await.expect_err("port stays closed");

    assert!(started.elapsed() <= Duration::from_secs(12), "{err:?}");
}

#[tokio::test(start_paused = true)]
async fn open_events_are_not_surfaced_as_messages() {
    let connector = ScriptedConnector::new();
    let mut lines: Vec<(Duration, String)> = (0..5)
        .map(|_| (Duration::from_secs(1), String::from(r#"{"event":"open"}"#)))
        .collect();
    lines.push((Duration::from_secs(1), keepalive_line()));
    lines.push((Duration::from_secs(1), message_line("System rebooting now")));
    connector.push_stream(lines, StreamTail::Idle);
    let pattern = Regex::new(DEFAULT_COMPLETION_PATTERN).expect("pattern");
    let watcher = EventStreamWatcher::new(
        &connector,
        Duration::from_secs(300),
        Duration::from_secs(2),
        &pattern,
    );

    let mut seen = Vec::new();
    let summary = watcher
        .watch("topic", |message| seen.push(message.to_owned()))
        .await
        .expect("stream completes");

    assert_eq!(seen, vec![String::from("System rebooting now")]);
    assert_eq!(summary.messages, 1);
    assert_eq!(
        summary.end,
        WatchEnd::Completed {
            message: String::from("System rebooting now")
        }
    );
}
