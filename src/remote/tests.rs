//! Tests for SSH argument construction and output capture.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::test_support::ScriptedRunner;

#[fixture]
fn settings() -> SshSettings {
    SshSettings::new("root", Some(String::from("/keys/id_ed25519")))
}

#[fixture]
fn host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10))
}

fn rendered(args: &[OsString]) -> Vec<String> {
    args.iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

#[rstest]
fn ssh_args_are_non_interactive(settings: SshSettings, host: IpAddr) {
    let shell = RemoteShell::new(settings, ScriptedRunner::new()).expect("settings validate");
    let args = rendered(&shell.build_ssh_args(host, "docker ps"));

    for expected in [
        "BatchMode=yes",
        "PasswordAuthentication=no",
        "StrictHostKeyChecking=no",
        "UserKnownHostsFile=/dev/null",
        "ConnectTimeout=5",
    ] {
        assert!(
            args.contains(&String::from(expected)),
            "missing {expected}: {args:?}"
        );
    }
    assert_eq!(
        args.iter().rev().take(2).collect::<Vec<_>>(),
        vec!["docker ps", "root@192.0.2.10"],
    );
}

#[rstest]
fn ssh_args_include_identity_flag(settings: SshSettings, host: IpAddr) {
    let shell = RemoteShell::new(settings, ScriptedRunner::new()).expect("settings validate");
    let args = rendered(&shell.build_ssh_args(host, "true"));
    let position = args
        .iter()
        .position(|arg| arg == "-i")
        .expect("identity flag present");
    assert_eq!(
        args.get(position + 1).map(String::as_str),
        Some("/keys/id_ed25519")
    );
}

#[rstest]
fn ssh_args_omit_identity_when_unset(host: IpAddr) {
    let shell = RemoteShell::new(SshSettings::new("root", None), ScriptedRunner::new())
        .expect("settings validate");
    let args = rendered(&shell.build_ssh_args(host, "true"));
    assert!(!args.contains(&String::from("-i")), "{args:?}");
    assert_eq!(args.first().map(String::as_str), Some("-p"));
    assert_eq!(args.get(1).map(String::as_str), Some("22"));
}

#[rstest]
#[tokio::test]
async fn capture_returns_stdout_on_success(settings: SshSettings, host: IpAddr) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), "ollama\nopen-webui\n", "");
    let shell = RemoteShell::new(settings, runner.clone()).expect("settings validate");

    let stdout = shell.capture(host, "docker ps").await;

    assert_eq!(stdout.as_deref(), Some("ollama\nopen-webui\n"));
    let invocations = runner.invocations();
    assert_eq!(invocations.len(), 1);
    assert!(
        invocations
            .first()
            .is_some_and(|call| call.program == "ssh"),
        "{invocations:?}"
    );
}

#[rstest]
#[case::non_zero_exit(Some(255))]
#[case::no_exit_code(None)]
#[tokio::test]
async fn capture_discards_failed_commands(
    settings: SshSettings,
    host: IpAddr,
    #[case] code: Option<i32>,
) {
    let runner = ScriptedRunner::new();
    runner.push_output(code, "partial", "connection refused");
    let shell = RemoteShell::new(settings, runner).expect("settings validate");

    assert_eq!(shell.capture(host, "docker ps").await, None);
}

#[rstest]
#[tokio::test]
async fn capture_swallows_spawn_errors(settings: SshSettings, host: IpAddr) {
    let shell = RemoteShell::new(settings, ScriptedRunner::new()).expect("settings validate");
    assert_eq!(shell.capture(host, "docker ps").await, None);
}

#[rstest]
#[tokio::test]
async fn run_propagates_spawn_errors(settings: SshSettings, host: IpAddr) {
    let shell = RemoteShell::new(settings, ScriptedRunner::new()).expect("settings validate");
    let err = shell.run(host, "true").await.expect_err("no scripted output");
    assert!(matches!(err, RemoteError::Spawn { .. }), "{err}");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn dropping_a_slow_capture_abandons_it(settings: SshSettings, host: IpAddr) {
    let runner = ScriptedRunner::new().with_delay(Duration::from_secs(60));
    runner.push_stdout("ollama\n");
    let shell = RemoteShell::new(settings, runner).expect("settings validate");

    let result = tokio::time::timeout(Duration::from_secs(5), shell.capture(host, "docker ps")).await;

    assert!(result.is_err(), "capture should still be pending: {result:?}");
}

#[cfg(unix)]
#[tokio::test]
async fn process_runner_collects_output() {
    let args = [OsString::from("-c"), OsString::from("echo ready; exit 3")];

    let output = ProcessCommandRunner
        .run("sh", &args)
        .await
        .expect("sh spawns");

    assert_eq!(output.code, Some(3));
    assert_eq!(output.stdout, "ready\n");
}

#[cfg(unix)]
#[tokio::test]
async fn process_runner_can_be_cut_short() {
    let args = [OsString::from("30")];
    let started = std::time::Instant::now();

    let result = tokio::time::timeout(
        Duration::from_millis(200),
        ProcessCommandRunner.run("sleep", &args),
    )
    .await;

    assert!(result.is_err(), "sleep should not have finished");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn process_runner_reports_missing_programs() {
    let err = ProcessCommandRunner
        .run("gpulaunch-no-such-program", &[])
        .await
        .expect_err("program is missing");
    assert!(
        matches!(err, RemoteError::Spawn { ref program, .. } if program == "gpulaunch-no-such-program"),
        "{err}"
    );
}

#[rstest]
#[case::key_under_home("~/.ssh/id_ed25519", "/.ssh/id_ed25519")]
#[case::bare_home("~", "")]
fn expand_tilde_prefixes_home(#[case] path: &str, #[case] suffix: &str) {
    let Some(raw_home) = std::env::var_os("HOME") else {
        assert_eq!(expand_tilde(path), path);
        return;
    };
    let home = raw_home.to_string_lossy().trim_end_matches('/').to_owned();
    assert_eq!(expand_tilde(path), format!("{home}{suffix}"));
}

#[rstest]
#[case::absolute("/keys/id_ed25519")]
#[case::relative("keys/~/id_ed25519")]
#[case::other_user("~admin/.ssh/id_ed25519")]
fn expand_tilde_leaves_other_paths(#[case] path: &str) {
    assert_eq!(expand_tilde(path), path);
}

#[rstest]
#[case::blank_user(SshSettings::new("  ", None), "ssh_user")]
#[case::blank_identity(SshSettings::new("root", Some(String::from(" "))), "ssh_identity_file")]
#[case::zero_port(SshSettings { port: 0, ..SshSettings::new("root", None) }, "ssh_port")]
fn validate_rejects_unusable_settings(#[case] candidate: SshSettings, #[case] field: &str) {
    let err = candidate.validate().expect_err("settings should be rejected");
    assert_eq!(
        err,
        RemoteError::InvalidConfig {
            field: field.to_owned()
        }
    );
}
