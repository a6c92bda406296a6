//! Binary entry point for the `gpulaunch` CLI.

use std::env;
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::process;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gpulaunch::backend::InstanceHandle;
use gpulaunch::cloud_init::DEFAULT_TEMPLATE;
use gpulaunch::config::{ConfigError, DeployConfig};
use gpulaunch::deploy::{DeployError, DeployOrchestrator, DeployOutcome, DeployPlan, PlanError};
use gpulaunch::linode::{LinodeBackend, LinodeError};
use gpulaunch::progress::ConsoleReporter;
use gpulaunch::readiness::{
    HttpEventConnector, PhaseOutcome, PhaseTimings, ReadinessError, ReadinessMonitor, StreamError,
};
use gpulaunch::record_store::{AuditLog, RecordStore, TempArtifacts};
use gpulaunch::remote::{RemoteError, RemoteShell, SshSettings};
use gpulaunch::test_support::{
    FixedConfirm, ScriptedConnector, ScriptedProvisioner, ScriptedRunner, StreamTail,
    message_line,
};

mod cli;

use cli::{Cli, DeployCommand};

/// Selects a scripted deployment instead of talking to real services.
const FAKE_DEPLOY_ENV: &str = "GPULAUNCH_FAKE_DEPLOY_MODE";

const FAKE_PUBLIC_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIfake fake@gpulaunch";

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("authentication error: {0}")]
    Auth(#[source] ConfigError),
    #[error("{0}")]
    Plan(#[from] PlanError),
    #[error("backend error: {0}")]
    Backend(#[source] LinodeError),
    #[error("remote shell error: {0}")]
    Remote(#[from] RemoteError),
    #[error("event stream error: {0}")]
    Stream(#[from] StreamError),
    #[error("failed to create instance: {0}")]
    Provision(String),
    #[error(transparent)]
    Readiness(#[from] ReadinessError),
    #[error("fake deployment setup failed: {0}")]
    Fake(String),
}

impl<E: std::error::Error + 'static> From<DeployError<E>> for CliError {
    fn from(value: DeployError<E>) -> Self {
        match value {
            DeployError::Provision(err) => Self::Provision(err.to_string()),
            DeployError::Readiness(err) => Self::Readiness(err),
        }
    }
}

/// Termination signals that cancel a deployment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Shutdown {
    Interrupt,
    Terminate,
}

impl Shutdown {
    const fn exit_code(self) -> i32 {
        match self {
            Self::Interrupt => 130,
            Self::Terminate => 143,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match cli {
        Cli::Deploy(command) => exec_deploy(command).await,
    };
    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .init();
}

async fn exec_deploy(args: DeployCommand) -> i32 {
    let artifacts = TempArtifacts::new();
    let config = DeployConfig::load_without_cli_args();
    let audit = AuditLog::in_dir(
        config
            .as_ref()
            .map_or(".", |loaded| loaded.record_dir.as_str()),
    );

    tokio::select! {
        result = deploy(&args, config, artifacts.clone()) => match result {
            Ok(outcome) => {
                write_outcome(io::stdout(), &outcome);
                0
            }
            Err(err) => {
                report_fatal(&audit, &err);
                1
            }
        },
        shutdown = shutdown_signal() => {
            let failures = artifacts.cleanup();
            info!(signal = shutdown.name(), failures = failures.len(), "deployment cancelled");
            writeln!(
                io::stderr(),
                "interrupted by {}; temporary files removed",
                shutdown.name()
            )
            .ok();
            shutdown.exit_code()
        }
    }
}

async fn deploy(
    args: &DeployCommand,
    config: Result<DeployConfig, ConfigError>,
    artifacts: TempArtifacts,
) -> Result<DeployOutcome, CliError> {
    let loaded = config?;
    loaded.validate()?;
    if let Ok(mode) = env::var(FAKE_DEPLOY_ENV)
        && let Some(scenario) = FakeScenario::parse(&mode)
    {
        return fake_deploy(scenario, args, &loaded, artifacts).await;
    }

    let token = loaded.token().map_err(CliError::Auth)?;
    let plan = DeployPlan::prepare(&loaded)?;
    let backend = LinodeBackend::new(&loaded.api_url, token.clone()).map_err(CliError::Backend)?;
    let gpu = backend
        .ensure_gpu_type(&plan.request.instance_type)
        .await
        .map_err(CliError::Backend)?;
    info!(instance_type = %gpu.id, gpus = gpu.gpus, "GPU type available");

    let shell = RemoteShell::with_process_runner(SshSettings::new(
        loaded.ssh_user.as_str(),
        loaded.ssh_identity_file.clone(),
    ))?;
    let events = HttpEventConnector::new(&loaded.events_url)?;
    let monitor = ReadinessMonitor::new(backend, shell, events, plan.expectations.clone())?
        .with_reporter(ConsoleReporter::new(args.silent));
    let store = RecordStore::new(loaded.record_dir.as_str(), artifacts);
    let orchestrator = DeployOrchestrator::new(monitor, store)
        .with_audit_log(AuditLog::in_dir(loaded.record_dir.as_str()));
    Ok(orchestrator.execute(&plan, token).await?)
}

async fn shutdown_signal() -> Shutdown {
    let interrupt = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => Shutdown::Interrupt,
        () = terminate => Shutdown::Terminate,
    }
}

fn write_outcome(mut target: impl Write, outcome: &DeployOutcome) {
    let report = &outcome.report;
    let handle = &report.handle;
    writeln!(
        target,
        "instance {} ({}) is ready at {}",
        handle.label, handle.id, handle.address
    )
    .ok();
    for record in &report.history {
        let result = match record.outcome {
            PhaseOutcome::Succeeded => "ok",
            PhaseOutcome::Degraded(_) => "warning",
            PhaseOutcome::Failed(_) => "failed",
        };
        writeln!(
            target,
            "  {:<10} {:>6}s  {result}",
            record.phase.name(),
            record.elapsed().as_secs()
        )
        .ok();
    }
    for warning in &report.warnings {
        writeln!(target, "warning: {warning}").ok();
    }
    match outcome.record {
        Ok(ref path) => writeln!(target, "record written to {path}").ok(),
        Err(ref err) => writeln!(target, "warning: deployment record not written: {err}").ok(),
    };
}

fn report_fatal(audit: &AuditLog, err: &CliError) {
    write_error(io::stderr(), err);
    if let Err(audit_err) = audit.append("error", &err.to_string()) {
        error!(path = %audit.path(), error = %audit_err, "audit log entry not written");
    }
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "error: {err}").ok();
}

/// Scripted deployments used by the CLI tests.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FakeScenario {
    Ready,
    Warn,
    HardTimeout,
}

impl FakeScenario {
    fn parse(mode: &str) -> Option<Self> {
        match mode {
            "ready" => Some(Self::Ready),
            "warn" => Some(Self::Warn),
            "hard-timeout" => Some(Self::HardTimeout),
            _ => None,
        }
    }
}

const fn fake_timings() -> PhaseTimings {
    let tick = Duration::from_millis(10);
    let bound = Duration::from_millis(200);
    PhaseTimings {
        status_interval: tick,
        status_timeout: bound,
        first_event_timeout: bound,
        stream_retry_interval: tick,
        reboot_grace: tick,
        port_interval: tick,
        port_timeout: bound,
        port_connect_timeout: tick,
        containers_timeout: bound,
        health_interval: tick,
        health_timeout: bound,
        catalog_interval: tick,
        catalog_timeout: bound,
    }
}

async fn fake_deploy(
    scenario: FakeScenario,
    args: &DeployCommand,
    config: &DeployConfig,
    artifacts: TempArtifacts,
) -> Result<DeployOutcome, CliError> {
    let plan = DeployPlan::from_parts(config, FAKE_PUBLIC_KEY, DEFAULT_TEMPLATE)?;
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .map_err(|err| CliError::Fake(err.to_string()))?;
    let port = listener
        .local_addr()
        .map_err(|err| CliError::Fake(err.to_string()))?
        .port();

    let provisioner = ScriptedProvisioner::new(InstanceHandle {
        id: String::from("4242"),
        address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        label: plan.request.label.clone(),
    });
    if scenario == FakeScenario::HardTimeout {
        provisioner.push_status("provisioning");
    }
    let connector = ScriptedConnector::new();
    connector.push_stream(
        vec![
            (Duration::from_millis(5), message_line("Installing NVIDIA drivers")),
            (Duration::from_millis(5), message_line("Rebooting to load the GPU driver")),
        ],
        StreamTail::Idle,
    );
    let runner = ScriptedRunner::new();
    runner.respond_to(
        "docker ps",
        format!("{}\n{}", config.primary_service, config.secondary_service),
    );
    let health = if scenario == FakeScenario::Warn { "503" } else { "200" };
    runner.respond_to("/health", health);
    runner.respond_to(
        "/api/tags",
        format!(r#"{{"models":[{{"name":"{}"}}]}}"#, config.workload_id),
    );

    let settings = SshSettings {
        port,
        ..SshSettings::new(config.ssh_user.as_str(), None)
    };
    let shell = RemoteShell::new(settings, runner)?;
    let monitor = ReadinessMonitor::new(provisioner, shell, connector, plan.expectations.clone())?
        .with_timings(fake_timings())
        .with_reporter(ConsoleReporter::new(args.silent))
        .with_confirm(FixedConfirm::new(false));
    let store = RecordStore::new(config.record_dir.as_str(), artifacts);
    let orchestrator = DeployOrchestrator::new(monitor, store)
        .with_audit_log(AuditLog::in_dir(config.record_dir.as_str()));
    let token = gpulaunch::config::ApiToken::new("fake-token")?;
    let outcome = orchestrator.execute(&plan, token).await;
    drop(listener);
    Ok(outcome?)
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
