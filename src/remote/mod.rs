//! Remote command execution over the system `ssh` client.
//!
//! Every call opens a fresh, non-interactive session with key-based
//! authentication only. Host keys are neither confirmed nor persisted, and a
//! short connect timeout keeps a dead host from stalling a polling loop.

use std::ffi::OsString;
use std::net::IpAddr;

use thiserror::Error;
use tracing::debug;

mod types;

pub use types::{CommandFuture, CommandOutput, CommandRunner, ProcessCommandRunner};

/// Default SSH port on freshly provisioned instances.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default SSH connect timeout, in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u16 = 5;

/// Settings for the remote shell session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshSettings {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Remote user to connect as.
    pub user: String,
    /// TCP port of the SSH daemon.
    pub port: u16,
    /// Optional private key; when absent `ssh` uses its default keys.
    pub identity_file: Option<String>,
    /// Connect timeout passed to `ssh`, in seconds.
    pub connect_timeout_secs: u16,
}

impl SshSettings {
    /// Builds settings for `user` with the default binary, port and timeout.
    #[must_use]
    pub fn new(user: impl Into<String>, identity_file: Option<String>) -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            user: user.into(),
            port: DEFAULT_SSH_PORT,
            identity_file,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }

    /// Ensures configuration values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidConfig`] when a field is blank or zero.
    pub fn validate(&self) -> Result<(), RemoteError> {
        let invalid = |field: &str| RemoteError::InvalidConfig {
            field: field.to_owned(),
        };
        if self.ssh_bin.trim().is_empty() {
            return Err(invalid("ssh_bin"));
        }
        if self.user.trim().is_empty() {
            return Err(invalid("ssh_user"));
        }
        if self.port == 0 {
            return Err(invalid("ssh_port"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(invalid("connect_timeout"));
        }
        if self
            .identity_file
            .as_deref()
            .is_some_and(|path| path.trim().is_empty())
        {
            return Err(invalid("ssh_identity_file"));
        }
        Ok(())
    }
}

/// Output captured from a remote command executed over SSH.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteCommandOutput {
    /// Exit code reported by the remote command, if any.
    pub exit_code: Option<i32>,
    /// Captured standard output stream.
    pub stdout: String,
    /// Captured standard error stream.
    pub stderr: String,
}

/// Errors surfaced while executing remote commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteError {
    /// Raised when configuration is missing required values.
    #[error("invalid SSH configuration: {field}")]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
}

/// Runs commands on a single remote host.
#[derive(Clone, Debug)]
pub struct RemoteShell<R: CommandRunner> {
    settings: SshSettings,
    runner: R,
}

impl RemoteShell<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidConfig`] when validation fails.
    pub fn with_process_runner(settings: SshSettings) -> Result<Self, RemoteError> {
        Self::new(settings, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> RemoteShell<R> {
    /// Creates a remote shell using the provided runner and settings.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidConfig`] when settings validation fails.
    pub fn new(settings: SshSettings, runner: R) -> Result<Self, RemoteError> {
        settings.validate()?;
        Ok(Self { settings, runner })
    }

    /// Returns the session settings.
    #[must_use]
    pub const fn settings(&self) -> &SshSettings {
        &self.settings
    }

    /// Executes `command` on `host` and returns the full output.
    ///
    /// # Errors
    ///
    /// Propagates any failure to spawn the `ssh` client.
    ///
    /// # Security
    ///
    /// `command` is passed verbatim to the remote shell; callers must quote
    /// untrusted input.
    pub async fn run(
        &self,
        host: IpAddr,
        command: &str,
    ) -> Result<RemoteCommandOutput, RemoteError> {
        let args = self.build_ssh_args(host, command);
        let output = self.runner.run(&self.settings.ssh_bin, &args).await?;
        Ok(RemoteCommandOutput {
            exit_code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Executes `command` and returns stdout only when it exited with zero.
    ///
    /// Connection failures and non-zero exits yield `None`; polling loops
    /// treat that as "not ready yet". Dropping the future abandons the
    /// session.
    pub async fn capture(&self, host: IpAddr, command: &str) -> Option<String> {
        match self.run(host, command).await {
            Ok(output) if output.exit_code == Some(0) => Some(output.stdout),
            Ok(output) => {
                debug!(
                    %host,
                    exit_code = ?output.exit_code,
                    stderr = %output.stderr.trim(),
                    "remote command failed"
                );
                None
            }
            Err(err) => {
                debug!(%host, error = %err, "remote command could not run");
                None
            }
        }
    }

    fn build_ssh_args(&self, host: IpAddr, command: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.settings.port.to_string()),
        ];

        if let Some(ref identity_file) = self.settings.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file)));
        }

        let options = [
            String::from("BatchMode=yes"),
            String::from("PasswordAuthentication=no"),
            String::from("KbdInteractiveAuthentication=no"),
            String::from("StrictHostKeyChecking=no"),
            String::from("UserKnownHostsFile=/dev/null"),
            String::from("LogLevel=ERROR"),
            format!("ConnectTimeout={}", self.settings.connect_timeout_secs),
        ];
        for option in options {
            args.push(OsString::from("-o"));
            args.push(OsString::from(option));
        }

        args.push(OsString::from(format!("{}@{host}", self.settings.user)));
        args.push(OsString::from(command));
        args
    }
}

/// Expands a leading `~` in a key path to `$HOME`.
///
/// Only the current user's home is understood; `~other/...` and paths
/// without a tilde come back unchanged, as does everything when `HOME` is
/// unset.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    let rest = match path.strip_prefix('~') {
        Some("") => "",
        Some(rest) if rest.starts_with('/') => rest,
        _ => return path.to_owned(),
    };
    std::env::var_os("HOME").map_or_else(
        || path.to_owned(),
        |home| format!("{}{rest}", home.to_string_lossy().trim_end_matches('/')),
    )
}

#[cfg(test)]
mod tests;
