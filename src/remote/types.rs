//! Process output and the asynchronous command runner seam.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;

use tokio::process::Command;

use super::RemoteError;

/// Boxed future returned by [`CommandRunner::run`].
pub type CommandFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, RemoteError>> + Send + 'a>>;

/// Exit code and captured streams of a finished process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code, absent when the process was killed by a signal.
    pub code: Option<i32>,
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

/// Starts a local program and collects its output.
///
/// Dropping the returned future must stop waiting on the program, so callers
/// can bound a call with a timeout or abandon it on shutdown.
pub trait CommandRunner {
    /// Runs `program` with `args` to completion.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Spawn`] if the program cannot be started.
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> CommandFuture<'a>;
}

/// Runs programs as child processes of this one.
///
/// The child is killed when its future is dropped, so an abandoned `ssh`
/// session does not outlive the phase that started it.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> CommandFuture<'a> {
        Box::pin(async move {
            let output = Command::new(program)
                .args(args)
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|err| RemoteError::Spawn {
                    program: program.to_owned(),
                    message: err.to_string(),
                })?;
            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}
