//! Test doubles shared across unit tests, integration tests and the fake
//! deployment modes of the binary.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio::time::sleep;

use crate::backend::{
    BackendFuture, InstanceHandle, InstanceRequest, ProvisionedInstance, Provisioner,
};
use crate::readiness::{EventConnector, EventSource, StreamError, StreamFuture};
use crate::recovery::{Confirm, ConfirmFuture};
use crate::remote::{CommandFuture, CommandOutput, CommandRunner, RemoteError};

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Once the queue is empty, the first standing response whose needle occurs
/// in the remote command answers instead. Anything else fails as if `ssh`
/// could not be spawned. With a delay set, every answer arrives that much
/// later, like a session stuck on a slow network.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<RunnerState>>,
}

#[derive(Debug, Default)]
struct RunnerState {
    responses: VecDeque<CommandOutput>,
    standing: Vec<(String, CommandOutput)>,
    invocations: Vec<CommandInvocation>,
    delay: Duration,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    /// Returns the remote command, which is always the last argument.
    #[must_use]
    pub fn remote_command(&self) -> String {
        self.args
            .last()
            .map(|arg| arg.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every answer by `delay`.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        self.with_state(|state| state.delay = delay);
        self
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut RunnerState) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.with_state(|state| state.invocations.clone())
    }

    /// Counts invocations whose remote command contains `needle`.
    #[must_use]
    pub fn count_matching(&self, needle: &str) -> usize {
        self.with_state(|state| {
            state
                .invocations
                .iter()
                .filter(|call| call.remote_command().contains(needle))
                .count()
        })
    }

    /// Pushes a successful exit with the given stdout.
    pub fn push_stdout(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        let output = CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        };
        self.with_state(|state| state.responses.push_back(output));
    }

    /// Answers every command containing `needle` with a zero exit and
    /// `stdout` once the queue is exhausted.
    pub fn respond_to(&self, needle: &str, stdout: impl Into<String>) {
        let output = CommandOutput {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        };
        self.with_state(|state| state.standing.push((needle.to_owned(), output)));
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> CommandFuture<'a> {
        let invocation = CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        };
        let remote_command = invocation.remote_command();
        let (answer, delay) = self.with_state(|state| {
            state.invocations.push(invocation);
            let found = state.responses.pop_front().or_else(|| {
                state
                    .standing
                    .iter()
                    .find(|(needle, _)| remote_command.contains(needle.as_str()))
                    .map(|(_, output)| output.clone())
            });
            (found, state.delay)
        });
        Box::pin(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            answer.ok_or_else(|| RemoteError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
        })
    }
}

/// Error type produced by [`ScriptedProvisioner`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScriptedError {
    /// The instance does not exist.
    #[error("instance not found")]
    NotFound,
    /// Any other scripted failure.
    #[error("scripted failure: {0}")]
    Failed(String),
}

#[derive(Debug)]
struct ProvisionerState {
    handle: InstanceHandle,
    create_error: Option<ScriptedError>,
    statuses: VecDeque<Result<String, ScriptedError>>,
    delete_error: Option<ScriptedError>,
    created: Vec<InstanceRequest>,
    status_calls: usize,
    delete_calls: usize,
}

/// In-memory provisioner with scripted status answers.
///
/// Status answers are consumed in order; the last one repeats forever. With
/// nothing scripted the instance reports `running`.
#[derive(Clone, Debug)]
pub struct ScriptedProvisioner {
    state: Arc<Mutex<ProvisionerState>>,
}

impl ScriptedProvisioner {
    /// Creates a provisioner whose create call returns `handle`.
    #[must_use]
    pub fn new(handle: InstanceHandle) -> Self {
        Self {
            state: Arc::new(Mutex::new(ProvisionerState {
                handle,
                create_error: None,
                statuses: VecDeque::new(),
                delete_error: None,
                created: Vec::new(),
                status_calls: 0,
                delete_calls: 0,
            })),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ProvisionerState) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Queues a status answer.
    pub fn push_status(&self, status: &str) {
        self.with_state(|state| state.statuses.push_back(Ok(status.to_owned())));
    }

    /// Queues a failed status request.
    pub fn push_status_error(&self) {
        self.with_state(|state| {
            state
                .statuses
                .push_back(Err(ScriptedError::Failed(String::from("status unavailable"))));
        });
    }

    /// Makes the create call fail.
    pub fn fail_create(&self, message: &str) {
        self.with_state(|state| state.create_error = Some(ScriptedError::Failed(message.to_owned())));
    }

    /// Makes the delete call fail with `error`.
    pub fn fail_delete(&self, error: ScriptedError) {
        self.with_state(|state| state.delete_error = Some(error));
    }

    /// Requests passed to the create call.
    #[must_use]
    pub fn created(&self) -> Vec<InstanceRequest> {
        self.with_state(|state| state.created.clone())
    }

    /// Number of status calls made.
    #[must_use]
    pub fn status_calls(&self) -> usize {
        self.with_state(|state| state.status_calls)
    }

    /// Number of delete calls made.
    #[must_use]
    pub fn delete_calls(&self) -> usize {
        self.with_state(|state| state.delete_calls)
    }
}

impl Provisioner for ScriptedProvisioner {
    type Error = ScriptedError;

    fn create<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> BackendFuture<'a, ProvisionedInstance, Self::Error> {
        let result = self.with_state(|state| {
            state.created.push(request.clone());
            state.create_error.clone().map_or_else(
                || {
                    Ok(ProvisionedInstance {
                        handle: state.handle.clone(),
                        status: String::from("provisioning"),
                        response: serde_json::json!({ "id": state.handle.id }),
                    })
                },
                Err,
            )
        });
        Box::pin(async move { result })
    }

    fn status<'a>(&'a self, _id: &'a str) -> BackendFuture<'a, String, Self::Error> {
        let result = self.with_state(|state| {
            state.status_calls += 1;
            if state.statuses.len() > 1 {
                state
                    .statuses
                    .pop_front()
                    .unwrap_or_else(|| Ok(String::from("running")))
            } else {
                state
                    .statuses
                    .front()
                    .cloned()
                    .unwrap_or_else(|| Ok(String::from("running")))
            }
        });
        Box::pin(async move { result })
    }

    fn delete<'a>(&'a self, _id: &'a str) -> BackendFuture<'a, (), Self::Error> {
        let result = self.with_state(|state| {
            state.delete_calls += 1;
            state.delete_error.clone().map_or(Ok(()), Err)
        });
        Box::pin(async move { result })
    }

    fn is_missing(error: &Self::Error) -> bool {
        matches!(error, ScriptedError::NotFound)
    }
}

/// How a scripted stream behaves after its last line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamTail {
    /// The server closes the stream.
    Eof,
    /// Reading fails.
    Error,
    /// The stream stays open and silent.
    Idle,
}

#[derive(Clone, Debug)]
enum ScriptedOpen {
    Fail,
    Stream {
        lines: VecDeque<(Duration, String)>,
        tail: StreamTail,
    },
}

/// Event connector replaying scripted streams, one per open call.
///
/// Opens beyond the script fail with a connection error.
#[derive(Clone, Debug, Default)]
pub struct ScriptedConnector {
    script: Arc<Mutex<VecDeque<ScriptedOpen>>>,
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    /// Creates a connector with nothing scripted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts an open call that fails.
    pub fn push_open_failure(&self) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(ScriptedOpen::Fail);
    }

    /// Scripts a stream yielding `lines`, each after its delay.
    pub fn push_stream(&self, lines: Vec<(Duration, String)>, tail: StreamTail) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(ScriptedOpen::Stream {
                lines: lines.into(),
                tail,
            });
    }

    /// Number of open calls made.
    #[must_use]
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of sources closed.
    #[must_use]
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl EventConnector for ScriptedConnector {
    type Source = ScriptedSource;

    fn open<'a>(&'a self, _topic: &'a str) -> StreamFuture<'a, Self::Source> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let closes = Arc::clone(&self.closes);
        Box::pin(async move {
            match next {
                Some(ScriptedOpen::Stream { lines, tail }) => Ok(ScriptedSource {
                    lines,
                    tail,
                    closes,
                    closed: false,
                }),
                Some(ScriptedOpen::Fail) | None => Err(StreamError::Connect(String::from(
                    "scripted connection refused",
                ))),
            }
        })
    }
}

/// Source produced by [`ScriptedConnector`].
#[derive(Debug)]
pub struct ScriptedSource {
    lines: VecDeque<(Duration, String)>,
    tail: StreamTail,
    closes: Arc<AtomicUsize>,
    closed: bool,
}

impl EventSource for ScriptedSource {
    fn next_line(&mut self) -> StreamFuture<'_, Option<String>> {
        let next = self.lines.pop_front();
        let tail = self.tail;
        Box::pin(async move {
            if let Some((delay, line)) = next {
                sleep(delay).await;
                return Ok(Some(line));
            }
            match tail {
                StreamTail::Eof => Ok(None),
                StreamTail::Error => Err(StreamError::Read(String::from("scripted reset"))),
                StreamTail::Idle => {
                    std::future::pending::<()>().await;
                    Ok(None)
                }
            }
        })
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Renders a `message` stream entry.
#[must_use]
pub fn message_line(text: &str) -> String {
    serde_json::json!({ "event": "message", "message": text }).to_string()
}

/// Renders a `keepalive` stream entry.
#[must_use]
pub fn keepalive_line() -> String {
    serde_json::json!({ "event": "keepalive" }).to_string()
}

/// Confirmation double returning a fixed answer and recording prompts.
#[derive(Clone, Debug)]
pub struct FixedConfirm {
    answer: bool,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl FixedConfirm {
    /// Creates a double answering `answer`.
    #[must_use]
    pub fn new(answer: bool) -> Self {
        Self {
            answer,
            prompts: Arc::default(),
        }
    }

    /// Prompts shown so far.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Confirm for FixedConfirm {
    fn confirm<'a>(&'a self, prompt: &'a str, _default: bool) -> ConfirmFuture<'a> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.to_owned());
        let answer = self.answer;
        Box::pin(async move { answer })
    }
}

/// Handle used throughout the tests.
#[must_use]
pub fn sample_handle() -> InstanceHandle {
    InstanceHandle {
        id: String::from("4242"),
        address: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)),
        label: String::from("gpulaunch-test"),
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }

    /// Removes variables while holding the global mutex.
    pub async fn remove_vars(keys: &[&str]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(keys.len());
        for key in keys {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::remove_var(key) };
            previous.push(((*key).to_owned(), old));
        }
        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
