//! Progress event stream published by the instance during first boot.
//!
//! The instance posts human readable progress messages to a push
//! notification topic. The topic is consumed as newline-delimited JSON over a
//! long-lived HTTP response; each line carries an `event` type and, for
//! `message` events, the text that was published.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, warn};

/// Pattern matching messages that announce the first-boot reboot.
pub const DEFAULT_COMPLETION_PATTERN: &str = r"(?i)\b(reboot|rebooting|restart|restarting)\b";

/// Future returned by event stream operations.
pub type StreamFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StreamError>> + Send + 'a>>;

/// Failures while consuming the progress stream.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StreamError {
    /// The stream could not be opened.
    #[error("failed to open progress stream: {0}")]
    Connect(String),
    /// The server answered with a non-success status.
    #[error("progress stream returned HTTP {0}")]
    Status(u16),
    /// Reading from an open stream failed.
    #[error("progress stream read failed: {0}")]
    Read(String),
    /// No message arrived within the first-event bound.
    #[error("no progress message within {waited_secs}s")]
    FirstEventTimeout {
        /// Seconds waited before giving up.
        waited_secs: u64,
    },
    /// The completion pattern does not compile.
    #[error("invalid completion pattern: {0}")]
    InvalidPattern(String),
}

/// An open stream of raw lines.
pub trait EventSource: Send {
    /// Returns the next line, or `None` once the server closed the stream.
    fn next_line(&mut self) -> StreamFuture<'_, Option<String>>;

    /// Releases the underlying connection.
    fn close(&mut self);
}

/// Opens event sources for a topic.
pub trait EventConnector {
    /// Source type produced by this connector.
    type Source: EventSource;

    /// Opens a stream for `topic`.
    fn open<'a>(&'a self, topic: &'a str) -> StreamFuture<'a, Self::Source>;
}

/// One decoded stream entry.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct StreamEvent {
    /// Entry type, such as `open`, `keepalive` or `message`.
    pub event: String,
    /// Published text for `message` entries.
    #[serde(default)]
    pub message: Option<String>,
}

/// Decodes `line` and returns its text when it is a `message` entry.
/// Keepalives, open notices and malformed lines yield `None`.
#[must_use]
pub fn parse_message(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<StreamEvent>(trimmed) {
        Ok(event) if event.event == "message" => Some(event.message.unwrap_or_default()),
        Ok(_) => None,
        Err(err) => {
            debug!(error = %err, "ignoring malformed stream line");
            None
        }
    }
}

/// Splits arbitrary byte chunks into complete lines.
#[derive(Clone, Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Appends a chunk read from the network.
    pub fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Removes and returns the next complete line without its terminator.
    pub fn pop_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|byte| *byte == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Returns any trailing partial line once the stream has ended.
    pub fn take_rest(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Opens topic streams over HTTP.
#[derive(Clone, Debug)]
pub struct HttpEventConnector {
    client: Client,
    base_url: String,
}

impl HttpEventConnector {
    /// Creates a connector for the service at `base_url`. Only connection
    /// setup is bounded; an open stream may stay idle indefinitely.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Connect`] when the HTTP client cannot be built
    /// or the URL is blank.
    pub fn new(base_url: &str) -> Result<Self, StreamError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(StreamError::Connect(String::from(
                "event stream URL must not be empty",
            )));
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| StreamError::Connect(err.to_string()))?;
        Ok(Self {
            client,
            base_url: trimmed.to_owned(),
        })
    }

    /// URL streaming every cached and future message for `topic`.
    #[must_use]
    pub fn stream_url(&self, topic: &str) -> String {
        format!("{}/{topic}/json?since=all", self.base_url)
    }

    async fn open_stream(&self, topic: &str) -> Result<HttpEventSource, StreamError> {
        let response = self
            .client
            .get(self.stream_url(topic))
            .send()
            .await
            .map_err(|err| StreamError::Connect(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::Status(status.as_u16()));
        }
        Ok(HttpEventSource {
            response: Some(response),
            buffer: LineBuffer::default(),
        })
    }
}

impl EventConnector for HttpEventConnector {
    type Source = HttpEventSource;

    fn open<'a>(&'a self, topic: &'a str) -> StreamFuture<'a, Self::Source> {
        Box::pin(self.open_stream(topic))
    }
}

/// Streaming HTTP response split into lines.
#[derive(Debug)]
pub struct HttpEventSource {
    response: Option<reqwest::Response>,
    buffer: LineBuffer,
}

impl HttpEventSource {
    async fn read_line(&mut self) -> Result<Option<String>, StreamError> {
        loop {
            if let Some(line) = self.buffer.pop_line() {
                return Ok(Some(line));
            }
            let Some(response) = self.response.as_mut() else {
                return Ok(self.buffer.take_rest());
            };
            match response.chunk().await {
                Ok(Some(bytes)) => self.buffer.push(&bytes),
                Ok(None) => self.response = None,
                Err(err) => {
                    self.response = None;
                    return Err(StreamError::Read(err.to_string()));
                }
            }
        }
    }
}

impl EventSource for HttpEventSource {
    fn next_line(&mut self) -> StreamFuture<'_, Option<String>> {
        Box::pin(self.read_line())
    }

    fn close(&mut self) {
        self.response = None;
    }
}

/// How a completed watch ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WatchEnd {
    /// A message matched the completion pattern.
    Completed {
        /// The matching message.
        message: String,
    },
    /// The stream closed or failed after at least one message.
    StreamEnded,
}

/// Summary of a finished watch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WatchSummary {
    /// Number of `message` entries received.
    pub messages: usize,
    /// Time from the start of the watch to the first message.
    pub first_message_after: Duration,
    /// How the watch ended.
    pub end: WatchEnd,
}

/// Follows a topic until the reboot notice arrives.
///
/// Only the wait for the first message is bounded. Before that message, a
/// failed open or a dropped stream is retried within the same bound; after
/// it, the stream is followed without a deadline and any loss of the stream
/// ends the watch.
#[derive(Debug)]
pub struct EventStreamWatcher<'a, C> {
    connector: &'a C,
    first_event_timeout: Duration,
    retry_interval: Duration,
    completion: &'a Regex,
}

impl<'a, C: EventConnector> EventStreamWatcher<'a, C> {
    /// Creates a watcher.
    #[must_use]
    pub const fn new(
        connector: &'a C,
        first_event_timeout: Duration,
        retry_interval: Duration,
        completion: &'a Regex,
    ) -> Self {
        Self {
            connector,
            first_event_timeout,
            retry_interval,
            completion,
        }
    }

    /// Consumes `topic`, passing every message to `on_message`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::FirstEventTimeout`] when no message arrives
    /// within the first-event bound.
    pub async fn watch<F>(&self, topic: &str, mut on_message: F) -> Result<WatchSummary, StreamError>
    where
        F: FnMut(&str),
    {
        let started = Instant::now();
        let deadline = started + self.first_event_timeout;
        let mut messages = 0_usize;
        let mut first_message_after: Option<Duration> = None;
        let mut source = self.open_before(topic, deadline, started).await?;

        loop {
            let next = if first_message_after.is_some() {
                source.next_line().await
            } else {
                match timeout_at(deadline, source.next_line()).await {
                    Ok(result) => result,
                    Err(_) => {
                        source.close();
                        return Err(self.first_event_timeout(started));
                    }
                }
            };

            let ended = match next {
                Ok(Some(line)) => {
                    let Some(message) = parse_message(&line) else {
                        continue;
                    };
                    messages += 1;
                    let first = *first_message_after.get_or_insert_with(|| started.elapsed());
                    on_message(&message);
                    if self.completion.is_match(&message) {
                        source.close();
                        return Ok(WatchSummary {
                            messages,
                            first_message_after: first,
                            end: WatchEnd::Completed { message },
                        });
                    }
                    continue;
                }
                Ok(None) => None,
                Err(err) => Some(err),
            };

            source.close();
            if let Some(first) = first_message_after {
                if let Some(err) = ended {
                    warn!(error = %err, "progress stream failed");
                }
                return Ok(WatchSummary {
                    messages,
                    first_message_after: first,
                    end: WatchEnd::StreamEnded,
                });
            }
            debug!(error = ?ended, "stream ended before the first message; reopening");
            self.pause_before_retry(deadline).await;
            source = self.open_before(topic, deadline, started).await?;
        }
    }

    async fn open_before(
        &self,
        topic: &str,
        deadline: Instant,
        started: Instant,
    ) -> Result<C::Source, StreamError> {
        loop {
            if Instant::now() >= deadline {
                return Err(self.first_event_timeout(started));
            }
            match timeout_at(deadline, self.connector.open(topic)).await {
                Ok(Ok(source)) => return Ok(source),
                Ok(Err(err)) => {
                    debug!(error = %err, "progress stream unavailable; retrying");
                    self.pause_before_retry(deadline).await;
                }
                Err(_) => return Err(self.first_event_timeout(started)),
            }
        }
    }

    async fn pause_before_retry(&self, deadline: Instant) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        sleep(self.retry_interval.min(remaining)).await;
    }

    fn first_event_timeout(&self, started: Instant) -> StreamError {
        debug!(bound = ?self.first_event_timeout, "gave up waiting for first message");
        StreamError::FirstEventTimeout {
            waited_secs: started.elapsed().as_secs(),
        }
    }
}
