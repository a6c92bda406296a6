//! Local persistence for deployment records and the audit log.
//!
//! Records are written once per deployment and never read back by the tool.
//! Writes go to a temporary sibling first and are renamed into place, so a
//! reader never observes a partial record. Temporary files are tracked in
//! [`TempArtifacts`] so an interrupted run can remove them.

use std::io::{self, Write};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::OpenOptions;
use cap_std::{ambient_authority, fs_utf8::Dir};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Prefix of every file this tool writes.
pub const FILE_PREFIX: &str = "gpulaunch-";

/// File name of the append-only audit log.
pub const AUDIT_LOG_NAME: &str = "gpulaunch-audit.log";

/// Persisted summary of one deployment.
#[derive(Clone, Deserialize, Eq, PartialEq, Serialize)]
pub struct DeploymentRecord {
    /// When the create call succeeded.
    pub created_at: DateTime<Utc>,
    /// Provider identifier.
    pub id: String,
    /// Instance label.
    pub label: String,
    /// Public address.
    pub address: IpAddr,
    /// Region the instance lives in.
    pub region: String,
    /// Instance type.
    pub instance_type: String,
    /// Progress stream topic.
    pub topic: String,
    /// Generated root password.
    pub root_password: String,
    /// Raw create response.
    pub response: serde_json::Value,
}

impl std::fmt::Debug for DeploymentRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentRecord")
            .field("created_at", &self.created_at)
            .field("id", &self.id)
            .field("label", &self.label)
            .field("address", &self.address)
            .field("region", &self.region)
            .field("instance_type", &self.instance_type)
            .field("topic", &self.topic)
            .field("root_password", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// Errors raised while writing local files.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RecordStoreError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a record cannot be rendered as JSON.
    #[error("failed to serialise deployment record: {0}")]
    Serialize(String),
    /// Raised when a label cannot be used in a file name.
    #[error("label '{0}' cannot be used as a file name")]
    InvalidLabel(String),
}

fn io_error(path: &Utf8Path, err: &io::Error) -> RecordStoreError {
    RecordStoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Abstraction over record writers for dependency injection.
pub trait RecordWriter {
    /// Persists `record` and returns the final path.
    ///
    /// # Errors
    ///
    /// Returns [`RecordStoreError`] when the record cannot be written.
    fn write_record(&self, record: &DeploymentRecord) -> Result<Utf8PathBuf, RecordStoreError>;
}

/// Writes `gpulaunch-{label}.json` files into a directory.
#[derive(Clone, Debug)]
pub struct RecordStore {
    dir: Utf8PathBuf,
    artifacts: TempArtifacts,
}

impl RecordStore {
    /// Creates a store rooted at `dir`, registering temporary files with
    /// `artifacts`.
    #[must_use]
    pub fn new(dir: impl Into<Utf8PathBuf>, artifacts: TempArtifacts) -> Self {
        Self {
            dir: dir.into(),
            artifacts,
        }
    }

    /// Path the record for `label` is written to.
    #[must_use]
    pub fn record_path(&self, label: &str) -> Utf8PathBuf {
        self.dir.join(record_file_name(label))
    }

    fn open_dir(&self) -> Result<Dir, RecordStoreError> {
        Dir::create_ambient_dir_all(&self.dir, ambient_authority())
            .map_err(|err| io_error(&self.dir, &err))?;
        Dir::open_ambient_dir(&self.dir, ambient_authority()).map_err(|err| io_error(&self.dir, &err))
    }
}

fn record_file_name(label: &str) -> String {
    format!("{FILE_PREFIX}{label}.json")
}

impl RecordWriter for RecordStore {
    fn write_record(&self, record: &DeploymentRecord) -> Result<Utf8PathBuf, RecordStoreError> {
        if record.label.is_empty() || record.label.contains(['/', '\\']) || record.label.starts_with('.')
        {
            return Err(RecordStoreError::InvalidLabel(record.label.clone()));
        }
        let rendered = serde_json::to_string_pretty(record)
            .map_err(|err| RecordStoreError::Serialize(err.to_string()))?;
        let dir = self.open_dir()?;

        let final_name = record_file_name(&record.label);
        let temp_name = format!(".{final_name}.{}.tmp", Uuid::new_v4().simple());
        let final_path = self.dir.join(&final_name);
        let temp_path = self.dir.join(&temp_name);

        self.artifacts.register(temp_path.clone());
        let written = dir
            .write(&temp_name, rendered)
            .and_then(|()| dir.rename(&temp_name, &dir, &final_name));
        if let Err(err) = written {
            if let Err(cleanup) = dir.remove_file(&temp_name) {
                debug!(path = %temp_path, error = %cleanup, "temporary record not removed");
            }
            self.artifacts.release(&temp_path);
            return Err(io_error(&final_path, &err));
        }
        self.artifacts.release(&temp_path);
        debug!(path = %final_path, "deployment record written");
        Ok(final_path)
    }
}

/// Registry of temporary files to remove when a run is interrupted.
#[derive(Clone, Debug, Default)]
pub struct TempArtifacts {
    paths: Arc<Mutex<Vec<Utf8PathBuf>>>,
}

impl TempArtifacts {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn paths(&self) -> std::sync::MutexGuard<'_, Vec<Utf8PathBuf>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tracks `path` until it is released.
    pub fn register(&self, path: Utf8PathBuf) {
        self.paths().push(path);
    }

    /// Stops tracking `path`.
    pub fn release(&self, path: &Utf8Path) {
        self.paths().retain(|tracked| tracked != path);
    }

    /// Paths currently tracked.
    #[must_use]
    pub fn pending(&self) -> Vec<Utf8PathBuf> {
        self.paths().clone()
    }

    /// Removes every tracked file. Failures are logged and returned, never
    /// raised; a file that is already gone counts as removed.
    pub fn cleanup(&self) -> Vec<RecordStoreError> {
        let paths = std::mem::take(&mut *self.paths());
        paths
            .into_iter()
            .filter_map(|path| match remove_path(&path) {
                Ok(()) => None,
                Err(err) => {
                    warn!(path = %path, error = %err, "failed to remove temporary file");
                    Some(err)
                }
            })
            .collect()
    }
}

fn remove_path(path: &Utf8Path) -> Result<(), RecordStoreError> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let Some(file_name) = path.file_name() else {
        return Err(RecordStoreError::Io {
            path: path.to_path_buf(),
            message: String::from("path is missing a filename"),
        });
    };
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(io_error(parent, &err)),
    };
    match dir.remove_file(file_name) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_error(path, &err)),
    }
}

/// Append-only log of fatal errors and recovery outcomes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuditLog {
    path: Utf8PathBuf,
}

impl AuditLog {
    /// Log stored as `gpulaunch-audit.log` inside `dir`.
    #[must_use]
    pub fn in_dir(dir: impl AsRef<Utf8Path>) -> Self {
        Self {
            path: dir.as_ref().join(AUDIT_LOG_NAME),
        }
    }

    /// Location of the log file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Appends one timestamped line. Line breaks in `message` are flattened
    /// so each entry stays on a single line.
    ///
    /// # Errors
    ///
    /// Returns [`RecordStoreError::Io`] when the log cannot be opened or
    /// written.
    pub fn append(&self, kind: &str, message: &str) -> Result<(), RecordStoreError> {
        let parent = self.path.parent().unwrap_or_else(|| Utf8Path::new("."));
        let file_name = self.path.file_name().unwrap_or(AUDIT_LOG_NAME);
        Dir::create_ambient_dir_all(parent, ambient_authority())
            .map_err(|err| io_error(parent, &err))?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority())
            .map_err(|err| io_error(parent, &err))?;

        let mut options = OpenOptions::new();
        options.append(true).create(true);
        let mut file = dir
            .open_with(file_name, &options)
            .map_err(|err| io_error(&self.path, &err))?;

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let flattened = message.replace(['\r', '\n'], " ");
        writeln!(file, "{timestamp} {kind}: {flattened}").map_err(|err| io_error(&self.path, &err))
    }
}
