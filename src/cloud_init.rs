//! Cloud-init user-data templating.
//!
//! The instance's first-boot script is a template. It is either the built-in
//! one or a file named by configuration, and `{{NAME}}` placeholders are
//! replaced with deployment values before the payload is attached to the
//! create request.

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

use crate::remote::expand_tilde;

/// Built-in first-boot script: installs the GPU driver and container
/// runtime, starts both service containers, reports progress to the event
/// topic and reboots.
pub const DEFAULT_TEMPLATE: &str = include_str!("../assets/cloud-init.yaml");

/// Errors raised while loading or rendering user-data.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum CloudInitError {
    /// Raised when a file path is empty or only whitespace.
    #[error("cloud-init user-data file path must not be empty")]
    FilePathEmpty,
    /// Raised when a file resolves to empty or only whitespace.
    #[error("cloud-init user-data file must not be empty")]
    FileEmpty,
    /// Raised when reading a file fails.
    #[error("failed to read `{path}`: {message}")]
    FileRead {
        /// Expanded path that failed to read.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when rendering produced nothing.
    #[error("rendered cloud-init user-data is empty")]
    RenderedEmpty,
}

/// Values substituted into the template.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TemplateVars<'a> {
    /// Event stream topic.
    pub topic: &'a str,
    /// Base URL of the event stream service.
    pub events_url: &'a str,
    /// Model the catalog must list.
    pub workload_id: &'a str,
    /// Host port of the liveness endpoint.
    pub health_port: u16,
    /// Host port of the catalog endpoint.
    pub catalog_port: u16,
    /// Container name of the model server.
    pub primary_service: &'a str,
    /// Container name of the web front end.
    pub secondary_service: &'a str,
}

impl TemplateVars<'_> {
    fn substitutions(&self) -> [(&'static str, String); 7] {
        [
            ("{{TOPIC}}", self.topic.to_owned()),
            (
                "{{EVENTS_URL}}",
                self.events_url.trim_end_matches('/').to_owned(),
            ),
            ("{{WORKLOAD_ID}}", self.workload_id.to_owned()),
            ("{{HEALTH_PORT}}", self.health_port.to_string()),
            ("{{CATALOG_PORT}}", self.catalog_port.to_string()),
            ("{{PRIMARY_SERVICE}}", self.primary_service.to_owned()),
            ("{{SECONDARY_SERVICE}}", self.secondary_service.to_owned()),
        ]
    }
}

/// Returns the template text: the file at `file` when given, otherwise the
/// built-in template.
///
/// # Errors
///
/// Returns [`CloudInitError`] when the path is blank, unreadable, or names an
/// empty file.
pub fn load_template(file: Option<&str>) -> Result<String, CloudInitError> {
    let Some(path) = file else {
        return Ok(DEFAULT_TEMPLATE.to_owned());
    };
    if path.trim().is_empty() {
        return Err(CloudInitError::FilePathEmpty);
    }
    let content = read_file(path)?;
    if content.trim().is_empty() {
        return Err(CloudInitError::FileEmpty);
    }
    Ok(content)
}

/// Replaces every known placeholder in `template`. Unknown placeholders are
/// left untouched.
///
/// # Errors
///
/// Returns [`CloudInitError::RenderedEmpty`] when the result is blank.
pub fn render(template: &str, vars: &TemplateVars<'_>) -> Result<String, CloudInitError> {
    let rendered = vars
        .substitutions()
        .iter()
        .fold(template.to_owned(), |text, (placeholder, value)| {
            text.replace(placeholder, value)
        });
    if rendered.trim().is_empty() {
        return Err(CloudInitError::RenderedEmpty);
    }
    Ok(rendered)
}

/// Reads a UTF-8 text file, expanding a leading `~/`.
///
/// # Errors
///
/// Returns [`CloudInitError::FileRead`] when the file cannot be read.
pub fn read_file(path: &str) -> Result<String, CloudInitError> {
    let expanded = expand_tilde(path.trim());
    read_to_string_ambient(&expanded).map_err(|message| CloudInitError::FileRead {
        path: expanded.clone(),
        message,
    })
}

fn read_to_string_ambient(path: &str) -> Result<String, String> {
    let path_buf = Utf8Path::new(path);

    let (dir_path, file_path) = if path_buf.is_absolute() {
        let parent = path_buf
            .parent()
            .ok_or_else(|| format!("path has no parent directory: {path_buf}"))?;
        let file_name = path_buf
            .file_name()
            .ok_or_else(|| format!("path has no file name: {path_buf}"))?;
        (parent, Utf8Path::new(file_name))
    } else {
        (Utf8Path::new("."), path_buf)
    };

    let dir =
        Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read_to_string(file_path).map_err(|err| err.to_string())
}
