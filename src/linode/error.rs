//! Error types for the Linode backend.

use crate::backend::BackendError;
use crate::config::ConfigError;
use thiserror::Error;

/// Errors raised by the Linode backend.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LinodeError {
    /// Raised when the high-level configuration is incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when a request is missing a required field.
    #[error("invalid instance request: {0}")]
    Validation(String),
    /// Raised when the API rejects a call with an error envelope.
    #[error("provider rejected request (HTTP {status}): {}", reasons.join("; "))]
    Api {
        /// HTTP status code of the response.
        status: u16,
        /// Reasons listed in the `errors` envelope.
        reasons: Vec<String>,
    },
    /// Raised when the addressed instance does not exist.
    #[error("instance {id} not found")]
    NotFound {
        /// Provider instance identifier.
        id: String,
    },
    /// Raised when the request never produced a response.
    #[error("transport error: {0}")]
    Transport(String),
    /// Raised when a response body cannot be decoded.
    #[error("unexpected response body: {0}")]
    Decode(String),
    /// Raised when a created instance exposes no usable IPv4 address.
    #[error("instance {id} has no public IPv4 address")]
    MissingAddress {
        /// Provider instance identifier.
        id: String,
    },
    /// Raised when the configured instance type is not in the catalog.
    #[error("instance type '{instance_type}' is not offered by the provider")]
    UnknownInstanceType {
        /// Requested type identifier.
        instance_type: String,
    },
    /// Raised when the configured instance type is not a GPU plan.
    #[error("instance type '{instance_type}' is a {class} plan, not a GPU plan")]
    NotGpuType {
        /// Requested type identifier.
        instance_type: String,
        /// Class reported by the catalog.
        class: String,
    },
}

impl From<reqwest::Error> for LinodeError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

impl From<BackendError> for LinodeError {
    fn from(value: BackendError) -> Self {
        Self::Validation(value.to_string())
    }
}

impl From<ConfigError> for LinodeError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
