//! Provisioning abstraction for GPU-backed virtual machines.
//!
//! A [`Provisioner`] knows how to create an instance, report its status, and
//! delete it again. The readiness pipeline only talks to this trait, which
//! keeps the phase logic testable without a real cloud account.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use thiserror::Error;

const LABEL_MIN_LEN: usize = 3;
const LABEL_MAX_LEN: usize = 64;
const PASSWORD_MIN_LEN: usize = 11;
const PASSWORD_MAX_LEN: usize = 128;

/// Parameters required to create a new instance.
#[derive(Clone, Eq, PartialEq)]
pub struct InstanceRequest {
    /// Human readable label shown in the provider console.
    pub label: String,
    /// Region slug (for example `us-ord`).
    pub region: String,
    /// Instance type (for example `g2-gpu-rtx4000a1-s`).
    pub instance_type: String,
    /// Boot image identifier (for example `linode/ubuntu22.04`).
    pub image: String,
    /// Root password set on first boot.
    pub root_password: String,
    /// Public keys authorised for the root account.
    pub authorized_keys: Vec<String>,
    /// Rendered cloud-init payload, before transport encoding.
    pub user_data: Option<String>,
}

impl std::fmt::Debug for InstanceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRequest")
            .field("label", &self.label)
            .field("region", &self.region)
            .field("instance_type", &self.instance_type)
            .field("image", &self.image)
            .field("root_password", &"<redacted>")
            .field("authorized_keys", &self.authorized_keys.len())
            .field("user_data", &self.user_data.as_ref().map(String::len))
            .finish()
    }
}

impl InstanceRequest {
    /// Starts a builder for an [`InstanceRequest`].
    #[must_use]
    pub fn builder() -> InstanceRequestBuilder {
        InstanceRequestBuilder::new()
    }

    /// Validates the request, returning a descriptive error when a field is
    /// missing or malformed.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when a required field is empty,
    /// [`BackendError::InvalidLabel`] when the label breaks provider rules,
    /// or [`BackendError::WeakPassword`] when the root password is too weak.
    pub fn validate(&self) -> Result<(), BackendError> {
        validate_label(&self.label)?;
        if self.region.is_empty() {
            return Err(BackendError::Validation("region".to_owned()));
        }
        if self.instance_type.is_empty() {
            return Err(BackendError::Validation("instance_type".to_owned()));
        }
        if self.image.is_empty() {
            return Err(BackendError::Validation("image".to_owned()));
        }
        if self.authorized_keys.iter().all(|key| key.trim().is_empty()) {
            return Err(BackendError::Validation("authorized_keys".to_owned()));
        }
        validate_root_password(&self.root_password)
    }
}

/// Checks a label against provider naming rules.
///
/// Labels must be 3 to 64 characters, start with a letter, contain only ASCII
/// alphanumerics, `-`, `_` or `.`, and never repeat a separator.
///
/// # Errors
///
/// Returns [`BackendError::InvalidLabel`] describing the first broken rule.
pub fn validate_label(label: &str) -> Result<(), BackendError> {
    let invalid = |reason: &str| BackendError::InvalidLabel {
        label: label.to_owned(),
        reason: reason.to_owned(),
    };

    let length = label.chars().count();
    if !(LABEL_MIN_LEN..=LABEL_MAX_LEN).contains(&length) {
        return Err(invalid("must be between 3 and 64 characters"));
    }
    if !label.chars().next().is_some_and(|ch| ch.is_ascii_alphabetic()) {
        return Err(invalid("must start with a letter"));
    }
    if !label
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
    {
        return Err(invalid("may only contain letters, digits, '-', '_' and '.'"));
    }
    let mut previous_separator = false;
    for ch in label.chars() {
        let separator = matches!(ch, '-' | '_' | '.');
        if separator && previous_separator {
            return Err(invalid("must not contain consecutive separators"));
        }
        previous_separator = separator;
    }
    Ok(())
}

/// Checks that a root password satisfies provider complexity rules.
///
/// # Errors
///
/// Returns [`BackendError::WeakPassword`] when the password is too short, too
/// long, or uses fewer than three character classes.
pub fn validate_root_password(password: &str) -> Result<(), BackendError> {
    let length = password.chars().count();
    if !(PASSWORD_MIN_LEN..=PASSWORD_MAX_LEN).contains(&length) {
        return Err(BackendError::WeakPassword(String::from(
            "root password must be between 11 and 128 characters",
        )));
    }

    let classes = [
        password.chars().any(|ch| ch.is_ascii_lowercase()),
        password.chars().any(|ch| ch.is_ascii_uppercase()),
        password.chars().any(|ch| ch.is_ascii_digit()),
        password
            .chars()
            .any(|ch| !ch.is_ascii_alphanumeric() && !ch.is_whitespace()),
    ];
    if classes.iter().filter(|present| **present).count() < 3 {
        return Err(BackendError::WeakPassword(String::from(
            "root password must mix at least three of: lowercase, uppercase, digits, symbols",
        )));
    }
    Ok(())
}

/// Builder for [`InstanceRequest`] that defers trimming and validation to
/// construction.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct InstanceRequestBuilder {
    label: String,
    region: String,
    instance_type: String,
    image: String,
    root_password: String,
    authorized_keys: Vec<String>,
    user_data: Option<String>,
}

impl std::fmt::Debug for InstanceRequestBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRequestBuilder")
            .field("label", &self.label)
            .field("region", &self.region)
            .field("instance_type", &self.instance_type)
            .field("image", &self.image)
            .finish_non_exhaustive()
    }
}

impl InstanceRequestBuilder {
    /// Creates an empty builder; fields must be populated before build.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the instance label.
    #[must_use]
    pub fn label(mut self, value: impl Into<String>) -> Self {
        self.label = value.into();
        self
    }

    /// Sets the region.
    #[must_use]
    pub fn region(mut self, value: impl Into<String>) -> Self {
        self.region = value.into();
        self
    }

    /// Sets the instance type.
    #[must_use]
    pub fn instance_type(mut self, value: impl Into<String>) -> Self {
        self.instance_type = value.into();
        self
    }

    /// Sets the boot image.
    #[must_use]
    pub fn image(mut self, value: impl Into<String>) -> Self {
        self.image = value.into();
        self
    }

    /// Sets the root password. The value is not trimmed.
    #[must_use]
    pub fn root_password(mut self, value: impl Into<String>) -> Self {
        self.root_password = value.into();
        self
    }

    /// Adds an authorised public key.
    #[must_use]
    pub fn authorized_key(mut self, value: impl Into<String>) -> Self {
        self.authorized_keys.push(value.into());
        self
    }

    /// Sets the cloud-init payload.
    #[must_use]
    pub fn user_data(mut self, value: Option<String>) -> Self {
        self.user_data = value;
        self
    }

    /// Builds and validates the [`InstanceRequest`], trimming string inputs.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when any field fails validation.
    pub fn build(self) -> Result<InstanceRequest, BackendError> {
        let request = InstanceRequest {
            label: self.label.trim().to_owned(),
            region: self.region.trim().to_owned(),
            instance_type: self.instance_type.trim().to_owned(),
            image: self.image.trim().to_owned(),
            root_password: self.root_password,
            authorized_keys: self
                .authorized_keys
                .into_iter()
                .map(|key| key.trim().to_owned())
                .filter(|key| !key.is_empty())
                .collect(),
            user_data: self.user_data,
        };
        request.validate()?;
        Ok(request)
    }
}

/// Identity of a provisioned instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceHandle {
    /// Provider specific identifier for the instance.
    pub id: String,
    /// Public IPv4 address assigned by the provider.
    pub address: IpAddr,
    /// Human readable label.
    pub label: String,
}

/// Result of a successful create call.
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisionedInstance {
    /// Identity used by every later phase.
    pub handle: InstanceHandle,
    /// Status reported in the creation response.
    pub status: String,
    /// Raw creation response, kept for the deployment record.
    pub response: serde_json::Value,
}

/// Errors raised while validating provisioning input.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// Raised when a request is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
    /// Raised when the label breaks provider naming rules.
    #[error("invalid label '{label}': {reason}")]
    InvalidLabel {
        /// Label that was rejected.
        label: String,
        /// Rule that was broken.
        reason: String,
    },
    /// Raised when the root password is too weak.
    #[error("{0}")]
    WeakPassword(String),
}

/// Future returned by provisioner operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Minimal interface implemented by cloud provisioning backends.
pub trait Provisioner {
    /// Provider specific error type returned by the backend.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates a new instance and returns its identity.
    fn create<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> BackendFuture<'a, ProvisionedInstance, Self::Error>;

    /// Returns the provider status string for `id` (for example `running`).
    fn status<'a>(&'a self, id: &'a str) -> BackendFuture<'a, String, Self::Error>;

    /// Deletes the instance identified by `id`.
    fn delete<'a>(&'a self, id: &'a str) -> BackendFuture<'a, (), Self::Error>;

    /// Returns `true` when `error` means the instance no longer exists.
    fn is_missing(_error: &Self::Error) -> bool {
        false
    }
}
