//! Configuration loading via `ortho-config`.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Environment variable that supplies the API token and bypasses any other
/// credential source.
pub const TOKEN_ENV_VAR: &str = "GPULAUNCH_API_TOKEN";

/// Deployment settings derived from environment variables and configuration
/// files.
#[derive(Clone, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "GPULAUNCH",
    discovery(
        app_name = "gpulaunch",
        env_var = "GPULAUNCH_CONFIG_PATH",
        config_file_name = "gpulaunch.toml",
        dotfile_name = ".gpulaunch.toml",
        project_file_name = "gpulaunch.toml"
    )
)]
pub struct DeployConfig {
    /// Personal access token for the provisioning API.
    pub api_token: Option<String>,
    /// Base URL of the provisioning API.
    #[ortho_config(default = "https://api.linode.com/v4".to_owned())]
    pub api_url: String,
    /// Base URL of the push notification service.
    #[ortho_config(default = "https://ntfy.sh".to_owned())]
    pub events_url: String,
    /// Region in which to create the instance.
    #[ortho_config(default = "us-ord".to_owned())]
    pub region: String,
    /// GPU instance type.
    #[ortho_config(default = "g2-gpu-rtx4000a1-s".to_owned())]
    pub instance_type: String,
    /// Boot image.
    #[ortho_config(default = "linode/ubuntu22.04".to_owned())]
    pub image: String,
    /// Optional label; a random one is generated when absent.
    pub label: Option<String>,
    /// Remote user for SSH checks.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Public key installed on the instance. Supports `~/` expansion.
    #[ortho_config(default = "~/.ssh/id_ed25519.pub".to_owned())]
    pub ssh_public_key_file: String,
    /// Private key used for SSH checks. Supports `~/` expansion.
    pub ssh_identity_file: Option<String>,
    /// Optional cloud-init template overriding the built-in one.
    pub user_data_file: Option<String>,
    /// Identifier of the workload the catalog endpoint must list.
    #[ortho_config(default = "llama3.1:8b".to_owned())]
    pub workload_id: String,
    /// Container name of the model server.
    #[ortho_config(default = "ollama".to_owned())]
    pub primary_service: String,
    /// Container name of the web front end.
    #[ortho_config(default = "open-webui".to_owned())]
    pub secondary_service: String,
    /// Port of the liveness endpoint on the instance.
    #[ortho_config(default = 8080)]
    pub health_port: u16,
    /// Port of the catalog endpoint on the instance.
    #[ortho_config(default = 11434)]
    pub catalog_port: u16,
    /// Directory receiving the deployment record and audit log.
    #[ortho_config(default = ".".to_owned())]
    pub record_dir: String,
}

impl std::fmt::Debug for DeployConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployConfig")
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("api_url", &self.api_url)
            .field("events_url", &self.events_url)
            .field("region", &self.region)
            .field("instance_type", &self.instance_type)
            .field("image", &self.image)
            .field("label", &self.label)
            .field("workload_id", &self.workload_id)
            .field("record_dir", &self.record_dir)
            .finish_non_exhaustive()
    }
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

/// Read-only API credential. Never serialised or logged.
#[derive(Clone, Eq, PartialEq)]
pub struct ApiToken(String);

impl ApiToken {
    /// Wraps a token, rejecting blank values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingToken`] when the value is blank.
    pub fn new(value: impl Into<String>) -> Result<Self, ConfigError> {
        let raw = value.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::MissingToken);
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Exposes the token for building an authorisation header.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiToken(<redacted>)")
    }
}

impl DeployConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to gpulaunch.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("gpulaunch")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Resolves the API credential.
    ///
    /// The `GPULAUNCH_API_TOKEN` environment variable wins over every other
    /// source; otherwise the merged configuration value is used.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingToken`] when no usable token exists.
    pub fn token(&self) -> Result<ApiToken, ConfigError> {
        if let Ok(value) = std::env::var(TOKEN_ENV_VAR)
            && !value.trim().is_empty()
        {
            return ApiToken::new(value);
        }
        self.api_token
            .as_deref()
            .map_or(Err(ConfigError::MissingToken), ApiToken::new)
    }

    /// Performs semantic validation on required fields. Error messages include
    /// guidance on how to provide missing values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty,
    /// or [`ConfigError::InvalidPort`] when a port is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (
                self.api_url.as_str(),
                FieldMetadata::new("API base URL", "GPULAUNCH_API_URL", "api_url"),
            ),
            (
                self.events_url.as_str(),
                FieldMetadata::new("event stream URL", "GPULAUNCH_EVENTS_URL", "events_url"),
            ),
            (
                self.region.as_str(),
                FieldMetadata::new("region", "GPULAUNCH_REGION", "region"),
            ),
            (
                self.instance_type.as_str(),
                FieldMetadata::new("instance type", "GPULAUNCH_INSTANCE_TYPE", "instance_type"),
            ),
            (
                self.image.as_str(),
                FieldMetadata::new("boot image", "GPULAUNCH_IMAGE", "image"),
            ),
            (
                self.ssh_user.as_str(),
                FieldMetadata::new("SSH user", "GPULAUNCH_SSH_USER", "ssh_user"),
            ),
            (
                self.ssh_public_key_file.as_str(),
                FieldMetadata::new(
                    "SSH public key file",
                    "GPULAUNCH_SSH_PUBLIC_KEY_FILE",
                    "ssh_public_key_file",
                ),
            ),
            (
                self.workload_id.as_str(),
                FieldMetadata::new("workload identifier", "GPULAUNCH_WORKLOAD_ID", "workload_id"),
            ),
            (
                self.primary_service.as_str(),
                FieldMetadata::new(
                    "primary service name",
                    "GPULAUNCH_PRIMARY_SERVICE",
                    "primary_service",
                ),
            ),
            (
                self.secondary_service.as_str(),
                FieldMetadata::new(
                    "secondary service name",
                    "GPULAUNCH_SECONDARY_SERVICE",
                    "secondary_service",
                ),
            ),
            (
                self.record_dir.as_str(),
                FieldMetadata::new("record directory", "GPULAUNCH_RECORD_DIR", "record_dir"),
            ),
        ];
        for (value, metadata) in &required {
            Self::require_field(value, metadata)?;
        }

        if self.health_port == 0 {
            return Err(ConfigError::InvalidPort(String::from("health_port")));
        }
        if self.catalog_port == 0 {
            return Err(ConfigError::InvalidPort(String::from("catalog_port")));
        }
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates no usable API credential was found.
    #[error("no API token available: set {TOKEN_ENV_VAR} or add api_token to gpulaunch.toml")]
    MissingToken,
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a port value cannot be used.
    #[error("{0} must be a non-zero port")]
    InvalidPort(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
