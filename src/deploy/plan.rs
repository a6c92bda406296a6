//! Turns configuration into a concrete create request.

use rand::seq::SliceRandom;
use thiserror::Error;
use uuid::Uuid;

use crate::backend::{BackendError, InstanceRequest};
use crate::cloud_init::{self, CloudInitError, TemplateVars};
use crate::config::DeployConfig;
use crate::readiness::ServiceExpectations;

/// Prefix of generated labels and topics.
pub const NAME_PREFIX: &str = "gpulaunch-";

/// Length of generated root passwords.
pub const GENERATED_PASSWORD_LEN: usize = 32;

const LOWER: &[u8] = b"abcdefghijkmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
const DIGITS: &[u8] = b"23456789";
const SYMBOLS: &[u8] = b"-_.+=@%";

/// Errors raised while preparing a deployment.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum PlanError {
    /// The SSH public key could not be read.
    #[error("failed to load SSH public key: {0}")]
    PublicKey(#[source] CloudInitError),
    /// The SSH public key file is empty.
    #[error("SSH public key file {0} is empty")]
    EmptyPublicKey(String),
    /// The user-data template could not be loaded or rendered.
    #[error("failed to prepare cloud-init user data: {0}")]
    UserData(#[source] CloudInitError),
    /// The assembled request is invalid.
    #[error("invalid instance request: {0}")]
    Request(#[from] BackendError),
}

/// Everything needed to create and follow one deployment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeployPlan {
    /// Validated create request, including the generated password.
    pub request: InstanceRequest,
    /// Progress topic the instance publishes to.
    pub topic: String,
    /// What the application checks expect on the instance.
    pub expectations: ServiceExpectations,
}

impl DeployPlan {
    /// Reads the public key and template named by `config` and assembles a
    /// plan.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError`] when a file cannot be read or the request does
    /// not validate.
    pub fn prepare(config: &DeployConfig) -> Result<Self, PlanError> {
        let public_key =
            cloud_init::read_file(&config.ssh_public_key_file).map_err(PlanError::PublicKey)?;
        if public_key.trim().is_empty() {
            return Err(PlanError::EmptyPublicKey(config.ssh_public_key_file.clone()));
        }
        let template = cloud_init::load_template(config.user_data_file.as_deref())
            .map_err(PlanError::UserData)?;
        Self::from_parts(config, &public_key, &template)
    }

    /// Assembles a plan from already loaded inputs. A label is generated when
    /// none is configured; the topic and root password are always fresh.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError`] when rendering fails or the request does not
    /// validate.
    pub fn from_parts(
        config: &DeployConfig,
        public_key: &str,
        template: &str,
    ) -> Result<Self, PlanError> {
        let label = config
            .label
            .as_deref()
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .map_or_else(generate_label, str::to_owned);
        let topic = generate_topic();
        let expectations = ServiceExpectations {
            primary_service: config.primary_service.clone(),
            secondary_service: config.secondary_service.clone(),
            health_port: config.health_port,
            catalog_port: config.catalog_port,
            workload_id: config.workload_id.clone(),
        };
        let vars = TemplateVars {
            topic: &topic,
            events_url: &config.events_url,
            workload_id: &expectations.workload_id,
            health_port: expectations.health_port,
            catalog_port: expectations.catalog_port,
            primary_service: &expectations.primary_service,
            secondary_service: &expectations.secondary_service,
        };
        let user_data = cloud_init::render(template, &vars).map_err(PlanError::UserData)?;

        let request = InstanceRequest::builder()
            .label(label)
            .region(config.region.as_str())
            .instance_type(config.instance_type.as_str())
            .image(config.image.as_str())
            .root_password(generate_root_password())
            .authorized_key(public_key)
            .user_data(Some(user_data))
            .build()?;
        Ok(Self {
            request,
            topic,
            expectations,
        })
    }
}

/// Returns `gpulaunch-` followed by eight random hex digits.
#[must_use]
pub fn generate_label() -> String {
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("{NAME_PREFIX}{suffix}")
}

/// Returns an unguessable topic name.
#[must_use]
pub fn generate_topic() -> String {
    format!("{NAME_PREFIX}{}", Uuid::new_v4().simple())
}

/// Returns a random password containing every character class.
#[must_use]
pub fn generate_root_password() -> String {
    let mut rng = rand::thread_rng();
    let classes = [LOWER, UPPER, DIGITS, SYMBOLS];
    let alphabet = classes.concat();

    let mut bytes: Vec<u8> = classes
        .iter()
        .filter_map(|class| class.choose(&mut rng).copied())
        .collect();
    let remaining = GENERATED_PASSWORD_LEN.saturating_sub(bytes.len());
    bytes.extend((0..remaining).filter_map(|_| alphabet.choose(&mut rng).copied()));
    bytes.shuffle(&mut rng);
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;
    use crate::backend::{validate_label, validate_root_password};

    #[fixture]
    fn config() -> DeployConfig {
        DeployConfig {
            api_token: None,
            api_url: String::from("https://api.example/v4"),
            events_url: String::from("https://ntfy.example"),
            region: String::from("us-ord"),
            instance_type: String::from("g2-gpu-rtx4000a1-s"),
            image: String::from("linode/ubuntu22.04"),
            label: None,
            ssh_user: String::from("root"),
            ssh_public_key_file: String::from("~/.ssh/id_ed25519.pub"),
            ssh_identity_file: None,
            user_data_file: None,
            workload_id: String::from("llama3.1:8b"),
            primary_service: String::from("ollama"),
            secondary_service: String::from("open-webui"),
            health_port: 8080,
            catalog_port: 11434,
            record_dir: String::from("."),
        }
    }

    #[test]
    fn generated_labels_are_valid() {
        let label = generate_label();
        assert!(label.starts_with(NAME_PREFIX));
        assert_eq!(label.len(), NAME_PREFIX.len() + 8);
        validate_label(&label).expect("generated label validates");
    }

    #[test]
    fn generated_passwords_are_strong_and_distinct() {
        let first = generate_root_password();
        let second = generate_root_password();
        assert_eq!(first.len(), GENERATED_PASSWORD_LEN);
        assert_ne!(first, second);
        validate_root_password(&first).expect("generated password validates");
    }

    #[rstest]
    fn plan_renders_topic_into_user_data(config: DeployConfig) {
        let plan = DeployPlan::from_parts(&config, "ssh-ed25519 AAAA test", "notify {{TOPIC}}")
            .expect("plan");

        assert_eq!(
            plan.request.user_data.as_deref(),
            Some(format!("notify {}", plan.topic).as_str())
        );
        assert_eq!(
            plan.request.authorized_keys,
            vec![String::from("ssh-ed25519 AAAA test")]
        );
        assert!(plan.request.label.starts_with(NAME_PREFIX));
        assert_eq!(plan.expectations.workload_id, "llama3.1:8b");
    }

    #[rstest]
    fn configured_label_is_used(config: DeployConfig) {
        let plan = DeployPlan::from_parts(
            &DeployConfig {
                label: Some(String::from(" team-gpu ")),
                ..config
            },
            "ssh-ed25519 AAAA test",
            "#cloud-config",
        )
        .expect("plan");
        assert_eq!(plan.request.label, "team-gpu");
    }

    #[rstest]
    fn invalid_configured_label_is_rejected(config: DeployConfig) {
        let err = DeployPlan::from_parts(
            &DeployConfig {
                label: Some(String::from("9starts-with-digit")),
                ..config
            },
            "ssh-ed25519 AAAA test",
            "#cloud-config",
        )
        .expect_err("label must start with a letter");
        assert!(matches!(err, PlanError::Request(BackendError::InvalidLabel { .. })));
    }

    #[rstest]
    fn each_plan_gets_a_fresh_topic(config: DeployConfig) {
        let first = DeployPlan::from_parts(&config, "key", "#cloud-config").expect("plan");
        let second = DeployPlan::from_parts(&config, "key", "#cloud-config").expect("plan");
        assert_ne!(first.topic, second.topic);
        assert_ne!(first.request.root_password, second.request.root_password);
    }

    #[rstest]
    fn missing_public_key_file_is_reported(config: DeployConfig) {
        let err = DeployPlan::prepare(&DeployConfig {
            ssh_public_key_file: String::from("/nonexistent/gpulaunch/key.pub"),
            ..config
        })
        .expect_err("key file is missing");
        assert!(matches!(err, PlanError::PublicKey(_)), "{err}");
    }
}
