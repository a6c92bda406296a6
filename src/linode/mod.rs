//! Linode backend implementation of the provisioning lifecycle.

mod catalog;
mod error;
mod types;

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use tracing::debug;

use crate::backend::{BackendFuture, InstanceHandle, InstanceRequest, ProvisionedInstance, Provisioner};
use crate::config::ApiToken;
use types::{CreateInstanceBody, ErrorEnvelope, InstanceBody, Metadata, StatusBody};

pub use catalog::select_by_id;
pub use error::LinodeError;
pub use types::InstanceType;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Backend that provisions instances through the Linode API v4.
#[derive(Clone)]
pub struct LinodeBackend {
    client: Client,
    base_url: String,
    token: ApiToken,
}

impl std::fmt::Debug for LinodeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinodeBackend")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl LinodeBackend {
    /// Constructs a backend talking to `base_url` with `token`.
    ///
    /// # Errors
    ///
    /// Returns [`LinodeError::Config`] when the base URL is blank or the HTTP
    /// client cannot be built.
    pub fn new(base_url: &str, token: ApiToken) -> Result<Self, LinodeError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(LinodeError::Config(String::from("API base URL must not be empty")));
        }
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|err| LinodeError::Config(err.to_string()))?;
        Ok(Self {
            client,
            base_url: trimmed.to_owned(),
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(self.token.expose())
    }

    pub(in crate::linode) async fn send(
        &self,
        builder: RequestBuilder,
    ) -> Result<(StatusCode, Vec<u8>), LinodeError> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        Ok((status, body.to_vec()))
    }

    async fn create_instance(
        &self,
        request: &InstanceRequest,
    ) -> Result<ProvisionedInstance, LinodeError> {
        request.validate()?;
        let payload = CreateInstanceBody {
            label: &request.label,
            region: &request.region,
            instance_type: &request.instance_type,
            image: &request.image,
            root_pass: &request.root_password,
            authorized_keys: &request.authorized_keys,
            booted: true,
            metadata: request.user_data.as_ref().map(|data| Metadata {
                user_data: BASE64.encode(data.as_bytes()),
            }),
        };

        let (status, body) = self
            .send(self.request(Method::POST, "/linode/instances").json(&payload))
            .await?;
        if !status.is_success() {
            return Err(api_error(status, &body));
        }

        let response: serde_json::Value =
            serde_json::from_slice(&body).map_err(|err| LinodeError::Decode(err.to_string()))?;
        let instance: InstanceBody = serde_json::from_value(response.clone())
            .map_err(|err| LinodeError::Decode(err.to_string()))?;
        let id = instance.id.to_string();
        let address = instance
            .public_address()
            .ok_or_else(|| LinodeError::MissingAddress { id: id.clone() })?;
        debug!(instance_id = %id, %address, status = %instance.status, "instance created");

        let label = if instance.label.is_empty() {
            request.label.clone()
        } else {
            instance.label
        };
        Ok(ProvisionedInstance {
            handle: InstanceHandle { id, address, label },
            status: instance.status,
            response,
        })
    }

    async fn fetch_status(&self, id: &str) -> Result<String, LinodeError> {
        let (status, body) = self
            .send(self.request(Method::GET, &format!("/linode/instances/{id}")))
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(LinodeError::NotFound { id: id.to_owned() });
        }
        if !status.is_success() {
            return Err(api_error(status, &body));
        }
        let parsed: StatusBody =
            serde_json::from_slice(&body).map_err(|err| LinodeError::Decode(err.to_string()))?;
        Ok(parsed.status)
    }

    async fn delete_instance(&self, id: &str) -> Result<(), LinodeError> {
        let (status, body) = self
            .send(self.request(Method::DELETE, &format!("/linode/instances/{id}")))
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(LinodeError::NotFound { id: id.to_owned() });
        }
        if !status.is_success() {
            return Err(api_error(status, &body));
        }
        Ok(())
    }
}

impl Provisioner for LinodeBackend {
    type Error = LinodeError;

    fn create<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> BackendFuture<'a, ProvisionedInstance, Self::Error> {
        Box::pin(async move { self.create_instance(request).await })
    }

    fn status<'a>(&'a self, id: &'a str) -> BackendFuture<'a, String, Self::Error> {
        Box::pin(async move { self.fetch_status(id).await })
    }

    fn delete<'a>(&'a self, id: &'a str) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move { self.delete_instance(id).await })
    }

    fn is_missing(error: &Self::Error) -> bool {
        matches!(error, LinodeError::NotFound { .. })
    }
}

/// Converts a non-success response into a structured error, reading the
/// `{errors: [{reason}]}` envelope when present.
pub(crate) fn api_error(status: StatusCode, body: &[u8]) -> LinodeError {
    let envelope: ErrorEnvelope = serde_json::from_slice(body).unwrap_or_default();
    let mut reasons = envelope.reasons();
    if reasons.is_empty() {
        let text = String::from_utf8_lossy(body).trim().to_owned();
        reasons.push(if text.is_empty() {
            status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_owned()
        } else {
            text
        });
    }
    LinodeError::Api {
        status: status.as_u16(),
        reasons,
    }
}
