//! Wire types for the Linode API v4.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

#[derive(Serialize)]
pub(crate) struct CreateInstanceBody<'a> {
    pub(crate) label: &'a str,
    pub(crate) region: &'a str,
    #[serde(rename = "type")]
    pub(crate) instance_type: &'a str,
    pub(crate) image: &'a str,
    pub(crate) root_pass: &'a str,
    pub(crate) authorized_keys: &'a [String],
    pub(crate) booted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) metadata: Option<Metadata>,
}

#[derive(Serialize)]
pub(crate) struct Metadata {
    pub(crate) user_data: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct InstanceBody {
    pub(crate) id: u64,
    #[serde(default)]
    pub(crate) label: String,
    pub(crate) status: String,
    #[serde(default)]
    pub(crate) ipv4: Vec<String>,
}

impl InstanceBody {
    /// Picks the first public IPv4 address, falling back to any parseable one.
    pub(crate) fn public_address(&self) -> Option<IpAddr> {
        let parsed: Vec<IpAddr> = self
            .ipv4
            .iter()
            .filter_map(|raw| raw.parse::<IpAddr>().ok())
            .collect();
        parsed
            .iter()
            .find(|ip| match ip {
                IpAddr::V4(v4) => !v4.is_private() && !v4.is_loopback(),
                IpAddr::V6(_) => false,
            })
            .or_else(|| parsed.first())
            .copied()
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatusBody {
    pub(crate) status: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorEnvelope {
    #[serde(default)]
    pub(crate) errors: Vec<ErrorEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorEntry {
    pub(crate) reason: String,
    #[serde(default)]
    pub(crate) field: Option<String>,
}

impl ErrorEnvelope {
    /// Flattens the envelope into human readable reasons.
    pub(crate) fn reasons(&self) -> Vec<String> {
        self.errors
            .iter()
            .map(|entry| match &entry.field {
                Some(field) => format!("{field}: {}", entry.reason),
                None => entry.reason.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TypePage {
    #[serde(default)]
    pub(crate) data: Vec<InstanceType>,
    #[serde(default = "first_page")]
    pub(crate) pages: u32,
}

const fn first_page() -> u32 {
    1
}

/// Entry from the provider's instance type catalog.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct InstanceType {
    /// Type identifier used in create calls.
    pub id: String,
    /// Display label.
    #[serde(default)]
    pub label: String,
    /// Plan class (`gpu`, `standard`, `dedicated`, ...).
    #[serde(default)]
    pub class: String,
    /// Number of GPUs attached.
    #[serde(default)]
    pub gpus: u32,
    /// Memory in megabytes.
    #[serde(default)]
    pub memory: u64,
    /// Virtual CPU count.
    #[serde(default)]
    pub vcpus: u32,
}

impl InstanceType {
    /// Returns `true` for GPU plans.
    #[must_use]
    pub fn is_gpu(&self) -> bool {
        self.class == "gpu" || self.gpus > 0
    }
}
