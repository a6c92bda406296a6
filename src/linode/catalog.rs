//! GPU plan catalog lookups.
//!
//! The type list is paginated. The first page tells us how many pages exist;
//! the remaining pages are fetched concurrently and joined before use.

use futures::future::try_join_all;
use reqwest::Method;

use super::types::{InstanceType, TypePage};
use super::{LinodeBackend, LinodeError, api_error};

impl LinodeBackend {
    async fn fetch_type_page(&self, page: u32) -> Result<TypePage, LinodeError> {
        let builder = self
            .request(Method::GET, "/linode/types")
            .query(&[("page", page)]);
        let (status, body) = self.send(builder).await?;
        if !status.is_success() {
            return Err(api_error(status, &body));
        }
        serde_json::from_slice(&body).map_err(|err| LinodeError::Decode(err.to_string()))
    }

    /// Fetches every instance type offered by the provider.
    ///
    /// # Errors
    ///
    /// Returns [`LinodeError`] when any page request fails.
    pub async fn instance_types(&self) -> Result<Vec<InstanceType>, LinodeError> {
        let first = self.fetch_type_page(1).await?;
        let rest = try_join_all((2..=first.pages).map(|page| self.fetch_type_page(page))).await?;
        Ok(first
            .data
            .into_iter()
            .chain(rest.into_iter().flat_map(|page| page.data))
            .collect())
    }

    /// Fetches the GPU plans only.
    ///
    /// # Errors
    ///
    /// Returns [`LinodeError`] when any page request fails.
    pub async fn gpu_types(&self) -> Result<Vec<InstanceType>, LinodeError> {
        let all = self.instance_types().await?;
        Ok(all.into_iter().filter(InstanceType::is_gpu).collect())
    }

    /// Confirms that `instance_type` exists and is a GPU plan.
    ///
    /// # Errors
    ///
    /// Returns [`LinodeError::UnknownInstanceType`] or
    /// [`LinodeError::NotGpuType`] when the type cannot be used.
    pub async fn ensure_gpu_type(&self, instance_type: &str) -> Result<InstanceType, LinodeError> {
        let all = self.instance_types().await?;
        check_gpu_type(&all, instance_type)
    }
}

fn check_gpu_type(types: &[InstanceType], instance_type: &str) -> Result<InstanceType, LinodeError> {
    let Some((_, found)) = select_by_id(types, instance_type) else {
        return Err(LinodeError::UnknownInstanceType {
            instance_type: instance_type.to_owned(),
        });
    };
    if !found.is_gpu() {
        return Err(LinodeError::NotGpuType {
            instance_type: instance_type.to_owned(),
            class: found.class.clone(),
        });
    }
    Ok(found.clone())
}

/// Finds a catalog entry by identifier, returning its position and the record.
#[must_use]
pub fn select_by_id<'a>(types: &'a [InstanceType], id: &str) -> Option<(usize, &'a InstanceType)> {
    types.iter().enumerate().find(|(_, entry)| entry.id == id)
}
