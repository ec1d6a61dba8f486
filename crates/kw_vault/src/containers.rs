use chrono::Utc;
use kw_store::models::{Container, ContainerType};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::VaultError;
use crate::service::VaultService;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContainer {
    #[serde(rename = "type")]
    pub container_type: ContainerType,
    pub name: String,
    #[serde(default)]
    pub favorite: bool,
}

/// Partial update; `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerUpdate {
    #[serde(rename = "type", default)]
    pub container_type: Option<ContainerType>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub favorite: Option<bool>,
}

pub(crate) fn clean_name(name: &str) -> Result<String, VaultError> {
    match name.trim() {
        "" => Err(VaultError::InvalidInput("container name must not be empty".into())),
        trimmed => Ok(trimmed.to_string()),
    }
}

impl VaultService {
    pub async fn create_container(&self, input: NewContainer) -> Result<Container, VaultError> {
        let handle = self.acquire().await?;
        let now = Utc::now();
        let container = Container {
            id: Uuid::new_v4().to_string(),
            container_type: input.container_type,
            name: clean_name(&input.name)?,
            favorite: input.favorite,
            created_at: now,
            updated_at: now,
        };
        self.storage(handle.store.insert_container(&container).await).await?;
        info!("[vault] created container={}", container.id);
        Ok(container)
    }

    pub async fn get_container(&self, id: &str) -> Result<Container, VaultError> {
        let handle = self.acquire().await?;
        self.storage(handle.store.get_container(id).await)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("container {id}")))
    }

    pub async fn list_containers(
        &self,
        kind: Option<ContainerType>,
    ) -> Result<Vec<Container>, VaultError> {
        let handle = self.acquire().await?;
        self.storage(handle.store.list_containers(kind).await).await
    }

    pub async fn update_container(
        &self,
        id: &str,
        update: ContainerUpdate,
    ) -> Result<Container, VaultError> {
        let handle = self.acquire().await?;
        let mut container = self
            .storage(handle.store.get_container(id).await)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("container {id}")))?;

        if let Some(kind) = update.container_type {
            container.container_type = kind;
        }
        if let Some(name) = update.name {
            container.name = clean_name(&name)?;
        }
        if let Some(favorite) = update.favorite {
            container.favorite = favorite;
        }
        container.updated_at = Utc::now();

        if !self.storage(handle.store.update_container(&container).await).await? {
            return Err(VaultError::NotFound(format!("container {id}")));
        }
        Ok(container)
    }

    /// Deletes the container and, by cascade, every item in it.
    pub async fn delete_container(&self, id: &str) -> Result<(), VaultError> {
        let handle = self.acquire().await?;
        if !self.storage(handle.store.delete_container(id).await).await? {
            return Err(VaultError::NotFound(format!("container {id}")));
        }
        info!("[vault] deleted container={}", id);
        Ok(())
    }
}
