//! Container queries.

use crate::db::{Mutation, VaultStore};
use crate::error::StoreError;
use crate::models::{Container, ContainerRow, ContainerType};

pub(crate) const SELECT_CONTAINERS: &str =
    "SELECT id, container_type, name, favorite, created_at, updated_at FROM containers";

impl VaultStore {
    pub async fn insert_container(&self, container: &Container) -> Result<(), StoreError> {
        self.apply(vec![Mutation::InsertContainer(container.clone())]).await?;
        Ok(())
    }

    /// Returns false when no container has that id.
    pub async fn update_container(&self, container: &Container) -> Result<bool, StoreError> {
        let counts = self.apply(vec![Mutation::UpdateContainer(container.clone())]).await?;
        Ok(counts.first().copied().unwrap_or(0) > 0)
    }

    /// Deletes the container and, through the foreign key, its items.
    pub async fn delete_container(&self, id: &str) -> Result<bool, StoreError> {
        let counts = self.apply(vec![Mutation::DeleteContainer(id.to_string())]).await?;
        Ok(counts.first().copied().unwrap_or(0) > 0)
    }

    pub async fn get_container(&self, id: &str) -> Result<Option<Container>, StoreError> {
        let mut conn = self.connection().await?;
        let row = sqlx::query_as::<_, ContainerRow>(&format!("{SELECT_CONTAINERS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| self.db_error(e))?;
        row.map(Container::try_from).transpose()
    }

    pub async fn list_containers(
        &self,
        kind: Option<ContainerType>,
    ) -> Result<Vec<Container>, StoreError> {
        let mut conn = self.connection().await?;
        let rows = sqlx::query_as::<_, ContainerRow>(&format!(
            "{SELECT_CONTAINERS} WHERE (? IS NULL OR container_type = ?) \
             ORDER BY favorite DESC, name COLLATE NOCASE, id"
        ))
        .bind(kind.map(|k| k.as_str()))
        .bind(kind.map(|k| k.as_str()))
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| self.db_error(e))?;
        rows.into_iter().map(Container::try_from).collect()
    }

    /// Oldest container with exactly this name (and type, when given).
    pub async fn find_container_by_name(
        &self,
        name: &str,
        kind: Option<ContainerType>,
    ) -> Result<Option<Container>, StoreError> {
        let mut conn = self.connection().await?;
        let row = sqlx::query_as::<_, ContainerRow>(&format!(
            "{SELECT_CONTAINERS} WHERE name = ? AND (? IS NULL OR container_type = ?) \
             ORDER BY created_at, id LIMIT 1"
        ))
        .bind(name)
        .bind(kind.map(|k| k.as_str()))
        .bind(kind.map(|k| k.as_str()))
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| self.db_error(e))?;
        row.map(Container::try_from).transpose()
    }
}
