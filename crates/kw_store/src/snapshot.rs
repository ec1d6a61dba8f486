//! Sealed whole-database snapshots.
//!
//! On-disk bytes are the `kw_crypto::aead` wire format over a JSON dump of
//! every table, with the vault id as associated data so snapshots cannot be
//! swapped between vaults.

use kw_crypto::{aead, SecretKey};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;
use zeroize::Zeroizing;

use crate::containers::SELECT_CONTAINERS;
use crate::db::{INSERT_CONTAINER, INSERT_ITEM};
use crate::error::StoreError;
use crate::items::SELECT_ITEMS;
use crate::models::{ContainerRow, ItemRow, MetaRow};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    version: u32,
    containers: Vec<ContainerRow>,
    items: Vec<ItemRow>,
    meta: Vec<MetaRow>,
}

fn aad(vault_id: &str) -> Vec<u8> {
    format!("kw-vault-db-v1:{vault_id}").into_bytes()
}

impl Snapshot {
    pub(crate) async fn dump(conn: &mut SqliteConnection) -> Result<Self, sqlx::Error> {
        let containers =
            sqlx::query_as::<_, ContainerRow>(&format!("{SELECT_CONTAINERS} ORDER BY id"))
                .fetch_all(&mut *conn)
                .await?;
        let items = sqlx::query_as::<_, ItemRow>(&format!("{SELECT_ITEMS} ORDER BY id"))
            .fetch_all(&mut *conn)
            .await?;
        let meta = sqlx::query_as::<_, MetaRow>(
            "SELECT key, value, updated_at FROM vault_meta ORDER BY key",
        )
        .fetch_all(&mut *conn)
        .await?;
        Ok(Self { version: SNAPSHOT_VERSION, containers, items, meta })
    }

    /// Load rows into a freshly migrated, empty database.
    pub(crate) async fn restore(self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        sqlx::query("BEGIN").execute(&mut *conn).await?;
        let loaded = self.insert_all(conn).await;
        match loaded {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn insert_all(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        // Parents before children.
        for c in &self.containers {
            sqlx::query(INSERT_CONTAINER)
                .bind(&c.id)
                .bind(&c.container_type)
                .bind(&c.name)
                .bind(c.favorite)
                .bind(c.created_at)
                .bind(c.updated_at)
                .execute(&mut *conn)
                .await?;
        }
        for i in &self.items {
            sqlx::query(INSERT_ITEM)
                .bind(&i.id)
                .bind(&i.container_id)
                .bind(&i.category)
                .bind(&i.title)
                .bind(&i.domain)
                .bind(&i.fields)
                .bind(i.favorite)
                .bind(i.created_at)
                .bind(i.updated_at)
                .execute(&mut *conn)
                .await?;
        }
        for m in &self.meta {
            sqlx::query("INSERT INTO vault_meta (key, value, updated_at) VALUES (?, ?, ?)")
                .bind(&m.key)
                .bind(&m.value)
                .bind(m.updated_at)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    pub(crate) fn seal(&self, dek: &SecretKey, vault_id: &str) -> Result<Vec<u8>, StoreError> {
        let json = Zeroizing::new(serde_json::to_vec(self)?);
        Ok(aead::encrypt(dek, &json, &aad(vault_id))?)
    }

    /// Every failure, tag mismatch or malformed JSON, is `IncorrectPassword`.
    pub(crate) fn unseal(
        bytes: &[u8],
        dek: &SecretKey,
        vault_id: &str,
    ) -> Result<Self, StoreError> {
        let json = aead::decrypt(dek, bytes, &aad(vault_id))
            .map_err(|_| StoreError::IncorrectPassword)?;
        let snapshot: Self =
            serde_json::from_slice(&json).map_err(|_| StoreError::IncorrectPassword)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::Format(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_is_bound_to_vault_id() {
        let dek = SecretKey::generate();
        let empty = Snapshot { version: SNAPSHOT_VERSION, ..Default::default() };
        let sealed = empty.seal(&dek, "a").unwrap();
        assert!(Snapshot::unseal(&sealed, &dek, "a").is_ok());
        assert!(matches!(
            Snapshot::unseal(&sealed, &dek, "b"),
            Err(StoreError::IncorrectPassword)
        ));
        assert!(matches!(
            Snapshot::unseal(&sealed, &SecretKey::generate(), "a"),
            Err(StoreError::IncorrectPassword)
        ));
    }
}
