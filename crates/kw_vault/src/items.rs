//! Item operations with field-level encryption.
//!
//! `encrypted` fields are sealed with a per-item key right before a write
//! and opened right after a read, so the store only ever holds envelopes.
//! A field that fails to open is replaced by [`UNREADABLE_FIELD`] instead
//! of failing the whole read.

use std::collections::HashSet;

use chrono::Utc;
use kw_crypto::field::{decrypt_field, derive_field_key, encrypt_field, FIELD_CONTEXT};
use kw_crypto::SecretKey;
use kw_store::models::{Field, ItemCategory, ItemFilter, VaultItem};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::VaultError;
use crate::service::VaultService;

/// Shown in place of a field value that could not be decrypted.
pub const UNREADABLE_FIELD: &str = "[unable to decrypt]";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewItem {
    #[serde(default)]
    pub container_id: Option<String>,
    pub category: ItemCategory,
    pub title: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub favorite: bool,
}

/// Partial update. `Some(None)` clears an optional column.
#[derive(Debug, Clone, Default)]
pub struct ItemUpdate {
    pub container_id: Option<Option<String>>,
    pub category: Option<ItemCategory>,
    pub title: Option<String>,
    pub domain: Option<Option<String>>,
    pub fields: Option<Vec<Field>>,
    pub favorite: Option<bool>,
}

/// Field keys are unique within an item; CSV export has one column per key.
pub(crate) fn check_field_keys(fields: &[Field]) -> Result<(), VaultError> {
    let mut seen = HashSet::new();
    match fields.iter().find(|f| !seen.insert(f.key.as_str())) {
        Some(dup) => Err(VaultError::InvalidInput(format!("duplicate field key '{}'", dup.key))),
        None => Ok(()),
    }
}

/// Seal every `encrypted` field of `item_id` under its field key.
pub(crate) fn seal_fields(
    dek: &SecretKey,
    item_id: &str,
    fields: Vec<Field>,
) -> Result<Vec<Field>, VaultError> {
    if !fields.iter().any(|f| f.encrypted) {
        return Ok(fields);
    }
    let key = derive_field_key(dek, FIELD_CONTEXT, item_id)?;
    fields
        .into_iter()
        .map(|mut field| -> Result<Field, VaultError> {
            if field.encrypted {
                field.value = encrypt_field(&field.value, &key)?;
            }
            Ok(field)
        })
        .collect()
}

pub(crate) fn open_item(dek: &SecretKey, mut item: VaultItem) -> VaultItem {
    if !item.fields.iter().any(|f| f.encrypted) {
        return item;
    }
    let key = match derive_field_key(dek, FIELD_CONTEXT, &item.id) {
        Ok(key) => key,
        Err(e) => {
            warn!("[vault] field key derivation failed for item={}: {}", item.id, e);
            for field in item.fields.iter_mut().filter(|f| f.encrypted) {
                field.value = UNREADABLE_FIELD.to_string();
            }
            return item;
        }
    };
    for field in item.fields.iter_mut().filter(|f| f.encrypted) {
        match decrypt_field(&field.value, &key) {
            Ok(plain) => field.value = plain,
            Err(_) => {
                warn!("[vault] could not decrypt field '{}' of item={}", field.key, item.id);
                field.value = UNREADABLE_FIELD.to_string();
            }
        }
    }
    item
}

/// Lowercase host for autofill matching: no scheme, userinfo, `www.`,
/// port or path.
pub fn normalize_domain(input: &str) -> String {
    let mut host = input.trim();
    if let Some((_, rest)) = host.split_once("://") {
        host = rest;
    }
    host = host.split(['/', '?', '#']).next().unwrap_or_default();
    if let Some((_, rest)) = host.rsplit_once('@') {
        host = rest;
    }
    host = host.split(':').next().unwrap_or_default();
    let host = host.trim_end_matches('.').to_lowercase();
    match host.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => host,
    }
}

fn clean_title(title: &str) -> Result<String, VaultError> {
    match title.trim() {
        "" => Err(VaultError::InvalidInput("item title must not be empty".into())),
        trimmed => Ok(trimmed.to_string()),
    }
}

fn clean_domain(domain: Option<String>) -> Option<String> {
    domain.map(|d| d.trim().to_string()).filter(|d| !d.is_empty())
}

impl VaultService {
    pub async fn create_item(&self, input: NewItem) -> Result<VaultItem, VaultError> {
        check_field_keys(&input.fields)?;
        let handle = self.acquire().await?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let item = VaultItem {
            fields: seal_fields(&handle.dek, &id, input.fields)?,
            id,
            container_id: input.container_id,
            category: input.category,
            title: clean_title(&input.title)?,
            domain: clean_domain(input.domain),
            favorite: input.favorite,
            created_at: now,
            updated_at: now,
        };
        self.storage(handle.store.insert_item(&item).await).await?;
        info!("[vault] created item={} category={}", item.id, item.category);
        Ok(open_item(&handle.dek, item))
    }

    pub async fn update_item(
        &self,
        id: &str,
        update: ItemUpdate,
    ) -> Result<VaultItem, VaultError> {
        if let Some(fields) = &update.fields {
            check_field_keys(fields)?;
        }
        let handle = self.acquire().await?;
        let mut item = self
            .storage(handle.store.get_item(id).await)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("item {id}")))?;

        if let Some(container_id) = update.container_id {
            item.container_id = container_id;
        }
        if let Some(category) = update.category {
            item.category = category;
        }
        if let Some(title) = update.title {
            item.title = clean_title(&title)?;
        }
        if let Some(domain) = update.domain {
            item.domain = clean_domain(domain);
        }
        if let Some(fields) = update.fields {
            item.fields = seal_fields(&handle.dek, &item.id, fields)?;
        }
        if let Some(favorite) = update.favorite {
            item.favorite = favorite;
        }
        item.updated_at = Utc::now();

        if !self.storage(handle.store.update_item(&item).await).await? {
            return Err(VaultError::NotFound(format!("item {id}")));
        }
        Ok(open_item(&handle.dek, item))
    }

    pub async fn delete_item(&self, id: &str) -> Result<(), VaultError> {
        let handle = self.acquire().await?;
        if !self.storage(handle.store.delete_item(id).await).await? {
            return Err(VaultError::NotFound(format!("item {id}")));
        }
        info!("[vault] deleted item={}", id);
        Ok(())
    }

    pub async fn get_item(&self, id: &str) -> Result<VaultItem, VaultError> {
        let handle = self.acquire().await?;
        let item = self
            .storage(handle.store.get_item(id).await)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("item {id}")))?;
        Ok(open_item(&handle.dek, item))
    }

    pub async fn list_items(&self, filter: &ItemFilter) -> Result<Vec<VaultItem>, VaultError> {
        let handle = self.acquire().await?;
        let items = self.storage(handle.store.list_items(filter).await).await?;
        Ok(items.into_iter().map(|item| open_item(&handle.dek, item)).collect())
    }

    /// Case-insensitive substring search over title and domain. A blank
    /// query matches nothing.
    pub async fn search(&self, query: &str) -> Result<Vec<VaultItem>, VaultError> {
        let handle = self.acquire().await?;
        let query = query.trim();
        if query.is_empty() {
            return Ok(vec![]);
        }
        let items = self.storage(handle.store.search_items(query).await).await?;
        Ok(items.into_iter().map(|item| open_item(&handle.dek, item)).collect())
    }

    /// Fully decrypted password items for `domain`. Callers must already
    /// hold an authenticated session.
    pub async fn get_autofill_candidates(
        &self,
        domain: &str,
    ) -> Result<Vec<VaultItem>, VaultError> {
        let handle = self.acquire().await?;
        let needle = normalize_domain(domain);
        if needle.is_empty() {
            return Ok(vec![]);
        }
        let items = self.storage(handle.store.autofill_candidates(&needle).await).await?;
        Ok(items.into_iter().map(|item| open_item(&handle.dek, item)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kw_store::models::FieldType;

    fn secret_field(value: &str) -> Field {
        Field {
            key: "password".into(),
            value: value.into(),
            encrypted: true,
            field_type: FieldType::Password,
        }
    }

    #[test]
    fn normalizes_domains() {
        assert_eq!(normalize_domain("https://www.GitHub.com/login?x=1"), "github.com");
        assert_eq!(
            normalize_domain("http://user@accounts.example.org:8443/"),
            "accounts.example.org"
        );
        assert_eq!(normalize_domain("https://www.BÄCKEREI.de/"), "bäckerei.de");
        assert_eq!(normalize_domain("www.example.com"), "example.com");
        assert_eq!(normalize_domain("  github.com  "), "github.com");
        assert_eq!(normalize_domain("https://"), "");
    }

    #[test]
    fn sealed_fields_open_only_for_their_item() {
        let dek = SecretKey::generate();
        let sealed = seal_fields(&dek, "item-a", vec![secret_field("s3cr3t")]).unwrap();
        assert_ne!(sealed[0].value, "s3cr3t");

        let now = Utc::now();
        let mut item = VaultItem {
            id: "item-a".into(),
            container_id: None,
            category: ItemCategory::Password,
            title: "t".into(),
            domain: None,
            fields: sealed,
            favorite: false,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(open_item(&dek, item.clone()).fields[0].value, "s3cr3t");

        item.id = "item-b".into();
        assert_eq!(open_item(&dek, item).fields[0].value, UNREADABLE_FIELD);
    }

    #[test]
    fn duplicate_field_keys_are_rejected() {
        let fields = vec![secret_field("one"), secret_field("two")];
        let err = check_field_keys(&fields).unwrap_err();
        assert!(matches!(err, VaultError::InvalidInput(msg) if msg.contains("password")));
        assert!(check_field_keys(&fields[..1]).is_ok());
    }

    #[test]
    fn plain_fields_are_untouched() {
        let dek = SecretKey::generate();
        let fields = vec![Field {
            key: "username".into(),
            value: "alice".into(),
            encrypted: false,
            field_type: FieldType::Text,
        }];
        assert_eq!(seal_fields(&dek, "i", fields.clone()).unwrap(), fields);
    }
}
