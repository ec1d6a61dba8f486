//! Vault item queries.
//!
//! Items arrive and leave with encrypted fields still sealed; the store
//! never sees plaintext for `encrypted` fields.

use sqlx::{QueryBuilder, Sqlite};

use crate::db::{Mutation, VaultStore};
use crate::error::StoreError;
use crate::models::{ItemFilter, ItemRow, VaultItem};

pub(crate) const SELECT_ITEMS: &str = "SELECT id, container_id, category, title, domain, fields, \
     favorite, created_at, updated_at FROM vault_items";

impl VaultStore {
    pub async fn insert_item(&self, item: &VaultItem) -> Result<(), StoreError> {
        self.apply(vec![Mutation::InsertItem(item.clone())]).await?;
        Ok(())
    }

    pub async fn update_item(&self, item: &VaultItem) -> Result<bool, StoreError> {
        let counts = self.apply(vec![Mutation::UpdateItem(item.clone())]).await?;
        Ok(counts.first().copied().unwrap_or(0) > 0)
    }

    pub async fn delete_item(&self, id: &str) -> Result<bool, StoreError> {
        let counts = self.apply(vec![Mutation::DeleteItem(id.to_string())]).await?;
        Ok(counts.first().copied().unwrap_or(0) > 0)
    }

    pub async fn get_item(&self, id: &str) -> Result<Option<VaultItem>, StoreError> {
        let mut conn = self.connection().await?;
        let row = sqlx::query_as::<_, ItemRow>(&format!("{SELECT_ITEMS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| self.db_error(e))?;
        row.map(VaultItem::try_from).transpose()
    }

    /// Newest first. Filters and pagination are bound parameters.
    pub async fn list_items(&self, filter: &ItemFilter) -> Result<Vec<VaultItem>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_ITEMS);
        qb.push(" WHERE 1 = 1");
        if let Some(container_id) = &filter.container_id {
            qb.push(" AND container_id = ").push_bind(container_id.clone());
        }
        if let Some(category) = filter.category {
            qb.push(" AND category = ").push_bind(category.as_str());
        }
        if let Some(favorite) = filter.favorite {
            qb.push(" AND favorite = ").push_bind(favorite);
        }
        qb.push(" ORDER BY updated_at DESC, id");
        match (filter.limit, filter.offset) {
            (Some(limit), offset) => {
                qb.push(" LIMIT ").push_bind(i64::from(limit));
                qb.push(" OFFSET ").push_bind(i64::from(offset.unwrap_or(0)));
            }
            // SQLite needs a LIMIT before OFFSET; -1 means unbounded.
            (None, Some(offset)) => {
                qb.push(" LIMIT -1 OFFSET ").push_bind(i64::from(offset));
            }
            (None, None) => {}
        }

        let mut conn = self.connection().await?;
        let rows = qb
            .build_query_as::<ItemRow>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| self.db_error(e))?;
        rows.into_iter().map(VaultItem::try_from).collect()
    }

    /// Case-insensitive substring match on title or domain.
    ///
    /// SQLite's `lower()` only folds ASCII, so both sides are folded here
    /// with `str::to_lowercase` instead.
    pub async fn search_items(&self, term: &str) -> Result<Vec<VaultItem>, StoreError> {
        let needle = term.to_lowercase();
        let sql = format!("{SELECT_ITEMS} ORDER BY title COLLATE NOCASE, id");
        let items = self.fetch_items(&sql).await?;
        Ok(items
            .into_iter()
            .filter(|item| {
                contains_folded(&item.title, &needle)
                    || item.domain.as_deref().is_some_and(|d| contains_folded(d, &needle))
            })
            .collect())
    }

    /// Password items whose stored domain contains `normalized_domain`.
    pub async fn autofill_candidates(
        &self,
        normalized_domain: &str,
    ) -> Result<Vec<VaultItem>, StoreError> {
        let needle = normalized_domain.to_lowercase();
        let sql = format!(
            "{SELECT_ITEMS} WHERE category = 'password' AND domain IS NOT NULL \
             ORDER BY favorite DESC, updated_at DESC, id"
        );
        let items = self.fetch_items(&sql).await?;
        Ok(items
            .into_iter()
            .filter(|item| item.domain.as_deref().is_some_and(|d| contains_folded(d, &needle)))
            .collect())
    }

    async fn fetch_items(&self, sql: &str) -> Result<Vec<VaultItem>, StoreError> {
        let mut conn = self.connection().await?;
        let rows = sqlx::query_as::<_, ItemRow>(sql)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| self.db_error(e))?;
        rows.into_iter().map(VaultItem::try_from).collect()
    }

    /// Insert a batch atomically (used by import).
    pub async fn insert_batch(&self, mutations: Vec<Mutation>) -> Result<(), StoreError> {
        self.apply(mutations).await?;
        Ok(())
    }
}

/// `needle` must already be lowercased.
fn contains_folded(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use kw_crypto::SecretKey;

    use crate::db::{StoreOptions, VaultStore};
    use crate::error::StoreError;
    use crate::models::*;
    use crate::paths::VaultPaths;

    async fn store(dir: &std::path::Path) -> VaultStore {
        let options = StoreOptions { reopen_attempts: 1, reopen_backoff: Duration::ZERO };
        VaultStore::create(&VaultPaths::new(dir), "t", Arc::new(SecretKey::generate()), options)
            .await
            .unwrap()
    }

    fn container(name: &str) -> Container {
        let now = Utc::now();
        Container {
            id: uuid::Uuid::new_v4().to_string(),
            container_type: ContainerType::Company,
            name: name.into(),
            favorite: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn item(title: &str, domain: Option<&str>, container_id: Option<&str>) -> VaultItem {
        let now = Utc::now();
        VaultItem {
            id: uuid::Uuid::new_v4().to_string(),
            container_id: container_id.map(str::to_string),
            category: ItemCategory::Password,
            title: title.into(),
            domain: domain.map(str::to_string),
            fields: vec![],
            favorite: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn cascade_delete_removes_only_own_items() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path()).await;
        let a = container("Acme");
        let b = container("Globex");
        s.insert_container(&a).await.unwrap();
        s.insert_container(&b).await.unwrap();
        s.insert_item(&item("a1", None, Some(&a.id))).await.unwrap();
        s.insert_item(&item("a2", None, Some(&a.id))).await.unwrap();
        let keep = item("b1", None, Some(&b.id));
        s.insert_item(&keep).await.unwrap();
        let loose = item("loose", None, None);
        s.insert_item(&loose).await.unwrap();

        assert!(s.delete_container(&a.id).await.unwrap());
        let left: Vec<String> = s
            .list_items(&ItemFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.title)
            .collect();
        assert_eq!(left.len(), 2);
        assert!(left.contains(&"b1".to_string()));
        assert!(left.contains(&"loose".to_string()));
    }

    #[tokio::test]
    async fn item_in_unknown_container_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path()).await;
        let err = s.insert_item(&item("x", None, Some("missing"))).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(s.list_items(&ItemFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn filters_and_pagination() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path()).await;
        for n in 0..5 {
            let mut i = item(&format!("item-{n}"), None, None);
            i.favorite = n % 2 == 0;
            i.updated_at = Utc::now() + chrono::Duration::seconds(n);
            s.insert_item(&i).await.unwrap();
        }

        let favs = s
            .list_items(&ItemFilter { favorite: Some(true), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(favs.len(), 3);

        let page = s
            .list_items(&ItemFilter { limit: Some(2), offset: Some(1), ..Default::default() })
            .await
            .unwrap();
        let titles: Vec<_> = page.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["item-3", "item-2"]);

        let tail = s
            .list_items(&ItemFilter { offset: Some(4), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].title, "item-0");
    }

    #[tokio::test]
    async fn search_is_case_insensitive_and_injection_safe() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path()).await;
        s.insert_item(&item("GitHub", Some("github.com"), None)).await.unwrap();
        s.insert_item(&item("Bank'; DROP TABLE vault_items; --", Some("bank.example"), None))
            .await
            .unwrap();

        assert_eq!(s.search_items("GITHUB").await.unwrap().len(), 1);
        assert_eq!(s.search_items("bank.EXAMPLE").await.unwrap().len(), 1);
        assert_eq!(s.search_items("'; drop").await.unwrap().len(), 1);
        assert_eq!(s.list_items(&ItemFilter::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn search_folds_non_ascii_case() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path()).await;
        s.insert_item(&item("Überweisung Bank", Some("bank.example"), None)).await.unwrap();
        s.insert_item(&item("Unrelated", None, None)).await.unwrap();

        for term in ["überweisung", "ÜBERWEISUNG", "Überweisung"] {
            let hits = s.search_items(term).await.unwrap();
            assert_eq!(hits.len(), 1, "term {term}");
            assert_eq!(hits[0].title, "Überweisung Bank");
        }
    }

    #[tokio::test]
    async fn autofill_folds_internationalized_domains() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path()).await;
        s.insert_item(&item("Bäckerei", Some("BÄCKEREI.de"), None)).await.unwrap();

        let hits = s.autofill_candidates("bäckerei.de").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Bäckerei");
    }

    #[tokio::test]
    async fn autofill_only_matches_password_items() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path()).await;
        s.insert_item(&item("GitHub", Some("github.com"), None)).await.unwrap();
        let mut addr = item("Office", Some("github.com"), None);
        addr.category = ItemCategory::Address;
        s.insert_item(&addr).await.unwrap();

        let hits = s.autofill_candidates("github.com").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "GitHub");
    }

    #[tokio::test]
    async fn rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let paths = VaultPaths::new(dir.path());
        let dek = Arc::new(SecretKey::generate());
        let s = VaultStore::create(&paths, "t", dek.clone(), StoreOptions::default())
            .await
            .unwrap();
        let c = container("Acme");
        s.insert_container(&c).await.unwrap();
        s.insert_item(&item("kept", None, Some(&c.id))).await.unwrap();
        s.close().await;

        let s = VaultStore::open(&paths, "t", dek, StoreOptions::default()).await.unwrap();
        assert_eq!(s.get_container(&c.id).await.unwrap().unwrap().name, "Acme");
        assert_eq!(s.list_items(&ItemFilter::default()).await.unwrap().len(), 1);
        assert!(s.find_container_by_name("Acme", None).await.unwrap().is_some());
        assert!(s
            .find_container_by_name("Acme", Some(ContainerType::Identity))
            .await
            .unwrap()
            .is_none());
    }
}
