//! Vault database handle over SQLite via sqlx.
//!
//! One in-memory SQLite connection per open vault, rebuilt from the sealed
//! snapshot file on open and on reconnect. Mutations run inside
//! `BEGIN IMMEDIATE` and only commit once the new snapshot is on disk.

use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kw_crypto::SecretKey;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::Connection;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::models::{Container, ContainerRow, ItemRow, VaultItem};
use crate::paths::{validate_vault_id, write_atomic, VaultPaths};
use crate::snapshot::Snapshot;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub(crate) const INSERT_CONTAINER: &str = "INSERT INTO containers \
     (id, container_type, name, favorite, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)";

pub(crate) const INSERT_ITEM: &str = "INSERT INTO vault_items \
     (id, container_id, category, title, domain, fields, favorite, created_at, updated_at) \
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)";

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Transparent reopen attempts before `StorageUnavailable`.
    pub reopen_attempts: u32,
    /// Delay before reopen attempt `n` is `n * reopen_backoff`.
    pub reopen_backoff: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            reopen_attempts: 3,
            reopen_backoff: Duration::from_millis(50),
        }
    }
}

/// A single write applied by [`VaultStore::apply`].
#[derive(Debug, Clone)]
pub enum Mutation {
    InsertContainer(Container),
    UpdateContainer(Container),
    DeleteContainer(String),
    InsertItem(VaultItem),
    UpdateItem(VaultItem),
    DeleteItem(String),
    PutMeta { key: String, value: Vec<u8> },
}

pub struct VaultStore {
    vault_id: String,
    path: PathBuf,
    dek: Arc<SecretKey>,
    options: StoreOptions,
    conn: Mutex<Option<SqliteConnection>>,
    broken: AtomicBool,
    closed: AtomicBool,
}

impl VaultStore {
    /// Create a new, empty vault database. Fails if the file already exists.
    pub async fn create(
        paths: &VaultPaths,
        vault_id: &str,
        dek: Arc<SecretKey>,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        validate_vault_id(vault_id)?;
        paths.ensure_dirs()?;
        let path = paths.database(vault_id);
        if path.exists() {
            return Err(StoreError::AlreadyExists(vault_id.to_string()));
        }

        let mut conn = fresh_connection()
            .await
            .map_err(|e| StoreError::SchemaCreation(e.to_string()))?;
        MIGRATOR
            .run(&mut conn)
            .await
            .map_err(|e| StoreError::SchemaCreation(e.to_string()))?;
        write_snapshot(&mut conn, &dek, vault_id, &path).await?;

        info!("[store] created vault={}", vault_id);
        Ok(Self::with_connection(vault_id, path, dek, options, conn))
    }

    /// Open an existing vault. A key that does not open the file surfaces as
    /// `IncorrectPassword`, never as a driver error.
    pub async fn open(
        paths: &VaultPaths,
        vault_id: &str,
        dek: Arc<SecretKey>,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        validate_vault_id(vault_id)?;
        let path = paths.database(vault_id);
        if !path.exists() {
            return Err(StoreError::NotFound(format!("vault {vault_id}")));
        }
        let conn = load_connection(&path, &dek, vault_id).await?;
        info!("[store] opened vault={}", vault_id);
        Ok(Self::with_connection(vault_id, path, dek, options, conn))
    }

    fn with_connection(
        vault_id: &str,
        path: PathBuf,
        dek: Arc<SecretKey>,
        options: StoreOptions,
        conn: SqliteConnection,
    ) -> Self {
        Self {
            vault_id: vault_id.to_string(),
            path,
            dek,
            options,
            conn: Mutex::new(Some(conn)),
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn vault_id(&self) -> &str {
        &self.vault_id
    }

    /// Idempotent. Later calls on this handle fail with `Closed`.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            if let Err(e) = conn.close().await {
                debug!("[store] close vault={}: {}", self.vault_id, e);
            }
            info!("[store] closed vault={}", self.vault_id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drop the live connection without closing the handle, as a driver
    /// failure would. The next call goes through the reopen path.
    #[doc(hidden)]
    pub async fn drop_connection(&self) {
        if let Some(conn) = self.conn.lock().await.take() {
            let _ = conn.close().await;
        }
    }

    // ── Connection management ────────────────────────────────────────────────

    /// Exclusive access to a live connection, reopening from the sealed file
    /// (bounded) when the current one is missing or unhealthy.
    pub(crate) async fn connection(
        &self,
    ) -> Result<MappedMutexGuard<'_, SqliteConnection>, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        let mut guard = self.conn.lock().await;
        if self.is_closed() {
            return Err(StoreError::Closed);
        }

        let healthy = match guard.as_mut() {
            Some(conn) if !self.broken.load(Ordering::Acquire) => conn.ping().await.is_ok(),
            _ => false,
        };
        if !healthy {
            if let Some(stale) = guard.take() {
                let _ = stale.close().await;
            }
            *guard = Some(self.reopen().await?);
            self.broken.store(false, Ordering::Release);
        }

        MutexGuard::try_map(guard, |slot| slot.as_mut()).map_err(|_| StoreError::Closed)
    }

    async fn reopen(&self) -> Result<SqliteConnection, StoreError> {
        let attempts = self.options.reopen_attempts;
        for attempt in 1..=attempts {
            match load_connection(&self.path, &self.dek, &self.vault_id).await {
                Ok(conn) => {
                    info!("[store] reopened vault={} attempt={}", self.vault_id, attempt);
                    return Ok(conn);
                }
                Err(e) => {
                    warn!(
                        "[store] reopen vault={} attempt={}/{} failed: {}",
                        self.vault_id, attempt, attempts, e
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.options.reopen_backoff * attempt).await;
                    }
                }
            }
        }
        Err(StoreError::StorageUnavailable { attempts })
    }

    /// Wrap a driver error, flagging the connection for reopen when the
    /// error means the connection itself is gone.
    pub(crate) fn db_error(&self, e: sqlx::Error) -> StoreError {
        if is_connection_error(&e) {
            warn!("[store] connection failure on vault={}: {}", self.vault_id, e);
            self.broken.store(true, Ordering::Release);
        }
        StoreError::Database(e)
    }

    // ── Writes ───────────────────────────────────────────────────────────────

    /// Apply `mutations` atomically. Returns rows affected per mutation.
    /// Either every mutation lands in memory and on disk, or none does.
    pub async fn apply(&self, mutations: Vec<Mutation>) -> Result<Vec<u64>, StoreError> {
        let mut conn = self.connection().await?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(|e| self.db_error(e))?;

        let outcome = self.apply_in_tx(&mut *conn, &mutations).await;
        match outcome {
            Ok(counts) => match sqlx::query("COMMIT").execute(&mut *conn).await {
                Ok(_) => Ok(counts),
                Err(e) => {
                    let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                    // The snapshot on disk is ahead of memory; force a reload.
                    self.broken.store(true, Ordering::Release);
                    Err(self.db_error(e))
                }
            },
            Err(e) => {
                if let Err(rb) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    warn!("[store] rollback failed on vault={}: {}", self.vault_id, rb);
                    self.broken.store(true, Ordering::Release);
                }
                Err(e)
            }
        }
    }

    async fn apply_in_tx(
        &self,
        conn: &mut SqliteConnection,
        mutations: &[Mutation],
    ) -> Result<Vec<u64>, StoreError> {
        let mut counts = Vec::with_capacity(mutations.len());
        for m in mutations {
            counts.push(self.apply_one(conn, m).await?);
        }
        write_snapshot(conn, &self.dek, &self.vault_id, &self.path).await?;
        Ok(counts)
    }

    async fn apply_one(
        &self,
        conn: &mut SqliteConnection,
        m: &Mutation,
    ) -> Result<u64, StoreError> {
        let result = match m {
            Mutation::InsertContainer(c) => {
                let row = ContainerRow::from(c);
                sqlx::query(INSERT_CONTAINER)
                    .bind(&row.id)
                    .bind(&row.container_type)
                    .bind(&row.name)
                    .bind(row.favorite)
                    .bind(row.created_at)
                    .bind(row.updated_at)
                    .execute(&mut *conn)
                    .await
            }
            Mutation::UpdateContainer(c) => {
                let row = ContainerRow::from(c);
                sqlx::query(
                    "UPDATE containers SET container_type = ?, name = ?, favorite = ?, \
                     updated_at = ? WHERE id = ?",
                )
                .bind(&row.container_type)
                .bind(&row.name)
                .bind(row.favorite)
                .bind(row.updated_at)
                .bind(&row.id)
                .execute(&mut *conn)
                .await
            }
            Mutation::DeleteContainer(id) => {
                // Items go with it via ON DELETE CASCADE.
                sqlx::query("DELETE FROM containers WHERE id = ?")
                    .bind(id)
                    .execute(&mut *conn)
                    .await
            }
            Mutation::InsertItem(item) => {
                let row = ItemRow::try_from(item)?;
                sqlx::query(INSERT_ITEM)
                    .bind(&row.id)
                    .bind(&row.container_id)
                    .bind(&row.category)
                    .bind(&row.title)
                    .bind(&row.domain)
                    .bind(&row.fields)
                    .bind(row.favorite)
                    .bind(row.created_at)
                    .bind(row.updated_at)
                    .execute(&mut *conn)
                    .await
            }
            Mutation::UpdateItem(item) => {
                let row = ItemRow::try_from(item)?;
                sqlx::query(
                    "UPDATE vault_items SET container_id = ?, category = ?, title = ?, domain = ?, \
                     fields = ?, favorite = ?, updated_at = ? WHERE id = ?",
                )
                .bind(&row.container_id)
                .bind(&row.category)
                .bind(&row.title)
                .bind(&row.domain)
                .bind(&row.fields)
                .bind(row.favorite)
                .bind(row.updated_at)
                .bind(&row.id)
                .execute(&mut *conn)
                .await
            }
            Mutation::DeleteItem(id) => {
                sqlx::query("DELETE FROM vault_items WHERE id = ?")
                    .bind(id)
                    .execute(&mut *conn)
                    .await
            }
            Mutation::PutMeta { key, value } => {
                sqlx::query(
                    "INSERT INTO vault_meta (key, value, updated_at) VALUES (?, ?, ?) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
                     updated_at = excluded.updated_at",
                )
                .bind(key)
                .bind(value)
                .bind(Utc::now())
                .execute(&mut *conn)
                .await
            }
        };
        result
            .map(|r| r.rows_affected())
            .map_err(|e| self.mutation_error(e, m))
    }

    fn mutation_error(&self, e: sqlx::Error, m: &Mutation) -> StoreError {
        if let sqlx::Error::Database(db) = &e {
            if db.is_foreign_key_violation() {
                let container = match m {
                    Mutation::InsertItem(i) | Mutation::UpdateItem(i) => {
                        i.container_id.clone().unwrap_or_default()
                    }
                    _ => String::new(),
                };
                return StoreError::NotFound(format!("container {container}"));
            }
            if db.is_unique_violation() {
                let id = match m {
                    Mutation::InsertContainer(c) => c.id.clone(),
                    Mutation::InsertItem(i) => i.id.clone(),
                    _ => String::new(),
                };
                return StoreError::AlreadyExists(id);
            }
        }
        self.db_error(e)
    }

    // ── vault_meta ───────────────────────────────────────────────────────────

    pub async fn put_meta(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.apply(vec![Mutation::PutMeta { key: key.to_string(), value: value.to_vec() }])
            .await?;
        Ok(())
    }

    pub async fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.connection().await?;
        sqlx::query_scalar::<_, Vec<u8>>("SELECT value FROM vault_meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| self.db_error(e))
    }
}

async fn fresh_connection() -> Result<SqliteConnection, sqlx::Error> {
    let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    SqliteConnection::connect_with(&opts).await
}

/// Decrypt the vault file and rebuild a live connection from it.
async fn load_connection(
    path: &std::path::Path,
    dek: &SecretKey,
    vault_id: &str,
) -> Result<SqliteConnection, StoreError> {
    let sealed = fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StoreError::NotFound(format!("vault {vault_id}")),
        _ => StoreError::Io(e),
    })?;
    let snapshot = Snapshot::unseal(&sealed, dek, vault_id)?;

    let mut conn = fresh_connection().await?;
    MIGRATOR
        .run(&mut conn)
        .await
        .map_err(|e| StoreError::SchemaCreation(e.to_string()))?;
    snapshot
        .restore(&mut conn)
        .await
        .map_err(|_| StoreError::IncorrectPassword)?;

    // Trivial read to prove the database is usable with this key.
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM vault_meta")
        .fetch_one(&mut conn)
        .await
        .map_err(|_| StoreError::IncorrectPassword)?;
    Ok(conn)
}

async fn write_snapshot(
    conn: &mut SqliteConnection,
    dek: &SecretKey,
    vault_id: &str,
    path: &std::path::Path,
) -> Result<(), StoreError> {
    let snapshot = Snapshot::dump(conn).await?;
    let sealed = snapshot.seal(dek, vault_id)?;
    write_atomic(path, &sealed)
}

fn is_connection_error(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::WorkerCrashed
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn quick() -> StoreOptions {
        StoreOptions { reopen_attempts: 3, reopen_backoff: Duration::ZERO }
    }

    #[tokio::test]
    async fn create_then_open_with_same_key() {
        let dir = tempdir().unwrap();
        let paths = VaultPaths::new(dir.path());
        let dek = Arc::new(SecretKey::generate());

        let store = VaultStore::create(&paths, "default", dek.clone(), quick()).await.unwrap();
        store.put_meta("settings", b"{\"autoLockMinutes\":5}").await.unwrap();
        store.close().await;

        let reopened = VaultStore::open(&paths, "default", dek, quick()).await.unwrap();
        let value = reopened.get_meta("settings").await.unwrap().unwrap();
        assert_eq!(value, b"{\"autoLockMinutes\":5}");
    }

    #[tokio::test]
    async fn wrong_key_is_incorrect_password() {
        let dir = tempdir().unwrap();
        let paths = VaultPaths::new(dir.path());
        let store = VaultStore::create(&paths, "v", Arc::new(SecretKey::generate()), quick())
            .await
            .unwrap();
        store.close().await;

        let err = VaultStore::open(&paths, "v", Arc::new(SecretKey::generate()), quick())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::IncorrectPassword));
    }

    #[tokio::test]
    async fn create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let paths = VaultPaths::new(dir.path());
        let dek = Arc::new(SecretKey::generate());
        VaultStore::create(&paths, "v", dek.clone(), quick()).await.unwrap();
        let err = VaultStore::create(&paths, "v", dek, quick()).await.err().unwrap();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn file_on_disk_is_opaque() {
        let dir = tempdir().unwrap();
        let paths = VaultPaths::new(dir.path());
        let store = VaultStore::create(&paths, "v", Arc::new(SecretKey::generate()), quick())
            .await
            .unwrap();
        store.put_meta("marker", b"PLAINTEXT-MARKER").await.unwrap();

        let bytes = fs::read(paths.database("v")).unwrap();
        let needle = b"PLAINTEXT-MARKER";
        assert!(!bytes.windows(needle.len()).any(|w| w == needle));
        assert!(!bytes.windows(12).any(|w| w == b"\"containers\""));
    }

    #[tokio::test]
    async fn dropped_connection_is_reopened_transparently() {
        let dir = tempdir().unwrap();
        let paths = VaultPaths::new(dir.path());
        let store = VaultStore::create(&paths, "v", Arc::new(SecretKey::generate()), quick())
            .await
            .unwrap();
        store.put_meta("k", b"v1").await.unwrap();

        store.drop_connection().await;
        assert_eq!(store.get_meta("k").await.unwrap().unwrap(), b"v1");
    }

    #[tokio::test]
    async fn reopen_gives_up_after_bounded_attempts() {
        let dir = tempdir().unwrap();
        let paths = VaultPaths::new(dir.path());
        let store = VaultStore::create(&paths, "v", Arc::new(SecretKey::generate()), quick())
            .await
            .unwrap();

        store.broken.store(true, Ordering::Release);
        fs::remove_file(paths.database("v")).unwrap();
        let err = store.get_meta("k").await.unwrap_err();
        assert!(matches!(err, StoreError::StorageUnavailable { attempts: 3 }));
    }

    #[tokio::test]
    async fn closed_handle_fails_fast_and_close_is_idempotent() {
        let dir = tempdir().unwrap();
        let paths = VaultPaths::new(dir.path());
        let store = VaultStore::create(&paths, "v", Arc::new(SecretKey::generate()), quick())
            .await
            .unwrap();
        store.close().await;
        store.close().await;
        assert!(matches!(store.get_meta("k").await, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn open_missing_vault_is_not_found() {
        let dir = tempdir().unwrap();
        let paths = VaultPaths::new(dir.path());
        let err = VaultStore::open(&paths, "nope", Arc::new(SecretKey::generate()), quick())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
