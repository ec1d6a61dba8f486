//! VaultService: the single entry point for vault operations.
//!
//! Lifecycle (create / unlock / lock / delete), status and settings live
//! here; container, item and CSV operations are in sibling modules as
//! further `impl VaultService` blocks.

use std::sync::Arc;

use kw_crypto::kdf::generate_salt;
use kw_crypto::wrap::{unwrap_dek, wrap_dek};
use kw_crypto::{Argon2idDeriver, KdfParams, KeyDeriver, SecretKey};
use kw_store::db::Mutation;
use kw_store::meta::META_KEY;
use kw_store::paths::{remove_if_exists, validate_vault_id};
use kw_store::{StoreError, VaultEntry, VaultMetadata, VaultPaths, VaultRegistry, VaultStore};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::config::VaultConfig;
use crate::error::VaultError;
use crate::session::{LockReason, SessionHandle, SessionManager, SessionPhase, UnlockMode};

pub const DEFAULT_VAULT_ID: &str = "default";
pub(crate) const SETTINGS_KEY: &str = "settings";

/// Returned by `create_vault` and `unlock`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockedVault {
    pub vault_id: String,
    /// Session capability for transport layers. Only its hash is retained.
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultStatus {
    pub exists: bool,
    pub locked: bool,
    pub is_unlocked: bool,
    pub auto_lock_minutes: u32,
    pub current_vault_id: Option<String>,
    pub available_vaults: Vec<VaultEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultSettings {
    pub auto_lock_minutes: u32,
}

pub struct VaultService {
    pub(crate) config: VaultConfig,
    pub(crate) paths: VaultPaths,
    pub(crate) registry: VaultRegistry,
    pub(crate) session: SessionManager,
    deriver: Arc<dyn KeyDeriver>,
}

impl VaultService {
    pub fn new(config: VaultConfig) -> Result<Self, VaultError> {
        config
            .validate()
            .map_err(|e| VaultError::InvalidInput(e.to_string()))?;
        let paths = VaultPaths::new(config.data_dir());
        paths.ensure_dirs()?;
        Ok(Self {
            registry: VaultRegistry::new(paths.clone()),
            session: SessionManager::new(config.unlock_max_attempts, config.unlock_window()),
            paths,
            config,
            deriver: Arc::new(Argon2idDeriver),
        })
    }

    /// Replace the password KDF (instrumentation, tests).
    pub fn with_key_deriver(mut self, deriver: Arc<dyn KeyDeriver>) -> Self {
        self.deriver = deriver;
        self
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.session
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Create a vault and leave it unlocked.
    pub async fn create_vault(
        &self,
        password: &str,
        name: &str,
        vault_id: Option<&str>,
    ) -> Result<UnlockedVault, VaultError> {
        let vault_id = vault_id.unwrap_or(DEFAULT_VAULT_ID);
        validate_vault_id(vault_id)?;
        if password.is_empty() {
            return Err(VaultError::InvalidInput("password must not be empty".into()));
        }
        let name = match name.trim() {
            "" => vault_id,
            trimmed => trimmed,
        };
        if self.vault_exists(vault_id) {
            return Err(VaultError::VaultAlreadyExists(vault_id.to_string()));
        }
        self.config.kdf_policy.check_new(&self.config.kdf)?;

        let UnlockMode::Fresh(pending) = self.session.begin_unlock(vault_id).await? else {
            return Err(VaultError::VaultAlreadyExists(vault_id.to_string()));
        };
        let provisioned = match self.discard_orphaned_metadata(vault_id) {
            Ok(()) => self.provision(vault_id, name, password).await,
            Err(e) => Err(e),
        };
        let (dek, store, auto_lock_minutes) = match provisioned {
            Ok(opened) => opened,
            Err(e) => {
                self.session.abort_unlock(pending).await;
                return Err(e);
            }
        };
        let token = self
            .session
            .complete_unlock(pending, dek, store, auto_lock_minutes)
            .await?;
        info!("[vault] created vault={}", vault_id);
        Ok(UnlockedVault { vault_id: vault_id.to_string(), token })
    }

    async fn provision(
        &self,
        vault_id: &str,
        name: &str,
        password: &str,
    ) -> Result<(Arc<SecretKey>, Arc<VaultStore>, u32), VaultError> {
        let params = self.config.kdf;
        let salt = generate_salt();
        let dek = Arc::new(SecretKey::generate());
        let kek = self.derive(password, salt, params).await?;
        let wrapped = wrap_dek(&dek, &kek)?;
        drop(kek);
        let meta = VaultMetadata::new(&salt, &wrapped, params);
        let settings = VaultSettings { auto_lock_minutes: self.config.default_auto_lock_minutes };

        let options = self.config.store_options();
        let store = VaultStore::create(&self.paths, vault_id, dek.clone(), options)
            .await
            .map_err(|e| match e {
                StoreError::AlreadyExists(id) => VaultError::VaultAlreadyExists(id),
                other => other.into(),
            })?;

        let finish = async {
            store
                .apply(vec![
                    Mutation::PutMeta { key: META_KEY.into(), value: meta.to_json()? },
                    Mutation::PutMeta {
                        key: SETTINGS_KEY.into(),
                        value: serde_json::to_vec(&settings)?,
                    },
                ])
                .await?;
            meta.save(&self.paths.metadata(vault_id))?;
            self.registry.register(vault_id, name)?;
            Ok::<_, StoreError>(())
        };
        if let Err(e) = finish.await {
            error!("[vault] create vault={} failed, removing partial files: {}", vault_id, e);
            store.close().await;
            self.remove_vault_files(vault_id);
            return Err(e.into());
        }
        Ok((dek, Arc::new(store), settings.auto_lock_minutes))
    }

    /// Unlock `vault_id`. Unlocking the vault that is already unlocked
    /// re-verifies the password and rotates the session token.
    ///
    /// Dropping the returned future mid-way leaves the session `Locked`.
    pub async fn unlock(
        &self,
        password: &str,
        vault_id: &str,
    ) -> Result<UnlockedVault, VaultError> {
        validate_vault_id(vault_id)?;
        self.session.check_unlock_rate()?;

        match self.session.begin_unlock(vault_id).await? {
            UnlockMode::Reauthenticate => {
                let meta = self.load_metadata(vault_id)?;
                self.unwrap_key(password, &meta).await?;
                let token = self.session.reauthenticate(vault_id).await?;
                Ok(UnlockedVault { vault_id: vault_id.to_string(), token })
            }
            UnlockMode::Fresh(pending) => {
                let (dek, store, minutes) = match self.open_vault(vault_id, password).await {
                    Ok(opened) => opened,
                    Err(e) => {
                        self.session.abort_unlock(pending).await;
                        if matches!(e, VaultError::IncorrectPassword) {
                            warn!(
                                "[vault] unlock failed for vault={}: incorrect password",
                                vault_id
                            );
                        }
                        return Err(e);
                    }
                };
                let token = self.session.complete_unlock(pending, dek, store, minutes).await?;
                Ok(UnlockedVault { vault_id: vault_id.to_string(), token })
            }
        }
    }

    async fn open_vault(
        &self,
        vault_id: &str,
        password: &str,
    ) -> Result<(Arc<SecretKey>, Arc<VaultStore>, u32), VaultError> {
        if !self.vault_exists(vault_id) {
            self.discard_orphaned_metadata(vault_id)?;
            return Err(VaultError::VaultNotFound(vault_id.to_string()));
        }
        let meta = self.load_metadata(vault_id)?;
        let dek = Arc::new(self.unwrap_key(password, &meta).await?);

        let options = self.config.store_options();
        let store = Arc::new(VaultStore::open(&self.paths, vault_id, dek.clone(), options).await?);

        // The in-store copy of the metadata is the vault's own record of
        // its key wrap; restore it if an older write lost it.
        match store.get_meta(META_KEY).await? {
            Some(bytes) if bytes == meta.to_json()? => {}
            _ => {
                warn!("[vault] restoring in-store metadata for vault={}", vault_id);
                store.put_meta(META_KEY, &meta.to_json()?).await?;
            }
        }

        let minutes = load_settings(&store)
            .await?
            .map(|s| s.auto_lock_minutes)
            .unwrap_or(self.config.default_auto_lock_minutes);
        Ok((dek, store, minutes))
    }

    fn load_metadata(&self, vault_id: &str) -> Result<VaultMetadata, VaultError> {
        match VaultMetadata::load(&self.paths.metadata(vault_id))? {
            Some(meta) => Ok(meta),
            None if self.paths.database(vault_id).exists() => {
                error!("[vault] metadata missing for existing vault={}", vault_id);
                Err(VaultError::MetadataMissing(vault_id.to_string()))
            }
            None => Err(VaultError::VaultNotFound(vault_id.to_string())),
        }
    }

    /// Derive the KEK from `password` and unwrap the DEK.
    async fn unwrap_key(
        &self,
        password: &str,
        meta: &VaultMetadata,
    ) -> Result<SecretKey, VaultError> {
        self.config.kdf_policy.check_cap(&meta.kdf_params)?;
        if meta.kdf_params.memory_cost < self.config.kdf_policy.min_memory_kib {
            warn!(
                "[vault] stored KDF memory cost {} KiB is below the floor for new vaults",
                meta.kdf_params.memory_cost
            );
        }
        let salt = meta.salt_bytes()?;
        let wrapped = meta.wrapped_dek_bytes()?;
        let kek = self.derive(password, salt, meta.kdf_params).await?;
        Ok(unwrap_dek(&wrapped, &kek)?)
    }

    async fn derive(
        &self,
        password: &str,
        salt: [u8; kw_crypto::kdf::SALT_LEN],
        params: KdfParams,
    ) -> Result<SecretKey, VaultError> {
        let deriver = self.deriver.clone();
        let password = Zeroizing::new(password.as_bytes().to_vec());
        tokio::task::spawn_blocking(move || deriver.derive_kek(&password, &salt, &params))
            .await
            .map_err(|e| VaultError::KeyDerivation(format!("KDF task failed: {e}")))?
            .map_err(Into::into)
    }

    /// End the session. Never fails; locking twice is a no-op.
    pub async fn lock(&self) {
        self.session.lock(LockReason::Explicit).await;
    }

    /// Permanently remove a vault. Only the currently unlocked vault can be
    /// deleted; `None` means that vault.
    pub async fn delete_vault(&self, vault_id: Option<&str>) -> Result<(), VaultError> {
        let current = self.session.current_vault_id().await.ok_or(VaultError::VaultLocked)?;
        let target = vault_id.unwrap_or(current.as_str());
        if target != current {
            return Err(VaultError::VaultLocked);
        }
        let target = target.to_string();

        self.session.lock(LockReason::Deleted).await;
        remove_if_exists(&self.paths.database(&target))?;
        VaultMetadata::remove(&self.paths.metadata(&target))?;
        self.registry.unregister(&target)?;
        info!("[vault] deleted vault={}", target);
        Ok(())
    }

    pub async fn get_status(&self, vault_id: Option<&str>) -> Result<VaultStatus, VaultError> {
        let current = self.session.current_vault_id().await;
        let target = vault_id
            .map(str::to_string)
            .or_else(|| current.clone())
            .unwrap_or_else(|| DEFAULT_VAULT_ID.to_string());

        let is_unlocked = current.as_deref() == Some(target.as_str())
            && self.session.phase().await == SessionPhase::Unlocked;
        let auto_lock_minutes = if is_unlocked {
            self.session
                .auto_lock_minutes()
                .await
                .unwrap_or(self.config.default_auto_lock_minutes)
        } else {
            self.config.default_auto_lock_minutes
        };

        Ok(VaultStatus {
            exists: validate_vault_id(&target).is_ok() && self.vault_exists(&target),
            locked: !is_unlocked,
            is_unlocked,
            auto_lock_minutes,
            current_vault_id: current,
            available_vaults: self.registry.list()?,
        })
    }

    pub fn list_vaults(&self) -> Result<Vec<VaultEntry>, VaultError> {
        Ok(self.registry.list()?)
    }

    pub async fn verify_token(&self, token: &str) -> Result<(), VaultError> {
        self.session.verify_token(token).await
    }

    // ── Settings ─────────────────────────────────────────────────────────────

    pub async fn get_settings(&self) -> Result<VaultSettings, VaultError> {
        let handle = self.acquire().await?;
        let stored = self.storage(load_settings(&handle.store).await).await?;
        Ok(stored.unwrap_or(VaultSettings {
            auto_lock_minutes: self.config.default_auto_lock_minutes,
        }))
    }

    /// Persist settings and apply the new auto-lock timeout immediately.
    pub async fn update_settings(
        &self,
        settings: VaultSettings,
    ) -> Result<VaultSettings, VaultError> {
        let handle = self.acquire().await?;
        let bytes = serde_json::to_vec(&settings).map_err(|e| VaultError::Format(e.to_string()))?;
        self.storage(handle.store.put_meta(SETTINGS_KEY, &bytes).await).await?;
        self.session.set_auto_lock(settings.auto_lock_minutes).await?;
        Ok(settings)
    }

    // ── Internals shared with the operation modules ─────────────────────────

    pub(crate) async fn acquire(&self) -> Result<SessionHandle, VaultError> {
        self.session.acquire().await
    }

    /// Map a store result, locking the session when the store is beyond
    /// recovery.
    pub(crate) async fn storage<T>(&self, result: Result<T, StoreError>) -> Result<T, VaultError> {
        match result {
            Err(StoreError::StorageUnavailable { attempts }) => {
                error!("[vault] store unrecoverable after {} attempts, locking", attempts);
                self.session.lock(LockReason::StorageFailure).await;
                Err(StoreError::StorageUnavailable { attempts }.into())
            }
            other => other.map_err(Into::into),
        }
    }

    /// A vault exists exactly when its database file does, which is also
    /// what the registry reconciles against.
    fn vault_exists(&self, vault_id: &str) -> bool {
        self.paths.database(vault_id).exists()
    }

    /// Metadata without a database is what an interrupted `delete_vault`
    /// leaves behind. Nothing can unlock it, so it must not hold the id.
    fn discard_orphaned_metadata(&self, vault_id: &str) -> Result<(), VaultError> {
        if self.vault_exists(vault_id) {
            return Ok(());
        }
        if VaultMetadata::remove(&self.paths.metadata(vault_id))? {
            warn!("[vault] removed orphaned metadata for vault={}", vault_id);
        }
        Ok(())
    }

    fn remove_vault_files(&self, vault_id: &str) {
        for path in [self.paths.database(vault_id), self.paths.metadata(vault_id)] {
            if let Err(e) = remove_if_exists(&path) {
                warn!("[vault] could not remove {}: {}", path.display(), e);
            }
        }
        if let Err(e) = self.registry.unregister(vault_id) {
            warn!("[vault] could not unregister vault={}: {}", vault_id, e);
        }
    }
}

async fn load_settings(store: &VaultStore) -> Result<Option<VaultSettings>, StoreError> {
    match store.get_meta(SETTINGS_KEY).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

