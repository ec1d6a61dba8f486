//! Vault catalog.
//!
//! Lives outside every vault's encryption boundary: listing vaults never
//! needs a password. The file is reconciled against the database files on
//! disk on every `list()`, so a lost or stale registration heals itself.

use std::collections::HashSet;
use std::fs;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::paths::{validate_vault_id, write_atomic, VaultPaths, DB_EXTENSION};

const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultEntry {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    vaults: Vec<VaultEntry>,
}

pub struct VaultRegistry {
    paths: VaultPaths,
    // Serialises read-modify-write cycles on the registry file.
    lock: Mutex<()>,
}

impl VaultRegistry {
    pub fn new(paths: VaultPaths) -> Self {
        Self { paths, lock: Mutex::new(()) }
    }

    /// All known vaults, oldest first, after reconciling with disk.
    pub fn list(&self) -> Result<Vec<VaultEntry>, StoreError> {
        let _guard = self.lock.lock();
        let mut file = self.load();
        if self.reconcile(&mut file)? {
            self.save(&file)?;
        }
        let mut vaults = file.vaults;
        vaults.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(vaults)
    }

    pub fn get(&self, id: &str) -> Result<Option<VaultEntry>, StoreError> {
        Ok(self.list()?.into_iter().find(|v| v.id == id))
    }

    /// Insert or rename. Re-registering an existing id keeps its `created_at`.
    pub fn register(&self, id: &str, name: &str) -> Result<VaultEntry, StoreError> {
        validate_vault_id(id)?;
        let _guard = self.lock.lock();
        let mut file = self.load();
        let entry = match file.vaults.iter_mut().find(|v| v.id == id) {
            Some(existing) => {
                existing.name = name.to_string();
                existing.clone()
            }
            None => {
                let entry = VaultEntry {
                    id: id.to_string(),
                    name: name.to_string(),
                    created_at: Utc::now(),
                };
                file.vaults.push(entry.clone());
                entry
            }
        };
        self.save(&file)?;
        info!("[registry] registered vault={}", id);
        Ok(entry)
    }

    /// Returns whether an entry was removed; removing twice is not an error.
    pub fn unregister(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock();
        let mut file = self.load();
        let before = file.vaults.len();
        file.vaults.retain(|v| v.id != id);
        let removed = file.vaults.len() != before;
        if removed {
            self.save(&file)?;
            info!("[registry] unregistered vault={}", id);
        }
        Ok(removed)
    }

    fn load(&self) -> RegistryFile {
        let path = self.paths.registry();
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(
                    "[registry] unreadable registry {}: {} (rebuilding from disk)",
                    path.display(),
                    e
                );
                RegistryFile::default()
            }),
            Err(_) => RegistryFile::default(),
        }
    }

    fn save(&self, file: &RegistryFile) -> Result<(), StoreError> {
        let out = RegistryFile { version: REGISTRY_VERSION, vaults: file.vaults.clone() };
        write_atomic(&self.paths.registry(), &serde_json::to_vec_pretty(&out)?)
    }

    /// Returns true when `file` changed.
    fn reconcile(&self, file: &mut RegistryFile) -> Result<bool, StoreError> {
        let on_disk = self.database_files()?;
        let mut changed = false;

        let before = file.vaults.len();
        file.vaults.retain(|v| {
            let present = on_disk.iter().any(|(id, _)| id == &v.id);
            if !present {
                warn!("[registry] dropping vault={} (database file missing)", v.id);
            }
            present
        });
        changed |= file.vaults.len() != before;

        let known: HashSet<String> = file.vaults.iter().map(|v| v.id.clone()).collect();
        for (id, created_at) in on_disk {
            if !known.contains(&id) {
                warn!("[registry] recovering unregistered vault={}", id);
                file.vaults.push(VaultEntry { name: id.clone(), id, created_at });
                changed = true;
            }
        }
        Ok(changed)
    }

    fn database_files(&self) -> Result<Vec<(String, DateTime<Utc>)>, StoreError> {
        let dir = self.paths.vaults_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(DB_EXTENSION) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_vault_id(id).is_err() {
                continue;
            }
            let created_at = fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            found.push((id.to_string(), created_at));
        }
        Ok(found)
    }
}
