use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::StoreError;

pub const DB_EXTENSION: &str = "kwdb";
const META_SUFFIX: &str = ".meta.json";
const MAX_VAULT_ID_LEN: usize = 64;

/// On-disk layout rooted at the configured data directory.
#[derive(Debug, Clone)]
pub struct VaultPaths {
    root: PathBuf,
}

impl VaultPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn vaults_dir(&self) -> PathBuf {
        self.root.join("vaults")
    }

    pub fn registry(&self) -> PathBuf {
        self.root.join("registry.json")
    }

    pub fn database(&self, vault_id: &str) -> PathBuf {
        self.vaults_dir().join(format!("{vault_id}.{DB_EXTENSION}"))
    }

    pub fn metadata(&self, vault_id: &str) -> PathBuf {
        self.vaults_dir().join(format!("{vault_id}{META_SUFFIX}"))
    }

    pub fn ensure_dirs(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.vaults_dir())?;
        Ok(())
    }
}

/// Vault ids become file names: 1-64 chars of `[A-Za-z0-9_-]`.
pub fn validate_vault_id(id: &str) -> Result<(), StoreError> {
    let ok = !id.is_empty()
        && id.len() <= MAX_VAULT_ID_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidVaultId(id.to_string()))
    }
}

/// Replace `path` with `bytes` via a temp file in the same directory.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::Format(format!("no parent directory for {}", path.display())))?;
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vault_ids_cannot_escape_the_data_dir() {
        assert!(validate_vault_id("default").is_ok());
        assert!(validate_vault_id("work_2024-a").is_ok());
        assert!(validate_vault_id("").is_err());
        assert!(validate_vault_id("../etc").is_err());
        assert!(validate_vault_id("a/b").is_err());
        assert!(validate_vault_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn layout() {
        let p = VaultPaths::new("/data");
        assert_eq!(p.database("default"), PathBuf::from("/data/vaults/default.kwdb"));
        assert_eq!(p.metadata("default"), PathBuf::from("/data/vaults/default.meta.json"));
        assert_eq!(p.registry(), PathBuf::from("/data/registry.json"));
    }
}
