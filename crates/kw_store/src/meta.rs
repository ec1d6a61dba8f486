//! Vault metadata file.
//!
//! ```json
//! { "salt": "<base64>", "wrappedDEK": "<base64>",
//!   "kdfParams": { "memoryCost": 65536, "timeCost": 3, "parallelism": 4 } }
//! ```
//!
//! Without this file the DEK cannot be unwrapped, so a missing file is fatal
//! for the vault. A copy is also kept inside the sealed database.

use std::fs;
use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use kw_crypto::kdf::{KdfParams, SALT_LEN};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::paths::{remove_if_exists, write_atomic};

/// Key under which the in-store copy lives in `vault_meta`.
pub const META_KEY: &str = "vault_metadata";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultMetadata {
    pub salt: String,
    #[serde(rename = "wrappedDEK")]
    pub wrapped_dek: String,
    #[serde(rename = "kdfParams")]
    pub kdf_params: KdfParams,
}

impl VaultMetadata {
    pub fn new(salt: &[u8; SALT_LEN], wrapped_dek: &[u8], kdf_params: KdfParams) -> Self {
        Self {
            salt: general_purpose::STANDARD.encode(salt),
            wrapped_dek: general_purpose::STANDARD.encode(wrapped_dek),
            kdf_params,
        }
    }

    pub fn salt_bytes(&self) -> Result<[u8; SALT_LEN], StoreError> {
        let raw = general_purpose::STANDARD
            .decode(&self.salt)
            .map_err(|e| StoreError::Format(format!("salt: {e}")))?;
        raw.try_into().map_err(|v: Vec<u8>| {
            StoreError::Format(format!("salt must be {SALT_LEN} bytes, got {}", v.len()))
        })
    }

    pub fn wrapped_dek_bytes(&self) -> Result<Vec<u8>, StoreError> {
        general_purpose::STANDARD
            .decode(&self.wrapped_dek)
            .map_err(|e| StoreError::Format(format!("wrappedDEK: {e}")))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes)
            .map_err(|e| StoreError::Format(format!("vault metadata: {e}")))
    }

    /// `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, StoreError> {
        match fs::read(path) {
            Ok(bytes) => Self::from_json(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        write_atomic(path, &self.to_json()?)
    }

    pub fn remove(path: &Path) -> Result<bool, StoreError> {
        remove_if_exists(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kw_crypto::kdf::generate_salt;

    #[test]
    fn file_format_field_names() {
        let meta = VaultMetadata::new(&generate_salt(), &[1u8; 60], KdfParams::default());
        let json: serde_json::Value = serde_json::from_slice(&meta.to_json().unwrap()).unwrap();
        assert!(json["salt"].is_string());
        assert!(json["wrappedDEK"].is_string());
        assert_eq!(json["kdfParams"]["memoryCost"], 65536);
    }

    #[test]
    fn save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.meta.json");
        assert!(VaultMetadata::load(&path).unwrap().is_none());

        let salt = generate_salt();
        let meta = VaultMetadata::new(&salt, &[9u8; 60], KdfParams::default());
        meta.save(&path).unwrap();
        let loaded = VaultMetadata::load(&path).unwrap().unwrap();
        assert_eq!(loaded, meta);
        assert_eq!(loaded.salt_bytes().unwrap(), salt);
        assert_eq!(loaded.wrapped_dek_bytes().unwrap(), vec![9u8; 60]);

        assert!(VaultMetadata::remove(&path).unwrap());
        assert!(!VaultMetadata::remove(&path).unwrap());
    }

    #[test]
    fn short_salt_is_format_error() {
        let mut meta = VaultMetadata::new(&generate_salt(), &[0u8; 60], KdfParams::default());
        meta.salt = general_purpose::STANDARD.encode([0u8; 8]);
        assert!(matches!(meta.salt_bytes(), Err(StoreError::Format(_))));
    }
}
