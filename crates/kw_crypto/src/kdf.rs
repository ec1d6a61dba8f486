//! Password → KEK derivation.
//!
//! Argon2id with parameters that are persisted next to the wrapped DEK, so
//! unlock always replays exactly what was used at creation time.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::secret::{SecretKey, KEY_LEN};

pub const SALT_LEN: usize = 32;

/// Argon2id cost parameters. `memory_cost` is in KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    pub memory_cost: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_cost: 64 * 1024, // 64 MiB
            time_cost: 3,
            parallelism: 4,
        }
    }
}

/// Bounds on `memory_cost`.
///
/// `min_memory_kib` is the security floor for new vaults; `max_memory_kib`
/// protects the host allocator. Parameters outside the bounds are rejected,
/// never clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfPolicy {
    pub min_memory_kib: u32,
    pub max_memory_kib: u32,
}

impl Default for KdfPolicy {
    fn default() -> Self {
        Self {
            min_memory_kib: 64 * 1024,
            max_memory_kib: 1024 * 1024,
        }
    }
}

impl KdfPolicy {
    /// Check parameters for a vault that is about to be created.
    pub fn check_new(&self, params: &KdfParams) -> Result<(), CryptoError> {
        if params.memory_cost < self.min_memory_kib {
            return Err(CryptoError::KeyDerivation(format!(
                "memory cost {} KiB is below the configured floor of {} KiB",
                params.memory_cost, self.min_memory_kib
            )));
        }
        self.check_cap(params)
    }

    /// Check persisted parameters before replaying them on unlock.
    pub fn check_cap(&self, params: &KdfParams) -> Result<(), CryptoError> {
        if params.memory_cost > self.max_memory_kib {
            return Err(CryptoError::KeyDerivation(format!(
                "memory cost {} KiB exceeds the configured cap of {} KiB \
                 (raise KW_KDF_MAX_MEMORY_KIB)",
                params.memory_cost, self.max_memory_kib
            )));
        }
        Ok(())
    }
}

/// Derives a KEK from a password. Implementations must be slow and
/// memory-hard; the seam exists so callers can wrap or instrument it.
pub trait KeyDeriver: Send + Sync {
    fn derive_kek(
        &self,
        password: &[u8],
        salt: &[u8],
        params: &KdfParams,
    ) -> Result<SecretKey, CryptoError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Argon2idDeriver;

impl KeyDeriver for Argon2idDeriver {
    fn derive_kek(
        &self,
        password: &[u8],
        salt: &[u8],
        params: &KdfParams,
    ) -> Result<SecretKey, CryptoError> {
        derive_kek(password, salt, params)
    }
}

/// Derive a 32-byte KEK from `password` and a 32-byte `salt`.
pub fn derive_kek(
    password: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<SecretKey, CryptoError> {
    if salt.len() != SALT_LEN {
        return Err(CryptoError::KeyDerivation(format!(
            "salt must be {SALT_LEN} bytes, got {}",
            salt.len()
        )));
    }
    let argon_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| CryptoError::KeyDerivation(format!("argon2 params: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut output = [0u8; KEY_LEN];
    let derived = argon.hash_password_into(password, salt, &mut output);
    if let Err(e) = derived {
        output.zeroize();
        return Err(CryptoError::KeyDerivation(format!("argon2 derive: {e}")));
    }
    Ok(SecretKey::from_bytes(&mut output))
}

/// Fresh random salt; stored in the vault metadata, not secret.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> KdfParams {
        KdfParams { memory_cost: 64, time_cost: 1, parallelism: 1 }
    }

    #[test]
    fn same_inputs_same_key() {
        let salt = generate_salt();
        let a = derive_kek(b"correct horse", &salt, &fast()).unwrap();
        let b = derive_kek(b"correct horse", &salt, &fast()).unwrap();
        assert_eq!(a.expose(), b.expose());
    }

    #[test]
    fn different_password_different_key() {
        let salt = generate_salt();
        let a = derive_kek(b"correct horse", &salt, &fast()).unwrap();
        let b = derive_kek(b"correct horsf", &salt, &fast()).unwrap();
        assert_ne!(a.expose(), b.expose());
    }

    #[test]
    fn malformed_salt_rejected() {
        let err = derive_kek(b"pw", &[0u8; 16], &fast()).unwrap_err();
        assert!(matches!(err, CryptoError::KeyDerivation(_)));
    }

    #[test]
    fn policy_rejects_instead_of_clamping() {
        let policy = KdfPolicy { min_memory_kib: 1024, max_memory_kib: 4096 };
        let weak = KdfParams { memory_cost: 512, ..fast() };
        let huge = KdfParams { memory_cost: 8192, ..fast() };
        assert!(policy.check_new(&weak).is_err());
        assert!(policy.check_new(&huge).is_err());
        assert!(policy.check_cap(&weak).is_ok());
        assert!(policy.check_new(&KdfParams { memory_cost: 2048, ..fast() }).is_ok());
    }

    #[test]
    fn params_serialize_camel_case() {
        let json = serde_json::to_value(KdfParams::default()).unwrap();
        assert_eq!(json["memoryCost"], 65536);
        assert_eq!(json["timeCost"], 3);
        assert_eq!(json["parallelism"], 4);
    }
}
