use kw_crypto::CryptoError;
use kw_store::StoreError;
use thiserror::Error;
use tracing::error;

/// Every error VaultService can return. Driver and I/O errors are logged
/// and collapsed into `StorageUnavailable`; they never reach callers raw.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Wrong password or corrupted key wrap; deliberately indistinguishable.
    #[error("Incorrect password")]
    IncorrectPassword,

    #[error("Vault already exists: {0}")]
    VaultAlreadyExists(String),

    #[error("Vault not found: {0}")]
    VaultNotFound(String),

    #[error("Vault is locked - unlock with password first")]
    VaultLocked,

    #[error("Too many unlock attempts; retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Malformed vault data: {0}")]
    Format(String),

    #[error("Field could not be decrypted")]
    FieldDecryption,

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Schema creation failed: {0}")]
    SchemaCreation(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Metadata for vault '{0}' is missing; it cannot be unlocked and must be recreated")]
    MetadataMissing(String),

    #[error("Another vault session is active: {0}")]
    SessionActive(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<CryptoError> for VaultError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::KeyDerivation(msg) => VaultError::KeyDerivation(msg),
            CryptoError::IncorrectPassword => VaultError::IncorrectPassword,
            CryptoError::Format(msg) => VaultError::Format(msg),
            CryptoError::FieldDecryption => VaultError::FieldDecryption,
            other @ (CryptoError::AeadEncrypt
            | CryptoError::AeadDecrypt
            | CryptoError::Base64Decode(_)) => VaultError::Format(other.to_string()),
        }
    }
}

impl From<StoreError> for VaultError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Database(inner) => {
                error!("[vault] database error: {}", inner);
                VaultError::StorageUnavailable("database operation failed".into())
            }
            StoreError::Io(inner) => {
                error!("[vault] i/o error: {}", inner);
                VaultError::StorageUnavailable("file operation failed".into())
            }
            StoreError::Crypto(inner) => inner.into(),
            StoreError::Serialisation(inner) => VaultError::Format(inner.to_string()),
            StoreError::NotFound(what) => VaultError::NotFound(what),
            StoreError::AlreadyExists(what) => VaultError::VaultAlreadyExists(what),
            StoreError::IncorrectPassword => VaultError::IncorrectPassword,
            StoreError::SchemaCreation(msg) => VaultError::SchemaCreation(msg),
            StoreError::StorageUnavailable { attempts } => VaultError::StorageUnavailable(format!(
                "store unreachable after {attempts} reopen attempts"
            )),
            // The session was locked underneath an in-flight call.
            StoreError::Closed => VaultError::VaultLocked,
            StoreError::Format(msg) => VaultError::Format(msg),
            StoreError::InvalidVaultId(id) => {
                VaultError::InvalidInput(format!("invalid vault id '{id}'"))
            }
        }
    }
}
