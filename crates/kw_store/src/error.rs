use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] kw_crypto::CryptoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    /// The key did not open the vault file. Never carries driver detail.
    #[error("Incorrect password")]
    IncorrectPassword,

    #[error("Schema creation failed: {0}")]
    SchemaCreation(String),

    #[error("Storage unavailable after {attempts} reopen attempts")]
    StorageUnavailable { attempts: u32 },

    #[error("Store handle is closed")]
    Closed,

    #[error("Malformed data: {0}")]
    Format(String),

    #[error("Invalid vault id: {0}")]
    InvalidVaultId(String),
}
