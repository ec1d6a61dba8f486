use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Wrong password and a corrupted wrap are deliberately the same error.
    #[error("Incorrect password")]
    IncorrectPassword,

    #[error("Malformed key material: {0}")]
    Format(String),

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch)")]
    AeadDecrypt,

    #[error("Field could not be decrypted")]
    FieldDecryption,

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
