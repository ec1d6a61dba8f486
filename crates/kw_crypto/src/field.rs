//! Field-level encryption.
//!
//! Each item gets its own field key: HKDF-SHA256 over the DEK with
//! `context || ":" || item_id` as info. A ciphertext sealed for one item
//! cannot be opened with another item's key.
//!
//! Envelope: base64 (standard alphabet) of the `aead` wire format.

use base64::{engine::general_purpose, Engine as _};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::aead;
use crate::error::CryptoError;
use crate::secret::{SecretKey, KEY_LEN};

/// HKDF context for vault item fields.
pub const FIELD_CONTEXT: &str = "field-encryption";

const FIELD_AAD: &[u8] = b"kw-field-v1";

pub fn derive_field_key(
    dek: &SecretKey,
    context: &str,
    item_id: &str,
) -> Result<SecretKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, dek.expose());
    let mut info = Vec::with_capacity(context.len() + 1 + item_id.len());
    info.extend_from_slice(context.as_bytes());
    info.push(b':');
    info.extend_from_slice(item_id.as_bytes());

    let mut out = [0u8; KEY_LEN];
    hk.expand(&info, &mut out)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(SecretKey::from_bytes(&mut out))
}

pub fn encrypt_field(plaintext: &str, field_key: &SecretKey) -> Result<String, CryptoError> {
    let sealed = aead::encrypt(field_key, plaintext.as_bytes(), FIELD_AAD)?;
    Ok(general_purpose::STANDARD.encode(sealed))
}

pub fn decrypt_field(envelope: &str, field_key: &SecretKey) -> Result<String, CryptoError> {
    let sealed = general_purpose::STANDARD
        .decode(envelope)
        .map_err(|_| CryptoError::FieldDecryption)?;
    let plaintext =
        aead::decrypt(field_key, &sealed, FIELD_AAD).map_err(|_| CryptoError::FieldDecryption)?;
    String::from_utf8(plaintext.to_vec()).map_err(|_| CryptoError::FieldDecryption)
}
