//! DEK wrapping under the password-derived KEK.
//!
//! AES-256-GCM with a fresh 96-bit nonce per wrap.
//!
//! Blob layout (always 60 bytes):
//!   [ nonce (12) | ciphertext (32) | tag (16) ]

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::secret::{SecretKey, KEY_LEN};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const WRAPPED_LEN: usize = NONCE_LEN + KEY_LEN + TAG_LEN;

const WRAP_AAD: &[u8] = b"kw-dek-wrap-v1";

pub fn wrap_dek(dek: &SecretKey, kek: &SecretKey) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(kek.expose()).map_err(|_| CryptoError::AeadEncrypt)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let sealed = cipher
        .encrypt(&nonce, Payload { msg: dek.expose().as_slice(), aad: WRAP_AAD })
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut blob = Vec::with_capacity(WRAPPED_LEN);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&sealed);
    debug_assert_eq!(blob.len(), WRAPPED_LEN);
    Ok(blob)
}

/// Any authentication failure is reported as `IncorrectPassword`: a wrong
/// KEK and a tampered blob are indistinguishable to the caller.
pub fn unwrap_dek(blob: &[u8], kek: &SecretKey) -> Result<SecretKey, CryptoError> {
    if blob.len() != WRAPPED_LEN {
        return Err(CryptoError::Format(format!(
            "wrapped key must be {WRAPPED_LEN} bytes, got {}",
            blob.len()
        )));
    }
    let (nonce, sealed) = blob.split_at(NONCE_LEN);
    let cipher =
        Aes256Gcm::new_from_slice(kek.expose()).map_err(|_| CryptoError::IncorrectPassword)?;
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: sealed, aad: WRAP_AAD })
            .map_err(|_| CryptoError::IncorrectPassword)?,
    );
    let mut bytes: [u8; KEY_LEN] = plaintext
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::IncorrectPassword)?;
    Ok(SecretKey::from_bytes(&mut bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::{derive_kek, generate_salt, KdfParams};

    fn fast() -> KdfParams {
        KdfParams { memory_cost: 64, time_cost: 1, parallelism: 1 }
    }

    #[test]
    fn wrap_unwrap_roundtrip_through_kdf() {
        let salt = generate_salt();
        let dek = SecretKey::generate();
        let kek = derive_kek(b"correct-horse-battery-staple", &salt, &fast()).unwrap();
        let blob = wrap_dek(&dek, &kek).unwrap();
        assert_eq!(blob.len(), WRAPPED_LEN);

        let kek_again = derive_kek(b"correct-horse-battery-staple", &salt, &fast()).unwrap();
        let recovered = unwrap_dek(&blob, &kek_again).unwrap();
        assert_eq!(recovered.expose(), dek.expose());
    }

    #[test]
    fn fresh_nonce_per_wrap() {
        let dek = SecretKey::generate();
        let kek = SecretKey::generate();
        assert_ne!(wrap_dek(&dek, &kek).unwrap(), wrap_dek(&dek, &kek).unwrap());
    }

    #[test]
    fn wrong_kek_and_tampering_look_the_same() {
        let dek = SecretKey::generate();
        let kek = SecretKey::generate();
        let mut blob = wrap_dek(&dek, &kek).unwrap();

        let wrong = unwrap_dek(&blob, &SecretKey::generate()).unwrap_err();
        assert!(matches!(wrong, CryptoError::IncorrectPassword));

        blob[20] ^= 0x01;
        let tampered = unwrap_dek(&blob, &kek).unwrap_err();
        assert!(matches!(tampered, CryptoError::IncorrectPassword));
    }

    #[test]
    fn bad_length_is_format_error() {
        let kek = SecretKey::generate();
        assert!(matches!(unwrap_dek(&[0u8; 59], &kek), Err(CryptoError::Format(_))));
        assert!(matches!(unwrap_dek(&[0u8; 61], &kek), Err(CryptoError::Format(_))));
    }
}
