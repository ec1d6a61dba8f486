//! Authenticated Encryption with Associated Data
//!
//! Uses XChaCha20-Poly1305 (192-bit nonce).
//! Key size: 32 bytes.  Nonce: 24 bytes (random).  Tag: 16 bytes.
//!
//! Ciphertext wire format:
//!   [ nonce (24 bytes) | ciphertext + tag ]

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    XChaCha20Poly1305, XNonce,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::secret::SecretKey;

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

/// Encrypt `plaintext`, prepending a random 24-byte nonce.
/// `aad` is authenticated but not encrypted.
pub fn encrypt(key: &SecretKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher =
        XChaCha20Poly1305::new_from_slice(key.expose()).map_err(|_| CryptoError::AeadEncrypt)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt wire-format bytes (nonce || ciphertext+tag).
pub fn decrypt(
    key: &SecretKey,
    data: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce, ct) = data.split_at(NONCE_LEN);
    let cipher =
        XChaCha20Poly1305::new_from_slice(key.expose()).map_err(|_| CryptoError::AeadDecrypt)?;
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ct, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aad_is_bound() {
        let key = SecretKey::generate();
        let ct = encrypt(&key, b"payload", b"vault-a").unwrap();
        assert_eq!(decrypt(&key, &ct, b"vault-a").unwrap().as_slice(), b"payload");
        assert!(decrypt(&key, &ct, b"vault-b").is_err());
    }

    #[test]
    fn short_input_rejected() {
        let key = SecretKey::generate();
        assert!(matches!(decrypt(&key, &[0u8; 30], b""), Err(CryptoError::AeadDecrypt)));
    }
}
