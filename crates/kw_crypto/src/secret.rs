//! Scoped secret key material.
//!
//! `SecretKey` is the only type that carries a KEK, DEK or field key. Its
//! backing bytes are overwritten with random data and then zeroed when the
//! value is dropped, on every exit path including `?` early returns.

use std::fmt;

use rand::RngCore;
use zeroize::Zeroize;

pub const KEY_LEN: usize = 32;

pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    /// Fresh key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Takes ownership of `bytes`; the caller's copy is wiped.
    pub fn from_bytes(bytes: &mut [u8; KEY_LEN]) -> Self {
        let key = Self(*bytes);
        bytes.zeroize();
        key
    }

    pub fn expose(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        rand::rngs::OsRng.fill_bytes(&mut self.0);
        self.0.zeroize();
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bytes_wipes_source() {
        let mut raw = [7u8; KEY_LEN];
        let key = SecretKey::from_bytes(&mut raw);
        assert_eq!(raw, [0u8; KEY_LEN]);
        assert_eq!(key.expose(), &[7u8; KEY_LEN]);
    }

    #[test]
    fn debug_is_redacted() {
        let key = SecretKey::generate();
        assert_eq!(format!("{key:?}"), "SecretKey([REDACTED])");
    }

    #[test]
    fn generated_keys_differ() {
        assert_ne!(SecretKey::generate().expose(), SecretKey::generate().expose());
    }
}
