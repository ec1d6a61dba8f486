//! kw_crypto - Keyward key hierarchy primitives
//!
//! # Key hierarchy
//! - master password + salt → **KEK** (Argon2id, memory-hard)
//! - random **DEK** wrapped under the KEK (AES-256-GCM, 60-byte blob)
//! - per-item **field keys** expanded from the DEK (HKDF-SHA256)
//! - individual field values sealed under field keys (XChaCha20-Poly1305)
//!
//! # Module layout
//! - `secret` - scoped 32-byte secret that wipes itself on drop
//! - `kdf`    - Argon2id parameters, policy and the `KeyDeriver` seam
//! - `wrap`   - DEK wrapping / unwrapping
//! - `aead`   - XChaCha20-Poly1305 helpers (nonce-prefixed wire format)
//! - `field`  - field-key derivation and field envelopes
//! - `error`  - unified error type

pub mod aead;
pub mod error;
pub mod field;
pub mod kdf;
pub mod secret;
pub mod wrap;

pub use error::CryptoError;
pub use kdf::{Argon2idDeriver, KdfParams, KdfPolicy, KeyDeriver};
pub use secret::SecretKey;
