//! kw_store - Encrypted local storage for Keyward vaults
//!
//! # Encryption strategy
//! SQLite does NOT natively encrypt. Each vault runs an in-memory SQLite
//! database over a single connection; every committed write seals a snapshot
//! of all tables with the vault DEK (XChaCha20-Poly1305) and replaces the
//! vault file atomically. Nothing but `nonce || ciphertext || tag` ever
//! reaches disk.
//!
//! Individual sensitive fields are additionally sealed by the caller with
//! per-item field keys before they are handed to the store.
//!
//! # Files
//! - `<root>/vaults/<id>.kwdb`      - sealed database snapshot
//! - `<root>/vaults/<id>.meta.json` - salt, wrapped DEK, KDF parameters
//! - `<root>/registry.json`         - vault catalog (outside any vault)

pub mod containers;
pub mod db;
pub mod error;
pub mod items;
pub mod meta;
pub mod models;
pub mod paths;
pub mod registry;
mod snapshot;

pub use db::{StoreOptions, VaultStore};
pub use error::StoreError;
pub use meta::VaultMetadata;
pub use paths::VaultPaths;
pub use registry::{VaultEntry, VaultRegistry};
