//! kw_vault - Keyward vault orchestration
//!
//! Composes the key hierarchy (`kw_crypto`) and encrypted storage
//! (`kw_store`) into the vault surface: create / unlock / lock, container
//! and item CRUD with field-level encryption, search, autofill lookup and
//! CSV export/import.
//!
//! # Sessions
//! There is at most one unlocked vault per process. The session holds the
//! DEK and the open store; it ends on `lock()`, on auto-lock after
//! inactivity, or when the store becomes unrecoverable.

pub mod config;
pub mod containers;
pub mod csv;
pub mod error;
pub mod items;
pub mod limiter;
pub mod logging;
pub mod service;
pub mod session;

pub use config::VaultConfig;
pub use error::VaultError;
pub use service::{UnlockedVault, VaultService, VaultSettings, VaultStatus, DEFAULT_VAULT_ID};

pub use kw_store::models::{
    Container, ContainerType, Field, FieldType, ItemCategory, ItemFilter, VaultItem,
};
pub use kw_store::VaultEntry;
