//! Runtime configuration.
//!
//! Defaults are safe for production; every value can be overridden from
//! the environment (`KW_*`). Nothing here is secret.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};
use directories::ProjectDirs;
use kw_crypto::{KdfParams, KdfPolicy};
use kw_store::StoreOptions;
use serde::{Deserialize, Serialize};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "keyward";
pub const APP_NAME: &str = "keyward";

pub const DEFAULT_AUTO_LOCK_MINUTES: u32 = 15;

pub fn default_data_dir() -> anyhow::Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfig {
    pub data_dir: PathBuf,
    /// Parameters used for newly created vaults.
    pub kdf: KdfParams,
    pub kdf_policy: KdfPolicy,
    /// Applied to vaults that have no stored settings yet.
    pub default_auto_lock_minutes: u32,
    pub unlock_max_attempts: u32,
    pub unlock_window_secs: u64,
    pub store_reopen_attempts: u32,
}

impl VaultConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            kdf: KdfParams::default(),
            kdf_policy: KdfPolicy::default(),
            default_auto_lock_minutes: DEFAULT_AUTO_LOCK_MINUTES,
            unlock_max_attempts: 5,
            unlock_window_secs: 60,
            store_reopen_attempts: StoreOptions::default().reopen_attempts,
        }
    }

    /// Defaults, then `KW_*` overrides.
    pub fn from_env() -> anyhow::Result<Self> {
        let data_dir = match std::env::var_os("KW_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir()?,
        };
        let mut cfg = Self::new(data_dir);

        if let Some(v) = env_parse("KW_KDF_MEMORY_KIB")? {
            cfg.kdf.memory_cost = v;
        }
        if let Some(v) = env_parse("KW_KDF_TIME_COST")? {
            cfg.kdf.time_cost = v;
        }
        if let Some(v) = env_parse("KW_KDF_PARALLELISM")? {
            cfg.kdf.parallelism = v;
        }
        if let Some(v) = env_parse("KW_KDF_MIN_MEMORY_KIB")? {
            cfg.kdf_policy.min_memory_kib = v;
        }
        if let Some(v) = env_parse("KW_KDF_MAX_MEMORY_KIB")? {
            cfg.kdf_policy.max_memory_kib = v;
        }
        if let Some(v) = env_parse("KW_AUTO_LOCK_MINUTES")? {
            cfg.default_auto_lock_minutes = v;
        }
        if let Some(v) = env_parse("KW_UNLOCK_MAX_ATTEMPTS")? {
            cfg.unlock_max_attempts = v;
        }
        if let Some(v) = env_parse("KW_UNLOCK_WINDOW_SECS")? {
            cfg.unlock_window_secs = v;
        }
        if let Some(v) = env_parse("KW_STORE_REOPEN_ATTEMPTS")? {
            cfg.store_reopen_attempts = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.kdf_policy.min_memory_kib > self.kdf_policy.max_memory_kib {
            bail!(
                "KDF memory floor ({} KiB) is above the cap ({} KiB)",
                self.kdf_policy.min_memory_kib,
                self.kdf_policy.max_memory_kib
            );
        }
        if self.kdf.time_cost == 0 || self.kdf.parallelism == 0 {
            bail!("KDF time cost and parallelism must be at least 1");
        }
        if self.unlock_max_attempts == 0 {
            bail!("KW_UNLOCK_MAX_ATTEMPTS must be at least 1");
        }
        if self.unlock_window_secs == 0 {
            bail!("KW_UNLOCK_WINDOW_SECS must be at least 1");
        }
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn unlock_window(&self) -> Duration {
        Duration::from_secs(self.unlock_window_secs)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            reopen_attempts: self.store_reopen_attempts,
            ..StoreOptions::default()
        }
    }
}

fn env_parse<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {key}: '{raw}'")),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = VaultConfig::new("/tmp/kw");
        cfg.validate().unwrap();
        assert_eq!(cfg.kdf.memory_cost, 65536);
        assert_eq!(cfg.default_auto_lock_minutes, 15);
        assert_eq!(cfg.unlock_max_attempts, 5);
        assert_eq!(cfg.store_options().reopen_attempts, 3);
    }

    #[test]
    fn inverted_policy_is_rejected() {
        let mut cfg = VaultConfig::new("/tmp/kw");
        cfg.kdf_policy.min_memory_kib = 2048;
        cfg.kdf_policy.max_memory_kib = 1024;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_parse_reports_bad_values() {
        std::env::set_var("KW_TEST_PARSE_BAD", "lots");
        let err = env_parse::<u32>("KW_TEST_PARSE_BAD").unwrap_err();
        assert!(err.to_string().contains("KW_TEST_PARSE_BAD"));

        std::env::set_var("KW_TEST_PARSE_OK", " 42 ");
        assert_eq!(env_parse::<u32>("KW_TEST_PARSE_OK").unwrap(), Some(42));
        assert_eq!(env_parse::<u32>("KW_TEST_PARSE_UNSET").unwrap(), None);
    }
}
