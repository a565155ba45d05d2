//! On-disk configuration for the store and the rate-limit policies.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::crypto::{DEFAULT_KDF_ITERATIONS, MIN_KDF_ITERATIONS};
use crate::error::{Result, SafeboxError};
use crate::paths;
use crate::rate_limit::RateLimitConfig;

pub const DEFAULT_DATABASE_NAME: &str = "safebox.db";
pub const DEFAULT_TABLE_NAME: &str = "encrypted_items";
pub const DEFAULT_MAX_ITEM_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub database_name: String,
    pub table_name: String,
    pub kdf_iterations: u32,
    pub max_item_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::new(),
            database_name: DEFAULT_DATABASE_NAME.into(),
            table_name: DEFAULT_TABLE_NAME.into(),
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            max_item_bytes: DEFAULT_MAX_ITEM_BYTES,
        }
    }
}

impl StoreConfig {
    /// Defaults rooted at the platform data directory (or `SAFEBOX_DATA_DIR`).
    pub fn from_env() -> Result<Self> {
        Ok(Self::in_dir(paths::data_dir()?))
    }

    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(SafeboxError::Config("data_dir must be set".into()));
        }
        if self.kdf_iterations < MIN_KDF_ITERATIONS {
            return Err(SafeboxError::Config(format!(
                "kdf_iterations must be at least {MIN_KDF_ITERATIONS}"
            )));
        }
        if self.database_name.is_empty()
            || self.database_name.contains(['/', '\\'])
            || self.database_name == ".."
        {
            return Err(SafeboxError::Config(format!(
                "invalid database name {:?}",
                self.database_name
            )));
        }
        if !is_sql_identifier(&self.table_name) {
            return Err(SafeboxError::Config(format!(
                "invalid table name {:?}",
                self.table_name
            )));
        }
        if self.max_item_bytes == 0 {
            return Err(SafeboxError::Config("max_item_bytes must be positive".into()));
        }
        Ok(())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`; table names are interpolated into SQL.
fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicies {
    pub auth: RateLimitConfig,
    pub api: RateLimitConfig,
    pub form: RateLimitConfig,
}

impl Default for RateLimitPolicies {
    fn default() -> Self {
        Self {
            auth: RateLimitConfig::auth(),
            api: RateLimitConfig::api(),
            form: RateLimitConfig::form(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SafeboxConfig {
    pub store: StoreConfig,
    pub rate_limits: RateLimitPolicies,
}

impl SafeboxConfig {
    /// Read a config file. A missing `data_dir` resolves to the directory
    /// holding the file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let mut config: SafeboxConfig = serde_json::from_str(&data)
            .map_err(|e| SafeboxError::Config(format!("parse {}: {e}", path.display())))?;
        if config.store.data_dir.as_os_str().is_empty() {
            if let Some(parent) = path.parent() {
                config.store.data_dir = parent.to_path_buf();
            }
        }
        config.store.validate()?;
        Ok(config)
    }

    /// Defaults rooted at `data_dir` when no config file exists.
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let path = paths::config_path(data_dir);
        if path.exists() {
            return Self::load(&path);
        }
        Ok(Self {
            store: StoreConfig::in_dir(data_dir),
            ..Self::default()
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_valid() {
        let config = StoreConfig::in_dir("/tmp/safebox");
        config.validate().unwrap();
        assert_eq!(
            config.database_path(),
            PathBuf::from("/tmp/safebox").join(DEFAULT_DATABASE_NAME)
        );
    }

    #[test]
    fn default_has_no_data_dir() {
        let config = StoreConfig::default();
        assert!(config.data_dir.as_os_str().is_empty());
        assert!(matches!(config.validate(), Err(SafeboxError::Config(_))));
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = StoreConfig::in_dir("/tmp");
        config.kdf_iterations = 10;
        assert!(config.validate().is_err());

        let mut config = StoreConfig::in_dir("/tmp");
        config.table_name = "items; DROP TABLE x".into();
        assert!(config.validate().is_err());

        let mut config = StoreConfig::in_dir("/tmp");
        config.database_name = "../escape.db".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_or_default_and_save() {
        let dir = tempdir().unwrap();
        let config = SafeboxConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.store.data_dir, dir.path());
        assert_eq!(config.rate_limits.auth.max_requests, 5);

        let mut custom = config.clone();
        custom.store.table_name = "vault_items".into();
        custom.rate_limits.api.max_requests = 7;
        custom.save(&paths::config_path(dir.path())).unwrap();

        let loaded = SafeboxConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.store.table_name, "vault_items");
        assert_eq!(loaded.rate_limits.api.max_requests, 7);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = paths::config_path(dir.path());
        fs::write(&path, r#"{"store": {"table_name": "t1"}}"#).unwrap();
        let loaded = SafeboxConfig::load(&path).unwrap();
        assert_eq!(loaded.store.table_name, "t1");
        assert_eq!(loaded.store.data_dir, dir.path());
        assert_eq!(loaded.store.database_name, DEFAULT_DATABASE_NAME);
        assert_eq!(loaded.rate_limits.form.max_requests, 10);
    }
}
