use directories::ProjectDirs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SafeboxError};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "darklock";
pub const APP_NAME: &str = "safebox";
pub const DATA_DIR_ENV: &str = "SAFEBOX_DATA_DIR";
pub const CONFIG_FILE: &str = "config.json";

pub fn data_dir() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(DATA_DIR_ENV) {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| SafeboxError::Config("cannot determine data directory".into()))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

pub fn rate_limit_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("rate-limits")
}
