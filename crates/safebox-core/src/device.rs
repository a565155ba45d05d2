//! Stable per-device identifier used to derive the device-layer key.

use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, SafeboxError};

pub const DEVICE_ID_FILE: &str = "device-id";

/// Source of the per-device secret. Desktop builds persist a generated
/// fingerprint; backends can hand in a provisioned install id.
pub trait DeviceIdProvider: Send + Sync {
    fn device_id(&self) -> Result<String>;
}

/// Fixed identifier supplied by the embedding application.
#[derive(Clone)]
pub struct StaticDeviceIdProvider {
    id: String,
}

impl StaticDeviceIdProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl DeviceIdProvider for StaticDeviceIdProvider {
    fn device_id(&self) -> Result<String> {
        if self.id.is_empty() {
            return Err(SafeboxError::InvalidInput("device id must not be empty".into()));
        }
        Ok(self.id.clone())
    }
}

/// Fingerprint generated once and persisted to a file, reused afterwards.
pub struct FileDeviceIdProvider {
    path: PathBuf,
}

impl FileDeviceIdProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Provider storing its id as [`DEVICE_ID_FILE`] inside `data_dir`.
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(DEVICE_ID_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let id = fs::read_to_string(&self.path)?.trim().to_string();
        Ok(if id.is_empty() { None } else { Some(id) })
    }

    fn persist(&self, id: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, id)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

impl DeviceIdProvider for FileDeviceIdProvider {
    fn device_id(&self) -> Result<String> {
        if let Some(id) = self.load()? {
            debug!(path = %self.path.display(), "loaded device id");
            return Ok(id);
        }
        let id = generate_fingerprint();
        self.persist(&id)?;
        info!(path = %self.path.display(), "generated new device id");
        Ok(id)
    }
}

/// Hash of host traits plus a random component; 32 hex characters.
pub fn generate_fingerprint() -> String {
    let env = |name: &str| std::env::var(name).unwrap_or_default();
    let hostname = if cfg!(windows) {
        env("COMPUTERNAME")
    } else {
        env("HOSTNAME")
    };
    let locale = [env("LC_ALL"), env("LANG")].join(",");
    let parts = [
        std::env::consts::OS.to_string(),
        std::env::consts::ARCH.to_string(),
        hostname,
        locale,
        env("TZ"),
        Uuid::new_v4().to_string(),
    ];
    let digest = Sha256::digest(parts.join("|").as_bytes());
    hex::encode(&digest[..16])
}
