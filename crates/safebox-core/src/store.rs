//! Encrypted key-value store over SQLite.
//!
//! Every record is sealed with the double-layer envelope before it reaches
//! the database; only the key, the item type, timestamps and the plaintext
//! size are stored in the clear.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::StoreConfig;
use crate::crypto;
use crate::device::{DeviceIdProvider, FileDeviceIdProvider};
use crate::envelope::EncryptedEnvelope;
use crate::error::{Result, SafeboxError};
use crate::session::Session;

pub const DEFAULT_ITEM_TYPE: &str = "data";
pub const MAX_KEY_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoreStatus {
    Uninitialized,
    Initializing,
    Ready,
    Closed,
}

enum StoreState {
    Uninitialized,
    Initializing,
    Ready(Session),
    Closed,
}

impl StoreState {
    fn status(&self) -> StoreStatus {
        match self {
            StoreState::Uninitialized => StoreStatus::Uninitialized,
            StoreState::Initializing => StoreStatus::Initializing,
            StoreState::Ready(_) => StoreStatus::Ready,
            StoreState::Closed => StoreStatus::Closed,
        }
    }

    fn session(&self) -> Result<&Session> {
        match self {
            StoreState::Ready(session) => Ok(session),
            _ => Err(SafeboxError::NotInitialized),
        }
    }
}

/// Clear-text bookkeeping kept next to each envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    pub key: String,
    pub item_type: String,
    /// Unix milliseconds.
    pub created_at: i64,
    pub updated_at: i64,
    /// Serialized plaintext length in bytes.
    pub size_bytes: u64,
}

/// A record as stored, without decrypting it.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub metadata: RecordMetadata,
    pub envelope: EncryptedEnvelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub item_count: u64,
    pub total_size: u64,
    /// Rounded to the nearest byte, 0 for an empty store.
    pub avg_item_size: u64,
}

type MetadataRow = (String, String, i64, i64, i64);

fn metadata_from_row((key, item_type, created_at, updated_at, size): MetadataRow) -> RecordMetadata {
    RecordMetadata {
        key,
        item_type,
        created_at,
        updated_at,
        size_bytes: size.max(0) as u64,
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(SafeboxError::InvalidInput("key must not be empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(SafeboxError::InvalidInput(format!(
            "key longer than {MAX_KEY_LEN} bytes"
        )));
    }
    if key.chars().any(char::is_control) {
        return Err(SafeboxError::InvalidInput("key contains control characters".into()));
    }
    Ok(())
}

pub struct EncryptedStore {
    config: StoreConfig,
    device: Arc<dyn DeviceIdProvider>,
    state: RwLock<StoreState>,
}

impl EncryptedStore {
    pub fn new(config: StoreConfig, device: Arc<dyn DeviceIdProvider>) -> Self {
        Self {
            config,
            device,
            state: RwLock::new(StoreState::Uninitialized),
        }
    }

    /// Store whose device id is generated once and kept in `config.data_dir`.
    pub fn with_file_device(config: StoreConfig) -> Self {
        let device = Arc::new(FileDeviceIdProvider::in_dir(&config.data_dir));
        Self::new(config, device)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub async fn state(&self) -> StoreStatus {
        self.state.read().await.status()
    }

    /// Derive both keys and open the database.
    ///
    /// The password is not checked here: a wrong one surfaces as
    /// [`SafeboxError::Decryption`] on the first read of an existing record.
    /// Re-initializing a ready store closes the previous session first.
    pub async fn initialize(&self, password: &str, user_id: &str) -> Result<()> {
        crypto::ensure_supported()?;
        self.config.validate()?;
        if password.is_empty() {
            return Err(SafeboxError::InvalidInput("password must not be empty".into()));
        }
        if user_id.is_empty() {
            return Err(SafeboxError::InvalidInput("user id must not be empty".into()));
        }

        let mut state = self.state.write().await;
        if let StoreState::Ready(previous) =
            std::mem::replace(&mut *state, StoreState::Initializing)
        {
            previous.close().await;
        }
        debug!(user_id, "initializing store");

        match self.open_session(password, user_id).await {
            Ok(session) => {
                *state = StoreState::Ready(session);
                info!(user_id, db = %self.config.database_path().display(), "store ready");
                Ok(())
            }
            Err(e) => {
                *state = StoreState::Uninitialized;
                warn!(user_id, error = %e, "store initialization failed");
                Err(e)
            }
        }
    }

    async fn open_session(&self, password: &str, user_id: &str) -> Result<Session> {
        let user_key = crypto::derive_key_async(
            Zeroizing::new(password.to_string()),
            user_id.to_string(),
            self.config.kdf_iterations,
        )
        .await?;
        let device_id = self.device.device_id()?;
        let device_key = crypto::derive_device_key_async(device_id).await?;
        Session::open(&self.config, user_id, user_key, device_key).await
    }

    /// Encrypt and upsert `data` under `key`. An existing record keeps its
    /// creation time.
    pub async fn set_item<T: Serialize + ?Sized>(
        &self,
        key: &str,
        data: &T,
        item_type: Option<&str>,
    ) -> Result<()> {
        let state = self.state.read().await;
        let session = state.session()?;
        validate_key(key)?;

        let plaintext = Zeroizing::new(serde_json::to_vec(data)?);
        if plaintext.len() > self.config.max_item_bytes {
            return Err(SafeboxError::InvalidInput(format!(
                "item of {} bytes exceeds limit of {}",
                plaintext.len(),
                self.config.max_item_bytes
            )));
        }
        let item_type = item_type
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_ITEM_TYPE);
        let envelope = session.seal(&plaintext)?.to_json()?;
        let now = Utc::now().timestamp_millis();

        let sql = format!(
            "INSERT INTO {} (key, envelope, item_type, created_at, updated_at, size_bytes)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                envelope = excluded.envelope,
                item_type = excluded.item_type,
                updated_at = excluded.updated_at,
                size_bytes = excluded.size_bytes",
            session.table()
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(envelope)
            .bind(item_type)
            .bind(now)
            .bind(now)
            .bind(plaintext.len() as i64)
            .execute(session.pool())
            .await?;
        debug!(key, item_type, size = plaintext.len(), "item stored");
        Ok(())
    }

    /// Decrypt the value under `key`, `None` when absent.
    pub async fn get_item(&self, key: &str) -> Result<Option<Value>> {
        let state = self.state.read().await;
        let session = state.session()?;

        let sql = format!("SELECT envelope FROM {} WHERE key = ?", session.table());
        let envelope: Option<String> = sqlx::query_scalar(&sql)
            .bind(key)
            .fetch_optional(session.pool())
            .await?;
        match envelope {
            None => Ok(None),
            Some(json) => {
                let envelope = EncryptedEnvelope::from_json(&json)?;
                session.unseal(&envelope).map(Some)
            }
        }
    }

    /// [`get_item`](Self::get_item) deserialized into `T`.
    pub async fn get_item_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_item(key).await? {
            None => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
        }
    }

    /// Removing a missing key is not an error.
    pub async fn remove_item(&self, key: &str) -> Result<()> {
        let state = self.state.read().await;
        let session = state.session()?;
        let sql = format!("DELETE FROM {} WHERE key = ?", session.table());
        let removed = sqlx::query(&sql)
            .bind(key)
            .execute(session.pool())
            .await?
            .rows_affected();
        debug!(key, removed, "item removed");
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        let state = self.state.read().await;
        let session = state.session()?;
        let sql = format!("DELETE FROM {}", session.table());
        let removed = sqlx::query(&sql)
            .execute(session.pool())
            .await?
            .rows_affected();
        info!(removed, "store cleared");
        Ok(())
    }

    /// All keys in ascending order.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let session = state.session()?;
        let sql = format!("SELECT key FROM {} ORDER BY key", session.table());
        Ok(sqlx::query_scalar(&sql).fetch_all(session.pool()).await?)
    }

    pub async fn keys_by_type(&self, item_type: &str) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let session = state.session()?;
        let sql = format!(
            "SELECT key FROM {} WHERE item_type = ? ORDER BY key",
            session.table()
        );
        Ok(sqlx::query_scalar(&sql)
            .bind(item_type)
            .fetch_all(session.pool())
            .await?)
    }

    pub async fn get_stats(&self) -> Result<StoreStats> {
        let state = self.state.read().await;
        let session = state.session()?;
        let sql = format!(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM {}",
            session.table()
        );
        let (count, total): (i64, i64) = sqlx::query_as(&sql).fetch_one(session.pool()).await?;
        let item_count = count.max(0) as u64;
        let total_size = total.max(0) as u64;
        let avg_item_size = if item_count == 0 {
            0
        } else {
            (total_size as f64 / item_count as f64).round() as u64
        };
        Ok(StoreStats {
            item_count,
            total_size,
            avg_item_size,
        })
    }

    pub async fn metadata(&self, key: &str) -> Result<Option<RecordMetadata>> {
        let state = self.state.read().await;
        let session = state.session()?;
        let sql = format!(
            "SELECT key, item_type, created_at, updated_at, size_bytes FROM {} WHERE key = ?",
            session.table()
        );
        let row: Option<MetadataRow> = sqlx::query_as(&sql)
            .bind(key)
            .fetch_optional(session.pool())
            .await?;
        Ok(row.map(metadata_from_row))
    }

    /// The stored envelope and metadata for `key`, still encrypted.
    pub async fn record(&self, key: &str) -> Result<Option<StoredRecord>> {
        let state = self.state.read().await;
        let session = state.session()?;
        let sql = format!(
            "SELECT key, item_type, created_at, updated_at, size_bytes, envelope FROM {} WHERE key = ?",
            session.table()
        );
        let row: Option<(String, String, i64, i64, i64, String)> = sqlx::query_as(&sql)
            .bind(key)
            .fetch_optional(session.pool())
            .await?;
        match row {
            None => Ok(None),
            Some((key, item_type, created_at, updated_at, size, envelope)) => Ok(Some(StoredRecord {
                metadata: metadata_from_row((key, item_type, created_at, updated_at, size)),
                envelope: EncryptedEnvelope::from_json(&envelope)?,
            })),
        }
    }

    /// Delete records last written before `cutoff_ms` (Unix milliseconds).
    pub async fn remove_updated_before(&self, cutoff_ms: i64) -> Result<u64> {
        let state = self.state.read().await;
        let session = state.session()?;
        let sql = format!("DELETE FROM {} WHERE updated_at < ?", session.table());
        let removed = sqlx::query(&sql)
            .bind(cutoff_ms)
            .execute(session.pool())
            .await?
            .rows_affected();
        info!(removed, cutoff_ms, "expired items removed");
        Ok(removed)
    }

    /// Drop both keys and the connection. A store that never became ready
    /// is left as it is.
    pub async fn close(&self) {
        let mut state = self.state.write().await;
        match std::mem::replace(&mut *state, StoreState::Closed) {
            StoreState::Ready(session) => {
                session.close().await;
                info!("store closed");
            }
            previous => *state = previous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation() {
        assert!(validate_key("profile").is_ok());
        assert!(matches!(
            validate_key(""),
            Err(SafeboxError::InvalidInput(_))
        ));
        assert!(validate_key(&"k".repeat(MAX_KEY_LEN)).is_ok());
        assert!(validate_key(&"k".repeat(MAX_KEY_LEN + 1)).is_err());
        assert!(validate_key("line\nbreak").is_err());
    }

    #[test]
    fn negative_sizes_clamp() {
        let meta = metadata_from_row(("k".into(), "data".into(), 1, 2, -5));
        assert_eq!(meta.size_bytes, 0);
    }
}
