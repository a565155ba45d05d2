//! An unlocked store: both keys plus the open database handle.
//!
//! Keys never leave the session. Closing (or dropping) it zeroizes them and
//! releases the connection.

use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::fs;
use tracing::debug;

use crate::config::StoreConfig;
use crate::crypto::CipherKey;
use crate::envelope::{double_decrypt, double_encrypt_bytes, EncryptedEnvelope};
use crate::error::Result;

pub struct Session {
    user_id: String,
    user_key: CipherKey,
    device_key: CipherKey,
    pool: SqlitePool,
    table: String,
}

impl Session {
    /// Open (or create) the database and its table. Nothing is kept open on failure.
    pub(crate) async fn open(
        config: &StoreConfig,
        user_id: &str,
        user_key: CipherKey,
        device_key: CipherKey,
    ) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let options = SqliteConnectOptions::new()
            .filename(config.database_path())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        // One connection: statements apply in submission order.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        if let Err(e) = ensure_schema(&pool, &config.table_name).await {
            pool.close().await;
            return Err(e);
        }
        debug!(db = %config.database_path().display(), table = %config.table_name, "database open");

        Ok(Self {
            user_id: user_id.to_string(),
            user_key,
            device_key,
            pool,
            table: config.table_name.clone(),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn table(&self) -> &str {
        &self.table
    }

    pub(crate) fn seal(&self, plaintext: &[u8]) -> Result<EncryptedEnvelope> {
        double_encrypt_bytes(plaintext, &self.user_key, &self.device_key)
    }

    pub(crate) fn unseal(&self, envelope: &EncryptedEnvelope) -> Result<Value> {
        double_decrypt(envelope, &self.user_key, &self.device_key)
    }

    pub(crate) async fn close(self) {
        self.pool.close().await;
        debug!(user_id = %self.user_id, "session closed");
    }
}

async fn ensure_schema(pool: &SqlitePool, table: &str) -> Result<()> {
    let statements = [
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                key TEXT PRIMARY KEY NOT NULL,
                envelope TEXT NOT NULL,
                item_type TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                size_bytes INTEGER NOT NULL
            )"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_item_type ON {table} (item_type)"),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_created_at ON {table} (created_at)"),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_updated_at ON {table} (updated_at)"),
    ];
    for statement in &statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
