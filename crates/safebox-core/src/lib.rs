//! safebox-core: client-side encrypted storage
//!
//! # Encryption strategy
//! Values never reach disk in the clear. Each record is sealed twice with
//! AES-256-GCM:
//! - the inner layer uses a key derived from the user password (PBKDF2-SHA256,
//!   salted with the user id);
//! - the outer layer uses a key derived from a per-device identifier.
//!
//! A copied database is useless without both the password and the device.
//! Record keys, types, timestamps and sizes stay in plaintext columns so the
//! store can list and account without decrypting.
//!
//! Alongside the store the crate ships a sliding-window rate limiter and
//! input sanitizers for content that ends up in a web view.

pub mod config;
pub mod crypto;
pub mod device;
pub mod envelope;
pub mod error;
pub mod headers;
pub mod paths;
pub mod rate_limit;
pub mod sanitize;
pub mod session;
pub mod store;

pub use config::{SafeboxConfig, StoreConfig};
pub use crypto::CipherKey;
pub use device::{DeviceIdProvider, FileDeviceIdProvider, StaticDeviceIdProvider};
pub use envelope::{EncryptedEnvelope, Layer};
pub use error::{Result, SafeboxError};
pub use rate_limit::{RateLimitConfig, RateLimitResult, RateLimiter};
pub use store::{EncryptedStore, RecordMetadata, StoreStats, StoreStatus, StoredRecord};
