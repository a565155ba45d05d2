//! Key derivation and single-layer authenticated encryption.
//!
//! - PBKDF2-HMAC-SHA256 derives 256-bit keys from a password or device id.
//! - AES-256-GCM with a random 96-bit nonce per message.
//!
//! Key material lives only inside [`CipherKey`], which is zeroized on drop
//! and cannot be cloned, printed or serialized.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use once_cell::sync::Lazy;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;
use sha2::Sha256;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::envelope::{EncryptedEnvelope, Layer};
use crate::error::{Result, SafeboxError};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const MIN_KDF_ITERATIONS: u32 = 100_000;
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;
/// Fixed round count for the device layer.
pub const DEVICE_KDF_ITERATIONS: u32 = 10_000;

/// Mixed into every salt so keys are specific to this application.
const APP_SALT: &str = "safebox-app-salt-v1";
const SELF_TEST_PLAINTEXT: &[u8] = b"safebox self-test";

/// 256-bit AES-GCM key. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct CipherKey {
    bytes: [u8; KEY_LEN],
}

impl CipherKey {
    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.bytes))
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CipherKey(<redacted>)")
    }
}

fn pbkdf2_key(secret: &[u8], salt: &[u8], rounds: u32) -> CipherKey {
    let mut key = CipherKey {
        bytes: [0u8; KEY_LEN],
    };
    pbkdf2_hmac::<Sha256>(secret, salt, rounds, &mut key.bytes);
    key
}

fn app_salt(salt: &str) -> Vec<u8> {
    format!("{salt}:{APP_SALT}").into_bytes()
}

/// Derive a user key from `password` and a caller-supplied `salt`.
pub fn derive_key(password: &str, salt: &str, iterations: u32) -> Result<CipherKey> {
    if password.is_empty() {
        return Err(SafeboxError::InvalidInput("password must not be empty".into()));
    }
    if iterations < MIN_KDF_ITERATIONS {
        return Err(SafeboxError::InvalidInput(format!(
            "kdf iterations must be at least {MIN_KDF_ITERATIONS}, got {iterations}"
        )));
    }
    Ok(pbkdf2_key(password.as_bytes(), &app_salt(salt), iterations))
}

/// Derive the secondary-layer key bound to one device.
pub fn derive_device_key(device_id: &str) -> Result<CipherKey> {
    if device_id.is_empty() {
        return Err(SafeboxError::InvalidInput("device id must not be empty".into()));
    }
    Ok(pbkdf2_key(
        device_id.as_bytes(),
        &app_salt("device"),
        DEVICE_KDF_ITERATIONS,
    ))
}

/// Run CPU-bound work on the blocking pool. A panicked or cancelled task is
/// reported as [`SafeboxError::Task`].
async fn run_blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| SafeboxError::Task(format!("kdf task: {e}")))?
}

/// [`derive_key`] on the blocking pool so the async runtime keeps serving other tasks.
pub async fn derive_key_async(
    password: Zeroizing<String>,
    salt: String,
    iterations: u32,
) -> Result<CipherKey> {
    run_blocking(move || derive_key(&password, &salt, iterations)).await
}

pub async fn derive_device_key_async(device_id: String) -> Result<CipherKey> {
    run_blocking(move || derive_device_key(&device_id)).await
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt raw bytes under a fresh nonce. `aad` is authenticated but not encrypted.
pub fn encrypt_bytes(
    key: &CipherKey,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<([u8; NONCE_LEN], Vec<u8>)> {
    let nonce = generate_nonce();
    let ciphertext = key
        .cipher()
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| SafeboxError::UnsupportedPlatform("AES-GCM encryption failed".into()))?;
    Ok((nonce, ciphertext))
}

pub fn decrypt_bytes(
    key: &CipherKey,
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if nonce.len() != NONCE_LEN {
        return Err(SafeboxError::Decryption(format!(
            "nonce must be {NONCE_LEN} bytes, got {}",
            nonce.len()
        )));
    }
    let plaintext = key
        .cipher()
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| {
            SafeboxError::Decryption("authentication tag mismatch (wrong key or tampered data)".into())
        })?;
    Ok(Zeroizing::new(plaintext))
}

/// Encrypt any JSON value into a single-layer envelope.
pub fn encrypt(plaintext: &Value, key: &CipherKey) -> Result<EncryptedEnvelope> {
    let bytes = Zeroizing::new(serde_json::to_vec(plaintext)?);
    EncryptedEnvelope::seal(&bytes, key, Layer::Single)
}

/// Decrypt a single-layer envelope.
pub fn decrypt(envelope: &EncryptedEnvelope, key: &CipherKey) -> Result<Value> {
    envelope.expect_layer(Layer::Single)?;
    let bytes = envelope.open(key)?;
    parse_plaintext(&bytes)
}

/// Structured data first, raw string otherwise.
pub(crate) fn parse_plaintext(bytes: &[u8]) -> Result<Value> {
    if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
        return Ok(value);
    }
    let text = std::str::from_utf8(bytes)
        .map_err(|_| SafeboxError::Decryption("plaintext is neither JSON nor UTF-8".into()))?;
    Ok(Value::String(text.to_string()))
}

static SELF_TEST: Lazy<std::result::Result<(), String>> = Lazy::new(run_self_test);

fn run_self_test() -> std::result::Result<(), String> {
    let mut probe = [0u8; KEY_LEN];
    OsRng
        .try_fill_bytes(&mut probe)
        .map_err(|e| format!("entropy source unavailable: {e}"))?;
    let key = CipherKey { bytes: probe };
    let (nonce, ciphertext) =
        encrypt_bytes(&key, SELF_TEST_PLAINTEXT, b"").map_err(|e| e.to_string())?;
    let roundtrip = decrypt_bytes(&key, &nonce, &ciphertext, b"").map_err(|e| e.to_string())?;
    if roundtrip.as_slice() != SELF_TEST_PLAINTEXT {
        return Err("AES-GCM self-test produced wrong plaintext".into());
    }
    Ok(())
}

/// Whether the crypto primitives work on this platform.
pub fn is_supported() -> bool {
    SELF_TEST.is_ok()
}

pub fn ensure_supported() -> Result<()> {
    (*SELF_TEST)
        .clone()
        .map_err(SafeboxError::UnsupportedPlatform)
}
