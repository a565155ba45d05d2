//! Encrypted envelopes and the double-layer scheme.
//!
//! A double envelope is the device-key encryption of the JSON form of a
//! user-key envelope, so neither key alone recovers the plaintext.
//!
//! Serialized form:
//!   `{ "ciphertext": b64, "iv": b64, "algorithm": tag, "timestamp": ms, "version": "1" }`
//!
//! The version and algorithm tag are bound into the AEAD associated data;
//! unknown tags or versions are rejected, never guessed at.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::Zeroizing;

use crate::crypto::{self, decrypt_bytes, encrypt_bytes, CipherKey};
use crate::error::{Result, SafeboxError};

pub const ENVELOPE_VERSION: &str = "1";
pub const ALGORITHM_SINGLE: &str = "AES-GCM";
pub const ALGORITHM_DOUBLE: &str = "AES-GCM+DOUBLE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Single,
    Double,
}

impl Layer {
    pub fn algorithm(self) -> &'static str {
        match self {
            Layer::Single => ALGORITHM_SINGLE,
            Layer::Double => ALGORITHM_DOUBLE,
        }
    }

    fn from_algorithm(tag: &str) -> Option<Self> {
        match tag {
            ALGORITHM_SINGLE => Some(Layer::Single),
            ALGORITHM_DOUBLE => Some(Layer::Double),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    #[serde(with = "b64")]
    ciphertext: Vec<u8>,
    #[serde(rename = "iv", with = "b64")]
    nonce: Vec<u8>,
    algorithm: String,
    #[serde(rename = "timestamp")]
    created_at: i64,
    version: String,
}

fn associated_data(version: &str, algorithm: &str) -> Vec<u8> {
    format!("safebox:{version}:{algorithm}").into_bytes()
}

impl EncryptedEnvelope {
    pub(crate) fn seal(plaintext: &[u8], key: &CipherKey, layer: Layer) -> Result<Self> {
        let algorithm = layer.algorithm();
        let aad = associated_data(ENVELOPE_VERSION, algorithm);
        let (nonce, ciphertext) = encrypt_bytes(key, plaintext, &aad)?;
        Ok(Self {
            ciphertext,
            nonce: nonce.to_vec(),
            algorithm: algorithm.to_string(),
            created_at: Utc::now().timestamp_millis(),
            version: ENVELOPE_VERSION.to_string(),
        })
    }

    pub(crate) fn open(&self, key: &CipherKey) -> Result<Zeroizing<Vec<u8>>> {
        self.layer()?;
        let aad = associated_data(&self.version, &self.algorithm);
        decrypt_bytes(key, &self.nonce, &self.ciphertext, &aad)
    }

    /// Which layering this envelope claims, after checking the format version.
    pub fn layer(&self) -> Result<Layer> {
        if self.version != ENVELOPE_VERSION {
            return Err(SafeboxError::Decryption(format!(
                "unsupported envelope format: version {:?}",
                self.version
            )));
        }
        Layer::from_algorithm(&self.algorithm).ok_or_else(|| {
            SafeboxError::Decryption(format!(
                "unsupported envelope format: algorithm {:?}",
                self.algorithm
            ))
        })
    }

    pub(crate) fn expect_layer(&self, expected: Layer) -> Result<()> {
        let actual = self.layer()?;
        if actual != expected {
            return Err(SafeboxError::Decryption(format!(
                "unsupported envelope format: expected {} envelope, found {}",
                expected.algorithm(),
                actual.algorithm()
            )));
        }
        Ok(())
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Creation time in epoch milliseconds.
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a stored envelope. Malformed input is an integrity failure.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| SafeboxError::Decryption(format!("malformed envelope: {e}")))
    }
}

/// Encrypt with `user_key`, then wrap the result with `device_key`.
pub fn double_encrypt(
    plaintext: &Value,
    user_key: &CipherKey,
    device_key: &CipherKey,
) -> Result<EncryptedEnvelope> {
    let bytes = Zeroizing::new(serde_json::to_vec(plaintext)?);
    double_encrypt_bytes(&bytes, user_key, device_key)
}

pub(crate) fn double_encrypt_bytes(
    plaintext: &[u8],
    user_key: &CipherKey,
    device_key: &CipherKey,
) -> Result<EncryptedEnvelope> {
    let inner = EncryptedEnvelope::seal(plaintext, user_key, Layer::Single)?;
    let inner_json = Zeroizing::new(serde_json::to_vec(&inner)?);
    EncryptedEnvelope::seal(&inner_json, device_key, Layer::Double)
}

/// Unwrap the device layer, then decrypt the inner envelope with `user_key`.
pub fn double_decrypt(
    envelope: &EncryptedEnvelope,
    user_key: &CipherKey,
    device_key: &CipherKey,
) -> Result<Value> {
    envelope.expect_layer(Layer::Double)?;
    let inner_json = envelope.open(device_key)?;
    let inner: EncryptedEnvelope = serde_json::from_slice(&inner_json)
        .map_err(|e| SafeboxError::Decryption(format!("malformed inner envelope: {e}")))?;
    crypto::decrypt(&inner, user_key)
}

mod b64 {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{decrypt, derive_device_key, derive_key, encrypt, MIN_KDF_ITERATIONS};
    use serde_json::json;

    fn keys() -> (CipherKey, CipherKey) {
        (
            derive_key("correct-horse", "user-42", MIN_KDF_ITERATIONS).unwrap(),
            derive_device_key("device-abc").unwrap(),
        )
    }

    #[test]
    fn double_roundtrip() {
        let (user, device) = keys();
        let value = json!({"text": "hi", "n": [1, 2, 3]});
        let envelope = double_encrypt(&value, &user, &device).unwrap();
        assert_eq!(envelope.algorithm(), ALGORITHM_DOUBLE);
        assert_eq!(envelope.version(), ENVELOPE_VERSION);
        assert_eq!(double_decrypt(&envelope, &user, &device).unwrap(), value);
    }

    #[test]
    fn swapped_keys_fail() {
        let (user, device) = keys();
        let envelope = double_encrypt(&json!("secret"), &user, &device).unwrap();
        let err = double_decrypt(&envelope, &device, &user).unwrap_err();
        assert!(err.is_decryption());
    }

    #[test]
    fn either_key_alone_is_insufficient() {
        let (user, device) = keys();
        let other_user = derive_key("other", "user-42", MIN_KDF_ITERATIONS).unwrap();
        let other_device = derive_device_key("device-xyz").unwrap();
        let envelope = double_encrypt(&json!("secret"), &user, &device).unwrap();
        assert!(double_decrypt(&envelope, &other_user, &device).is_err());
        assert!(double_decrypt(&envelope, &user, &other_device).is_err());
    }

    #[test]
    fn layer_mismatch_is_rejected() {
        let (user, device) = keys();
        let single = encrypt(&json!(1), &user).unwrap();
        assert!(double_decrypt(&single, &user, &device)
            .unwrap_err()
            .is_decryption());

        let double = double_encrypt(&json!(1), &user, &device).unwrap();
        assert!(decrypt(&double, &device).unwrap_err().is_decryption());
    }

    #[test]
    fn json_shape() {
        let (user, _) = keys();
        let envelope = encrypt(&json!("x"), &user).unwrap();
        let value: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        for field in ["ciphertext", "iv", "algorithm", "timestamp", "version"] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        let parsed = EncryptedEnvelope::from_json(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let (user, _) = keys();
        let envelope = encrypt(&json!("x"), &user).unwrap();
        let mut value = serde_json::to_value(&envelope).unwrap();
        value["version"] = json!("2");
        let bumped: EncryptedEnvelope = serde_json::from_value(value).unwrap();
        assert!(matches!(bumped.layer(), Err(SafeboxError::Decryption(_))));
        assert!(decrypt(&bumped, &user).is_err());
    }

    #[test]
    fn relabelled_algorithm_fails_authentication() {
        let (user, device) = keys();
        let envelope = double_encrypt(&json!("x"), &user, &device).unwrap();
        let mut value = serde_json::to_value(&envelope).unwrap();
        value["algorithm"] = json!(ALGORITHM_SINGLE);
        let relabelled: EncryptedEnvelope = serde_json::from_value(value).unwrap();
        assert!(decrypt(&relabelled, &device).unwrap_err().is_decryption());
    }

    #[test]
    fn malformed_json_is_decryption_error() {
        assert!(EncryptedEnvelope::from_json("{not json")
            .unwrap_err()
            .is_decryption());
    }
}
