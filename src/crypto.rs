use aes_gcm::aead::consts::U12;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use base64::Engine;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::ControlSettings;
use crate::error::{AppError, AppResult};

const NONCE_LEN: usize = 12;

/// Encrypted envelope persisted in `tenant_secrets.encrypted_blob`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub nonce_b64: String,
    pub ciphertext_b64: String,
}

type Aes192Gcm = AesGcm<Aes192, U12>;

enum AeadKey {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

impl std::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AeadKey(..)")
    }
}

/// AES-GCM envelope encryption over a JSON serialization of the payload.
#[derive(Debug)]
pub struct SecretCipher {
    key: AeadKey,
    key_version: &'static str,
}

impl SecretCipher {
    /// Build from settings. An empty `SECRETS_MASTER_KEY_B64` falls back to a
    /// fixed development key labeled `dev-v1`.
    pub fn from_settings(settings: &ControlSettings) -> AppResult<Self> {
        if settings.secrets_master_key_b64.trim().is_empty() {
            let key = Sha256::digest(b"nexus-saas-dev-key");
            return Self::from_key_bytes(&key, "dev-v1");
        }
        let key = base64::engine::general_purpose::STANDARD
            .decode(settings.secrets_master_key_b64.trim())
            .map_err(|_| {
                AppError::bad_request("key_invalid", "SECRETS_MASTER_KEY_B64 is not valid base64")
            })?;
        Self::from_key_bytes(&key, "v1")
    }

    pub fn from_key_bytes(key: &[u8], key_version: &'static str) -> AppResult<Self> {
        let key = match key.len() {
            16 => AeadKey::Aes128(Aes128Gcm::new(GenericArray::from_slice(key))),
            24 => AeadKey::Aes192(Aes192Gcm::new(GenericArray::from_slice(key))),
            32 => AeadKey::Aes256(Aes256Gcm::new(GenericArray::from_slice(key))),
            _ => {
                return Err(AppError::bad_request(
                    "key_invalid",
                    "SECRETS_MASTER_KEY_B64 must decode to 16/24/32 bytes",
                ))
            }
        };
        Ok(Self { key, key_version })
    }

    pub fn key_version(&self) -> &'static str {
        self.key_version
    }

    pub fn encrypt(&self, payload: &Value) -> AppResult<EncryptedBlob> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let plaintext = serde_json::to_vec(payload)
            .map_err(|e| AppError::Internal(format!("secret serialization failed: {e}")))?;
        let ciphertext = self
            .seal(&nonce, &plaintext)
            .map_err(|_| AppError::Internal("secret encryption failed".into()))?;
        let b64 = base64::engine::general_purpose::STANDARD;
        Ok(EncryptedBlob {
            nonce_b64: b64.encode(nonce),
            ciphertext_b64: b64.encode(ciphertext),
        })
    }

    pub fn decrypt(&self, blob: &EncryptedBlob) -> AppResult<Value> {
        let b64 = base64::engine::general_purpose::STANDARD;
        let nonce = b64
            .decode(&blob.nonce_b64)
            .map_err(|_| AppError::Internal("secret nonce is not valid base64".into()))?;
        let ciphertext = b64
            .decode(&blob.ciphertext_b64)
            .map_err(|_| AppError::Internal("secret ciphertext is not valid base64".into()))?;
        if nonce.len() != NONCE_LEN {
            return Err(AppError::Internal("secret nonce has wrong length".into()));
        }
        let plaintext = self
            .open(&nonce, &ciphertext)
            .map_err(|_| AppError::Internal("secret decryption failed".into()))?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| AppError::Internal(format!("secret payload is not JSON: {e}")))
    }

    fn seal(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, aes_gcm::Error> {
        let nonce = GenericArray::from_slice(nonce);
        match &self.key {
            AeadKey::Aes128(c) => c.encrypt(nonce, plaintext),
            AeadKey::Aes192(c) => c.encrypt(nonce, plaintext),
            AeadKey::Aes256(c) => c.encrypt(nonce, plaintext),
        }
    }

    fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, aes_gcm::Error> {
        let nonce = GenericArray::from_slice(nonce);
        match &self.key {
            AeadKey::Aes128(c) => c.decrypt(nonce, ciphertext),
            AeadKey::Aes192(c) => c.decrypt(nonce, ciphertext),
            AeadKey::Aes256(c) => c.decrypt(nonce, ciphertext),
        }
    }
}

/// Typed view of the tenant secret blob. The wire representation stays a JSON
/// object so blobs written by earlier revisions round-trip unchanged through
/// the `extra` map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantSecretBlob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_shared_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_defaults_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google: Option<GoogleSecretBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_oauth_last_error: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleSecretBlock {
    pub token_json: Value,
    pub scopes: Vec<String>,
    pub connected_at: String,
}

impl TenantSecretBlob {
    pub fn from_value(value: Value) -> AppResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| AppError::Internal(format!("tenant secret blob is malformed: {e}")))
    }

    pub fn to_value(&self) -> AppResult<Value> {
        serde_json::to_value(self)
            .map_err(|e| AppError::Internal(format!("tenant secret blob serialization failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cipher() -> SecretCipher {
        SecretCipher::from_key_bytes(&[7u8; 32], "test").unwrap()
    }

    #[test]
    fn round_trips_json_payloads() {
        let cipher = cipher();
        let payload = json!({
            "bridge_shared_secret": "abc",
            "nested": {"k": [1, 2, 3]},
            "unicode": "ñ€",
        });
        let blob = cipher.encrypt(&payload).unwrap();
        assert_ne!(blob.nonce_b64, blob.ciphertext_b64);
        assert_eq!(cipher.decrypt(&blob).unwrap(), payload);
    }

    #[test]
    fn fresh_nonce_per_encryption() {
        let cipher = cipher();
        let payload = json!({"a": 1});
        let first = cipher.encrypt(&payload).unwrap();
        let second = cipher.encrypt(&payload).unwrap();
        assert_ne!(first.nonce_b64, second.nonce_b64);
    }

    #[test]
    fn rejects_out_of_band_key_lengths() {
        let err = SecretCipher::from_key_bytes(&[0u8; 17], "test").unwrap_err();
        assert_eq!(err.code(), "key_invalid");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let cipher = cipher();
        let mut blob = cipher.encrypt(&json!({"a": 1})).unwrap();
        blob.ciphertext_b64 = base64::engine::general_purpose::STANDARD.encode([0u8; 32]);
        assert!(cipher.decrypt(&blob).is_err());
    }

    #[test]
    fn secret_blob_preserves_unknown_fields() {
        let raw = json!({
            "bridge_shared_secret": "s",
            "legacy_field": "kept",
        });
        let blob = TenantSecretBlob::from_value(raw.clone()).unwrap();
        let round = blob.to_value().unwrap();
        assert_eq!(round.get("legacy_field"), raw.get("legacy_field"));
        assert_eq!(round.get("bridge_shared_secret"), raw.get("bridge_shared_secret"));
    }
}
