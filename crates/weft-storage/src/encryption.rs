// AES-256-GCM encryption with key rotation for stored provider API keys.
// Keys are versioned as "key_id:base64_key"; the primary key encrypts new
// values, previous keys stay available for decryption until re-encryption.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;
const PAYLOAD_VERSION: u8 = 1;

/// Encrypted payload stored in the provider_keys table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedValue {
    /// Payload format version
    pub version: u8,
    /// Key ID of the master key used
    pub key_id: String,
    /// Base64-encoded nonce
    pub nonce: String,
    /// Base64-encoded ciphertext (includes auth tag)
    pub ciphertext: String,
}

#[derive(Clone)]
struct VersionedKey {
    id: String,
    cipher: Aes256Gcm,
}

/// Encryption service with key rotation. Thread-safe; clone freely.
#[derive(Clone)]
pub struct EncryptionService {
    primary: Arc<VersionedKey>,
    keys: Arc<HashMap<String, Aes256Gcm>>,
}

impl EncryptionService {
    /// Create from versioned key strings in format "key_id:base64_key".
    /// The first key encrypts; all keys decrypt.
    pub fn new(primary_key: &str, previous_keys: &[&str]) -> Result<Self> {
        let (primary_id, primary_cipher) = Self::parse_versioned_key(primary_key)?;

        let mut keys = HashMap::new();
        keys.insert(primary_id.clone(), primary_cipher.clone());
        for key_str in previous_keys {
            let (id, cipher) = Self::parse_versioned_key(key_str)?;
            if keys.contains_key(&id) {
                anyhow::bail!("Duplicate key ID: {}", id);
            }
            keys.insert(id, cipher);
        }

        Ok(Self {
            primary: Arc::new(VersionedKey {
                id: primary_id,
                cipher: primary_cipher,
            }),
            keys: Arc::new(keys),
        })
    }

    /// Create from environment variables.
    /// - MASTER_ENCRYPTION_KEY: primary key (required)
    /// - MASTER_ENCRYPTION_KEY_PREVIOUS: previous key for rotation (optional)
    pub fn from_env() -> Result<Self> {
        let primary = std::env::var("MASTER_ENCRYPTION_KEY")
            .context("MASTER_ENCRYPTION_KEY environment variable not set")?;
        let previous: Vec<String> = std::env::var("MASTER_ENCRYPTION_KEY_PREVIOUS")
            .ok()
            .into_iter()
            .collect();
        let previous_refs: Vec<&str> = previous.iter().map(|s| s.as_str()).collect();
        Self::new(&primary, &previous_refs)
    }

    fn parse_versioned_key(key_str: &str) -> Result<(String, Aes256Gcm)> {
        let (key_id, encoded) = key_str
            .split_once(':')
            .context("Invalid key format, expected 'key_id:base64_key'")?;

        let key_bytes = BASE64
            .decode(encoded)
            .context("Failed to decode key from base64")?;
        if key_bytes.len() != KEY_SIZE {
            anyhow::bail!(
                "Key must be {} bytes, got {} for key '{}'",
                KEY_SIZE,
                key_bytes.len(),
                key_id
            );
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| anyhow::anyhow!("Failed to create cipher for key '{}': {}", key_id, e))?;
        Ok((key_id.to_string(), cipher))
    }

    /// Encrypt a secret with the primary key. Returns JSON-encoded
    /// SealedValue bytes for database storage.
    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .primary
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

        let sealed = SealedValue {
            version: PAYLOAD_VERSION,
            key_id: self.primary.id.clone(),
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(&ciphertext),
        };
        serde_json::to_vec(&sealed).context("Failed to serialize sealed value")
    }

    /// Decrypt using the key the payload names
    pub fn decrypt(&self, data: &[u8]) -> Result<String> {
        let sealed: SealedValue =
            serde_json::from_slice(data).context("Failed to parse sealed value")?;

        if sealed.version != PAYLOAD_VERSION {
            anyhow::bail!("Unsupported sealed value version: {}", sealed.version);
        }

        let cipher = self
            .keys
            .get(&sealed.key_id)
            .with_context(|| format!("Unknown key_id '{}'", sealed.key_id))?;

        let nonce_bytes = BASE64.decode(&sealed.nonce).context("Bad nonce")?;
        let ciphertext = BASE64.decode(&sealed.ciphertext).context("Bad ciphertext")?;

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| anyhow::anyhow!("Decryption failed (data may be corrupted): {}", e))?;

        String::from_utf8(plaintext).context("Decrypted data is not valid UTF-8")
    }

    /// Key ID of a sealed value without decrypting it; identifies records
    /// that still need re-encryption after a rotation.
    pub fn key_id(data: &[u8]) -> Result<String> {
        let sealed: SealedValue =
            serde_json::from_slice(data).context("Failed to parse sealed value")?;
        Ok(sealed.key_id)
    }

    /// Re-encrypt with the primary key; None when already current
    pub fn reencrypt(&self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        if Self::key_id(data)? == self.primary.id {
            return Ok(None);
        }
        let plaintext = self.decrypt(data)?;
        Ok(Some(self.encrypt(&plaintext)?))
    }
}

/// Generate a new random key in versioned format "key_id:base64_key"
pub fn generate_master_key(key_id: &str) -> String {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    format!("{}:{}", key_id, BASE64.encode(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let service = EncryptionService::new(&generate_master_key("mk-v1"), &[]).unwrap();
        let sealed = service.encrypt("sk-test-api-key-12345").unwrap();
        assert_eq!(service.decrypt(&sealed).unwrap(), "sk-test-api-key-12345");
    }

    #[test]
    fn same_plaintext_yields_different_ciphertext() {
        let service = EncryptionService::new(&generate_master_key("mk-v1"), &[]).unwrap();
        let a = service.encrypt("secret").unwrap();
        let b = service.encrypt("secret").unwrap();
        assert_ne!(a, b);
        assert_eq!(service.decrypt(&a).unwrap(), service.decrypt(&b).unwrap());
    }

    #[test]
    fn rotation_keeps_old_values_readable() {
        let key_v1 = generate_master_key("mk-v1");
        let key_v2 = generate_master_key("mk-v2");

        let old_service = EncryptionService::new(&key_v1, &[]).unwrap();
        let sealed_v1 = old_service.encrypt("secret").unwrap();

        let new_service = EncryptionService::new(&key_v2, &[&key_v1]).unwrap();
        assert_eq!(new_service.decrypt(&sealed_v1).unwrap(), "secret");

        let resealed = new_service.reencrypt(&sealed_v1).unwrap().unwrap();
        assert_eq!(EncryptionService::key_id(&resealed).unwrap(), "mk-v2");
        assert!(new_service.reencrypt(&resealed).unwrap().is_none());
    }

    #[test]
    fn unknown_key_fails_decryption() {
        let sealed = EncryptionService::new(&generate_master_key("mk-v1"), &[])
            .unwrap()
            .encrypt("secret")
            .unwrap();
        let other = EncryptionService::new(&generate_master_key("mk-v2"), &[]).unwrap();
        assert!(other.decrypt(&sealed).is_err());
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert!(EncryptionService::new("no-colon", &[]).is_err());
        assert!(EncryptionService::new("mk-v1:not-base64!!!", &[]).is_err());
        let short = format!("mk-v1:{}", BASE64.encode([0u8; 8]));
        assert!(EncryptionService::new(&short, &[]).is_err());
        let dup = generate_master_key("mk-v1");
        let dup2 = generate_master_key("mk-v1");
        assert!(EncryptionService::new(&dup, &[&dup2]).is_err());
    }
}
