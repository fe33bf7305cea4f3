use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ProxyError;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;
const KEY_CONTEXT: &[u8] = b"vpn-control-plane/node-credential/v1";

/// A node API key encrypted at rest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SealedCredential {
    pub encrypted_data: String,
    pub nonce: String,
    pub created_at: i64,
}

/// Seals and opens node API keys with AES-256-GCM.
pub struct NodeCredentialCipher {
    encryption_key: [u8; KEY_SIZE],
}

impl NodeCredentialCipher {
    pub fn new(encryption_key: [u8; KEY_SIZE]) -> Self {
        Self { encryption_key }
    }

    /// Derives the cipher key from the token signing secret.
    pub fn from_secret(secret: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_CONTEXT);
        hasher.update(secret.as_bytes());

        let mut encryption_key = [0u8; KEY_SIZE];
        encryption_key.copy_from_slice(&hasher.finalize());
        Self { encryption_key }
    }

    pub fn seal(&self, api_key: &str) -> Result<SealedCredential, ProxyError> {
        let cipher = Aes256Gcm::new_from_slice(&self.encryption_key)
            .map_err(|e| ProxyError::Credential(format!("cipher init: {}", e)))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let encrypted = cipher
            .encrypt(nonce, api_key.as_bytes())
            .map_err(|e| ProxyError::Credential(format!("encryption failed: {}", e)))?;

        Ok(SealedCredential {
            encrypted_data: BASE64.encode(encrypted),
            nonce: BASE64.encode(nonce_bytes),
            created_at: Utc::now().timestamp(),
        })
    }

    pub fn open(&self, sealed: &SealedCredential) -> Result<String, ProxyError> {
        let cipher = Aes256Gcm::new_from_slice(&self.encryption_key)
            .map_err(|e| ProxyError::Credential(format!("cipher init: {}", e)))?;

        let nonce_bytes = BASE64
            .decode(&sealed.nonce)
            .map_err(|e| ProxyError::Credential(format!("invalid nonce: {}", e)))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(ProxyError::Credential("invalid nonce length".to_string()));
        }
        let nonce = Nonce::from_slice(&nonce_bytes);

        let encrypted_data = BASE64
            .decode(&sealed.encrypted_data)
            .map_err(|e| ProxyError::Credential(format!("invalid ciphertext: {}", e)))?;

        let decrypted = cipher
            .decrypt(nonce, encrypted_data.as_slice())
            .map_err(|_| ProxyError::Credential("decryption failed".to_string()))?;

        String::from_utf8(decrypted).map_err(|e| ProxyError::Credential(format!("invalid UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_and_open() {
        let cipher = NodeCredentialCipher::from_secret("test-secret-0123456789-abcdefghijklmnop");
        let sealed = cipher.seal("node-api-key-123").unwrap();

        assert!(!sealed.encrypted_data.contains("node-api-key-123"));
        assert!(sealed.created_at > 0);
        assert_eq!(cipher.open(&sealed).unwrap(), "node-api-key-123");
    }

    #[test]
    fn test_nonce_differs_per_seal() {
        let cipher = NodeCredentialCipher::from_secret("test-secret-0123456789-abcdefghijklmnop");
        let a = cipher.seal("same").unwrap();
        let b = cipher.seal("same").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.encrypted_data, b.encrypted_data);
    }

    #[test]
    fn test_other_secret_cannot_open() {
        let sealed = NodeCredentialCipher::from_secret("first-secret-0123456789-abcdefghijkl")
            .seal("node-api-key-123")
            .unwrap();
        let other = NodeCredentialCipher::from_secret("second-secret-0123456789-abcdefghijk");
        assert!(matches!(other.open(&sealed), Err(ProxyError::Credential(_))));
    }

    #[test]
    fn test_tampered_nonce_is_rejected() {
        let cipher = NodeCredentialCipher::new([7u8; KEY_SIZE]);
        let mut sealed = cipher.seal("node-api-key-123").unwrap();
        sealed.nonce = BASE64.encode([0u8; 4]);
        assert!(cipher.open(&sealed).is_err());
    }
}
