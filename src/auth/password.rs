//! Password policy and argon2id hashing.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use std::sync::OnceLock;

use crate::error::CredentialError;

pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_PASSWORD_LEN: usize = 128;

/// Checks length and character-class requirements.
pub fn validate_password(password: &str) -> Result<(), CredentialError> {
    let len = password.chars().count();
    if len < MIN_PASSWORD_LEN {
        return Err(CredentialError::Policy(format!(
            "Password must be at least {} characters long",
            MIN_PASSWORD_LEN
        )));
    }
    if len > MAX_PASSWORD_LEN {
        return Err(CredentialError::Policy(format!(
            "Password must be less than {} characters long",
            MAX_PASSWORD_LEN
        )));
    }

    let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if !(has_upper && has_lower && has_digit) {
        return Err(CredentialError::Policy(
            "Password must contain at least one uppercase letter, one lowercase letter, and one digit"
                .to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CredentialStore;

impl CredentialStore {
    pub fn new() -> Self {
        Self
    }

    /// Rejects policy violations before doing any hashing work.
    pub fn hash(&self, password: &str) -> Result<String, CredentialError> {
        validate_password(password)?;
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| CredentialError::Hashing(e.to_string()))
    }

    /// `Ok(false)` on mismatch; errors only for an unparseable stored hash.
    pub fn verify(&self, hash: &str, password: &str) -> Result<bool, CredentialError> {
        let parsed = PasswordHash::new(hash).map_err(|_| CredentialError::MalformedHash)?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }

    /// Spends the same work as a real verification. Used for unknown accounts.
    pub fn burn_verification(&self, password: &str) {
        if let Some(hash) = dummy_hash() {
            let _ = self.verify(hash, password);
        }
    }

    pub async fn hash_blocking(&self, password: String) -> Result<String, CredentialError> {
        let store = *self;
        tokio::task::spawn_blocking(move || store.hash(&password))
            .await
            .map_err(|e| CredentialError::Hashing(e.to_string()))?
    }

    pub async fn verify_blocking(&self, hash: String, password: String) -> Result<bool, CredentialError> {
        let store = *self;
        tokio::task::spawn_blocking(move || store.verify(&hash, &password))
            .await
            .map_err(|e| CredentialError::Hashing(e.to_string()))?
    }

    pub async fn burn_blocking(&self, password: String) {
        let store = *self;
        let _ = tokio::task::spawn_blocking(move || store.burn_verification(&password)).await;
    }
}

fn dummy_hash() -> Option<&'static str> {
    static DUMMY: OnceLock<Option<String>> = OnceLock::new();
    DUMMY
        .get_or_init(|| {
            let salt = SaltString::generate(&mut OsRng);
            Argon2::default()
                .hash_password(b"dummy-password-for-timing", &salt)
                .map(|hash| hash.to_string())
                .ok()
        })
        .as_deref()
}
