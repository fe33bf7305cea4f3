//! One-time codes proving control of a phone number.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::auth::RateLimiter;
use crate::config::OtpConfig;
use crate::error::OtpError;
use crate::Result;

/// Outcome of an atomic consume attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpCheck {
    /// No live challenge for the identifier.
    Missing,
    /// A challenge exists and was left in place.
    Mismatch,
    /// Wrong code on the last allowed attempt. The challenge is gone.
    Exhausted,
    /// The code matched and the challenge is gone.
    Consumed,
}

/// Single-slot keyed storage for live challenges.
#[async_trait]
pub trait OtpStore: Send + Sync {
    /// Replaces any live challenge for `identifier`.
    async fn put(&self, identifier: &str, code: &str, expires_at: DateTime<Utc>) -> Result<()>;

    /// The live code, if any. Expired codes are treated as absent.
    async fn get(&self, identifier: &str) -> Result<Option<String>>;

    async fn delete(&self, identifier: &str) -> Result<bool>;

    /// Compares and deletes in one step so at most one caller wins. A
    /// mismatch counts against the challenge, which is dropped once
    /// `max_attempts` wrong codes have been presented.
    async fn consume(&self, identifier: &str, code: &str, max_attempts: u32) -> Result<OtpCheck>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OtpDelivery: Send + Sync {
    async fn deliver(&self, identifier: &str, code: &str) -> std::result::Result<(), OtpError>;
}

#[derive(Debug)]
struct Challenge {
    code: String,
    expires_at: DateTime<Utc>,
    attempts: u32,
}

#[derive(Debug, Default)]
pub struct InMemoryOtpStore {
    challenges: Mutex<HashMap<String, Challenge>>,
}

impl InMemoryOtpStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OtpStore for InMemoryOtpStore {
    async fn put(&self, identifier: &str, code: &str, expires_at: DateTime<Utc>) -> Result<()> {
        self.challenges
            .lock()
            .await
            .insert(
                identifier.to_string(),
                Challenge {
                    code: code.to_string(),
                    expires_at,
                    attempts: 0,
                },
            );
        Ok(())
    }

    async fn get(&self, identifier: &str) -> Result<Option<String>> {
        let challenges = self.challenges.lock().await;
        Ok(challenges
            .get(identifier)
            .filter(|challenge| challenge.expires_at > Utc::now())
            .map(|challenge| challenge.code.clone()))
    }

    async fn delete(&self, identifier: &str) -> Result<bool> {
        Ok(self.challenges.lock().await.remove(identifier).is_some())
    }

    async fn consume(&self, identifier: &str, code: &str, max_attempts: u32) -> Result<OtpCheck> {
        let mut challenges = self.challenges.lock().await;
        let check = match challenges.get_mut(identifier) {
            None => return Ok(OtpCheck::Missing),
            Some(challenge) if challenge.expires_at <= Utc::now() => OtpCheck::Missing,
            Some(challenge) if challenge.code == code => OtpCheck::Consumed,
            Some(challenge) => {
                challenge.attempts += 1;
                if challenge.attempts < max_attempts {
                    return Ok(OtpCheck::Mismatch);
                }
                OtpCheck::Exhausted
            }
        };
        challenges.remove(identifier);
        Ok(check)
    }
}

/// Records that a code went out without writing the code anywhere.
#[derive(Debug, Default)]
pub struct LogDelivery;

#[async_trait]
impl OtpDelivery for LogDelivery {
    async fn deliver(&self, identifier: &str, _code: &str) -> std::result::Result<(), OtpError> {
        info!("Verification code dispatched to {}", identifier);
        Ok(())
    }
}

/// Mock SMS gateway keeping the last code sent to each identifier.
#[derive(Debug, Clone, Default)]
pub struct OutboxDelivery {
    sent: Arc<RwLock<HashMap<String, String>>>,
}

impl OutboxDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn last_code(&self, identifier: &str) -> Option<String> {
        self.sent.read().await.get(identifier).cloned()
    }
}

#[async_trait]
impl OtpDelivery for OutboxDelivery {
    async fn deliver(&self, identifier: &str, code: &str) -> std::result::Result<(), OtpError> {
        self.sent
            .write()
            .await
            .insert(identifier.to_string(), code.to_string());
        Ok(())
    }
}

pub struct OtpService {
    store: Arc<dyn OtpStore>,
    delivery: Arc<dyn OtpDelivery>,
    limiter: RateLimiter,
    code_length: u32,
    max_attempts: u32,
    ttl: Duration,
}

impl OtpService {
    pub fn new(
        store: Arc<dyn OtpStore>,
        delivery: Arc<dyn OtpDelivery>,
        limiter: RateLimiter,
        config: &OtpConfig,
    ) -> Self {
        Self {
            store,
            delivery,
            limiter,
            code_length: config.code_length,
            max_attempts: config.max_attempts,
            ttl: Duration::seconds(config.ttl_secs),
        }
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl.num_seconds()
    }

    /// Issues a fresh code, replacing any live one, and hands it to delivery.
    ///
    /// The returned code is for the delivery path and tests only.
    pub async fn send(&self, identifier: &str) -> std::result::Result<String, OtpError> {
        let code = self.generate_code();
        self.store
            .put(identifier, &code, Utc::now() + self.ttl)
            .await
            .map_err(OtpError::Store)?;

        if let Err(e) = self.delivery.deliver(identifier, &code).await {
            warn!("Verification code delivery to {} failed: {}", identifier, e);
            // an undeliverable code must not stay usable
            if let Err(e) = self.store.delete(identifier).await {
                warn!("Failed to drop undelivered code for {}: {}", identifier, e);
            }
            return Err(e);
        }
        Ok(code)
    }

    /// `Ok(false)` on mismatch. A match deletes the challenge, and so does
    /// running out of attempts.
    pub async fn verify(&self, identifier: &str, code: &str) -> std::result::Result<bool, OtpError> {
        let check = self
            .store
            .consume(identifier, code, self.max_attempts)
            .await
            .map_err(OtpError::Store)?;
        match check {
            OtpCheck::Consumed => Ok(true),
            OtpCheck::Mismatch => Ok(false),
            OtpCheck::Exhausted => {
                warn!("Verification code for {} dropped after {} wrong attempts", identifier, self.max_attempts);
                Ok(false)
            }
            OtpCheck::Missing => Err(OtpError::NoChallenge),
        }
    }

    pub async fn check_rate_limit(&self, key: &str, bucket: &str, limit: u32, window_secs: i64) -> bool {
        self.limiter.check_rate_limit(key, bucket, limit, window_secs).await
    }

    fn generate_code(&self) -> String {
        let upper = 10u32.pow(self.code_length);
        let value = rand::thread_rng().gen_range(0..upper);
        format!("{:0width$}", value, width = self.code_length as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::auth::rate_limit::OTP_BUCKET;

    fn service_with(delivery: Arc<dyn OtpDelivery>) -> (OtpService, Arc<InMemoryOtpStore>) {
        let settings = Settings::new_for_test().unwrap();
        let store = Arc::new(InMemoryOtpStore::new());
        let service = OtpService::new(store.clone(), delivery, RateLimiter::new(), &settings.otp);
        (service, store)
    }

    #[tokio::test]
    async fn test_code_is_six_digits_and_delivered() {
        let outbox = OutboxDelivery::new();
        let (otp, _) = service_with(Arc::new(outbox.clone()));

        let code = otp.send("+19995550100").await.unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(outbox.last_code("+19995550100").await, Some(code));
        assert_eq!(otp.ttl_secs(), 300);
    }

    #[tokio::test]
    async fn test_verify_is_single_use() {
        let (otp, _) = service_with(Arc::new(LogDelivery));
        let code = otp.send("+19995550100").await.unwrap();

        assert!(otp.verify("+19995550100", &code).await.unwrap());
        assert!(matches!(
            otp.verify("+19995550100", &code).await,
            Err(OtpError::NoChallenge)
        ));
    }

    #[tokio::test]
    async fn test_mismatch_keeps_challenge() {
        let (otp, store) = service_with(Arc::new(LogDelivery));
        let code = otp.send("+19995550100").await.unwrap();
        let wrong = if code == "000000" { "111111" } else { "000000" };

        assert!(!otp.verify("+19995550100", wrong).await.unwrap());
        assert_eq!(store.get("+19995550100").await.unwrap(), Some(code.clone()));
        assert!(otp.verify("+19995550100", &code).await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_guesses_drop_challenge() {
        let (otp, store) = service_with(Arc::new(LogDelivery));
        let code = otp.send("+19995550100").await.unwrap();
        let wrong = if code == "000000" { "111111" } else { "000000" };

        for _ in 0..5 {
            assert!(!otp.verify("+19995550100", wrong).await.unwrap());
        }
        assert_eq!(store.get("+19995550100").await.unwrap(), None);
        // the right code no longer helps once the cap is hit
        assert!(matches!(otp.verify("+19995550100", &code).await, Err(OtpError::NoChallenge)));
    }

    #[tokio::test]
    async fn test_resend_resets_attempts() {
        let store = InMemoryOtpStore::new();
        let expires_at = Utc::now() + Duration::seconds(60);
        store.put("+19995550100", "123456", expires_at).await.unwrap();
        assert_eq!(store.consume("+19995550100", "000000", 2).await.unwrap(), OtpCheck::Mismatch);

        store.put("+19995550100", "654321", expires_at).await.unwrap();
        assert_eq!(store.consume("+19995550100", "000000", 2).await.unwrap(), OtpCheck::Mismatch);
        assert_eq!(store.consume("+19995550100", "000000", 2).await.unwrap(), OtpCheck::Exhausted);
        assert_eq!(store.consume("+19995550100", "654321", 2).await.unwrap(), OtpCheck::Missing);
    }

    #[tokio::test]
    async fn test_no_challenge() {
        let (otp, _) = service_with(Arc::new(LogDelivery));
        assert!(matches!(otp.verify("+19995550100", "123456").await, Err(OtpError::NoChallenge)));
    }

    #[tokio::test]
    async fn test_new_send_overwrites_old_code() {
        let (otp, store) = service_with(Arc::new(LogDelivery));
        otp.send("+19995550100").await.unwrap();
        let second = otp.send("+19995550100").await.unwrap();
        assert_eq!(store.get("+19995550100").await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_expired_challenge_is_missing() {
        let store = InMemoryOtpStore::new();
        store
            .put("+19995550100", "123456", Utc::now() - Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(store.get("+19995550100").await.unwrap(), None);
        assert_eq!(store.consume("+19995550100", "123456", 5).await.unwrap(), OtpCheck::Missing);
    }

    #[tokio::test]
    async fn test_concurrent_verify_single_winner() {
        let (otp, _) = service_with(Arc::new(LogDelivery));
        let otp = Arc::new(otp);
        let code = otp.send("+19995550100").await.unwrap();

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let otp = otp.clone();
                let code = code.clone();
                tokio::spawn(async move { otp.verify("+19995550100", &code).await })
            })
            .collect();

        let mut winners = 0;
        for attempt in attempts {
            if let Ok(true) = attempt.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_failed_delivery_discards_code() {
        let mut delivery = MockOtpDelivery::new();
        delivery
            .expect_deliver()
            .times(1)
            .returning(|_, _| Err(OtpError::Delivery("gateway down".to_string())));
        let (otp, store) = service_with(Arc::new(delivery));

        assert!(matches!(otp.send("+19995550100").await, Err(OtpError::Delivery(_))));
        assert_eq!(store.get("+19995550100").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rate_limit_bucket() {
        let (otp, _) = service_with(Arc::new(LogDelivery));
        for _ in 0..3 {
            assert!(otp.check_rate_limit("+19995550100", OTP_BUCKET, 3, 300).await);
        }
        assert!(!otp.check_rate_limit("+19995550100", OTP_BUCKET, 3, 300).await);
    }
}
