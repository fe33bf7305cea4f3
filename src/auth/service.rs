use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::{AuditAction, AuditLog};
use crate::auth::otp::OtpService;
use crate::auth::password::{validate_password, CredentialStore};
use crate::auth::rate_limit::OTP_BUCKET;
use crate::auth::token::{Identity, TokenService};
use crate::config::OtpConfig;
use crate::db::{Account, AccountStore, NewAccount, Role};
use crate::error::{AppError, AuthError, OtpError};
use crate::Result;

/// Strips spaces and dashes and checks the result is 10-15 digits with an
/// optional leading `+`.
pub fn normalize_phone(raw: &str) -> Result<String> {
    let phone: String = raw.chars().filter(|c| *c != ' ' && *c != '-').collect();
    if phone.is_empty() {
        return Err(AppError::ValidationError("Phone number is required".to_string()));
    }
    if phone.len() < 10 || phone.len() > 15 {
        return Err(AppError::ValidationError(
            "Phone number must be between 10 and 15 characters".to_string(),
        ));
    }
    let digits = phone.strip_prefix('+').unwrap_or(&phone);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(AppError::ValidationError(
            "Phone number must contain only digits and optional + prefix".to_string(),
        ));
    }
    Ok(phone)
}

/// A freshly issued token and the account it was issued for.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub account: Account,
}

#[derive(Debug, Clone)]
pub struct Refreshed {
    pub token: String,
    pub refreshed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OtpDispatch {
    pub phone_number: String,
    pub expires_in: i64,
}

/// Registration, login and session handling on top of the token, OTP and
/// credential primitives. Each public operation records one audit event.
pub struct AuthGateway {
    tokens: TokenService,
    otp: OtpService,
    credentials: CredentialStore,
    accounts: Arc<dyn AccountStore>,
    audit: AuditLog,
    otp_limit: u32,
    otp_window_secs: i64,
}

impl AuthGateway {
    pub fn new(
        tokens: TokenService,
        otp: OtpService,
        accounts: Arc<dyn AccountStore>,
        audit: AuditLog,
        otp_config: &OtpConfig,
    ) -> Self {
        Self {
            tokens,
            otp,
            credentials: CredentialStore::new(),
            accounts,
            audit,
            otp_limit: otp_config.max_requests,
            otp_window_secs: otp_config.window_secs,
        }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub async fn register(
        &self,
        phone_number: &str,
        password: &str,
        otp_code: &str,
        origin: &str,
    ) -> Result<Session> {
        let phone = normalize_phone(phone_number)?;
        validate_password(password)?;
        if otp_code.trim().is_empty() {
            return Err(AppError::ValidationError("Verification code is required".to_string()));
        }

        let verified = match self.otp.verify(&phone, otp_code.trim()).await {
            Ok(verified) => verified,
            Err(OtpError::NoChallenge) => false,
            Err(e) => return Err(e.into()),
        };
        if !verified {
            self.audit
                .record(AuditAction::RegistrationFailed, &phone, "invalid or expired verification code", origin)
                .await;
            return Err(AuthError::InvalidOtp.into());
        }

        if self.accounts.find_account(&phone).await?.is_some() {
            self.audit
                .record(AuditAction::RegistrationFailed, &phone, "phone number already registered", origin)
                .await;
            return Err(AppError::Conflict(
                "User with this phone number already exists".to_string(),
            ));
        }

        let password_hash = self.credentials.hash_blocking(password.to_string()).await?;
        let account = match self
            .accounts
            .create_account(NewAccount {
                phone_number: phone.clone(),
                password_hash,
                role: Role::User,
            })
            .await
        {
            Ok(account) => account,
            Err(e) => {
                let detail = match &e {
                    AppError::Conflict(_) => "phone number already registered",
                    _ => "account could not be stored",
                };
                self.audit
                    .record(AuditAction::RegistrationFailed, &phone, detail, origin)
                    .await;
                return Err(e);
            }
        };

        let token = self.tokens.issue(&account.phone_number, account.id, account.role)?;
        self.audit
            .record(
                AuditAction::UserRegistered,
                &account.phone_number,
                format!("user_id={}", account.id),
                origin,
            )
            .await;
        info!("Registered account {} ({})", account.id, account.phone_number);

        Ok(Session { token, account })
    }

    pub async fn login(&self, phone_number: &str, password: &str, origin: &str) -> Result<Session> {
        let phone = match normalize_phone(phone_number) {
            Ok(phone) => phone,
            Err(_) => {
                self.audit
                    .record(AuditAction::LoginFailed, phone_number, "malformed phone number", origin)
                    .await;
                return Err(AuthError::InvalidCredentials.into());
            }
        };

        let found = match self.accounts.find_account(&phone).await {
            Ok(found) => found,
            Err(e) => return self.login_errored(&phone, "account lookup failed", e, origin).await,
        };
        let account = match found {
            Some(account) => account,
            None => {
                self.credentials.burn_blocking(password.to_string()).await;
                return self.login_failed(&phone, "unknown account", origin).await;
            }
        };

        let matches = self
            .credentials
            .verify_blocking(account.password_hash.clone(), password.to_string())
            .await;
        match matches {
            Ok(true) => {}
            Ok(false) => return self.login_failed(&phone, "password mismatch", origin).await,
            Err(e) => {
                warn!("Stored credential for account {} is unusable: {}", account.id, e);
                self.audit
                    .record(AuditAction::LoginFailed, &phone, "stored credential unusable", origin)
                    .await;
                return Err(e.into());
            }
        }
        if !account.is_active {
            return self.login_failed(&phone, "account inactive", origin).await;
        }

        let now = Utc::now();
        if let Err(e) = self.accounts.touch_last_login(account.id, now).await {
            return self.login_errored(&phone, "last-login update failed", e, origin).await;
        }
        let token = match self.tokens.issue(&account.phone_number, account.id, account.role) {
            Ok(token) => token,
            Err(e) => return self.login_errored(&phone, "token issuance failed", e.into(), origin).await,
        };
        self.audit
            .record(AuditAction::LoginSuccess, &phone, format!("user_id={}", account.id), origin)
            .await;

        Ok(Session {
            token,
            account: Account {
                last_login: Some(now),
                ..account
            },
        })
    }

    async fn login_failed<T>(&self, phone: &str, reason: &str, origin: &str) -> Result<T> {
        self.audit.record(AuditAction::LoginFailed, phone, reason, origin).await;
        Err(AuthError::InvalidCredentials.into())
    }

    /// Internal failures are audited too, then surface unchanged.
    async fn login_errored<T>(&self, phone: &str, reason: &str, error: AppError, origin: &str) -> Result<T> {
        warn!("Login for {} aborted: {}: {}", phone, reason, error);
        self.audit.record(AuditAction::LoginFailed, phone, reason, origin).await;
        Err(error)
    }

    pub async fn refresh(&self, token: &str, origin: &str) -> Result<Refreshed> {
        match self.tokens.refresh(token) {
            Ok(token) => {
                let actor = self.tokens.peek_identity(&token).unwrap_or_default();
                self.audit
                    .record(AuditAction::TokenRefreshed, &actor, "token refreshed", origin)
                    .await;
                Ok(Refreshed {
                    token,
                    refreshed_at: Utc::now(),
                })
            }
            Err(e) => {
                let actor = self.tokens.peek_identity(token).unwrap_or_default();
                self.audit
                    .record(AuditAction::TokenRefreshFailed, &actor, e.to_string(), origin)
                    .await;
                Err(e.into())
            }
        }
    }

    /// Stateless: the token stays valid until it expires.
    pub async fn logout(&self, authorization: Option<&str>, origin: &str) -> Result<DateTime<Utc>> {
        let identity = self.authenticate(authorization)?;
        self.audit
            .record(AuditAction::UserLogout, &identity.phone_number, "logout", origin)
            .await;
        Ok(Utc::now())
    }

    pub async fn send_otp(&self, phone_number: &str, origin: &str) -> Result<OtpDispatch> {
        let phone = normalize_phone(phone_number)?;

        if !self
            .otp
            .check_rate_limit(&phone, OTP_BUCKET, self.otp_limit, self.otp_window_secs)
            .await
        {
            self.audit
                .record(AuditAction::OtpRateLimited, &phone, "too many verification requests", origin)
                .await;
            return Err(AppError::RateLimited);
        }

        // the code stays on the delivery path
        self.otp.send(&phone).await?;
        self.audit
            .record(AuditAction::OtpSent, &phone, "verification code sent", origin)
            .await;

        Ok(OtpDispatch {
            phone_number: phone,
            expires_in: self.otp.ttl_secs(),
        })
    }

    /// Resolves an `Authorization: Bearer <token>` header to the caller.
    pub fn authenticate(&self, authorization: Option<&str>) -> Result<Identity> {
        let token = authorization
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;

        Ok(self.tokens.validate(token)?.into())
    }

    pub async fn set_account_active(
        &self,
        actor: &Identity,
        phone_number: &str,
        active: bool,
        origin: &str,
    ) -> Result<()> {
        if !actor.is_admin() {
            return Err(AuthError::Forbidden.into());
        }
        let phone = normalize_phone(phone_number)?;
        if !self.accounts.set_active(&phone, active).await? {
            return Err(AppError::NotFound(format!("Account '{}' not found", phone)));
        }

        let action = if active {
            AuditAction::AccountActivated
        } else {
            AuditAction::AccountDeactivated
        };
        self.audit
            .record(action, &actor.phone_number, format!("account={}", phone), origin)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::otp::{InMemoryOtpStore, OutboxDelivery};
    use crate::auth::RateLimiter;
    use crate::config::Settings;
    use crate::db::{MemoryStore, MockAccountStore};
    use crate::error::{DatabaseError, TokenError};

    const PHONE: &str = "+19995550100";
    const PASSWORD: &str = "Abcd1234";

    struct Fixture {
        gateway: AuthGateway,
        store: Arc<MemoryStore>,
        outbox: OutboxDelivery,
    }

    fn fixture() -> Fixture {
        let settings = Settings::new_for_test().unwrap();
        let store = Arc::new(MemoryStore::new());
        let outbox = OutboxDelivery::new();
        let otp = OtpService::new(
            Arc::new(InMemoryOtpStore::new()),
            Arc::new(outbox.clone()),
            RateLimiter::new(),
            &settings.otp,
        );
        let gateway = AuthGateway::new(
            TokenService::new(&settings.auth.jwt_secret).unwrap(),
            otp,
            store.clone(),
            AuditLog::new(store.clone(), "management-server"),
            &settings.otp,
        );
        Fixture { gateway, store, outbox }
    }

    impl Fixture {
        async fn register(&self, phone: &str, password: &str) -> Result<Session> {
            self.gateway.send_otp(phone, "127.0.0.1").await?;
            let code = self.outbox.last_code(phone).await.unwrap_or_default();
            self.gateway.register(phone, password, &code, "127.0.0.1").await
        }

        async fn actions(&self) -> Vec<AuditAction> {
            self.store.audit_events().await.into_iter().map(|e| e.action).collect()
        }
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("+1 999-555-0100").unwrap(), PHONE);
        assert_eq!(normalize_phone("9995550100").unwrap(), "9995550100");
        assert!(normalize_phone("").is_err());
        assert!(normalize_phone("12345").is_err());
        assert!(normalize_phone("+1999555010a").is_err());
        assert!(normalize_phone("1+999555010").is_err());
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let f = fixture();
        let registered = f.register(PHONE, PASSWORD).await.unwrap();
        assert_eq!(registered.account.phone_number, PHONE);

        let claims = f.gateway.tokens().validate(&registered.token).unwrap();
        assert_eq!(claims.user_id, registered.account.id);
        assert_eq!(claims.role, Role::User);

        let logged_in = f.gateway.login(PHONE, PASSWORD, "127.0.0.1").await.unwrap();
        assert_ne!(logged_in.token, registered.token);
        assert_eq!(
            f.actions().await,
            vec![AuditAction::OtpSent, AuditAction::UserRegistered, AuditAction::LoginSuccess]
        );
    }

    #[tokio::test]
    async fn test_duplicate_registration_keeps_first_hash() {
        let f = fixture();
        f.register(PHONE, PASSWORD).await.unwrap();
        let original = f.store.find_account(PHONE).await.unwrap().unwrap();

        let second = f.register(PHONE, "Zyxw9876").await;
        assert!(matches!(second, Err(AppError::Conflict(_))));

        let after = f.store.find_account(PHONE).await.unwrap().unwrap();
        assert_eq!(after.password_hash, original.password_hash);
        assert_eq!(f.actions().await.last(), Some(&AuditAction::RegistrationFailed));
    }

    #[tokio::test]
    async fn test_register_with_wrong_otp() {
        let f = fixture();
        f.gateway.send_otp(PHONE, "127.0.0.1").await.unwrap();
        let code = f.outbox.last_code(PHONE).await.unwrap();
        let wrong = if code == "000000" { "111111" } else { "000000" };

        let result = f.gateway.register(PHONE, PASSWORD, wrong, "127.0.0.1").await;
        assert!(matches!(result, Err(AppError::AuthError(AuthError::InvalidOtp))));
        assert!(f.store.find_account(PHONE).await.unwrap().is_none());
        assert_eq!(f.actions().await.last(), Some(&AuditAction::RegistrationFailed));
    }

    #[tokio::test]
    async fn test_register_without_challenge() {
        let f = fixture();
        let result = f.gateway.register(PHONE, PASSWORD, "123456", "127.0.0.1").await;
        assert!(matches!(result, Err(AppError::AuthError(AuthError::InvalidOtp))));
    }

    #[tokio::test]
    async fn test_weak_password_rejected_before_otp() {
        let f = fixture();
        f.gateway.send_otp(PHONE, "127.0.0.1").await.unwrap();
        let code = f.outbox.last_code(PHONE).await.unwrap();

        let result = f.gateway.register(PHONE, "password", &code, "127.0.0.1").await;
        assert!(matches!(result, Err(AppError::ValidationError(_))));
        // code is still live
        assert!(f.gateway.register(PHONE, PASSWORD, &code, "127.0.0.1").await.is_ok());
    }

    #[tokio::test]
    async fn test_login_failures_are_indistinguishable() {
        let f = fixture();
        f.register(PHONE, PASSWORD).await.unwrap();

        let unknown = f.gateway.login("+19995550199", PASSWORD, "127.0.0.1").await.unwrap_err();
        let mismatch = f.gateway.login(PHONE, "Wrong1234", "127.0.0.1").await.unwrap_err();
        assert_eq!(unknown.public_message(), mismatch.public_message());
        assert!(matches!(unknown, AppError::AuthError(AuthError::InvalidCredentials)));

        let failures = f
            .actions()
            .await
            .into_iter()
            .filter(|a| *a == AuditAction::LoginFailed)
            .count();
        assert_eq!(failures, 2);
    }

    fn gateway_over(accounts: MockAccountStore, audit: Arc<MemoryStore>) -> AuthGateway {
        let settings = Settings::new_for_test().unwrap();
        let otp = OtpService::new(
            Arc::new(InMemoryOtpStore::new()),
            Arc::new(OutboxDelivery::new()),
            RateLimiter::new(),
            &settings.otp,
        );
        AuthGateway::new(
            TokenService::new(&settings.auth.jwt_secret).unwrap(),
            otp,
            Arc::new(accounts),
            AuditLog::new(audit, "management-server"),
            &settings.otp,
        )
    }

    fn unavailable() -> AppError {
        AppError::DatabaseError(DatabaseError::ConnectionError("pool timed out".to_string()))
    }

    #[tokio::test]
    async fn test_storage_failure_on_lookup_is_audited() {
        let mut accounts = MockAccountStore::new();
        accounts.expect_find_account().times(1).returning(|_| Err(unavailable()));
        let audit = Arc::new(MemoryStore::new());
        let gateway = gateway_over(accounts, audit.clone());

        let result = gateway.login(PHONE, PASSWORD, "127.0.0.1").await;
        assert!(matches!(result, Err(AppError::DatabaseError(_))));

        let events = audit.audit_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, AuditAction::LoginFailed);
        assert_eq!(events[0].actor, PHONE);
    }

    #[tokio::test]
    async fn test_storage_failure_on_last_login_is_audited() {
        let hash = CredentialStore::new().hash(PASSWORD).unwrap();
        let mut accounts = MockAccountStore::new();
        accounts.expect_find_account().returning(move |phone| {
            Ok(Some(Account {
                id: 7,
                phone_number: phone.to_string(),
                password_hash: hash.clone(),
                role: Role::User,
                created_at: Utc::now(),
                last_login: None,
                is_active: true,
            }))
        });
        accounts.expect_touch_last_login().times(1).returning(|_, _| Err(unavailable()));
        let audit = Arc::new(MemoryStore::new());
        let gateway = gateway_over(accounts, audit.clone());

        assert!(gateway.login(PHONE, PASSWORD, "127.0.0.1").await.is_err());
        let actions: Vec<AuditAction> = audit.audit_events().await.into_iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::LoginFailed]);
    }

    #[tokio::test]
    async fn test_inactive_account_cannot_login() {
        let f = fixture();
        f.register(PHONE, PASSWORD).await.unwrap();
        f.store.set_active(PHONE, false).await.unwrap();

        let result = f.gateway.login(PHONE, PASSWORD, "127.0.0.1").await;
        assert!(matches!(result, Err(AppError::AuthError(AuthError::InvalidCredentials))));
    }

    #[tokio::test]
    async fn test_login_updates_last_login() {
        let f = fixture();
        let registered = f.register(PHONE, PASSWORD).await.unwrap();
        let session = f.gateway.login(PHONE, PASSWORD, "127.0.0.1").await.unwrap();

        let stored = f.store.find_account(PHONE).await.unwrap().unwrap();
        assert_eq!(stored.last_login, session.account.last_login);
        assert!(stored.last_login >= registered.account.last_login);
    }

    #[tokio::test]
    async fn test_authenticate_header() {
        let f = fixture();
        let session = f.register(PHONE, PASSWORD).await.unwrap();

        let header = format!("Bearer {}", session.token);
        let identity = f.gateway.authenticate(Some(&header)).unwrap();
        assert_eq!(identity.phone_number, PHONE);

        assert!(matches!(
            f.gateway.authenticate(None),
            Err(AppError::AuthError(AuthError::MissingToken))
        ));
        assert!(matches!(
            f.gateway.authenticate(Some(&session.token)),
            Err(AppError::AuthError(AuthError::MissingToken))
        ));
        assert!(matches!(
            f.gateway.authenticate(Some("Bearer garbage")),
            Err(AppError::AuthError(AuthError::InvalidToken))
        ));
    }

    #[tokio::test]
    async fn test_refresh_too_early_is_audited() {
        let f = fixture();
        let session = f.register(PHONE, PASSWORD).await.unwrap();

        let result = f.gateway.refresh(&session.token, "127.0.0.1").await;
        assert!(matches!(result, Err(AppError::AuthError(AuthError::RefreshTooEarly))));
        assert_eq!(f.actions().await.last(), Some(&AuditAction::TokenRefreshFailed));
    }

    #[tokio::test]
    async fn test_refresh_in_window() {
        let f = fixture();
        let issued_at = Utc::now() - chrono::Duration::minutes(23 * 60 + 30);
        let token = f.gateway.tokens().issue_at(PHONE, 1, Role::User, issued_at).unwrap();

        let refreshed = f.gateway.refresh(&token, "127.0.0.1").await.unwrap();
        assert_eq!(f.gateway.tokens().peek_identity(&refreshed.token), Ok(PHONE.to_string()));
        assert_eq!(f.actions().await, vec![AuditAction::TokenRefreshed]);
    }

    #[tokio::test]
    async fn test_logout_requires_valid_token() {
        let f = fixture();
        let session = f.register(PHONE, PASSWORD).await.unwrap();
        let header = format!("Bearer {}", session.token);

        f.gateway.logout(Some(&header), "127.0.0.1").await.unwrap();
        assert_eq!(f.actions().await.last(), Some(&AuditAction::UserLogout));
        // no revocation
        assert!(f.gateway.authenticate(Some(&header)).is_ok());

        assert!(f.gateway.logout(None, "127.0.0.1").await.is_err());
    }

    #[tokio::test]
    async fn test_send_otp_rate_limited() {
        let f = fixture();
        for _ in 0..3 {
            f.gateway.send_otp(PHONE, "127.0.0.1").await.unwrap();
        }
        assert!(matches!(
            f.gateway.send_otp(PHONE, "127.0.0.1").await,
            Err(AppError::RateLimited)
        ));
        assert_eq!(f.actions().await.last(), Some(&AuditAction::OtpRateLimited));
    }

    #[tokio::test]
    async fn test_set_account_active_requires_admin() {
        let f = fixture();
        let session = f.register(PHONE, PASSWORD).await.unwrap();
        let user: Identity = f.gateway.tokens().validate(&session.token).unwrap().into();

        let result = f.gateway.set_account_active(&user, PHONE, false, "127.0.0.1").await;
        assert!(matches!(result, Err(AppError::AuthError(AuthError::Forbidden))));

        let admin = Identity {
            phone_number: "+19995550000".to_string(),
            user_id: 99,
            role: Role::Admin,
        };
        f.gateway.set_account_active(&admin, PHONE, false, "127.0.0.1").await.unwrap();
        assert!(!f.store.find_account(PHONE).await.unwrap().unwrap().is_active);
        assert_eq!(f.actions().await.last(), Some(&AuditAction::AccountDeactivated));

        let missing = f.gateway.set_account_active(&admin, "+19995550111", true, "127.0.0.1").await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_token_error_mapping() {
        let err: AppError = TokenError::Expired.into();
        assert!(matches!(err, AppError::AuthError(AuthError::TokenExpired)));
    }
}
