//! Session token issuance and validation.
//!
//! Tokens are HS256 JWTs signed with the configured secret. The verifier pins
//! the algorithm, so a token signed with anything else is a signature
//! mismatch rather than a successfully decoded claim set.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::MIN_SECRET_LEN;
use crate::db::Role;
use crate::error::TokenError;

pub const TOKEN_ISSUER: &str = "vpn-control-plane-auth";

/// Lifetime of every issued token.
pub const TOKEN_TTL_HOURS: i64 = 24;

/// A token may only be refreshed once its remaining lifetime is at most this.
pub const REFRESH_WINDOW_MINUTES: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub phone_number: String,
    pub user_id: i64,
    pub role: Role,
    pub jti: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub iss: String,
    pub sub: String,
}

impl Claims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

/// The caller resolved from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub phone_number: String,
    pub user_id: i64,
    pub role: Role,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Self {
            phone_number: claims.phone_number,
            user_id: claims.user_id,
            role: claims.role,
        }
    }
}

#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenService {
    /// Fails with [`TokenError::WeakSecret`] for secrets shorter than 32 bytes.
    pub fn new(secret: &str) -> Result<Self, TokenError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(TokenError::WeakSecret);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[TOKEN_ISSUER]);
        validation.set_required_spec_claims(&["exp", "nbf", "iss", "sub"]);
        validation.validate_nbf = true;
        validation.leeway = 0;

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn issue(&self, identity: &str, user_id: i64, role: Role) -> Result<String, TokenError> {
        self.issue_at(identity, user_id, role, Utc::now())
    }

    pub(crate) fn issue_at(
        &self,
        identity: &str,
        user_id: i64,
        role: Role,
        issued_at: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        if identity.trim().is_empty() {
            return Err(TokenError::EmptyIdentity);
        }

        let iat = issued_at.timestamp();
        let claims = Claims {
            phone_number: identity.to_string(),
            user_id,
            role,
            jti: Uuid::new_v4().to_string(),
            iat,
            nbf: iat,
            exp: (issued_at + Duration::hours(TOKEN_TTL_HOURS)).timestamp(),
            iss: TOKEN_ISSUER.to_string(),
            sub: identity.to_string(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    pub fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    TokenError::SignatureMismatch
                }
                _ => TokenError::Malformed,
            })?
            .claims;

        // the library accepts exp == now
        if claims.exp <= Utc::now().timestamp() {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    /// Re-issues a token that is valid and inside its last hour.
    pub fn refresh(&self, token: &str) -> Result<String, TokenError> {
        let claims = self.validate(token)?;
        let remaining = claims.exp - Utc::now().timestamp();
        if remaining > REFRESH_WINDOW_MINUTES * 60 {
            return Err(TokenError::TooEarly);
        }
        self.issue(&claims.phone_number, claims.user_id, claims.role)
    }

    /// Reads the identity without checking the signature. Logging only.
    pub fn peek_identity(&self, token: &str) -> Result<String, TokenError> {
        Ok(Self::peek(token)?.phone_number)
    }

    /// Unverified expiry check. Unparseable tokens count as expired.
    pub fn is_expired(&self, token: &str) -> bool {
        match Self::peek(token) {
            Ok(claims) => claims.exp <= Utc::now().timestamp(),
            Err(_) => true,
        }
    }

    fn peek(token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.set_required_spec_claims::<&str>(&[]);

        decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
            .map(|data| data.claims)
            .map_err(|_| TokenError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-0123456789-abcdefghijklmnop";

    fn service() -> TokenService {
        TokenService::new(SECRET).unwrap()
    }

    #[test]
    fn test_issue_and_validate() {
        let tokens = service();
        let before = Utc::now().timestamp();
        let token = tokens.issue("+19995550100", 7, Role::User).unwrap();

        let claims = tokens.validate(&token).unwrap();
        assert_eq!(claims.phone_number, "+19995550100");
        assert_eq!(claims.sub, "+19995550100");
        assert_eq!(claims.user_id, 7);
        assert_eq!(claims.iss, TOKEN_ISSUER);
        assert!(claims.iat >= before);
        assert_eq!(claims.nbf, claims.iat);
        assert_eq!(claims.exp - claims.iat, TOKEN_TTL_HOURS * 3600);
    }

    #[test]
    fn test_weak_secret_is_rejected() {
        assert!(matches!(TokenService::new(""), Err(TokenError::WeakSecret)));
        assert!(matches!(TokenService::new("short-secret"), Err(TokenError::WeakSecret)));
    }

    #[test]
    fn test_empty_identity() {
        assert_eq!(service().issue("  ", 1, Role::User), Err(TokenError::EmptyIdentity));
    }

    #[test]
    fn test_tokens_are_unique() {
        let tokens = service();
        let a = tokens.issue("+19995550100", 1, Role::User).unwrap();
        let b = tokens.issue("+19995550100", 1, Role::User).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_expired_token() {
        let tokens = service();
        let token = tokens
            .issue_at("+19995550100", 1, Role::User, Utc::now() - Duration::hours(25))
            .unwrap();
        assert_eq!(tokens.validate(&token), Err(TokenError::Expired));
        assert!(tokens.is_expired(&token));
    }

    #[test]
    fn test_wrong_secret() {
        let token = service().issue("+19995550100", 1, Role::User).unwrap();
        let other = TokenService::new("another-secret-0123456789-abcdefghijk").unwrap();
        assert_eq!(other.validate(&token), Err(TokenError::SignatureMismatch));
    }

    #[test]
    fn test_algorithm_is_pinned() {
        let now = Utc::now().timestamp();
        let claims = Claims {
            phone_number: "+19995550100".to_string(),
            user_id: 1,
            role: Role::Admin,
            jti: "x".to_string(),
            iat: now,
            nbf: now,
            exp: now + 3600,
            iss: TOKEN_ISSUER.to_string(),
            sub: "+19995550100".to_string(),
        };
        let forged = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        assert_eq!(service().validate(&forged), Err(TokenError::SignatureMismatch));
    }

    #[test]
    fn test_malformed_token() {
        assert_eq!(service().validate("not-a-token"), Err(TokenError::Malformed));
        assert!(service().peek_identity("not-a-token").is_err());
    }

    #[test]
    fn test_refresh_too_early() {
        let tokens = service();
        let token = tokens.issue("+19995550100", 1, Role::User).unwrap();
        assert_eq!(tokens.refresh(&token), Err(TokenError::TooEarly));
    }

    #[test]
    fn test_refresh_in_window() {
        let tokens = service();
        let issued_at = Utc::now() - Duration::hours(23) - Duration::minutes(30);
        let token = tokens.issue_at("+19995550100", 3, Role::Admin, issued_at).unwrap();
        let original = tokens.validate(&token).unwrap();

        let refreshed = tokens.refresh(&token).unwrap();
        let claims = tokens.validate(&refreshed).unwrap();
        assert_eq!(claims.phone_number, original.phone_number);
        assert_eq!(claims.user_id, 3);
        assert_eq!(claims.role, Role::Admin);
        assert!(claims.exp > original.exp);
    }

    #[test]
    fn test_refresh_of_expired_token_fails() {
        let tokens = service();
        let token = tokens
            .issue_at("+19995550100", 1, Role::User, Utc::now() - Duration::hours(30))
            .unwrap();
        assert_eq!(tokens.refresh(&token), Err(TokenError::Expired));
    }

    #[test]
    fn test_peek_ignores_signature() {
        let token = TokenService::new("another-secret-0123456789-abcdefghijk")
            .unwrap()
            .issue("+19995550100", 1, Role::User)
            .unwrap();
        assert_eq!(service().peek_identity(&token).unwrap(), "+19995550100");
        assert!(!service().is_expired(&token));
    }
}
