use thiserror::Error;
use actix_web::{ResponseError, HttpResponse, http::StatusCode};
use serde_json::json;
use tracing::error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    AuthError(#[from] AuthError),

    #[error("Proxy error: {0}")]
    ProxyError(#[from] ProxyError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited")]
    RateLimited,
}

impl AppError {
    /// Text that is safe to hand to the caller. Internal detail stays in the logs.
    pub fn public_message(&self) -> String {
        match self {
            AppError::AuthError(e) => e.public_message().to_string(),
            AppError::ValidationError(msg) => msg.clone(),
            AppError::Conflict(msg) => msg.clone(),
            AppError::NotFound(msg) => msg.clone(),
            AppError::RateLimited => "Rate limit exceeded".to_string(),
            AppError::ProxyError(_) => "Failed to reach the end-node".to_string(),
            AppError::DatabaseError(DatabaseError::NotFound) => "Record not found".to_string(),
            AppError::DatabaseError(_)
            | AppError::ConfigError(_)
            | AppError::InternalError(_) => "Internal server error".to_string(),
        }
    }
}

// Implement conversion from config::ConfigError
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

// Implement conversion from sqlx::Error
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(err.into())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => AppError::AuthError(AuthError::TokenExpired),
            TokenError::TooEarly => AppError::AuthError(AuthError::RefreshTooEarly),
            TokenError::Malformed | TokenError::SignatureMismatch => {
                AppError::AuthError(AuthError::InvalidToken)
            }
            TokenError::EmptyIdentity => {
                AppError::ValidationError("Identity cannot be empty".to_string())
            }
            TokenError::WeakSecret => AppError::ConfigError(err.to_string()),
            TokenError::Signing(detail) => AppError::InternalError(detail),
        }
    }
}

impl From<OtpError> for AppError {
    fn from(err: OtpError) -> Self {
        match err {
            OtpError::NoChallenge => {
                AppError::ValidationError("No verification code was requested for this phone number".to_string())
            }
            OtpError::Delivery(detail) => AppError::InternalError(detail),
            OtpError::Store(e) => e,
        }
    }
}

impl From<CredentialError> for AppError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Policy(msg) => AppError::ValidationError(msg),
            CredentialError::MalformedHash | CredentialError::Hashing(_) => {
                AppError::InternalError(err.to_string())
            }
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }

        let mut body = json!({
            "success": false,
            "message": self.public_message(),
        });
        if let AppError::ProxyError(ProxyError::Upstream { status: Some(code), .. }) = self {
            body["upstream_status"] = json!(code);
        }
        HttpResponse::build(status).json(body)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::AuthError(e) => match e {
                AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
                AuthError::TokenExpired => StatusCode::UNAUTHORIZED,
                AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
                AuthError::MissingToken => StatusCode::UNAUTHORIZED,
                AuthError::InvalidOtp => StatusCode::UNAUTHORIZED,
                AuthError::Forbidden => StatusCode::FORBIDDEN,
                AuthError::RefreshTooEarly => StatusCode::BAD_REQUEST,
            },
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::ProxyError(_) => StatusCode::BAD_GATEWAY,
            AppError::DatabaseError(DatabaseError::NotFound) => StatusCode::NOT_FOUND,
            AppError::DatabaseError(DatabaseError::Duplicate) => StatusCode::CONFLICT,
            AppError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Missing or malformed authorization header")]
    MissingToken,

    #[error("Invalid verification code")]
    InvalidOtp,

    #[error("Forbidden")]
    Forbidden,

    #[error("Token is not within the refresh window")]
    RefreshTooEarly,
}

impl AuthError {
    fn public_message(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "Invalid phone number or password",
            AuthError::TokenExpired | AuthError::InvalidToken | AuthError::MissingToken => {
                "Unauthorized"
            }
            AuthError::InvalidOtp => "Invalid verification code",
            AuthError::Forbidden => "Forbidden",
            AuthError::RefreshTooEarly => "Token is not yet eligible for refresh",
        }
    }
}

/// Failures of the session token primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,

    #[error("signature or algorithm mismatch")]
    SignatureMismatch,

    #[error("token expired")]
    Expired,

    #[error("token has more than the refresh window left")]
    TooEarly,

    #[error("identity cannot be empty")]
    EmptyIdentity,

    #[error("signing secret must be at least 32 bytes")]
    WeakSecret,

    #[error("failed to sign token: {0}")]
    Signing(String),
}

#[derive(Error, Debug)]
pub enum OtpError {
    #[error("no challenge on file")]
    NoChallenge,

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("store failure: {0}")]
    Store(AppError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("{0}")]
    Policy(String),

    #[error("stored password hash is malformed")]
    MalformedHash,

    #[error("hashing failed: {0}")]
    Hashing(String),
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("upstream request failed (status {status:?}): {detail}")]
    Upstream { status: Option<u16>, detail: String },

    #[error("Invalid request URL: {0}")]
    InvalidUrl(String),

    #[error("upstream artifact exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("Stored node credential could not be opened: {0}")]
    Credential(String),
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::Upstream {
            status: err.status().map(|s| s.as_u16()),
            detail: err.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Record not found")]
    NotFound,

    #[error("Duplicate record")]
    Duplicate,
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => DatabaseError::Duplicate,
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseError::ConnectionError(err.to_string())
            }
            _ => DatabaseError::QueryError(err.to_string()),
        }
    }
}
