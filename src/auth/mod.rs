//! Account authentication for the management server.
//!
//! Session tokens, one-time codes, password hashing and the gateway that
//! ties them to the account store.

pub mod extractor;
pub mod handlers;
pub mod otp;
pub mod password;
pub mod rate_limit;
mod service;
pub mod token;

pub use extractor::{client_origin, origin_from, AdminOnly, Authenticated};
pub use otp::{InMemoryOtpStore, LogDelivery, OtpCheck, OtpDelivery, OtpService, OtpStore, OutboxDelivery};
pub use password::CredentialStore;
pub use rate_limit::{RateLimiter, API_BUCKET, OTP_BUCKET};
pub use service::{normalize_phone, AuthGateway, OtpDispatch, Refreshed, Session};
pub use token::{Claims, Identity, TokenService};
