use actix_web::dev::Payload;
use actix_web::http::header;
use actix_web::{web, FromRequest, HttpRequest};
use futures::future::{ready, Ready};
use std::net::SocketAddr;

use crate::auth::Identity;
use crate::error::{AppError, AuthError};
use crate::AppState;

/// Address recorded in audit events and used as the API rate-limit key.
pub fn client_origin(req: &HttpRequest) -> String {
    let trusted = req
        .app_data::<web::Data<AppState>>()
        .map(|state| state.config.rate_limit.trusted_proxies.as_slice())
        .unwrap_or(&[]);
    let info = req.connection_info();
    origin_from(req.peer_addr(), info.realip_remote_addr(), trusted)
}

/// The socket peer's IP, or the forwarded client address when the peer is a
/// trusted proxy. Forwarding headers from anyone else are ignored.
pub fn origin_from(peer: Option<SocketAddr>, forwarded: Option<&str>, trusted_proxies: &[String]) -> String {
    let Some(peer) = peer else {
        return "unknown".to_string();
    };
    let peer_ip = peer.ip().to_string();
    if trusted_proxies.iter().any(|proxy| *proxy == peer_ip) {
        if let Some(forwarded) = forwarded.filter(|f| !f.is_empty()) {
            return forwarded.to_string();
        }
    }
    peer_ip
}

fn resolve(req: &HttpRequest) -> Result<Identity, AppError> {
    let state = req
        .app_data::<web::Data<AppState>>()
        .ok_or_else(|| AppError::InternalError("application state not configured".to_string()))?;
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());
    state.auth.authenticate(authorization)
}

/// Any caller holding a valid token.
#[derive(Debug, Clone)]
pub struct Authenticated(pub Identity);

impl FromRequest for Authenticated {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(resolve(req).map(Authenticated))
    }
}

/// A caller whose token carries the admin role.
#[derive(Debug, Clone)]
pub struct AdminOnly(pub Identity);

impl FromRequest for AdminOnly {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(resolve(req).and_then(|identity| {
            if identity.is_admin() {
                Ok(AdminOnly(identity))
            } else {
                Err(AuthError::Forbidden.into())
            }
        }))
    }
}
