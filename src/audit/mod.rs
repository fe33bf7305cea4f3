//! Append-only audit trail of security-relevant actions.
//!
//! Every state-changing operation records exactly one [`AuditEvent`]. Events
//! are written through an [`AuditSink`] and mirrored to the tracing output.
//! A failing sink is logged and never fails the operation being audited.

pub mod handlers;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info};

use crate::db::AuditSink;
use crate::Result;

/// Upper bound for a single audit query.
pub const MAX_AUDIT_QUERY: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    UserRegistered,
    RegistrationFailed,
    LoginSuccess,
    LoginFailed,
    TokenRefreshed,
    TokenRefreshFailed,
    UserLogout,
    OtpSent,
    OtpRateLimited,
    AccountActivated,
    AccountDeactivated,
    EndnodeRegistered,
    EndnodeDeregistered,
    EndnodeHealth,
    UserCreated,
    UserDeleted,
    VpnStatusUpdate,
    VpnStatsUploaded,
    VpnStatsAccessed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::UserRegistered => "USER_REGISTERED",
            AuditAction::RegistrationFailed => "REGISTRATION_FAILED",
            AuditAction::LoginSuccess => "LOGIN_SUCCESS",
            AuditAction::LoginFailed => "LOGIN_FAILED",
            AuditAction::TokenRefreshed => "TOKEN_REFRESHED",
            AuditAction::TokenRefreshFailed => "TOKEN_REFRESH_FAILED",
            AuditAction::UserLogout => "USER_LOGOUT",
            AuditAction::OtpSent => "OTP_SENT",
            AuditAction::OtpRateLimited => "OTP_RATE_LIMITED",
            AuditAction::AccountActivated => "ACCOUNT_ACTIVATED",
            AuditAction::AccountDeactivated => "ACCOUNT_DEACTIVATED",
            AuditAction::EndnodeRegistered => "ENDNODE_REGISTERED",
            AuditAction::EndnodeDeregistered => "ENDNODE_DEREGISTERED",
            AuditAction::EndnodeHealth => "ENDNODE_HEALTH",
            AuditAction::UserCreated => "USER_CREATED",
            AuditAction::UserDeleted => "USER_DELETED",
            AuditAction::VpnStatusUpdate => "VPN_STATUS_UPDATE",
            AuditAction::VpnStatsUploaded => "VPN_STATS_UPLOADED",
            AuditAction::VpnStatsAccessed => "VPN_STATS_ACCESSED",
        }
    }

    const ALL: [AuditAction; 19] = [
        AuditAction::UserRegistered,
        AuditAction::RegistrationFailed,
        AuditAction::LoginSuccess,
        AuditAction::LoginFailed,
        AuditAction::TokenRefreshed,
        AuditAction::TokenRefreshFailed,
        AuditAction::UserLogout,
        AuditAction::OtpSent,
        AuditAction::OtpRateLimited,
        AuditAction::AccountActivated,
        AuditAction::AccountDeactivated,
        AuditAction::EndnodeRegistered,
        AuditAction::EndnodeDeregistered,
        AuditAction::EndnodeHealth,
        AuditAction::UserCreated,
        AuditAction::UserDeleted,
        AuditAction::VpnStatusUpdate,
        AuditAction::VpnStatsUploaded,
        AuditAction::VpnStatsAccessed,
    ];
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| format!("unknown audit action '{}'", s))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    /// Empty for system-initiated actions.
    pub actor: String,
    pub detail: String,
    pub origin: String,
    pub server_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditFilter {
    pub server_id: Option<String>,
    pub username: Option<String>,
}

impl AuditFilter {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.server_id.as_ref().map_or(true, |id| &event.server_id == id)
            && self.username.as_ref().map_or(true, |u| &event.actor == u)
    }
}

#[derive(Clone)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
    server_id: String,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>, server_id: impl Into<String>) -> Self {
        Self {
            sink,
            server_id: server_id.into(),
        }
    }

    pub async fn record(&self, action: AuditAction, actor: &str, detail: impl Into<String>, origin: &str) {
        let event = AuditEvent {
            timestamp: Utc::now(),
            action,
            actor: actor.to_string(),
            detail: detail.into(),
            origin: origin.to_string(),
            server_id: self.server_id.clone(),
        };

        info!(
            target: "audit",
            action = %event.action,
            actor = %event.actor,
            origin = %event.origin,
            "{}",
            event.detail
        );

        if let Err(e) = self.sink.append(&event).await {
            error!("Failed to write audit event {}: {}", event.action, e);
        }
    }

    pub async fn recent(&self, filter: &AuditFilter, limit: i64) -> Result<Vec<AuditEvent>> {
        self.sink.recent(filter, limit.clamp(1, MAX_AUDIT_QUERY)).await
    }
}
