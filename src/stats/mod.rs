//! Connection events and traffic samples reported by VPN clients.

pub mod handlers;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::audit::{AuditAction, AuditLog};
use crate::auth::Identity;
use crate::db::{ConnectionEvent, ConnectionStatus, UsageSample, UsageStore, UsageSummary};
use crate::error::{AppError, AuthError};
use crate::Result;

/// Connection events returned alongside a usage summary.
pub const HISTORY_LIMIT: i64 = 50;

#[derive(Debug, Clone, Deserialize)]
pub struct StatusUpdate {
    pub status: String,
    pub server_id: String,
    #[serde(default)]
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrafficReport {
    pub server_id: String,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub duration_seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageView {
    pub summary: UsageSummary,
    pub connections: Vec<ConnectionEvent>,
}

pub struct UsageService {
    store: Arc<dyn UsageStore>,
    audit: AuditLog,
}

impl UsageService {
    pub fn new(store: Arc<dyn UsageStore>, audit: AuditLog) -> Self {
        Self { store, audit }
    }

    pub async fn update_status(&self, caller: &Identity, update: StatusUpdate, origin: &str) -> Result<ConnectionEvent> {
        let status = update
            .status
            .parse::<ConnectionStatus>()
            .map_err(AppError::ValidationError)?;
        if update.server_id.trim().is_empty() {
            return Err(AppError::ValidationError("server_id is required".to_string()));
        }

        let event = ConnectionEvent::new(
            caller.phone_number.clone(),
            status,
            update.server_id,
            update.ip_address.filter(|ip| !ip.is_empty()),
        );
        self.store.record_connection(&event).await?;

        self.audit
            .record(
                AuditAction::VpnStatusUpdate,
                &caller.phone_number,
                format!("status {} on {}", status.as_str(), event.server_id),
                origin,
            )
            .await;
        Ok(event)
    }

    pub async fn upload_stats(&self, caller: &Identity, report: TrafficReport, origin: &str) -> Result<UsageSample> {
        if report.bytes_in < 0 || report.bytes_out < 0 || report.duration_seconds < 0 {
            return Err(AppError::ValidationError(
                "bytes_in, bytes_out and duration_seconds must not be negative".to_string(),
            ));
        }
        if report.server_id.trim().is_empty() {
            return Err(AppError::ValidationError("server_id is required".to_string()));
        }

        let sample = UsageSample {
            identity: caller.phone_number.clone(),
            server_id: report.server_id,
            bytes_in: report.bytes_in,
            bytes_out: report.bytes_out,
            duration_seconds: report.duration_seconds,
            created_at: Utc::now(),
        };
        self.store.record_usage(&sample).await?;

        self.audit
            .record(
                AuditAction::VpnStatsUploaded,
                &caller.phone_number,
                format!(
                    "{} bytes in, {} bytes out over {}s on {}",
                    sample.bytes_in, sample.bytes_out, sample.duration_seconds, sample.server_id
                ),
                origin,
            )
            .await;
        Ok(sample)
    }

    /// Callers read their own usage. Admins may read anyone's.
    pub async fn user_stats(&self, caller: &Identity, username: &str, origin: &str) -> Result<UsageView> {
        if caller.phone_number != username && !caller.is_admin() {
            return Err(AuthError::Forbidden.into());
        }

        let summary = self.store.usage_summary(username).await?;
        let connections = self.store.connection_history(username, HISTORY_LIMIT).await?;

        self.audit
            .record(
                AuditAction::VpnStatsAccessed,
                &caller.phone_number,
                format!("usage of {} read", username),
                origin,
            )
            .await;
        Ok(UsageView { summary, connections })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, Role};

    fn caller(phone: &str, role: Role) -> Identity {
        Identity {
            phone_number: phone.to_string(),
            user_id: 1,
            role,
        }
    }

    fn service() -> (UsageService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let service = UsageService::new(store.clone(), AuditLog::new(store.clone(), "management-server"));
        (service, store)
    }

    fn report(bytes_in: i64) -> TrafficReport {
        TrafficReport {
            server_id: "node-eu-1".to_string(),
            bytes_in,
            bytes_out: 2048,
            duration_seconds: 60,
        }
    }

    #[tokio::test]
    async fn test_usage_totals() {
        let (service, _store) = service();
        let alice = caller("+19995550100", Role::User);

        service
            .update_status(
                &alice,
                StatusUpdate {
                    status: "connected".to_string(),
                    server_id: "node-eu-1".to_string(),
                    ip_address: Some("10.8.0.2".to_string()),
                },
                "127.0.0.1",
            )
            .await
            .unwrap();
        service.upload_stats(&alice, report(1024), "127.0.0.1").await.unwrap();
        service.upload_stats(&alice, report(512), "127.0.0.1").await.unwrap();

        let view = service.user_stats(&alice, "+19995550100", "127.0.0.1").await.unwrap();
        assert_eq!(view.summary.total_bytes_in, 1536);
        assert_eq!(view.summary.total_bytes_out, 4096);
        assert_eq!(view.summary.connection_count, 2);
        assert!(view.summary.last_connection.is_some());
        assert_eq!(view.connections.len(), 1);
    }

    #[tokio::test]
    async fn test_negative_values_rejected() {
        let (service, store) = service();
        let alice = caller("+19995550100", Role::User);
        let result = service.upload_stats(&alice, report(-1), "127.0.0.1").await;
        assert!(matches!(result, Err(AppError::ValidationError(_))));
        assert!(store.audit_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_status_rejected() {
        let (service, _store) = service();
        let update = StatusUpdate {
            status: "sleeping".to_string(),
            server_id: "node-eu-1".to_string(),
            ip_address: None,
        };
        let result = service.update_status(&caller("+19995550100", Role::User), update, "").await;
        assert!(matches!(result, Err(AppError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_reading_other_users_requires_admin() {
        let (service, store) = service();
        let bob = caller("+19995550199", Role::User);
        let result = service.user_stats(&bob, "+19995550100", "").await;
        assert!(matches!(result, Err(AppError::AuthError(AuthError::Forbidden))));

        let admin = caller("+19995550000", Role::Admin);
        assert!(service.user_stats(&admin, "+19995550100", "").await.is_ok());
        assert_eq!(store.audit_events().await.len(), 1);
    }
}
