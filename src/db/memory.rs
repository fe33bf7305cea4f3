use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::audit::{AuditEvent, AuditFilter};
use crate::db::models::*;
use crate::db::{AccountStore, AuditSink, FleetStore, UsageStore};
use crate::error::AppError;
use crate::Result;

#[derive(Debug, Default)]
struct Inner {
    accounts: HashMap<String, Account>,
    next_account_id: i64,
    nodes: BTreeMap<String, EndNode>,
    bindings: Vec<UserBinding>,
    locations: Vec<Location>,
    connections: Vec<ConnectionEvent>,
    usage: Vec<UsageSample>,
    audit: Vec<AuditEvent>,
}

/// In-process implementation of every storage trait.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_location(&self, location: Location) {
        let mut inner = self.inner.write().await;
        inner.locations.retain(|l| l.id != location.id);
        inner.locations.push(location);
    }

    /// Promotes an existing account. Role changes only reach tokens issued afterwards.
    pub async fn grant_admin(&self, phone_number: &str) -> bool {
        match self.inner.write().await.accounts.get_mut(phone_number) {
            Some(account) => {
                account.role = Role::Admin;
                true
            }
            None => false,
        }
    }

    pub async fn audit_events(&self) -> Vec<AuditEvent> {
        self.inner.read().await.audit.clone()
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn find_account(&self, phone_number: &str) -> Result<Option<Account>> {
        Ok(self.inner.read().await.accounts.get(phone_number).cloned())
    }

    async fn create_account(&self, account: NewAccount) -> Result<Account> {
        let mut inner = self.inner.write().await;
        if inner.accounts.contains_key(&account.phone_number) {
            return Err(AppError::Conflict(
                "User with this phone number already exists".to_string(),
            ));
        }

        inner.next_account_id += 1;
        let now = Utc::now();
        let created = Account {
            id: inner.next_account_id,
            phone_number: account.phone_number,
            password_hash: account.password_hash,
            role: account.role,
            created_at: now,
            last_login: Some(now),
            is_active: true,
        };
        inner.accounts.insert(created.phone_number.clone(), created.clone());
        Ok(created)
    }

    async fn touch_last_login(&self, account_id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(account) = inner.accounts.values_mut().find(|a| a.id == account_id) {
            account.last_login = Some(at);
        }
        Ok(())
    }

    async fn set_active(&self, phone_number: &str, active: bool) -> Result<bool> {
        let mut inner = self.inner.write().await;
        Ok(match inner.accounts.get_mut(phone_number) {
            Some(account) => {
                account.is_active = active;
                true
            }
            None => false,
        })
    }
}

#[async_trait]
impl FleetStore for MemoryStore {
    async fn upsert_node(&self, node: NewEndNode) -> Result<EndNode> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let stored = match inner.nodes.get(&node.id) {
            Some(existing) => EndNode {
                id: node.id,
                host: node.host,
                port: node.port,
                status: node.status,
                location_id: node.location_id,
                credential: node.credential,
                registered_at: existing.registered_at,
                last_seen: Some(now),
                last_response_ms: existing.last_response_ms,
            },
            None => EndNode {
                id: node.id,
                host: node.host,
                port: node.port,
                status: node.status,
                location_id: node.location_id,
                credential: node.credential,
                registered_at: now,
                last_seen: Some(now),
                last_response_ms: None,
            },
        };
        inner.nodes.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn remove_node(&self, node_id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let removed = inner.nodes.remove(node_id).is_some();
        inner.bindings.retain(|b| b.server_id != node_id);
        Ok(removed)
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<EndNode>> {
        Ok(self.inner.read().await.nodes.get(node_id).cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<EndNode>> {
        Ok(self.inner.read().await.nodes.values().cloned().collect())
    }

    async fn update_node_health(
        &self,
        node_id: &str,
        status: &str,
        response_ms: Option<i32>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        Ok(match inner.nodes.get_mut(node_id) {
            Some(node) => {
                node.status = status.to_string();
                node.last_seen = Some(at);
                node.last_response_ms = response_ms;
                true
            }
            None => false,
        })
    }

    async fn insert_binding(&self, binding: &UserBinding) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if !inner.nodes.contains_key(&binding.server_id) {
            return Err(AppError::NotFound(format!(
                "End-node '{}' not found",
                binding.server_id
            )));
        }
        let exists = inner
            .bindings
            .iter()
            .any(|b| b.username == binding.username && b.server_id == binding.server_id);
        if exists {
            return Ok(false);
        }
        inner.bindings.push(binding.clone());
        Ok(true)
    }

    async fn get_binding(&self, username: &str, node_id: &str) -> Result<Option<UserBinding>> {
        Ok(self
            .inner
            .read()
            .await
            .bindings
            .iter()
            .find(|b| b.username == username && b.server_id == node_id)
            .cloned())
    }

    async fn list_bindings(&self) -> Result<Vec<UserBinding>> {
        let mut bindings = self.inner.read().await.bindings.clone();
        bindings.sort_by_key(|b| b.created_at);
        Ok(bindings)
    }

    async fn bindings_for_user(&self, username: &str) -> Result<Vec<UserBinding>> {
        Ok(self
            .inner
            .read()
            .await
            .bindings
            .iter()
            .filter(|b| b.username == username)
            .cloned()
            .collect())
    }

    async fn delete_user_bindings(&self, username: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.bindings.len();
        inner.bindings.retain(|b| b.username != username);
        Ok((before - inner.bindings.len()) as u64)
    }

    async fn list_locations(&self) -> Result<Vec<Location>> {
        let mut locations: Vec<Location> = self
            .inner
            .read()
            .await
            .locations
            .iter()
            .filter(|l| l.enabled)
            .cloned()
            .collect();
        locations.sort_by(|a, b| (&a.country, &a.city).cmp(&(&b.country, &b.city)));
        Ok(locations)
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn record_connection(&self, event: &ConnectionEvent) -> Result<()> {
        self.inner.write().await.connections.push(event.clone());
        Ok(())
    }

    async fn record_usage(&self, sample: &UsageSample) -> Result<()> {
        self.inner.write().await.usage.push(sample.clone());
        Ok(())
    }

    async fn usage_summary(&self, identity: &str) -> Result<UsageSummary> {
        let inner = self.inner.read().await;
        let mut summary = UsageSummary {
            username: identity.to_string(),
            ..Default::default()
        };
        for sample in inner.usage.iter().filter(|s| s.identity == identity) {
            summary.total_bytes_in += sample.bytes_in;
            summary.total_bytes_out += sample.bytes_out;
            summary.total_duration += sample.duration_seconds;
            summary.connection_count += 1;
        }
        summary.last_connection = inner
            .connections
            .iter()
            .filter(|c| c.identity == identity && c.status == ConnectionStatus::Connected)
            .map(|c| c.created_at)
            .max();
        Ok(summary)
    }

    async fn connection_history(&self, identity: &str, limit: i64) -> Result<Vec<ConnectionEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .connections
            .iter()
            .rev()
            .filter(|c| c.identity == identity)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn append(&self, event: &AuditEvent) -> Result<()> {
        self.inner.write().await.audit.push(event.clone());
        Ok(())
    }

    async fn recent(&self, filter: &AuditFilter, limit: i64) -> Result<Vec<AuditEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .audit
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
