//! Storage layer for the management server.
//!
//! Components talk to storage through the traits below. `DbOperations`
//! backs them with PostgreSQL, `MemoryStore` keeps everything in process.

pub mod memory;
pub mod models;
pub mod operations;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::audit::{AuditEvent, AuditFilter};
use crate::Result;

pub use memory::MemoryStore;
pub use models::{
    Account, ConnectionEvent, ConnectionStatus, EndNode, EndNodeSummary, Location, NewAccount,
    NewEndNode, Protocol, Role, UsageSample, UsageSummary, UserBinding,
};
pub use operations::DbOperations;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_account(&self, phone_number: &str) -> Result<Option<Account>>;

    /// Fails with `AppError::Conflict` when the phone number is taken.
    async fn create_account(&self, account: NewAccount) -> Result<Account>;

    async fn touch_last_login(&self, account_id: i64, at: DateTime<Utc>) -> Result<()>;

    /// Returns false when no such account exists.
    async fn set_active(&self, phone_number: &str, active: bool) -> Result<bool>;
}

#[async_trait]
pub trait FleetStore: Send + Sync {
    async fn upsert_node(&self, node: NewEndNode) -> Result<EndNode>;

    /// Removes the node and its bindings. Returns false if it was unknown.
    async fn remove_node(&self, node_id: &str) -> Result<bool>;

    async fn get_node(&self, node_id: &str) -> Result<Option<EndNode>>;

    async fn list_nodes(&self) -> Result<Vec<EndNode>>;

    async fn update_node_health(
        &self,
        node_id: &str,
        status: &str,
        response_ms: Option<i32>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Inserts unless (username, server_id) already exists. Returns true if inserted.
    async fn insert_binding(&self, binding: &UserBinding) -> Result<bool>;

    async fn get_binding(&self, username: &str, node_id: &str) -> Result<Option<UserBinding>>;

    /// All bindings, oldest first.
    async fn list_bindings(&self) -> Result<Vec<UserBinding>>;

    async fn bindings_for_user(&self, username: &str) -> Result<Vec<UserBinding>>;

    async fn delete_user_bindings(&self, username: &str) -> Result<u64>;

    async fn list_locations(&self) -> Result<Vec<Location>>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn record_connection(&self, event: &ConnectionEvent) -> Result<()>;

    async fn record_usage(&self, sample: &UsageSample) -> Result<()>;

    async fn usage_summary(&self, identity: &str) -> Result<UsageSummary>;

    /// Newest first.
    async fn connection_history(&self, identity: &str, limit: i64) -> Result<Vec<ConnectionEvent>>;
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: &AuditEvent) -> Result<()>;

    /// Newest first.
    async fn recent(&self, filter: &AuditFilter, limit: i64) -> Result<Vec<AuditEvent>>;
}
