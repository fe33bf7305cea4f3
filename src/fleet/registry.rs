use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditLog};
use crate::db::{EndNode, EndNodeSummary, FleetStore, Location, NewEndNode, Protocol, UserBinding};
use crate::error::{AppError, ProxyError};
use crate::fleet::{NodeCredentialCipher, NodeEndpoint, NodeSync};
use crate::Result;

pub const DEFAULT_VPN_PORT: u16 = 1194;

/// Pushes to distinct nodes or users that may be in flight at once.
const SYNC_CONCURRENCY: usize = 8;

const RESERVED_USERNAMES: [&str; 6] = ["admin", "root", "system", "vpnmanager", "postgres", "nobody"];

pub fn validate_username(username: &str) -> Result<()> {
    if username.len() < 3 || username.len() > 32 {
        return Err(AppError::ValidationError(
            "username must be 3-32 characters".to_string(),
        ));
    }
    if !username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(AppError::ValidationError(
            "username must contain only alphanumeric characters and underscores".to_string(),
        ));
    }
    if RESERVED_USERNAMES.iter().any(|r| r.eq_ignore_ascii_case(username)) {
        return Err(AppError::ValidationError(format!(
            "username '{}' is reserved",
            username
        )));
    }
    Ok(())
}

fn validate_node_id(node_id: &str) -> Result<()> {
    let valid = !node_id.is_empty()
        && node_id.len() <= 64
        && node_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(AppError::ValidationError(
            "server_id must be 1-64 characters of letters, digits, '-', '_' or '.'".to_string(),
        ))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeRegistration {
    pub server_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub location_id: Option<i32>,
    /// Key the node expects on its management API.
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BindingRequest {
    pub username: String,
    #[serde(default)]
    pub port: Option<u32>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub target_server_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReconcileTask {
    pub id: Uuid,
    pub node_id: String,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub node_id: String,
    pub created: usize,
    pub confirmed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    pub username: String,
    pub provisioned: Vec<UserBinding>,
    /// Bindings the user already held. Left untouched on the node and in storage.
    pub existing: Vec<UserBinding>,
    pub failed_servers: Vec<String>,
}

/// Directory of end-nodes and the accounts provisioned on them.
pub struct FleetRegistry {
    store: Arc<dyn FleetStore>,
    sync: Arc<dyn NodeSync>,
    cipher: Arc<NodeCredentialCipher>,
    audit: AuditLog,
    scheme: String,
    tasks: mpsc::UnboundedSender<ReconcileTask>,
}

impl FleetRegistry {
    /// The receiver feeds [`crate::fleet::reconcile::spawn_worker`].
    pub fn new(
        store: Arc<dyn FleetStore>,
        sync: Arc<dyn NodeSync>,
        cipher: Arc<NodeCredentialCipher>,
        audit: AuditLog,
        scheme: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<ReconcileTask>) {
        let (tasks, receiver) = mpsc::unbounded_channel();
        let registry = Self {
            store,
            sync,
            cipher,
            audit,
            scheme: scheme.into(),
            tasks,
        };
        (registry, receiver)
    }

    pub fn endpoint(&self, node: &EndNode) -> std::result::Result<NodeEndpoint, ProxyError> {
        NodeEndpoint::resolve(node, &self.scheme, &self.cipher)
    }

    /// Stores the node and queues a reconciliation sweep for it. Sync
    /// failures never fail the registration.
    pub async fn register(&self, actor: &str, request: NodeRegistration, origin: &str) -> Result<EndNodeSummary> {
        validate_node_id(&request.server_id)?;
        if request.host.trim().is_empty() {
            return Err(AppError::ValidationError("host is required".to_string()));
        }
        if request.port == 0 {
            return Err(AppError::ValidationError(
                "port must be between 1 and 65535".to_string(),
            ));
        }

        let credential = request
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .map(|k| self.cipher.seal(k))
            .transpose()?;
        let status = request
            .status
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "online".to_string());

        let node = self
            .store
            .upsert_node(NewEndNode {
                id: request.server_id,
                host: request.host.trim().to_string(),
                port: request.port,
                status,
                location_id: request.location_id,
                credential,
            })
            .await?;

        self.audit
            .record(
                AuditAction::EndnodeRegistered,
                actor,
                format!("end-node {} at {}:{}", node.id, node.host, node.port),
                origin,
            )
            .await;

        let task = ReconcileTask {
            id: Uuid::new_v4(),
            node_id: node.id.clone(),
            enqueued_at: Utc::now(),
        };
        if let Err(e) = self.tasks.send(task) {
            warn!("Reconciliation for {} not queued: {}", node.id, e);
        }

        info!("Registered end-node {} ({}:{})", node.id, node.host, node.port);
        Ok(EndNodeSummary::from(&node))
    }

    /// Idempotent. Returns whether a node was removed.
    pub async fn deregister(&self, actor: &str, node_id: &str, origin: &str) -> Result<bool> {
        let removed = self.store.remove_node(node_id).await?;
        let detail = if removed {
            format!("end-node {} removed", node_id)
        } else {
            format!("end-node {} was not registered", node_id)
        };
        self.audit
            .record(AuditAction::EndnodeDeregistered, actor, detail, origin)
            .await;
        Ok(removed)
    }

    pub async fn record_health(
        &self,
        actor: &str,
        node_id: &str,
        status: &str,
        response_ms: Option<i32>,
        origin: &str,
    ) -> Result<EndNodeSummary> {
        if status.trim().is_empty() {
            return Err(AppError::ValidationError("status is required".to_string()));
        }
        if response_ms.map_or(false, |ms| ms < 0) {
            return Err(AppError::ValidationError(
                "response_time_ms cannot be negative".to_string(),
            ));
        }

        let now = Utc::now();
        if !self.store.update_node_health(node_id, status, response_ms, now).await? {
            return Err(AppError::NotFound(format!("End-node '{}' not found", node_id)));
        }
        self.audit
            .record(
                AuditAction::EndnodeHealth,
                actor,
                format!("end-node {} reported {}", node_id, status),
                origin,
            )
            .await;
        self.get(node_id).await
    }

    pub async fn list(&self) -> Result<Vec<EndNodeSummary>> {
        let nodes = self.store.list_nodes().await?;
        Ok(nodes.iter().map(EndNodeSummary::from).collect())
    }

    pub async fn get(&self, node_id: &str) -> Result<EndNodeSummary> {
        self.node(node_id)
            .await?
            .as_ref()
            .map(EndNodeSummary::from)
            .ok_or_else(|| AppError::NotFound(format!("End-node '{}' not found", node_id)))
    }

    pub async fn node(&self, node_id: &str) -> Result<Option<EndNode>> {
        self.store.get_node(node_id).await
    }

    pub async fn nodes(&self) -> Result<Vec<EndNode>> {
        self.store.list_nodes().await
    }

    /// Enabled locations, ordered by country then city.
    pub async fn locations(&self) -> Result<Vec<Location>> {
        self.store.list_locations().await
    }

    pub async fn binding(&self, username: &str, node_id: &str) -> Result<Option<UserBinding>> {
        self.store.get_binding(username, node_id).await
    }

    pub async fn list_bindings(&self) -> Result<Vec<UserBinding>> {
        self.store.list_bindings().await
    }

    pub async fn user_bindings(&self, username: &str) -> Result<Vec<UserBinding>> {
        let bindings = self.store.bindings_for_user(username).await?;
        if bindings.is_empty() {
            return Err(AppError::NotFound(format!("User '{}' not found", username)));
        }
        Ok(bindings)
    }

    /// Provisions a user on one node, or on every registered node when no
    /// target is given.
    pub async fn create_binding(&self, actor: &str, request: BindingRequest, origin: &str) -> Result<ProvisionReport> {
        validate_username(&request.username)?;
        let port = match request.port {
            None | Some(0) => DEFAULT_VPN_PORT,
            Some(p) => u16::try_from(p).map_err(|_| {
                AppError::ValidationError("port must be between 1 and 65535".to_string())
            })?,
        };
        let protocol = match request.protocol.as_deref() {
            None | Some("") => Protocol::Udp,
            Some(p) => p.parse::<Protocol>().map_err(AppError::ValidationError)?,
        };

        let mut existing = Vec::new();
        let targets = match request.target_server_id.as_deref().filter(|t| !t.is_empty()) {
            Some(node_id) => {
                let node = self
                    .node(node_id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("End-node '{}' not found", node_id)))?;
                if self.binding(&request.username, node_id).await?.is_some() {
                    return Err(AppError::Conflict(format!(
                        "User '{}' already exists on end-node '{}'",
                        request.username, node_id
                    )));
                }
                vec![node]
            }
            None => {
                let nodes = self.nodes().await?;
                if nodes.is_empty() {
                    return Err(AppError::NotFound("No end-nodes are registered".to_string()));
                }
                existing = self.user_bindings(&request.username).await?;
                let bound: HashSet<&str> = existing.iter().map(|b| b.server_id.as_str()).collect();
                let missing: Vec<EndNode> = nodes
                    .into_iter()
                    .filter(|node| !bound.contains(node.id.as_str()))
                    .collect();
                if missing.is_empty() {
                    return Err(AppError::Conflict(format!(
                        "User '{}' already exists on every end-node",
                        request.username
                    )));
                }
                missing
            }
        };

        let now = Utc::now();
        let outcomes: Vec<(String, std::result::Result<Option<UserBinding>, AppError>)> = stream::iter(targets)
            .map(|node| {
                let binding = UserBinding {
                    username: request.username.clone(),
                    server_id: node.id.clone(),
                    port,
                    protocol,
                    created_at: now,
                };
                async move {
                    let outcome = self.push_and_record(&node, binding).await;
                    (node.id, outcome)
                }
            })
            .buffer_unordered(SYNC_CONCURRENCY)
            .collect()
            .await;

        let mut report = ProvisionReport {
            username: request.username.clone(),
            provisioned: Vec::new(),
            existing,
            failed_servers: Vec::new(),
        };
        let mut last_error = None;
        for (node_id, outcome) in outcomes {
            match outcome {
                Ok(Some(binding)) => report.provisioned.push(binding),
                Ok(None) => {
                    // a concurrent create recorded this node first
                    warn!("{} was provisioned on {} concurrently; keeping the stored binding", request.username, node_id);
                    if let Some(stored) = self.binding(&request.username, &node_id).await? {
                        report.existing.push(stored);
                    }
                }
                Err(e) => {
                    warn!("Provisioning {} on {} failed: {}", request.username, node_id, e);
                    report.failed_servers.push(node_id);
                    last_error = Some(e);
                }
            }
        }

        if report.provisioned.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                AppError::Conflict(format!("User '{}' already exists", request.username))
            }));
        }

        self.audit
            .record(
                AuditAction::UserCreated,
                actor,
                format!(
                    "user {} created with port {}, protocol {} on {} end-node(s), {} already present",
                    request.username,
                    port,
                    protocol,
                    report.provisioned.len(),
                    report.existing.len()
                ),
                origin,
            )
            .await;
        Ok(report)
    }

    /// `None` when a binding for the pair was already stored.
    async fn push_and_record(&self, node: &EndNode, binding: UserBinding) -> Result<Option<UserBinding>> {
        let endpoint = self.endpoint(node)?;
        self.sync.provision(&endpoint, &binding).await?;
        let inserted = self.store.insert_binding(&binding).await?;
        Ok(inserted.then_some(binding))
    }

    /// Removes every binding of the user. Node-side revocation is best effort.
    pub async fn delete_user(&self, actor: &str, username: &str, origin: &str) -> Result<u64> {
        let bindings = self.user_bindings(username).await?;

        for binding in &bindings {
            let node = match self.node(&binding.server_id).await? {
                Some(node) => node,
                None => continue,
            };
            let result = match self.endpoint(&node) {
                Ok(endpoint) => self.sync.revoke(&endpoint, username).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!("Revoking {} on {} failed: {}", username, node.id, e);
            }
        }

        let removed = self.store.delete_user_bindings(username).await?;
        self.audit
            .record(
                AuditAction::UserDeleted,
                actor,
                format!("user {} removed from {} end-node(s)", username, removed),
                origin,
            )
            .await;
        Ok(removed)
    }

    /// Brings `node_id` up to parity with the provisioned user set. Each user
    /// is pushed with the port and protocol of their earliest binding.
    pub async fn reconcile(&self, node_id: &str) -> Result<ReconcileReport> {
        let node = self
            .node(node_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("End-node '{}' not found", node_id)))?;
        let endpoint = self.endpoint(&node)?;

        let mut report = ReconcileReport {
            node_id: node.id.clone(),
            ..Default::default()
        };

        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        let bindings = self.store.list_bindings().await?;
        let present: HashSet<&str> = bindings
            .iter()
            .filter(|b| b.server_id == node.id)
            .map(|b| b.username.as_str())
            .collect();
        for template in &bindings {
            if !seen.insert(template.username.as_str()) {
                continue;
            }
            if present.contains(template.username.as_str()) {
                report.confirmed += 1;
                continue;
            }
            pending.push(UserBinding {
                server_id: node.id.clone(),
                created_at: Utc::now(),
                ..template.clone()
            });
        }

        let outcomes: Vec<(String, std::result::Result<bool, AppError>)> = stream::iter(pending)
            .map(|binding| {
                let endpoint = &endpoint;
                async move {
                    let outcome = match self.sync.provision(endpoint, &binding).await {
                        Ok(()) => self.store.insert_binding(&binding).await,
                        Err(e) => Err(e.into()),
                    };
                    (binding.username, outcome)
                }
            })
            .buffer_unordered(SYNC_CONCURRENCY)
            .collect()
            .await;

        for (username, outcome) in outcomes {
            match outcome {
                Ok(true) => report.created += 1,
                Ok(false) => report.confirmed += 1,
                Err(e) => {
                    warn!("Reconciling {} onto {} failed: {}", username, node.id, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Reconciled end-node {}: {} created, {} confirmed, {} failed",
            report.node_id, report.created, report.confirmed, report.failed
        );
        Ok(report)
    }
}
