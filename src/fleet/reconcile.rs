//! Background worker that drains the reconciliation queue.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::fleet::{FleetRegistry, ReconcileTask};

/// Sweeps run one at a time, in the order nodes registered. The worker
/// holds the registry, so it lives as long as the runtime.
pub fn spawn_worker(registry: Arc<FleetRegistry>, mut tasks: mpsc::UnboundedReceiver<ReconcileTask>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Reconciliation worker started");
        while let Some(task) = tasks.recv().await {
            let waited = Utc::now() - task.enqueued_at;
            debug!(
                "Reconciliation {} for {} picked up after {}ms",
                task.id,
                task.node_id,
                waited.num_milliseconds()
            );

            match registry.reconcile(&task.node_id).await {
                Ok(report) if report.failed > 0 => {
                    warn!(
                        "Reconciliation {} left {} user(s) unsynced on {}",
                        task.id, report.failed, report.node_id
                    );
                }
                Ok(_) => {}
                Err(AppError::NotFound(_)) => {
                    debug!("End-node {} deregistered before reconciliation {}", task.node_id, task.id);
                }
                Err(e) => {
                    warn!("Reconciliation {} for {} failed: {}", task.id, task.node_id, e);
                }
            }
        }
        info!("Reconciliation worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::db::{FleetStore, MemoryStore};
    use crate::fleet::sync::MockNodeSync;
    use crate::fleet::{BindingRequest, NodeCredentialCipher, NodeRegistration};
    use std::time::Duration;

    fn registration(id: &str) -> NodeRegistration {
        NodeRegistration {
            server_id: id.to_string(),
            host: "10.0.0.9".to_string(),
            port: 8080,
            status: None,
            location_id: None,
            api_key: None,
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_worker_reconciles_late_node() {
        let store = Arc::new(MemoryStore::new());
        let mut sync = MockNodeSync::new();
        sync.expect_provision().returning(|_, _| Ok(()));
        let (registry, tasks) = FleetRegistry::new(
            store.clone(),
            Arc::new(sync),
            Arc::new(NodeCredentialCipher::from_secret("test-secret-0123456789-abcdefghijklmnop")),
            AuditLog::new(store.clone(), "management-server"),
            "http",
        );
        let registry = Arc::new(registry);
        let worker = spawn_worker(registry.clone(), tasks);

        registry.register("", registration("node-us-1"), "").await.unwrap();
        registry
            .create_binding(
                "",
                BindingRequest {
                    username: "alice".to_string(),
                    port: None,
                    protocol: None,
                    target_server_id: Some("node-us-1".to_string()),
                },
                "",
            )
            .await
            .unwrap();

        registry.register("", registration("node-eu-1"), "").await.unwrap();

        let mut synced = false;
        for _ in 0..50 {
            if store.get_binding("alice", "node-eu-1").await.unwrap().is_some() {
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(synced);
        assert_eq!(store.bindings_for_user("alice").await.unwrap().len(), 2);
        worker.abort();
    }
}
