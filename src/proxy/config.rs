use actix_web::web::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{AppError, ProxyError};
use crate::fleet::FleetRegistry;
use crate::Result;

pub const OVPN_CONTENT_TYPE: &str = "application/x-openvpn-profile";

/// Largest artifact relayed from an end-node.
pub const MAX_ARTIFACT_BYTES: usize = 1024 * 1024;

/// An artifact fetched from an end-node, relayed chunk by chunk and unmodified.
pub struct ConfigArtifact {
    pub body: BoxStream<'static, std::result::Result<Bytes, ProxyError>>,
    /// As announced by the node, if it did.
    pub content_length: Option<u64>,
    pub filename: String,
    pub content_type: &'static str,
}

impl std::fmt::Debug for ConfigArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigArtifact")
            .field("filename", &self.filename)
            .field("content_length", &self.content_length)
            .finish()
    }
}

pub struct ConfigProxy {
    fleet: Arc<FleetRegistry>,
    client: Client,
}

impl ConfigProxy {
    pub fn new(fleet: Arc<FleetRegistry>, timeout: Duration) -> std::result::Result<Self, ProxyError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { fleet, client })
    }

    /// Fetches `username`'s profile from `node_id`. The node and the binding
    /// are checked before any outbound request is made.
    pub async fn fetch_user_config(&self, username: &str, node_id: &str) -> Result<ConfigArtifact> {
        let node = self
            .fleet
            .node(node_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("End-node '{}' not found", node_id)))?;
        if self.fleet.binding(username, node_id).await?.is_none() {
            return Err(AppError::NotFound(format!(
                "User '{}' is not provisioned on end-node '{}'",
                username, node_id
            )));
        }

        let endpoint = self.fleet.endpoint(&node)?;
        let url = endpoint.url(&["api", "ovpn", username])?;

        let response = endpoint
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| {
                warn!("Config fetch for {} from {} failed: {}", username, node_id, e);
                ProxyError::from(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!("End-node {} answered {} for {}'s config", node_id, status, username);
            return Err(ProxyError::Upstream {
                status: Some(status.as_u16()),
                detail: format!("config fetch from {} returned {}", node_id, status),
            }
            .into());
        }

        let content_length = response.content_length();
        if content_length.is_some_and(|len| len > MAX_ARTIFACT_BYTES as u64) {
            warn!("End-node {} announced an oversized config for {}", node_id, username);
            return Err(ProxyError::TooLarge { limit: MAX_ARTIFACT_BYTES }.into());
        }
        info!("Relaying config for {} from {} ({:?} bytes)", username, node_id, content_length);

        let mut relayed = 0usize;
        let body = response
            .bytes_stream()
            .map(move |chunk| {
                let chunk = chunk.map_err(ProxyError::from)?;
                relayed += chunk.len();
                if relayed > MAX_ARTIFACT_BYTES {
                    return Err(ProxyError::TooLarge { limit: MAX_ARTIFACT_BYTES });
                }
                Ok(chunk)
            })
            .boxed();

        Ok(ConfigArtifact {
            body,
            content_length,
            filename: format!("{}_{}.ovpn", username, node_id),
            content_type: OVPN_CONTENT_TYPE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::db::{FleetStore, MemoryStore, Protocol, UserBinding};
    use crate::fleet::{FleetRegistry, NodeCredentialCipher, NodeRegistration, NodeSync};
    use crate::fleet::sync::MockNodeSync;
    use chrono::Utc;
    use futures::TryStreamExt;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PROFILE: &str = "client\ndev tun\nremote 10.0.0.7 1194\n";

    async fn setup(server: &MockServer) -> (ConfigProxy, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let sync: Arc<dyn NodeSync> = Arc::new(MockNodeSync::new());
        let (registry, _tasks) = FleetRegistry::new(
            store.clone(),
            sync,
            Arc::new(NodeCredentialCipher::from_secret("test-secret-0123456789-abcdefghijklmnop")),
            AuditLog::new(store.clone(), "management-server"),
            "http",
        );
        let address = server.address();
        registry
            .register(
                "",
                NodeRegistration {
                    server_id: "node-eu-1".to_string(),
                    host: address.ip().to_string(),
                    port: address.port(),
                    status: None,
                    location_id: None,
                    api_key: Some("node-secret".to_string()),
                },
                "",
            )
            .await
            .unwrap();

        let proxy = ConfigProxy::new(Arc::new(registry), Duration::from_secs(5)).unwrap();
        (proxy, store)
    }

    async fn bind(store: &MemoryStore, username: &str) {
        store
            .insert_binding(&UserBinding {
                username: username.to_string(),
                server_id: "node-eu-1".to_string(),
                port: 1194,
                protocol: Protocol::Udp,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_binding_makes_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (proxy, _store) = setup(&server).await;
        let result = proxy.fetch_user_config("alice", "node-eu-1").await;
        assert!(matches!(result, Err(AppError::NotFound(_))));

        let result = proxy.fetch_user_config("alice", "node-ghost").await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_artifact_is_passed_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/ovpn/alice"))
            .and(header("authorization", "Bearer node-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PROFILE))
            .expect(1)
            .mount(&server)
            .await;

        let (proxy, store) = setup(&server).await;
        bind(&store, "alice").await;

        let artifact = proxy.fetch_user_config("alice", "node-eu-1").await.unwrap();
        assert_eq!(artifact.filename, "alice_node-eu-1.ovpn");
        assert_eq!(artifact.content_type, OVPN_CONTENT_TYPE);
        assert!(!format!("{:?}", artifact).contains("dev tun"));

        let chunks: Vec<Bytes> = artifact.body.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), PROFILE.as_bytes());
    }

    #[tokio::test]
    async fn test_oversized_artifact_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/ovpn/alice"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; MAX_ARTIFACT_BYTES + 1]))
            .mount(&server)
            .await;

        let (proxy, store) = setup(&server).await;
        bind(&store, "alice").await;

        let err = proxy.fetch_user_config("alice", "node-eu-1").await.unwrap_err();
        assert!(matches!(err, AppError::ProxyError(ProxyError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn test_upstream_status_is_folded_in() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/ovpn/alice"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (proxy, store) = setup(&server).await;
        bind(&store, "alice").await;

        let err = proxy.fetch_user_config("alice", "node-eu-1").await.unwrap_err();
        assert!(matches!(
            err,
            AppError::ProxyError(ProxyError::Upstream { status: Some(404), .. })
        ));
    }
}
