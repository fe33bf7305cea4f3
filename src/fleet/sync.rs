//! Pushing account changes to end-nodes.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::db::{EndNode, Protocol, UserBinding};
use crate::error::ProxyError;
use crate::fleet::NodeCredentialCipher;

/// Where and how to reach one end-node. Holds the opened node key, so it
/// is never serialised or logged.
#[derive(Clone)]
pub struct NodeEndpoint {
    pub node_id: String,
    pub base_url: Url,
    pub api_key: Option<String>,
}

impl std::fmt::Debug for NodeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeEndpoint")
            .field("node_id", &self.node_id)
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

impl NodeEndpoint {
    pub fn resolve(node: &EndNode, scheme: &str, cipher: &NodeCredentialCipher) -> Result<Self, ProxyError> {
        let host = if node.host.contains(':') && !node.host.starts_with('[') {
            format!("[{}]", node.host)
        } else {
            node.host.clone()
        };
        let base_url = Url::parse(&format!("{}://{}:{}/", scheme, host, node.port))
            .map_err(|e| ProxyError::InvalidUrl(format!("{}: {}", node.id, e)))?;

        let api_key = node.credential.as_ref().map(|c| cipher.open(c)).transpose()?;

        Ok(Self {
            node_id: node.id.clone(),
            base_url,
            api_key,
        })
    }

    /// Base URL with each segment appended and percent-encoded.
    pub fn url(&self, segments: &[&str]) -> Result<Url, ProxyError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ProxyError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[derive(Debug, Serialize)]
struct ProvisionRequest<'a> {
    username: &'a str,
    port: u16,
    protocol: Protocol,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeSync: Send + Sync {
    /// Creates the account on the node. Creating an existing account succeeds.
    async fn provision(&self, node: &NodeEndpoint, binding: &UserBinding) -> Result<(), ProxyError>;

    async fn revoke(&self, node: &NodeEndpoint, username: &str) -> Result<(), ProxyError>;
}

/// Talks to the end-node management API over HTTP.
pub struct HttpNodeSync {
    client: Client,
}

impl HttpNodeSync {
    pub fn new(timeout: Duration) -> Result<Self, ProxyError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

fn upstream_status(response: &reqwest::Response, action: &str) -> Result<(), ProxyError> {
    let status = response.status();
    if status.is_success() || status == reqwest::StatusCode::CONFLICT {
        return Ok(());
    }
    Err(ProxyError::Upstream {
        status: Some(status.as_u16()),
        detail: format!("{} rejected with {}", action, status),
    })
}

#[async_trait]
impl NodeSync for HttpNodeSync {
    async fn provision(&self, node: &NodeEndpoint, binding: &UserBinding) -> Result<(), ProxyError> {
        let url = node.url(&["api", "users"])?;
        debug!("Provisioning {} on {}", binding.username, node.node_id);

        let response = node
            .authorize(self.client.post(url))
            .json(&ProvisionRequest {
                username: &binding.username,
                port: binding.port,
                protocol: binding.protocol,
            })
            .send()
            .await?;
        upstream_status(&response, "provision")
    }

    async fn revoke(&self, node: &NodeEndpoint, username: &str) -> Result<(), ProxyError> {
        let url = node.url(&["api", "users", username])?;
        debug!("Revoking {} on {}", username, node.node_id);

        let response = node.authorize(self.client.delete(url)).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        upstream_status(&response, "revoke")
    }
}
