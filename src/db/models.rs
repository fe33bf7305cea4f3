use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::fleet::SealedCredential;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// An end-user account, keyed by phone number.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub phone_number: String,
    pub password_hash: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub phone_number: String,
    pub password_hash: String,
    pub role: Role,
}

/// A registered VPN gateway. Deliberately not `Serialize`: it carries the
/// node credential. Use [`EndNodeSummary`] for anything leaving the process.
#[derive(Debug, Clone)]
pub struct EndNode {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub status: String,
    pub location_id: Option<i32>,
    pub credential: Option<SealedCredential>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_response_ms: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct NewEndNode {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub status: String,
    pub location_id: Option<i32>,
    pub credential: Option<SealedCredential>,
}

/// Public view of an [`EndNode`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndNodeSummary {
    pub server_id: String,
    pub host: String,
    pub port: u16,
    pub status: String,
    pub location_id: Option<i32>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl From<&EndNode> for EndNodeSummary {
    fn from(node: &EndNode) -> Self {
        Self {
            server_id: node.id.clone(),
            host: node.host.clone(),
            port: node.port,
            status: node.status.clone(),
            location_id: node.location_id,
            registered_at: node.registered_at,
            last_seen: node.last_seen,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "udp" => Ok(Protocol::Udp),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(format!("protocol must be 'udp' or 'tcp', got '{}'", other)),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A VPN account provisioned on one end-node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserBinding {
    pub username: String,
    pub server_id: String,
    pub port: u16,
    pub protocol: Protocol,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub id: i32,
    pub country: String,
    pub city: String,
    pub country_code: String,
    pub latitude: f64,
    pub longitude: f64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Connecting,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Error => "error",
        }
    }
}

impl FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" => Ok(ConnectionStatus::Connected),
            "disconnected" => Ok(ConnectionStatus::Disconnected),
            "connecting" => Ok(ConnectionStatus::Connecting),
            "error" => Ok(ConnectionStatus::Error),
            other => Err(format!("unknown connection status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionEvent {
    pub identity: String,
    pub status: ConnectionStatus,
    pub server_id: String,
    pub ip_address: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ConnectionEvent {
    pub fn new(
        identity: String,
        status: ConnectionStatus,
        server_id: String,
        ip_address: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            identity,
            status,
            server_id,
            ip_address,
            connected_at: (status == ConnectionStatus::Connected).then_some(now),
            disconnected_at: (status == ConnectionStatus::Disconnected).then_some(now),
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageSample {
    pub identity: String,
    pub server_id: String,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub duration_seconds: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UsageSummary {
    pub username: String,
    pub total_bytes_in: i64,
    pub total_bytes_out: i64,
    pub total_duration: i64,
    pub connection_count: i64,
    pub last_connection: Option<DateTime<Utc>>,
}
