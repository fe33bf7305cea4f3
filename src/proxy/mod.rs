//! Pass-through of per-user configuration artifacts from end-nodes.

pub mod config;
pub mod handlers;

pub use self::config::{ConfigArtifact, ConfigProxy, MAX_ARTIFACT_BYTES, OVPN_CONTENT_TYPE};
