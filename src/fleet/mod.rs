//! End-node directory, user provisioning and reconciliation.

pub mod credentials;
pub mod handlers;
pub mod locations;
pub mod reconcile;
pub mod registry;
pub mod sync;

pub use credentials::{NodeCredentialCipher, SealedCredential};
pub use locations::{LocationView, ServerView};
pub use registry::{
    validate_username, BindingRequest, FleetRegistry, NodeRegistration, ProvisionReport, ReconcileReport,
    ReconcileTask, DEFAULT_VPN_PORT,
};
pub use sync::{HttpNodeSync, NodeEndpoint, NodeSync};
