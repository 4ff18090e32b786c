//! Host controller for forklift
//!
//! Watches Host resources and:
//! - Checks the owning provider is a ready vSphere provider
//! - Resolves the host in the provider's inventory
//! - Checks the management address and credentials secret
//! - Logs in to the host's SDK endpoint and reports `Ready` on success

#![deny(missing_docs)]

mod connection;
pub mod controller;
mod validation;

pub use connection::{sdk_endpoint, ConnectionError, Credentials, HostConnection, SoapConnection};
pub use controller::{error_policy, reconcile, Context, KubeClient, KubeClientImpl};
pub use validation::{validate_ip, validate_provider, validate_ref};
