//! Provider controller for forklift
//!
//! Watches Provider resources and:
//! - Checks the platform type, endpoint URL and credentials secret
//! - Tests the connection through the inventory service
//! - Starts the provider's inventory watch and reports `Ready` once it has parity

#![deny(missing_docs)]

pub mod controller;
mod validation;

pub use controller::{error_policy, reconcile, Context, KubeClient, KubeClientImpl};
pub use validation::{
    insecure_condition, validate_credentials, validate_secret, validate_type, validate_url,
    SecretCheck, INSECURE_SKIP_VERIFY, SECRET_NOT_VALID,
};
