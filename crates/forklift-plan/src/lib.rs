//! Plan controller for forklift
//!
//! A plan is validated against its providers, maps, VMs, transfer network
//! and hooks. Before validation the controller adopts the destination
//! provider's default transfer network and stamps the populator annotation;
//! the first reconcile locks the migration mode.

#![deny(missing_docs)]

pub mod controller;
#[cfg(test)]
mod fixtures;
mod transfer;
pub mod validation;

pub use controller::{error_policy, reconcile, Context, KubeClient, KubeClientImpl};
pub use forklift_common::crd::validate_update;
