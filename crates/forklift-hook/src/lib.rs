//! Hook controller for forklift
//!
//! Validates the runner image reference and the optional base-64 playbook
//! of every Hook, and marks valid hooks `Ready` for plans to use.

#![deny(missing_docs)]

pub mod controller;
mod image;

pub use controller::{error_policy, reconcile, Context, KubeClient, KubeClientImpl};
pub use image::validate_image;
