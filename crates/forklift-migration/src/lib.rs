//! Migration controller for forklift
//!
//! A migration executes its plan once. Every VM walks an itinerary of
//! phases; disk copies and guest conversion are delegated to conversion
//! workers, hooks to the hook runner and VM creation to the target platform.
//! A host-capacity scheduler bounds the disks in flight per source host
//! across every migration sharing the source provider.

#![deny(missing_docs)]

pub mod builder;
pub mod controller;
pub mod engine;
#[cfg(test)]
mod fixtures;
pub mod hook_runner;
pub mod inspection;
pub mod itinerary;
pub mod pipeline;
pub mod scheduler;
pub mod snapshot;
pub mod target;
pub mod worker;

pub use controller::{error_policy, reconcile, Context, KubeClient, KubeClientImpl};
pub use scheduler::{schedulable, Scheduler};
