//! Mapping controllers for forklift
//!
//! NetworkMap and StorageMap reconcilers run the chain
//! provider pair -> source list -> destination list, publish the resulting
//! conditions, and subscribe each map's source refs with the inventory
//! watch-manager so inventory changes requeue the map.

#![deny(missing_docs)]

pub mod controller;
mod network;
mod storage;
pub mod validation;

pub use controller::{error_policy, Context, KubeClient, KubeClientImpl};
pub use network::reconcile_network_map;
pub use storage::reconcile_storage_map;
