//! Common types for the forklift control plane: CRDs, conditions, inventory
//! access, errors and utilities

#![deny(missing_docs)]

pub mod condition;
pub mod crd;
pub mod error;
pub mod inventory;
pub mod kube_utils;
pub mod refs;
pub mod retry;
pub mod settings;
pub mod validation;

use std::time::Duration;

pub use error::Error;
pub use settings::Settings;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of every forklift resource
pub const API_GROUP: &str = "forklift.konveyor.io";

/// Destination-provider annotation naming the default transfer network
pub const ANN_DEFAULT_TRANSFER_NETWORK: &str = "forklift.konveyor.io/defaultTransferNetwork";

/// Plan annotation stamped once the plan has been resolved
pub const ANN_POPULATOR_LABELS: &str = "populatorLabels";

/// Network attachment annotation carrying the default route of the transfer network
pub const ANN_NETWORK_ROUTE: &str = "forklift.konveyor.io/route";

/// Route annotation value that disables the default route
pub const ROUTE_NONE: &str = "none";

/// Label carrying the migration UID on created sub-resources
pub const LABEL_MIGRATION: &str = "forklift.konveyor.io/migration";

/// Label carrying the plan UID on created sub-resources
pub const LABEL_PLAN: &str = "forklift.konveyor.io/plan";

/// Label carrying the source VM id on created sub-resources
pub const LABEL_VM: &str = "forklift.konveyor.io/vm";

/// Requeue delay while work is progressing
pub const REQUEUE_FAST: Duration = Duration::from_millis(500);

/// Requeue delay while waiting on something external
pub const REQUEUE_SLOW: Duration = Duration::from_secs(3);

/// Periodic resync of settled resources
pub const REQUEUE_RESYNC: Duration = Duration::from_secs(300);
