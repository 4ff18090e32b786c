//! Custom Resource Definitions for the forklift control plane
//!
//! All kinds live in `forklift.konveyor.io/v1beta1` and are namespaced.

mod hook;
mod host;
mod migration;
mod network_map;
mod plan;
mod provider;
mod storage_map;
mod types;

pub use hook::{Hook, HookSpec, HookStatus, DEFAULT_HOOK_DEADLINE_SECS};
pub use host::{Host, HostSpec, HostStatus};
pub use migration::{
    Migration, MigrationSpec, MigrationStatus, PowerState, Precopy, Progress, Snapshot,
    SnapshotMaps, SnapshotProviders, Task, TaskError, TaskPhase, VmPhase, VmStatus, WarmStatus,
};
pub use network_map::{
    DestinationNetwork, NetworkDestination, NetworkMap, NetworkMapSpec, NetworkPair,
    NETWORK_TYPE_IGNORED, NETWORK_TYPE_MULTUS, NETWORK_TYPE_POD,
};
pub use plan::{
    validate_update, HookRef, Plan, PlanMaps, PlanSpec, PlanStatus, PlanVm, STEP_POST_HOOK,
    STEP_PRE_HOOK,
};
pub use provider::{
    Capabilities, Provider, ProviderPhase, ProviderSpec, ProviderStatus, ProviderType,
};
pub use storage_map::{DestinationStorage, StorageMap, StorageMapSpec, StoragePair};
pub use types::{Generation, MapStatus, ProviderPair};
