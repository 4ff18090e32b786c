//! Runtime settings shared by every controller
//!
//! The operator binary parses these from flags and environment variables and
//! hands one `Arc<Settings>` to each controller context.

use std::time::Duration;

/// Default inventory service base URL
pub const DEFAULT_INVENTORY_URL: &str =
    "https://forklift-inventory.konveyor-forklift.svc.cluster.local:8443";
/// Default per-host in-flight disk budget
pub const DEFAULT_MAX_VM_INFLIGHT: usize = 20;
/// Default inventory call deadline
pub const DEFAULT_INVENTORY_TIMEOUT: Duration = Duration::from_secs(30);
/// Default inventory watch poll interval
pub const DEFAULT_INVENTORY_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Default capacity of the watch-manager event channels
pub const DEFAULT_WATCH_CHANNEL_CAPACITY: usize = 100;
/// Default spacing of warm incremental copies
pub const DEFAULT_PRECOPY_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Default conversion worker image
pub const DEFAULT_VIRT_V2V_IMAGE: &str = "quay.io/kubev2v/forklift-virt-v2v:latest";
/// Default hook runner image
pub const DEFAULT_HOOK_IMAGE: &str = "quay.io/kubev2v/hook-runner:latest";

/// Controller settings
#[derive(Clone, Debug)]
pub struct Settings {
    /// Inventory service base URL
    pub inventory_url: String,
    /// Deadline for a single inventory call
    pub inventory_timeout: Duration,
    /// Poll interval of the inventory watch source
    pub inventory_poll_interval: Duration,
    /// Capacity of each watch-manager event channel
    pub watch_channel_capacity: usize,
    /// Per-host in-flight disk budget shared by all plans of a source provider
    pub max_vm_inflight: usize,
    /// Conversion worker image
    pub virt_v2v_image: String,
    /// Default hook runner image
    pub hook_image: String,
    /// Spacing of warm incremental copies
    pub precopy_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            inventory_url: DEFAULT_INVENTORY_URL.to_string(),
            inventory_timeout: DEFAULT_INVENTORY_TIMEOUT,
            inventory_poll_interval: DEFAULT_INVENTORY_POLL_INTERVAL,
            watch_channel_capacity: DEFAULT_WATCH_CHANNEL_CAPACITY,
            max_vm_inflight: DEFAULT_MAX_VM_INFLIGHT,
            virt_v2v_image: DEFAULT_VIRT_V2V_IMAGE.to_string(),
            hook_image: DEFAULT_HOOK_IMAGE.to_string(),
            precopy_interval: DEFAULT_PRECOPY_INTERVAL,
        }
    }
}
