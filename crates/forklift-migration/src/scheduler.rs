//! Host-capacity scheduler
//!
//! Bounds the number of disks in flight per source host across every
//! migration sharing a source provider. A VM costs one unit per disk.
//!
//! The decision itself ([`schedulable`]) is pure; [`Scheduler`] gathers its
//! inputs from the running migration, the other active migrations of the
//! same source provider and the inventory.

use std::collections::BTreeMap;

use tracing::debug;

use forklift_common::crd::{Migration, VmStatus};
use forklift_common::inventory::{find_vm, Inventory, InventoryProvider, Lookup};
use forklift_common::refs::Ref;
use forklift_common::Error;

/// A VM waiting for admission
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingVm {
    /// Source VM
    pub vm: Ref,
    /// Disk count
    pub cost: usize,
}

/// Disks in flight per host
pub type Inflight = BTreeMap<String, usize>;

/// Pending VMs per host, in plan order
pub type Pending = BTreeMap<String, Vec<PendingVm>>;

/// VMs that fit their host's remaining budget, per host.
///
/// A host at or above `max_inflight` yields nothing. A VM whose own cost
/// exceeds `max_inflight` never fits. Pending order is preserved and hosts
/// are visited by id.
pub fn schedulable(max_inflight: usize, inflight: &Inflight, pending: &Pending) -> Pending {
    let mut out = Pending::new();
    for (host, vms) in pending {
        let used = inflight.get(host).copied().unwrap_or_default();
        if used >= max_inflight {
            continue;
        }
        let fits: Vec<PendingVm> = vms
            .iter()
            .filter(|vm| vm.cost + used <= max_inflight)
            .cloned()
            .collect();
        if !fits.is_empty() {
            out.insert(host.clone(), fits);
        }
    }
    out
}

/// First schedulable VM, by host id
pub fn next(max_inflight: usize, inflight: &Inflight, pending: &Pending) -> Option<PendingVm> {
    schedulable(max_inflight, inflight, pending)
        .into_values()
        .find_map(|vms| vms.into_iter().next())
}

/// Gathers scheduler inputs for one migration
pub struct Scheduler<'a> {
    /// Inventory of the shared source provider
    pub inventory: &'a dyn Inventory,
    /// Source provider handle
    pub provider: &'a InventoryProvider,
    /// Per-host disk budget
    pub max_inflight: usize,
}

impl Scheduler<'_> {
    /// Next VM of `vms` that may start.
    ///
    /// `others` are the other active migrations sharing the source provider;
    /// only their running VMs count. VMs that vanished from inventory are
    /// skipped: the engine fails them on its own.
    pub async fn next(
        &self,
        vms: &[VmStatus],
        others: &[Migration],
    ) -> Result<Option<Ref>, Error> {
        let mut inflight = Inflight::new();
        let mut pending = Pending::new();

        for vm in vms {
            let running = vm.is_running();
            let waiting = !vm.is_completed() && vm.started.is_none();
            if !running && !waiting {
                continue;
            }
            let Some((host, cost)) = self.locate(&vm.source).await? else {
                continue;
            };
            if running {
                *inflight.entry(host).or_default() += cost;
            } else {
                pending.entry(host).or_default().push(PendingVm {
                    vm: vm.source.clone(),
                    cost,
                });
            }
        }

        for other in others {
            let Some(status) = &other.status else {
                continue;
            };
            for vm in status.vms.iter().filter(|v| v.is_running()) {
                if let Some((host, cost)) = self.locate(&vm.source).await? {
                    *inflight.entry(host).or_default() += cost;
                }
            }
        }

        debug!(?inflight, pending_hosts = pending.len(), "scheduler inputs");
        Ok(next(self.max_inflight, &inflight, &pending).map(|p| p.vm))
    }

    async fn locate(&self, vm: &Ref) -> Result<Option<(String, usize)>, Error> {
        Ok(match find_vm(self.inventory, self.provider, vm).await? {
            Lookup::Found(found) => Some((found.host.clone(), found.cost())),
            Lookup::NotFound | Lookup::Ambiguous => None,
        })
    }
}
