//! Read-only inventory of source and target providers
//!
//! The control plane never mutates inventory. Lookups return
//! [`Lookup::Found`] or [`Lookup::NotFound`]; any other outcome is an
//! [`Error::Inventory`](crate::Error::Inventory) the caller returns from
//! reconcile so the framework retries it.

mod classify;
mod client;
mod watch;

use std::fmt;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use crate::crd::{PowerState, Provider, ProviderType};
use crate::refs::{Ref, RefLookup};
use crate::Result;

pub use classify::{classify, extract_http_status, Classification};
pub use client::InventoryClient;
pub use watch::{
    diff, EventType, InventoryEvent, MapKind, PollState, WatchManager, WatchReceivers,
    WatchRegistry,
};

/// Resource kinds the control plane reads from inventory
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InventoryKind {
    /// Virtual machines
    Vm,
    /// Networks
    Network,
    /// Datastores, storage domains, volume types
    Storage,
    /// Hypervisor hosts
    Host,
}

impl InventoryKind {
    /// Collection path segment for a provider type
    pub fn path(self, provider: ProviderType) -> &'static str {
        match (self, provider) {
            (InventoryKind::Vm, _) => "vms",
            (InventoryKind::Host, _) => "hosts",
            (InventoryKind::Network, ProviderType::OpenShift) => "networkattachmentdefinitions",
            (InventoryKind::Network, _) => "networks",
            (InventoryKind::Storage, ProviderType::VSphere) => "datastores",
            (InventoryKind::Storage, ProviderType::OVirt) => "storagedomains",
            (InventoryKind::Storage, ProviderType::OpenStack) => "volumetypes",
            (InventoryKind::Storage, ProviderType::Ova) => "storages",
            (InventoryKind::Storage, ProviderType::OpenShift) => "storageclasses",
            (InventoryKind::Storage, ProviderType::Undefined) => "storage",
        }
    }
}

impl fmt::Display for InventoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InventoryKind::Vm => "vm",
            InventoryKind::Network => "network",
            InventoryKind::Storage => "storage",
            InventoryKind::Host => "host",
        };
        write!(f, "{s}")
    }
}

/// Identity of the provider whose inventory is queried
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InventoryProvider {
    /// Provider UID (the inventory's key)
    pub uid: String,
    /// Provider type
    pub type_: ProviderType,
    /// Namespaced name, for logs
    pub name: String,
}

impl InventoryProvider {
    /// Handle for a Provider resource
    pub fn of(provider: &Provider) -> Self {
        Self {
            uid: provider.inventory_key(),
            type_: provider.spec.type_,
            name: format!(
                "{}/{}",
                provider.namespace().unwrap_or_default(),
                provider.name_any()
            ),
        }
    }
}

impl fmt::Display for InventoryProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Result of a lookup that reached the inventory
#[derive(Clone, Debug, PartialEq)]
pub enum Lookup<T> {
    /// Exactly one object matched
    Found(T),
    /// Nothing matched
    NotFound,
    /// A name lookup matched more than one object
    Ambiguous,
}

impl<T> Lookup<T> {
    /// The object, when found
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(t) => Some(t),
            _ => None,
        }
    }
}

/// Generic inventory object (network, storage, host)
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Inventory id
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Namespace (namespaced sources only)
    #[serde(default)]
    pub namespace: String,
    /// Object type (e.g. network type)
    #[serde(default, rename = "type")]
    pub type_: String,
    /// Revision, bumped on every change
    #[serde(default)]
    pub revision: i64,
}

/// A disk attached to a source VM
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmDisk {
    /// Disk id (or file path)
    pub id: String,
    /// Storage the disk lives on
    #[serde(default)]
    pub storage: Ref,
    /// Capacity in bytes
    #[serde(default)]
    pub capacity: i64,
}

/// A NIC of a source VM
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmNic {
    /// MAC address
    #[serde(default)]
    pub mac: String,
    /// Network the NIC is attached to
    #[serde(default)]
    pub network: Ref,
}

/// A source VM as the inventory reports it
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Vm {
    /// Inventory id
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Namespace (namespaced sources only)
    #[serde(default)]
    pub namespace: String,
    /// Host the VM runs on; the scheduler's capacity unit
    #[serde(default)]
    pub host: String,
    /// `On`, `Off` or anything else for unknown
    #[serde(default)]
    pub power_state: String,
    /// Disks
    #[serde(default)]
    pub disks: Vec<VmDisk>,
    /// NICs
    #[serde(default)]
    pub nics: Vec<VmNic>,
    /// vCPUs
    #[serde(default)]
    pub cpu_count: i32,
    /// Memory in MiB
    #[serde(default)]
    pub memory_mb: i64,
    /// `bios` or `efi`
    #[serde(default)]
    pub firmware: String,
    /// Guest OS identifier reported by the platform
    #[serde(default)]
    pub guest_id: String,
    /// Revision
    #[serde(default)]
    pub revision: i64,
}

impl Vm {
    /// Source power state
    pub fn power(&self) -> PowerState {
        match self.power_state.to_ascii_lowercase().as_str() {
            "on" | "poweredon" | "up" | "running" => PowerState::On,
            "off" | "poweredoff" | "down" | "stopped" => PowerState::Off,
            _ => PowerState::Unknown,
        }
    }

    /// Scheduler cost: one unit per disk
    pub fn cost(&self) -> usize {
        self.disks.len()
    }
}

/// Inventory contract
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Get one object by id
    async fn get(
        &self,
        provider: &InventoryProvider,
        kind: InventoryKind,
        id: &str,
    ) -> Result<Lookup<Resource>>;

    /// List every object of a kind
    async fn list(&self, provider: &InventoryProvider, kind: InventoryKind)
        -> Result<Vec<Resource>>;

    /// Get one VM by id
    async fn get_vm(&self, provider: &InventoryProvider, id: &str) -> Result<Lookup<Vm>>;

    /// List every VM
    async fn list_vms(&self, provider: &InventoryProvider) -> Result<Vec<Vm>>;
}

/// Resolve a [`Ref`] against inventory: by id, else by (namespaced) name.
pub async fn find(
    inventory: &dyn Inventory,
    provider: &InventoryProvider,
    kind: InventoryKind,
    r: &Ref,
) -> Result<Lookup<Resource>> {
    let Some(lookup) = r.lookup() else {
        return Ok(Lookup::NotFound);
    };
    if let RefLookup::Id(id) = lookup {
        return inventory.get(provider, kind, id).await;
    }
    let list = inventory.list(provider, kind).await?;
    Ok(unique(list.into_iter().filter(|o| by_name(&lookup, &o.namespace, &o.name))))
}

/// Resolve a VM [`Ref`]: by id, else by (namespaced) name.
pub async fn find_vm(
    inventory: &dyn Inventory,
    provider: &InventoryProvider,
    r: &Ref,
) -> Result<Lookup<Vm>> {
    let Some(lookup) = r.lookup() else {
        return Ok(Lookup::NotFound);
    };
    if let RefLookup::Id(id) = lookup {
        return inventory.get_vm(provider, id).await;
    }
    let list = inventory.list_vms(provider).await?;
    Ok(unique(list.into_iter().filter(|vm| by_name(&lookup, &vm.namespace, &vm.name))))
}

fn by_name(lookup: &RefLookup<'_>, namespace: &str, name: &str) -> bool {
    match lookup {
        RefLookup::Namespaced {
            namespace: ns,
            name: n,
        } => *ns == namespace && *n == name,
        RefLookup::Name(n) => *n == name,
        RefLookup::Id(_) => false,
    }
}

fn unique<T>(mut matches: impl Iterator<Item = T>) -> Lookup<T> {
    match (matches.next(), matches.next()) {
        (None, _) => Lookup::NotFound,
        (Some(one), None) => Lookup::Found(one),
        (Some(_), Some(_)) => Lookup::Ambiguous,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> InventoryProvider {
        InventoryProvider {
            uid: "uid-1".into(),
            type_: ProviderType::VSphere,
            name: "ns/src".into(),
        }
    }

    fn network(id: &str, name: &str) -> Resource {
        Resource {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn find_by_id_uses_get() {
        let mut inv = MockInventory::new();
        inv.expect_get()
            .withf(|_, kind, id| *kind == InventoryKind::Network && id == "net-1")
            .returning(|_, _, _| Ok(Lookup::Found(network("net-1", "prod"))));
        inv.expect_list().never();

        let found = find(&inv, &provider(), InventoryKind::Network, &Ref::with_id("net-1"))
            .await
            .unwrap();
        assert_eq!(found.found().map(|r| r.name), Some("prod".to_string()));
    }

    #[tokio::test]
    async fn find_by_name_lists_and_filters() {
        let mut inv = MockInventory::new();
        inv.expect_list().returning(|_, _| {
            Ok(vec![
                network("net-1", "prod"),
                network("net-2", "dev"),
                network("net-3", "dev"),
            ])
        });

        let p = provider();
        let prod = find(&inv, &p, InventoryKind::Network, &Ref::with_name("prod"))
            .await
            .unwrap();
        assert!(matches!(prod, Lookup::Found(ref r) if r.id == "net-1"));

        let dev = find(&inv, &p, InventoryKind::Network, &Ref::with_name("dev"))
            .await
            .unwrap();
        assert_eq!(dev, Lookup::Ambiguous);

        let missing = find(&inv, &p, InventoryKind::Network, &Ref::with_name("qa"))
            .await
            .unwrap();
        assert_eq!(missing, Lookup::NotFound);
    }

    #[tokio::test]
    async fn empty_ref_is_not_found_without_calls() {
        let inv = MockInventory::new();
        let r = find_vm(&inv, &provider(), &Ref::default()).await.unwrap();
        assert_eq!(r, Lookup::NotFound);
    }

    #[test]
    fn storage_path_depends_on_provider() {
        assert_eq!(InventoryKind::Storage.path(ProviderType::VSphere), "datastores");
        assert_eq!(InventoryKind::Storage.path(ProviderType::OVirt), "storagedomains");
        assert_eq!(
            InventoryKind::Network.path(ProviderType::OpenShift),
            "networkattachmentdefinitions"
        );
    }

    #[test]
    fn vm_power_and_cost() {
        let vm = Vm {
            power_state: "poweredOn".into(),
            disks: vec![VmDisk::default(), VmDisk::default()],
            ..Default::default()
        };
        assert_eq!(vm.power(), PowerState::On);
        assert_eq!(vm.cost(), 2);
    }
}
