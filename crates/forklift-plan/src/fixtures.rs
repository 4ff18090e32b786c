//! Test doubles and a small in-memory cluster for plan tests

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kube::api::{DynamicObject, ObjectMeta};
use kube::ResourceExt;
use mockall::mock;

use forklift_common::condition::Conditions;
use forklift_common::crd::{
    Hook, HookStatus, MapStatus, Migration, NetworkMap, Plan, PlanStatus, Provider, ProviderSpec,
    ProviderStatus, ProviderType, StorageMap,
};
use forklift_common::inventory::{
    Inventory, InventoryKind, InventoryProvider, Lookup, Resource, Vm, VmDisk, VmNic,
};
use forklift_common::kube_utils::network_attachment_resource;
use forklift_common::refs::{ObjectRef, Ref};
use forklift_common::{Result, ANN_DEFAULT_TRANSFER_NETWORK, ANN_NETWORK_ROUTE};

use crate::controller::{Context, MockKubeClient};

mock! {
    pub Inventory {}

    #[async_trait]
    impl Inventory for Inventory {
        async fn get(
            &self,
            provider: &InventoryProvider,
            kind: InventoryKind,
            id: &str,
        ) -> Result<Lookup<Resource>>;
        async fn list(&self, provider: &InventoryProvider, kind: InventoryKind)
            -> Result<Vec<Resource>>;
        async fn get_vm(&self, provider: &InventoryProvider, id: &str) -> Result<Lookup<Vm>>;
        async fn list_vms(&self, provider: &InventoryProvider) -> Result<Vec<Vm>>;
    }
}

pub(crate) const PLAN_YAML: &str = r#"
apiVersion: forklift.konveyor.io/v1beta1
kind: Plan
metadata:
  name: wave-1
  namespace: forklift
  generation: 1
spec:
  provider:
    source:
      name: vsphere
    destination:
      name: host
  map:
    network:
      name: net
    storage:
      name: storage
  targetNamespace: migrated
  vms:
    - id: vm-1
"#;

const NETWORK_MAP_YAML: &str = r#"
apiVersion: forklift.konveyor.io/v1beta1
kind: NetworkMap
metadata:
  name: net
  namespace: forklift
  generation: 1
spec:
  provider:
    source:
      name: vsphere
    destination:
      name: host
  map:
    - source:
        id: net-1
      destination:
        type: pod
"#;

const STORAGE_MAP_YAML: &str = r#"
apiVersion: forklift.konveyor.io/v1beta1
kind: StorageMap
metadata:
  name: storage
  namespace: forklift
  generation: 1
spec:
  provider:
    source:
      name: vsphere
    destination:
      name: host
  map:
    - source:
        id: datastore-1
      destination:
        storageClass: standard
"#;

pub(crate) fn plan() -> Plan {
    serde_yaml::from_str(PLAN_YAML).expect("valid plan")
}

fn ready() -> Conditions {
    let mut c = Conditions::default();
    c.set_ready(true, "ready");
    c
}

pub(crate) fn provider(name: &str, type_: ProviderType, url: &str) -> Provider {
    Provider {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("forklift".into()),
            uid: Some(format!("uid-{name}")),
            generation: Some(1),
            ..Default::default()
        },
        spec: ProviderSpec {
            type_,
            url: url.into(),
            secret: ObjectRef::default(),
            settings: BTreeMap::new(),
        },
        status: Some(ProviderStatus {
            conditions: ready(),
            ..Default::default()
        }),
    }
}

pub(crate) fn network_map() -> NetworkMap {
    let mut map: NetworkMap = serde_yaml::from_str(NETWORK_MAP_YAML).expect("valid network map");
    map.status = Some(MapStatus {
        conditions: ready(),
        ..Default::default()
    });
    map
}

pub(crate) fn storage_map() -> StorageMap {
    let mut map: StorageMap = serde_yaml::from_str(STORAGE_MAP_YAML).expect("valid storage map");
    map.status = Some(MapStatus {
        conditions: ready(),
        ..Default::default()
    });
    map
}

pub(crate) fn hook(name: &str, is_ready: bool) -> Hook {
    let mut hook = Hook::new(
        name,
        serde_yaml::from_str("image: quay.io/kubev2v/hook-runner").expect("valid hook spec"),
    );
    hook.metadata.namespace = Some("forklift".into());
    hook.status = Some(HookStatus {
        observed_generation: None,
        conditions: if is_ready { ready() } else { Conditions::default() },
    });
    hook
}

/// Network attachment definition, optionally with a route annotation
pub(crate) fn attachment(namespace: &str, name: &str, route: Option<&str>) -> DynamicObject {
    let mut nad = DynamicObject::new(name, &network_attachment_resource()).within(namespace);
    if let Some(route) = route {
        nad.annotations_mut()
            .insert(ANN_NETWORK_ROUTE.to_string(), route.to_string());
    }
    nad
}

pub(crate) fn vm(id: &str, name: &str) -> Vm {
    Vm {
        id: id.into(),
        name: name.into(),
        host: "host-1".into(),
        power_state: "On".into(),
        disks: vec![VmDisk {
            id: format!("{id}-disk-0"),
            storage: Ref::with_id("datastore-1"),
            capacity: 10 << 30,
        }],
        nics: vec![VmNic {
            mac: "00:50:56:00:00:01".into(),
            network: Ref::with_id("net-1"),
        }],
        ..Default::default()
    }
}

/// Inventory answering VM lookups from a fixed list
pub(crate) fn inventory(vms: Vec<Vm>) -> MockInventory {
    let by_id = vms.clone();
    let mut inv = MockInventory::new();
    inv.expect_get_vm().returning(move |_, id| {
        Ok(match by_id.iter().find(|v| v.id == id) {
            Some(vm) => Lookup::Found(vm.clone()),
            None => Lookup::NotFound,
        })
    });
    inv.expect_list_vms().returning(move |_| Ok(vms.clone()));
    inv
}

/// Everything the plan controller can read from the cluster
#[derive(Clone)]
pub(crate) struct World {
    pub providers: Vec<Provider>,
    pub network_maps: Vec<NetworkMap>,
    pub storage_maps: Vec<StorageMap>,
    pub hooks: Vec<Hook>,
    pub namespaces: Vec<String>,
    pub attachments: Vec<DynamicObject>,
    pub virtual_machines: Vec<ObjectRef>,
    pub migrations: Vec<Migration>,
}

impl Default for World {
    fn default() -> Self {
        Self {
            providers: vec![
                provider("vsphere", ProviderType::VSphere, "https://vcenter/sdk"),
                provider("host", ProviderType::OpenShift, ""),
            ],
            network_maps: vec![network_map()],
            storage_maps: vec![storage_map()],
            hooks: vec![hook("pre", true)],
            namespaces: vec!["migrated".into()],
            attachments: Vec::new(),
            virtual_machines: Vec::new(),
            migrations: Vec::new(),
        }
    }
}

/// Writes made by the controller
#[derive(Clone, Default)]
pub(crate) struct Writes {
    pub statuses: Arc<Mutex<Vec<PlanStatus>>>,
    pub patches: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl Writes {
    pub fn last_status(&self) -> PlanStatus {
        self.statuses
            .lock()
            .expect("mutex should not be poisoned")
            .last()
            .cloned()
            .expect("status should have been written")
    }

    pub fn patches(&self) -> Vec<serde_json::Value> {
        self.patches
            .lock()
            .expect("mutex should not be poisoned")
            .clone()
    }
}

fn named<K: ResourceExt + Clone>(items: &[K], name: &str, namespace: &str) -> Option<K> {
    items
        .iter()
        .find(|k| k.name_any() == name && k.namespace().as_deref() == Some(namespace))
        .cloned()
}

impl World {
    /// Annotate the destination provider with a default transfer network
    pub fn with_default_transfer_network(mut self, value: &str) -> Self {
        for p in self.providers.iter_mut().filter(|p| p.name_any() == "host") {
            p.annotations_mut()
                .insert(ANN_DEFAULT_TRANSFER_NETWORK.to_string(), value.to_string());
        }
        self
    }

    pub fn kube(self, writes: &Writes) -> MockKubeClient {
        let mut kube = MockKubeClient::new();
        let w = Arc::new(self);

        let world = w.clone();
        kube.expect_get_provider()
            .returning(move |name, ns| Ok(named(&world.providers, name, ns)));
        let world = w.clone();
        kube.expect_get_network_map()
            .returning(move |name, ns| Ok(named(&world.network_maps, name, ns)));
        let world = w.clone();
        kube.expect_get_storage_map()
            .returning(move |name, ns| Ok(named(&world.storage_maps, name, ns)));
        let world = w.clone();
        kube.expect_get_hook()
            .returning(move |name, ns| Ok(named(&world.hooks, name, ns)));
        let world = w.clone();
        kube.expect_namespace_exists()
            .returning(move |name| Ok(world.namespaces.iter().any(|n| n == name)));
        let world = w.clone();
        kube.expect_get_network_attachment()
            .returning(move |name, ns| Ok(named(&world.attachments, name, ns)));
        let world = w.clone();
        kube.expect_virtual_machine_exists().returning(move |name, ns| {
            Ok(world.virtual_machines.contains(&ObjectRef::new(ns, name)))
        });
        let world = w.clone();
        kube.expect_list_migrations().returning(move |ns| {
            Ok(world
                .migrations
                .iter()
                .filter(|m| m.namespace().as_deref() == Some(ns))
                .cloned()
                .collect())
        });

        let sink = writes.patches.clone();
        kube.expect_patch_plan().returning(move |_, _, patch| {
            sink.lock()
                .expect("mutex should not be poisoned")
                .push(patch.clone());
            Ok(())
        });
        let sink = writes.statuses.clone();
        kube.expect_patch_status().returning(move |_, _, status| {
            sink.lock()
                .expect("mutex should not be poisoned")
                .push(status.clone());
            Ok(())
        });
        kube
    }

    pub fn context(self, vms: Vec<Vm>) -> (Arc<Context>, Writes) {
        let writes = Writes::default();
        let kube = self.kube(&writes);
        (
            Arc::new(Context::new(Arc::new(kube), Arc::new(inventory(vms)))),
            writes,
        )
    }
}
