//! Test doubles and a small in-memory cluster for migration tests

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use mockall::mock;

use forklift_common::condition::Conditions;
use forklift_common::crd::{
    Hook, MapStatus, Migration, MigrationSpec, MigrationStatus, NetworkMap, Plan, PlanStatus,
    PlanVm, Provider, ProviderSpec, ProviderStatus, ProviderType, StorageMap, VmStatus,
};
use forklift_common::inventory::{
    Inventory, InventoryKind, InventoryProvider, Lookup, Resource, Vm, VmDisk, VmNic,
};
use forklift_common::refs::{ObjectRef, Ref};
use forklift_common::{Result, Settings};

use crate::controller::{reconcile, Context, MockKubeClient};
use crate::hook_runner::{HookOutcome, HookRequest, MockHookRunner};
use crate::inspection::OperatingSystem;
use crate::target::MockTargetPlatform;
use crate::worker::{
    Completion, DiskProgress, MockConversionWorker, Stage, WorkerRequest, WorkerStatus,
    WorkerWarning,
};

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

const PLAN_YAML: &str = r#"
apiVersion: forklift.konveyor.io/v1beta1
kind: Plan
metadata:
  name: wave-1
  namespace: forklift
  uid: plan-uid
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
  uid: net-uid
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
  uid: storage-uid
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

/// Migration UID; worker names use its first eight characters
pub(crate) const MIGRATION_UID: &str = "mig-0001-uid";

fn ready() -> Conditions {
    let mut c = Conditions::default();
    c.set_ready(true, "ready");
    c
}

/// Ready cold plan with one VM
pub(crate) fn plan() -> Plan {
    let mut plan: Plan = serde_yaml::from_str(PLAN_YAML).expect("valid plan");
    plan.status = Some(PlanStatus {
        observed_generation: Some(1),
        conditions: ready(),
        warm: Some(false),
    });
    plan
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
            secret: ObjectRef::new("forklift", format!("{name}-creds")),
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

pub(crate) fn hook(name: &str) -> Hook {
    let mut hook = Hook::new(
        name,
        serde_yaml::from_str("image: quay.io/example/quiesce:1.0").expect("valid hook spec"),
    );
    hook.metadata.namespace = Some("forklift".into());
    hook
}

pub(crate) fn migration() -> Migration {
    let mut m = Migration::new(
        "wave-1-run",
        MigrationSpec {
            plan: ObjectRef::new("forklift", "wave-1"),
            cutover: None,
            cancel: vec![],
        },
    );
    m.metadata.namespace = Some("forklift".into());
    m.metadata.uid = Some(MIGRATION_UID.into());
    m.metadata.generation = Some(1);
    m
}

/// Source VM on `host` with `disks` disks on datastore-1
pub(crate) fn vm(id: &str, name: &str, host: &str, disks: usize) -> Vm {
    Vm {
        id: id.into(),
        name: name.into(),
        host: host.into(),
        power_state: "poweredOn".into(),
        cpu_count: 2,
        memory_mb: 4096,
        disks: (0..disks)
            .map(|i| VmDisk {
                id: format!("{id}-disk-{i}"),
                storage: Ref::with_id("datastore-1"),
                capacity: 2 << 30,
            })
            .collect(),
        nics: vec![VmNic {
            mac: "00:50:56:00:00:01".into(),
            network: Ref::with_id("net-1"),
        }],
        ..Default::default()
    }
}

fn named<K: ResourceExt + Clone>(items: &[K], name: &str, namespace: &str) -> Option<K> {
    items
        .iter()
        .find(|k| k.name_any() == name && k.namespace().as_deref() == Some(namespace))
        .cloned()
}

/// Everything the migration controller can read from the cluster and the
/// inventory
#[derive(Clone)]
pub(crate) struct World {
    pub plans: Vec<Plan>,
    pub providers: Vec<Provider>,
    pub network_maps: Vec<NetworkMap>,
    pub storage_maps: Vec<StorageMap>,
    pub hooks: Vec<Hook>,
    pub migrations: Vec<Migration>,
    pub vms: Vec<Vm>,
    pub settings: Settings,
}

impl Default for World {
    fn default() -> Self {
        Self {
            plans: vec![plan()],
            providers: vec![
                provider("vsphere", ProviderType::VSphere, "https://vcenter/sdk"),
                provider("host", ProviderType::OpenShift, ""),
            ],
            network_maps: vec![network_map()],
            storage_maps: vec![storage_map()],
            hooks: vec![hook("quiesce")],
            migrations: Vec::new(),
            vms: vec![vm("vm-1", "web-01", "host-1", 1)],
            settings: Settings::default(),
        }
    }
}

impl World {
    /// Replace the source provider's type
    pub fn with_source_type(mut self, type_: ProviderType) -> Self {
        for p in self.providers.iter_mut().filter(|p| p.name_any() == "vsphere") {
            p.spec.type_ = type_;
        }
        self
    }

    /// Lock the plan in warm mode
    pub fn warm(mut self) -> Self {
        for p in &mut self.plans {
            p.spec.warm = true;
            if let Some(s) = p.status.as_mut() {
                s.warm = Some(true);
            }
        }
        self
    }

    /// Plan VMs, replacing the default single VM
    pub fn with_plan_vms(mut self, vms: Vec<PlanVm>) -> Self {
        for p in &mut self.plans {
            p.spec.vms = vms.clone();
        }
        self
    }

    /// A harness driving `migration()` through this world
    pub fn harness(self) -> Harness {
        let settings = self.settings.clone();
        let world = Arc::new(Mutex::new(self));
        let writes = Writes::default();
        let workers = Workers::default();
        let hooks = Hooks::default();
        let targets = Targets::default();
        let ctx = Context::new(
            Arc::new(kube(&world, &writes)),
            Arc::new(inventory(&world)),
            Arc::new(workers.mock()),
            Arc::new(targets.mock()),
            Arc::new(hooks.mock()),
            settings,
        );
        Harness {
            ctx: Arc::new(ctx),
            migration: migration(),
            world,
            writes,
            workers,
            hooks,
            targets,
        }
    }
}

type Shared = Arc<Mutex<World>>;

fn read<T>(world: &Shared, f: impl FnOnce(&World) -> T) -> T {
    f(&world.lock().expect("mutex should not be poisoned"))
}

fn kube(world: &Shared, writes: &Writes) -> MockKubeClient {
    let mut kube = MockKubeClient::new();

    let w = world.clone();
    kube.expect_get_plan()
        .returning(move |name, ns| Ok(read(&w, |w| named(&w.plans, name, ns))));
    let w = world.clone();
    kube.expect_get_provider()
        .returning(move |name, ns| Ok(read(&w, |w| named(&w.providers, name, ns))));
    let w = world.clone();
    kube.expect_get_network_map()
        .returning(move |name, ns| Ok(read(&w, |w| named(&w.network_maps, name, ns))));
    let w = world.clone();
    kube.expect_get_storage_map()
        .returning(move |name, ns| Ok(read(&w, |w| named(&w.storage_maps, name, ns))));
    let w = world.clone();
    kube.expect_get_hook()
        .returning(move |name, ns| Ok(read(&w, |w| named(&w.hooks, name, ns))));
    let w = world.clone();
    kube.expect_list_migrations()
        .returning(move || Ok(read(&w, |w| w.migrations.clone())));

    let sink = writes.statuses.clone();
    kube.expect_patch_status().returning(move |_, _, status| {
        sink.lock()
            .expect("mutex should not be poisoned")
            .push(status.clone());
        Ok(())
    });
    kube
}

/// Inventory answering VM lookups from the world's VM list
fn inventory(world: &Shared) -> MockInventory {
    let mut inv = MockInventory::new();
    let w = world.clone();
    inv.expect_get_vm().returning(move |_, id| {
        Ok(read(&w, |w| match w.vms.iter().find(|v| v.id == id) {
            Some(vm) => Lookup::Found(vm.clone()),
            None => Lookup::NotFound,
        }))
    });
    let w = world.clone();
    inv.expect_list_vms()
        .returning(move |_| Ok(read(&w, |w| w.vms.clone())));
    inv
}

/// Statuses written by the controller
#[derive(Clone, Default)]
pub(crate) struct Writes {
    pub statuses: Arc<Mutex<Vec<MigrationStatus>>>,
}

impl Writes {
    pub fn count(&self) -> usize {
        self.statuses
            .lock()
            .expect("mutex should not be poisoned")
            .len()
    }

    pub fn last(&self) -> Option<MigrationStatus> {
        self.statuses
            .lock()
            .expect("mutex should not be poisoned")
            .last()
            .cloned()
    }
}

/// Conversion workers keyed by pod name
#[derive(Clone, Default)]
pub(crate) struct Workers {
    pub launched: Arc<Mutex<Vec<WorkerRequest>>>,
    pub running: Arc<Mutex<BTreeMap<String, WorkerStatus>>>,
    pub released: Arc<Mutex<Vec<String>>>,
    pub shutdowns: Arc<Mutex<Vec<String>>>,
    pub inspection: Arc<Mutex<Option<OperatingSystem>>>,
    pub rendered: Arc<Mutex<Option<serde_json::Value>>>,
    pub warnings: Arc<Mutex<Vec<WorkerWarning>>>,
}

impl Workers {
    fn mock(&self) -> MockConversionWorker {
        let mut worker = MockConversionWorker::new();

        let (launched, running) = (self.launched.clone(), self.running.clone());
        worker.expect_launch().returning(move |request| {
            let mut running = running.lock().expect("mutex should not be poisoned");
            if !running.contains_key(&request.handle.name) {
                running.insert(request.handle.name.clone(), WorkerStatus::default());
                launched
                    .lock()
                    .expect("mutex should not be poisoned")
                    .push(request.clone());
            }
            Ok(())
        });
        let running = self.running.clone();
        worker.expect_status().returning(move |handle| {
            Ok(running
                .lock()
                .expect("mutex should not be poisoned")
                .get(&handle.name)
                .cloned())
        });
        let inspection = self.inspection.clone();
        worker.expect_inspection().returning(move |_| {
            Ok(inspection
                .lock()
                .expect("mutex should not be poisoned")
                .clone())
        });
        let rendered = self.rendered.clone();
        worker.expect_rendered_vm().returning(move |_| {
            Ok(rendered
                .lock()
                .expect("mutex should not be poisoned")
                .clone())
        });
        let warnings = self.warnings.clone();
        worker.expect_warnings().returning(move |_| {
            Ok(warnings
                .lock()
                .expect("mutex should not be poisoned")
                .clone())
        });
        let shutdowns = self.shutdowns.clone();
        worker.expect_shutdown().returning(move |handle| {
            shutdowns
                .lock()
                .expect("mutex should not be poisoned")
                .push(handle.name.clone());
            Ok(())
        });
        let (released, running) = (self.released.clone(), self.running.clone());
        worker.expect_release().returning(move |handle| {
            if running
                .lock()
                .expect("mutex should not be poisoned")
                .remove(&handle.name)
                .is_some()
            {
                released
                    .lock()
                    .expect("mutex should not be poisoned")
                    .push(handle.name.clone());
            }
            Ok(())
        });
        worker
    }

    /// Stages launched so far, in order
    pub fn stages(&self) -> Vec<Stage> {
        self.launched
            .lock()
            .expect("mutex should not be poisoned")
            .iter()
            .map(|r| r.stage)
            .collect()
    }

    pub fn request(&self, stage: Stage) -> WorkerRequest {
        self.launched
            .lock()
            .expect("mutex should not be poisoned")
            .iter()
            .find(|r| r.stage == stage)
            .cloned()
            .expect("stage should have been launched")
    }

    fn update(&self, stage: Stage, f: impl FnOnce(&mut WorkerStatus)) {
        let name = self.request(stage).handle.name;
        let mut running = self.running.lock().expect("mutex should not be poisoned");
        f(running.entry(name).or_default());
    }

    pub fn report(&self, stage: Stage, disk: &str, transferred: u64, total: u64) {
        self.update(stage, |s| {
            s.progress.retain(|p| p.disk_id != disk);
            s.progress.push(DiskProgress {
                disk_id: disk.into(),
                bytes_transferred: transferred,
                total_bytes: total,
            });
        });
    }

    pub fn complete(&self, stage: Stage) {
        self.update(stage, |s| s.completion = Some(Completion::Succeeded));
    }

    pub fn fail(&self, stage: Stage, reasons: &[&str]) {
        self.update(stage, |s| {
            s.completion = Some(Completion::Failed(
                reasons.iter().map(|r| r.to_string()).collect(),
            ))
        });
    }

    pub fn inspect(&self, osinfo: &str) {
        *self.inspection.lock().expect("mutex should not be poisoned") = Some(OperatingSystem {
            name: "guest".into(),
            distro: "distro".into(),
            osinfo: osinfo.into(),
            arch: "x86_64".into(),
        });
    }

    pub fn released(&self) -> Vec<String> {
        self.released
            .lock()
            .expect("mutex should not be poisoned")
            .clone()
    }
}

/// Hook outcomes by step
#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub outcomes: Arc<Mutex<BTreeMap<String, HookOutcome>>>,
    pub requests: Arc<Mutex<Vec<HookRequest>>>,
}

impl Hooks {
    fn mock(&self) -> MockHookRunner {
        let mut hooks = MockHookRunner::new();
        let (outcomes, requests) = (self.outcomes.clone(), self.requests.clone());
        hooks.expect_run().returning(move |request| {
            requests
                .lock()
                .expect("mutex should not be poisoned")
                .push(request.clone());
            Ok(outcomes
                .lock()
                .expect("mutex should not be poisoned")
                .get(&request.step)
                .cloned()
                .unwrap_or(HookOutcome::Running))
        });
        hooks
    }

    pub fn set(&self, step: &str, outcome: HookOutcome) {
        self.outcomes
            .lock()
            .expect("mutex should not be poisoned")
            .insert(step.into(), outcome);
    }
}

/// VMs created on the target
#[derive(Clone, Default)]
pub(crate) struct Targets {
    pub created: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl Targets {
    fn mock(&self) -> MockTargetPlatform {
        let mut target = MockTargetPlatform::new();
        let created = self.created.clone();
        target.expect_exists().returning(move |_, name| {
            Ok(created
                .lock()
                .expect("mutex should not be poisoned")
                .iter()
                .any(|vm| vm["metadata"]["name"] == name))
        });
        let created = self.created.clone();
        target.expect_create_vm().returning(move |_, vm| {
            created
                .lock()
                .expect("mutex should not be poisoned")
                .push(vm.clone());
            Ok(vm.clone())
        });
        target
    }

    pub fn created(&self) -> Vec<serde_json::Value> {
        self.created
            .lock()
            .expect("mutex should not be poisoned")
            .clone()
    }
}

/// Drives one migration tick by tick, feeding written statuses back
pub(crate) struct Harness {
    pub ctx: Arc<Context>,
    pub migration: Migration,
    pub world: Arc<Mutex<World>>,
    pub writes: Writes,
    pub workers: Workers,
    pub hooks: Hooks,
    pub targets: Targets,
}

impl Harness {
    pub async fn tick(&mut self) -> Action {
        let action = reconcile(Arc::new(self.migration.clone()), self.ctx.clone())
            .await
            .expect("reconcile should succeed");
        if let Some(status) = self.writes.last() {
            self.migration.status = Some(status);
        }
        action
    }

    pub async fn ticks(&mut self, n: usize) {
        for _ in 0..n {
            self.tick().await;
        }
    }

    pub fn status(&self) -> MigrationStatus {
        self.migration.status.clone().unwrap_or_default()
    }

    pub fn vm(&self, id: &str) -> VmStatus {
        self.status()
            .find_vm(&Ref::with_id(id))
            .cloned()
            .expect("vm status should exist")
    }

    /// Change the cluster or inventory between ticks
    pub fn edit(&self, f: impl FnOnce(&mut World)) {
        f(&mut self.world.lock().expect("mutex should not be poisoned"));
    }
}
