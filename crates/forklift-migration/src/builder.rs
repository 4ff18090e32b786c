//! Target VM rendering
//!
//! Builds a `kubevirt.io/v1` VirtualMachine from the inventory VM and the
//! plan's maps. When a conversion worker rendered its own object, only the
//! identity (name, namespace, labels, run strategy) is stamped over it.

use serde_json::{json, Map, Value};

use forklift_common::crd::{NetworkDestination, NetworkMap, PowerState, StorageMap, VmStatus};
use forklift_common::inventory::Vm;
use forklift_common::validation::sanitize_dns_label;
use forklift_common::{Error, LABEL_MIGRATION, LABEL_PLAN, LABEL_VM};

const MIB: i64 = 1 << 20;
const POD_NETWORK: &str = "default";

/// Everything needed to render one VM
pub struct Render<'a> {
    /// Inventory VM
    pub vm: &'a Vm,
    /// Its migration status
    pub status: &'a VmStatus,
    /// Target namespace
    pub namespace: &'a str,
    /// Network map of the plan
    pub network_map: &'a NetworkMap,
    /// Storage map of the plan
    pub storage_map: &'a StorageMap,
    /// Migration UID
    pub migration_uid: &'a str,
    /// Plan UID
    pub plan_uid: &'a str,
}

impl Render<'_> {
    fn labels(&self) -> Value {
        json!({
            LABEL_MIGRATION: self.migration_uid,
            LABEL_PLAN: self.plan_uid,
            LABEL_VM: sanitize_dns_label(&self.vm.id),
        })
    }

    fn running(&self) -> bool {
        self.status.restore_power_state == Some(PowerState::On)
    }
}

/// Render a VirtualMachine from the inventory and the maps
pub fn build(r: &Render<'_>) -> Result<Value, Error> {
    let name = &r.status.target_name;
    let mut disks = Vec::new();
    let mut volumes = Vec::new();
    let mut templates = Vec::new();

    for (i, disk) in r.vm.disks.iter().enumerate() {
        let pair = r
            .storage_map
            .find_storage_for(&disk.storage.id, &disk.storage.name)
            .ok_or_else(|| {
                Error::target(
                    r.namespace,
                    name,
                    format!("storage {} of disk {} is not mapped", disk.storage, disk.id),
                )
            })?;
        let dv = format!("{name}-disk-{i}");
        let mut storage = Map::new();
        storage.insert(
            "storageClassName".into(),
            json!(pair.destination.storage_class),
        );
        storage.insert(
            "resources".into(),
            json!({ "requests": { "storage": format!("{}Mi", mib_ceil(disk.capacity)) } }),
        );
        if let Some(mode) = &pair.destination.volume_mode {
            storage.insert("volumeMode".into(), json!(mode));
        }
        if let Some(mode) = &pair.destination.access_mode {
            storage.insert("accessModes".into(), json!([mode]));
        }

        disks.push(json!({ "name": format!("disk-{i}"), "disk": { "bus": "virtio" } }));
        volumes.push(json!({ "name": format!("disk-{i}"), "dataVolume": { "name": dv } }));
        templates.push(json!({
            "metadata": { "name": dv, "labels": r.labels() },
            "spec": { "source": { "blank": {} }, "storage": storage },
        }));
    }

    let mut interfaces = Vec::new();
    let mut networks = Vec::new();
    for (i, nic) in r.vm.nics.iter().enumerate() {
        let net = &nic.network;
        let pair = r
            .network_map
            .find_network_for(&net.id, &net.namespace, &net.name)
            .ok_or_else(|| {
                Error::target(
                    r.namespace,
                    name,
                    format!("network {net} of nic {} is not mapped", nic.mac),
                )
            })?;
        let iface = format!("net-{i}");
        match pair.destination.decode() {
            Some(NetworkDestination::Pod) => {
                interfaces.push(json!({ "name": iface, "macAddress": nic.mac, "masquerade": {} }));
                networks.push(json!({ "name": iface, "pod": {} }));
            }
            Some(NetworkDestination::Multus { namespace, name }) => {
                interfaces.push(json!({ "name": iface, "macAddress": nic.mac, "bridge": {} }));
                networks.push(json!({
                    "name": iface,
                    "multus": { "networkName": format!("{namespace}/{name}") },
                }));
            }
            Some(NetworkDestination::Ignored) => {}
            None => {
                return Err(Error::target(
                    r.namespace,
                    name,
                    format!("network type '{}' is not supported", pair.destination.type_),
                ))
            }
        }
    }
    if interfaces.is_empty() && r.vm.nics.is_empty() {
        interfaces.push(json!({ "name": POD_NETWORK, "masquerade": {} }));
        networks.push(json!({ "name": POD_NETWORK, "pod": {} }));
    }

    let firmware = if r.vm.firmware.eq_ignore_ascii_case("efi") {
        json!({ "bootloader": { "efi": { "secureBoot": false } } })
    } else {
        json!({ "bootloader": { "bios": {} } })
    };

    let mut annotations = Map::new();
    if let Some(os) = &r.status.operating_system {
        annotations.insert("vm.kubevirt.io/os".into(), json!(os));
    }

    Ok(json!({
        "apiVersion": "kubevirt.io/v1",
        "kind": "VirtualMachine",
        "metadata": {
            "name": name,
            "namespace": r.namespace,
            "labels": r.labels(),
            "annotations": annotations,
        },
        "spec": {
            "running": r.running(),
            "dataVolumeTemplates": templates,
            "template": {
                "metadata": { "labels": r.labels() },
                "spec": {
                    "domain": {
                        "cpu": { "cores": r.vm.cpu_count.max(1) },
                        "memory": { "guest": format!("{}Mi", r.vm.memory_mb.max(1)) },
                        "firmware": firmware,
                        "devices": { "disks": disks, "interfaces": interfaces },
                    },
                    "networks": networks,
                    "volumes": volumes,
                },
            },
        },
    }))
}

/// Stamp identity over an object rendered by the conversion worker
pub fn adopt(mut rendered: Value, r: &Render<'_>) -> Result<Value, Error> {
    let name = &r.status.target_name;
    let Some(object) = rendered.as_object_mut() else {
        return Err(Error::target(
            r.namespace,
            name,
            "rendered vm is not an object",
        ));
    };
    object.insert("apiVersion".into(), json!("kubevirt.io/v1"));
    object.insert("kind".into(), json!("VirtualMachine"));

    let metadata = object
        .entry("metadata")
        .or_insert_with(|| json!({}));
    let Some(metadata) = metadata.as_object_mut() else {
        return Err(Error::target(r.namespace, name, "rendered vm metadata is not an object"));
    };
    metadata.insert("name".into(), json!(name));
    metadata.insert("namespace".into(), json!(r.namespace));
    merge(metadata.entry("labels").or_insert_with(|| json!({})), r.labels());

    let spec = object.entry("spec").or_insert_with(|| json!({}));
    if let Some(spec) = spec.as_object_mut() {
        spec.remove("runStrategy");
        spec.insert("running".into(), json!(r.running()));
    }
    Ok(rendered)
}

fn merge(into: &mut Value, from: Value) {
    if let (Some(into), Value::Object(from)) = (into.as_object_mut(), from) {
        into.extend(from);
    }
}

fn mib_ceil(bytes: i64) -> i64 {
    (bytes.max(0) + MIB - 1) / MIB
}
