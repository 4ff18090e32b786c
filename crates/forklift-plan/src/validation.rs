//! Plan validation chain
//!
//! provider pair -> target namespace -> network map -> storage map -> warm
//! support -> VMs -> transfer network -> hooks. Every finding becomes a
//! condition; only cluster and inventory failures are returned as errors.

use std::collections::{BTreeMap, BTreeSet};

use kube::ResourceExt;
use tracing::debug;

use forklift_common::condition::{reason, Category, Condition, Conditions};
use forklift_common::crd::{
    NetworkMap, Plan, PlanSpec, PlanVm, Provider, ProviderPair, StorageMap, STEP_POST_HOOK,
    STEP_PRE_HOOK,
};
use forklift_common::inventory::{find_vm, InventoryProvider, Lookup, Vm};
use forklift_common::refs::ObjectRef;
use forklift_common::validation::{
    sanitize_dns_label, validate_dns1123_label, validate_dns1123_subdomain,
};
use forklift_common::Error;
use forklift_map::validation::{qualified_pair, validate_provider_pair};

use crate::controller::{is_executing, Context};
use crate::transfer::{prepare, validate_transfer_network};

/// Target namespace unset, malformed or missing
pub const NAMESPACE_NOT_VALID: &str = "NamespaceNotValid";
/// NetworkMap reference unset, missing or for other providers
pub const NETWORK_MAP_REF_NOT_VALID: &str = "NetworkMapRefNotValid";
/// NetworkMap is not Ready
pub const NETWORK_MAP_NOT_READY: &str = "NetworkMapNotReady";
/// StorageMap reference unset, missing or for other providers
pub const STORAGE_REF_NOT_VALID: &str = "StorageRefNotValid";
/// StorageMap is not Ready
pub const STORAGE_MAP_NOT_READY: &str = "StorageMapNotReady";
/// Source provider cannot do warm migration
pub const WARM_MIGRATION_NOT_READY: &str = "WarmMigrationNotReady";
/// VM reference has neither id nor name
pub const VM_REF_NOT_VALID: &str = "VMRefNotValid";
/// VM not in the source inventory
pub const VM_NOT_FOUND: &str = "VMNotFound";
/// Repeated or ambiguous VM reference
pub const DUPLICATE_VM: &str = "DuplicateVM";
/// VM NICs without a network mapping
pub const VM_NETWORKS_NOT_MAPPED: &str = "VMNetworksNotMapped";
/// VM disks without a storage mapping
pub const VM_STORAGE_NOT_MAPPED: &str = "VMStorageNotMapped";
/// Target VM name already taken
pub const VM_ALREADY_EXISTS: &str = "VMAlreadyExists";
/// Target VM name is not a DNS-1123 label
pub const TARGET_NAME_NOT_VALID: &str = "TargetNameNotValid";
/// Hook reference unset or missing
pub const HOOK_NOT_VALID: &str = "HookNotValid";
/// Hook is not Ready
pub const HOOK_NOT_READY: &str = "HookNotReady";
/// Unknown or repeated hook step
pub const HOOK_STEP_NOT_VALID: &str = "HookStepNotValid";

/// How far validation got
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Providers resolved and the full chain ran
    Resolved,
    /// Stopped at the provider pair
    ProvidersNotReady,
    /// Archived plans are not validated
    Archived,
}

/// Run the validation chain
pub(crate) async fn validate(
    ctx: &Context,
    plan: &Plan,
    conditions: &mut Conditions,
) -> Result<Outcome, Error> {
    let namespace = plan.namespace().unwrap_or_default();
    let pair = qualified_pair(&plan.spec.provider, &namespace);
    let source = fetch_provider(ctx, &pair.source).await?;
    let destination = fetch_provider(ctx, &pair.destination).await?;
    let Some(providers) = validate_provider_pair(&pair, source, destination, conditions) else {
        return Ok(Outcome::ProvidersNotReady);
    };

    let mut spec = plan.spec.clone();
    prepare(ctx, plan, &providers.destination, &mut spec).await?;

    validate_target_namespace(ctx, &spec, &providers.destination, conditions).await?;
    let network_map = validate_network_map(ctx, &spec, &pair, &namespace, conditions).await?;
    let storage_map = validate_storage_map(ctx, &spec, &pair, &namespace, conditions).await?;
    validate_warm(plan.is_warm(), &providers.source, conditions);
    if is_executing(conditions) {
        debug!("plan executing, VM validation skipped");
    } else {
        let maps = Maps {
            network: network_map.as_ref(),
            storage: storage_map.as_ref(),
        };
        validate_vms(ctx, &spec, &providers.source, &providers.destination, maps, conditions)
            .await?;
    }
    validate_transfer_network(ctx, &spec, &namespace, conditions).await?;
    validate_hooks(ctx, &spec, &namespace, conditions).await?;
    Ok(Outcome::Resolved)
}

async fn fetch_provider(ctx: &Context, r: &ObjectRef) -> Result<Option<Provider>, Error> {
    if r.name.is_empty() {
        return Ok(None);
    }
    ctx.kube.get_provider(&r.name, &r.namespace).await
}

async fn validate_target_namespace(
    ctx: &Context,
    spec: &PlanSpec,
    destination: &Provider,
    conditions: &mut Conditions,
) -> Result<(), Error> {
    let not_valid = |reason: &str| {
        Condition::new(
            NAMESPACE_NOT_VALID,
            Category::Critical,
            reason,
            "Target namespace is not valid.",
        )
    };
    let target = spec.target_namespace.as_str();
    if target.is_empty() {
        conditions.set_condition(not_valid(reason::NOT_SET));
    } else if validate_dns1123_subdomain(target).is_err() {
        conditions.set_condition(not_valid(reason::NOT_VALID).with_items([target]));
    } else if destination.is_host() && !ctx.kube.namespace_exists(target).await? {
        conditions.set_condition(not_valid(reason::NOT_FOUND).with_items([target]));
    }
    Ok(())
}

async fn validate_network_map(
    ctx: &Context,
    spec: &PlanSpec,
    pair: &ProviderPair,
    namespace: &str,
    conditions: &mut Conditions,
) -> Result<Option<NetworkMap>, Error> {
    let r = spec.map.network.or_namespace(namespace);
    let not_valid = |reason: &str| {
        Condition::new(
            NETWORK_MAP_REF_NOT_VALID,
            Category::Critical,
            reason,
            "Map.Network is not valid.",
        )
    };
    if r.name.is_empty() {
        conditions.set_condition(not_valid(reason::NOT_SET));
        return Ok(None);
    }
    let Some(map) = ctx.kube.get_network_map(&r.name, &r.namespace).await? else {
        conditions.set_condition(not_valid(reason::NOT_FOUND).with_items([r.to_string()]));
        return Ok(None);
    };
    if qualified_pair(&map.spec.provider, &r.namespace) != *pair {
        conditions.set_condition(not_valid(reason::NOT_VALID).with_items([r.to_string()]));
    }
    if !map.is_ready() {
        conditions.set_condition(
            Condition::new(
                NETWORK_MAP_NOT_READY,
                Category::Critical,
                reason::NOT_VALID,
                "Map.Network does not have Ready condition.",
            )
            .with_items([r.to_string()]),
        );
    }
    Ok(Some(map))
}

async fn validate_storage_map(
    ctx: &Context,
    spec: &PlanSpec,
    pair: &ProviderPair,
    namespace: &str,
    conditions: &mut Conditions,
) -> Result<Option<StorageMap>, Error> {
    let r = spec.map.storage.or_namespace(namespace);
    let not_valid = |reason: &str| {
        Condition::new(
            STORAGE_REF_NOT_VALID,
            Category::Critical,
            reason,
            "Map.Storage is not valid.",
        )
    };
    if r.name.is_empty() {
        conditions.set_condition(not_valid(reason::NOT_SET));
        return Ok(None);
    }
    let Some(map) = ctx.kube.get_storage_map(&r.name, &r.namespace).await? else {
        conditions.set_condition(not_valid(reason::NOT_FOUND).with_items([r.to_string()]));
        return Ok(None);
    };
    if qualified_pair(&map.spec.provider, &r.namespace) != *pair {
        conditions.set_condition(not_valid(reason::NOT_VALID).with_items([r.to_string()]));
    }
    if !map.is_ready() {
        conditions.set_condition(
            Condition::new(
                STORAGE_MAP_NOT_READY,
                Category::Critical,
                reason::NOT_VALID,
                "Map.Storage does not have Ready condition.",
            )
            .with_items([r.to_string()]),
        );
    }
    Ok(Some(map))
}

fn validate_warm(warm: bool, source: &Provider, conditions: &mut Conditions) {
    if warm && !source.spec.type_.capabilities().warm {
        conditions.set_condition(
            Condition::new(
                WARM_MIGRATION_NOT_READY,
                Category::Critical,
                reason::NOT_SUPPORTED,
                "Warm migration from the source provider is not supported.",
            )
            .with_items([source.spec.type_.as_str()]),
        );
    }
}

#[derive(Clone, Copy)]
struct Maps<'a> {
    network: Option<&'a NetworkMap>,
    storage: Option<&'a StorageMap>,
}

/// Findings of the VM pass, one item list per condition
#[derive(Default)]
struct VmFindings {
    not_set: Vec<String>,
    not_found: Vec<String>,
    not_unique: Vec<String>,
    ambiguous: Vec<String>,
    networks_not_mapped: Vec<String>,
    storage_not_mapped: Vec<String>,
    already_exists: Vec<String>,
    name_invalid: Vec<String>,
    name_normalized: Vec<String>,
}

impl VmFindings {
    fn publish(self, conditions: &mut Conditions) {
        let rules = [
            (VM_REF_NOT_VALID, Category::Critical, reason::NOT_SET, "VM reference has neither id nor name.", self.not_set),
            (VM_NOT_FOUND, Category::Critical, reason::NOT_FOUND, "VM not found.", self.not_found),
            (VM_NETWORKS_NOT_MAPPED, Category::Critical, reason::NOT_VALID, "VM has unmapped networks.", self.networks_not_mapped),
            (VM_STORAGE_NOT_MAPPED, Category::Critical, reason::NOT_VALID, "VM has unmapped storage.", self.storage_not_mapped),
            (VM_ALREADY_EXISTS, Category::Critical, reason::NOT_UNIQUE, "Target VM already exists.", self.already_exists),
        ];
        for (type_, category, reason, message, items) in rules {
            if !items.is_empty() {
                conditions.set_condition(
                    Condition::new(type_, category, reason, message).with_items(items),
                );
            }
        }

        if !self.not_unique.is_empty() {
            conditions.set_condition(
                Condition::new(DUPLICATE_VM, Category::Critical, reason::NOT_UNIQUE, "Duplicate (source) VM.")
                    .with_items(self.not_unique),
            );
        } else if !self.ambiguous.is_empty() {
            conditions.set_condition(
                Condition::new(DUPLICATE_VM, Category::Critical, reason::AMBIGUOUS, "VM reference is ambiguous.")
                    .with_items(self.ambiguous),
            );
        }

        if !self.name_invalid.is_empty() {
            conditions.set_condition(
                Condition::new(
                    TARGET_NAME_NOT_VALID,
                    Category::Critical,
                    reason::NOT_VALID,
                    "Target VM name does not comply with DNS1123 RFC.",
                )
                .with_items(self.name_invalid),
            );
        } else if !self.name_normalized.is_empty() {
            conditions.set_condition(
                Condition::new(
                    TARGET_NAME_NOT_VALID,
                    Category::Warn,
                    reason::NOT_VALID,
                    "Target VM name does not comply with DNS1123 RFC, will be automatically changed.",
                )
                .with_items(self.name_normalized),
            );
        }
    }
}

/// Name the VM will have on the target platform
pub fn target_name(vm: &PlanVm, source: &Vm) -> String {
    match vm.target_name.as_deref().filter(|n| !n.is_empty()) {
        Some(name) => name.to_string(),
        None => sanitize_dns_label(&source.name),
    }
}

async fn validate_vms(
    ctx: &Context,
    spec: &PlanSpec,
    source: &Provider,
    destination: &Provider,
    maps: Maps<'_>,
    conditions: &mut Conditions,
) -> Result<(), Error> {
    let handle = InventoryProvider::of(source);
    let mut findings = VmFindings::default();
    let mut seen_refs = BTreeSet::new();
    let mut seen_ids = BTreeSet::new();
    let mut target_names: BTreeMap<String, String> = BTreeMap::new();

    for (i, vm) in spec.vms.iter().enumerate() {
        let label = vm.source.to_string();
        if vm.source.not_set() {
            findings.not_set.push(format!("vms[{i}]"));
            continue;
        }
        if !seen_refs.insert(label.clone()) {
            findings.not_unique.push(label);
            continue;
        }
        let found = match find_vm(ctx.inventory.as_ref(), &handle, &vm.source).await? {
            Lookup::Found(found) => found,
            Lookup::NotFound => {
                findings.not_found.push(label);
                continue;
            }
            Lookup::Ambiguous => {
                findings.ambiguous.push(label);
                continue;
            }
        };
        if !seen_ids.insert(found.id.clone()) {
            findings.not_unique.push(label);
            continue;
        }

        if let Some(map) = maps.network {
            let unmapped = found
                .nics
                .iter()
                .any(|nic| {
                    let n = &nic.network;
                    map.find_network_for(&n.id, &n.namespace, &n.name).is_none()
                });
            if unmapped {
                findings.networks_not_mapped.push(label.clone());
            }
        }
        if let Some(map) = maps.storage {
            let unmapped = found
                .disks
                .iter()
                .any(|disk| map.find_storage_for(&disk.storage.id, &disk.storage.name).is_none());
            if unmapped {
                findings.storage_not_mapped.push(label.clone());
            }
        }

        let target = target_name(vm, &found);
        match vm.target_name.as_deref().filter(|n| !n.is_empty()) {
            Some(explicit) if validate_dns1123_label(explicit).is_err() => {
                findings.name_invalid.push(label.clone());
                continue;
            }
            None if validate_dns1123_label(&found.name).is_err() => {
                findings.name_normalized.push(label.clone());
            }
            _ => {}
        }
        if let Some(other) = target_names.insert(target.clone(), label.clone()) {
            findings.not_unique.push(format!("{label} (target name {target} also used by {other})"));
            continue;
        }
        if destination.is_host()
            && !spec.target_namespace.is_empty()
            && ctx
                .kube
                .virtual_machine_exists(&target, &spec.target_namespace)
                .await?
        {
            findings.already_exists.push(format!("{}/{target}", spec.target_namespace));
        }
    }

    findings.publish(conditions);
    Ok(())
}

async fn validate_hooks(
    ctx: &Context,
    spec: &PlanSpec,
    namespace: &str,
    conditions: &mut Conditions,
) -> Result<(), Error> {
    let mut not_set = Vec::new();
    let mut not_found = Vec::new();
    let mut not_ready = Vec::new();
    let mut step_not_valid = Vec::new();

    for vm in &spec.vms {
        let mut steps = BTreeSet::new();
        for hook in &vm.hooks {
            let known = hook.step == STEP_PRE_HOOK || hook.step == STEP_POST_HOOK;
            if !known || !steps.insert(hook.step.as_str()) {
                step_not_valid.push(format!("VM: {} step: {}", vm.source, hook.step));
            }
            if hook.hook.name.is_empty() {
                not_set.push(format!("VM: {}", vm.source));
                continue;
            }
            let r = hook.hook.or_namespace(namespace);
            match ctx.kube.get_hook(&r.name, &r.namespace).await? {
                None => not_found.push(format!("VM: {} hook: {r}", vm.source)),
                Some(found) if !found.is_ready() => {
                    not_ready.push(format!("VM: {} hook: {r}", vm.source))
                }
                Some(_) => {}
            }
        }
    }

    if !not_set.is_empty() {
        conditions.set_condition(
            Condition::new(
                HOOK_NOT_VALID,
                Category::Critical,
                reason::NOT_SET,
                "Hook specified by: `namespace` and `name`.",
            )
            .with_items(not_set),
        );
    } else if !not_found.is_empty() {
        conditions.set_condition(
            Condition::new(HOOK_NOT_VALID, Category::Critical, reason::NOT_FOUND, "Hook not found.")
                .with_items(not_found),
        );
    }
    if !not_ready.is_empty() {
        conditions.set_condition(
            Condition::new(
                HOOK_NOT_READY,
                Category::Critical,
                reason::NOT_VALID,
                "Hook does not have `Ready` condition.",
            )
            .with_items(not_ready),
        );
    }
    if !step_not_valid.is_empty() {
        conditions.set_condition(
            Condition::new(
                HOOK_STEP_NOT_VALID,
                Category::Critical,
                reason::NOT_VALID,
                "Hook step not valid.",
            )
            .with_items(step_not_valid),
        );
    }
    Ok(())
}
