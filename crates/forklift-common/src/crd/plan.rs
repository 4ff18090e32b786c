//! Plan CRD: the unit of migration intent

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ProviderPair;
use crate::condition::Conditions;
use crate::refs::{ObjectRef, Ref};
use crate::{Error, Result, ANN_POPULATOR_LABELS};

/// Hook step run before disk transfer
pub const STEP_PRE_HOOK: &str = "PreHook";
/// Hook step run after the target VM is created
pub const STEP_POST_HOOK: &str = "PostHook";

/// Plan selects VMs on a source provider and the maps used to migrate them.
///
/// ```yaml
/// apiVersion: forklift.konveyor.io/v1beta1
/// kind: Plan
/// metadata:
///   name: wave-1
/// spec:
///   provider:
///     source: {namespace: forklift, name: vsphere-prod}
///     destination: {namespace: forklift, name: host}
///   map:
///     network: {namespace: forklift, name: prod-networks}
///     storage: {namespace: forklift, name: prod-storage}
///   targetNamespace: migrated
///   warm: false
///   vms:
///     - id: vm-42
///       hooks:
///         - step: PreHook
///           hook: {namespace: forklift, name: quiesce}
///     - name: web-01
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "Plan",
    namespaced,
    status = "PlanStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Executing","type":"string","jsonPath":".status.conditions[?(@.type==\"Executing\")].status"}"#,
    printcolumn = r#"{"name":"Warm","type":"boolean","jsonPath":".spec.warm"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PlanSpec {
    /// Provider pair
    pub provider: ProviderPair,

    /// Network and storage maps
    #[serde(default)]
    pub map: PlanMaps,

    /// Namespace the VMs are created in
    #[serde(default)]
    pub target_namespace: String,

    /// VMs to migrate
    #[serde(default)]
    pub vms: Vec<PlanVm>,

    /// Incremental copy with a later cutover
    #[serde(default)]
    pub warm: bool,

    /// Archived plans are kept for history and no longer validated
    #[serde(default)]
    pub archived: bool,

    /// Network attachment used for disk transfer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_network: Option<ObjectRef>,
}

/// Maps referenced by a plan
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanMaps {
    /// NetworkMap
    #[serde(default)]
    pub network: ObjectRef,
    /// StorageMap
    #[serde(default)]
    pub storage: ObjectRef,
}

/// A VM selected by a plan
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanVm {
    /// Source VM
    #[serde(flatten)]
    pub source: Ref,

    /// Name of the created VM, defaults to the (normalized) source name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,

    /// Hooks bound to pipeline steps
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookRef>,
}

/// Binding of a Hook to a pipeline step
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HookRef {
    /// `PreHook` or `PostHook`
    pub step: String,
    /// Hook resource
    pub hook: ObjectRef,
}

impl PlanVm {
    /// Hook bound to `step`, if any
    pub fn hook_for(&self, step: &str) -> Option<&ObjectRef> {
        self.hooks.iter().find(|h| h.step == step).map(|h| &h.hook)
    }
}

/// Plan status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanStatus {
    /// Last generation processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Validation and execution conditions
    #[serde(default)]
    pub conditions: Conditions,

    /// Migration mode recorded on first reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm: Option<bool>,
}

impl Plan {
    /// Effective migration mode: the recorded value once locked
    pub fn is_warm(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.warm)
            .unwrap_or(self.spec.warm)
    }

    /// Validated and ready to run
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.conditions.is_ready())
    }

    /// Populator labels annotation has been stamped
    pub fn has_populator_labels(&self) -> bool {
        self.annotations()
            .get(ANN_POPULATOR_LABELS)
            .is_some_and(|v| v == "True")
    }

    /// Generation of the spec, 0 when unset
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or_default()
    }
}

/// Reject updates that toggle the migration mode of an existing plan
pub fn validate_update(old: &Plan, new: &Plan) -> Result<()> {
    let locked = old.is_warm();
    if new.spec.warm != locked {
        return Err(Error::validation_for_field(
            format!("{}/{}", old.namespace().unwrap_or_default(), old.name_any()),
            "spec.warm",
            format!("warm cannot be changed after creation (locked to {locked})"),
        ));
    }
    Ok(())
}
