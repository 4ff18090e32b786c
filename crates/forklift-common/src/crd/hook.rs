//! Hook CRD: a container image (and optional playbook) run at a pipeline step

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::Conditions;

/// Default hook deadline in seconds
pub const DEFAULT_HOOK_DEADLINE_SECS: i64 = 300;

/// Hook runs an image against a VM at a named pipeline step.
///
/// ```yaml
/// apiVersion: forklift.konveyor.io/v1beta1
/// kind: Hook
/// metadata:
///   name: quiesce
/// spec:
///   image: quay.io/konveyor/hook-runner:latest
///   playbook: LSBob3N0czogbG9jYWxob3N0Cg==
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "Hook",
    namespaced,
    status = "HookStatus",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HookSpec {
    /// Container image reference
    #[serde(default)]
    pub image: String,

    /// Base-64 encoded playbook
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playbook: Option<String>,

    /// Service account the hook job runs as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,

    /// Seconds before the hook job is killed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<i64>,
}

/// Hook status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HookStatus {
    /// Last generation processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Validation conditions
    #[serde(default)]
    pub conditions: Conditions,
}

impl Hook {
    /// Validated
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.conditions.is_ready())
    }

    /// Effective deadline in seconds
    pub fn deadline_secs(&self) -> i64 {
        self.spec
            .deadline
            .filter(|d| *d > 0)
            .unwrap_or(DEFAULT_HOOK_DEADLINE_SECS)
    }
}
