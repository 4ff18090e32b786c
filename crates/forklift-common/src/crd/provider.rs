//! Provider CRD: a connection to a source hypervisor platform or to the
//! target cluster.

use std::collections::BTreeMap;
use std::fmt;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::Conditions;
use crate::refs::ObjectRef;
use crate::ANN_DEFAULT_TRANSFER_NETWORK;

/// Provider registers a source platform or the target cluster.
///
/// ```yaml
/// apiVersion: forklift.konveyor.io/v1beta1
/// kind: Provider
/// metadata:
///   name: vsphere-prod
///   namespace: konveyor-forklift
/// spec:
///   type: vsphere
///   url: https://vcenter.example.com/sdk
///   secret:
///     namespace: konveyor-forklift
///     name: vsphere-prod-creds
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "Provider",
    namespaced,
    status = "ProviderStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Url","type":"string","jsonPath":".spec.url"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    /// Platform type
    #[serde(default, rename = "type")]
    pub type_: ProviderType,

    /// Platform endpoint. Empty means the local cluster.
    #[serde(default)]
    pub url: String,

    /// Secret holding credentials
    #[serde(default)]
    pub secret: ObjectRef,

    /// Free-form provider settings
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, String>,
}

/// Supported platforms
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Target cluster (or a remote cluster used as a source)
    OpenShift,
    /// VMware vSphere
    VSphere,
    /// oVirt / RHV
    OVirt,
    /// OpenStack
    OpenStack,
    /// OVA archives on an NFS share
    Ova,
    /// Missing or unknown type; never usable
    #[default]
    #[serde(other)]
    Undefined,
}

impl ProviderType {
    /// Every supported type
    pub const ALL: [ProviderType; 5] = [
        ProviderType::OpenShift,
        ProviderType::VSphere,
        ProviderType::OVirt,
        ProviderType::OpenStack,
        ProviderType::Ova,
    ];

    /// A known platform
    pub fn is_supported(&self) -> bool {
        *self != ProviderType::Undefined
    }

    /// Lowercase wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::OpenShift => "openshift",
            ProviderType::VSphere => "vsphere",
            ProviderType::OVirt => "ovirt",
            ProviderType::OpenStack => "openstack",
            ProviderType::Ova => "ova",
            ProviderType::Undefined => "undefined",
        }
    }

    /// What the control plane can do with this platform
    pub fn capabilities(&self) -> Capabilities {
        match self {
            ProviderType::OpenShift => Capabilities {
                source: true,
                target: true,
                warm: false,
                guest_conversion: false,
            },
            ProviderType::VSphere => Capabilities {
                source: true,
                target: false,
                warm: true,
                guest_conversion: true,
            },
            ProviderType::OVirt => Capabilities {
                source: true,
                target: false,
                warm: true,
                guest_conversion: false,
            },
            ProviderType::OpenStack => Capabilities {
                source: true,
                target: false,
                warm: false,
                guest_conversion: false,
            },
            ProviderType::Ova => Capabilities {
                source: true,
                target: false,
                warm: false,
                guest_conversion: true,
            },
            ProviderType::Undefined => Capabilities {
                source: false,
                target: false,
                warm: false,
                guest_conversion: false,
            },
        }
    }

    /// Secret keys required to talk to the platform
    pub fn required_secret_keys(&self, insecure_skip_verify: bool) -> Vec<&'static str> {
        match self {
            ProviderType::OpenShift => vec!["token"],
            ProviderType::VSphere | ProviderType::OpenStack => vec!["user", "password"],
            ProviderType::OVirt if insecure_skip_verify => vec!["user", "password"],
            ProviderType::OVirt => vec!["user", "password", "cacert"],
            ProviderType::Ova => vec!["url"],
            ProviderType::Undefined => Vec::new(),
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Capability set of a provider type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// Can be the source of a migration
    pub source: bool,
    /// Can be the destination of a migration
    pub target: bool,
    /// Supports warm (incremental) migration
    pub warm: bool,
    /// Guests need conversion (inspection + virt-v2v) after transfer
    pub guest_conversion: bool,
}

/// Provider lifecycle phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ProviderPhase {
    /// Not yet validated
    #[default]
    Pending,
    /// Spec is invalid
    ValidationFailed,
    /// Endpoint could not be reached
    ConnectionFailed,
    /// Inventory is loading
    Staging,
    /// Usable by maps and plans
    Ready,
}

/// Provider status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    /// Last generation processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Lifecycle phase
    #[serde(default)]
    pub phase: ProviderPhase,

    /// Validation conditions
    #[serde(default)]
    pub conditions: Conditions,
}

impl Provider {
    /// The local cluster: type openshift with an empty URL
    pub fn is_host(&self) -> bool {
        self.spec.type_ == ProviderType::OpenShift && self.spec.url.is_empty()
    }

    /// Validated and ready for use
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.conditions.is_ready())
    }

    /// Network the provider asks plans to use for disk transfer
    pub fn default_transfer_network(&self) -> Option<&str> {
        self.annotations()
            .get(ANN_DEFAULT_TRANSFER_NETWORK)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Stable identity used to key inventory watches
    pub fn inventory_key(&self) -> String {
        self.uid()
            .unwrap_or_else(|| format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any()))
    }

    /// Generation of the spec, 0 when unset
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> ProviderSpec {
        serde_yaml::from_str(yaml).expect("valid provider spec")
    }

    #[test]
    fn spec_parses_from_yaml() {
        let spec = parse(
            r#"
type: vsphere
url: https://vcenter.example.com/sdk
secret:
  namespace: forklift
  name: creds
"#,
        );
        assert_eq!(spec.type_, ProviderType::VSphere);
        assert_eq!(spec.secret.name, "creds");
    }

    #[test]
    fn unknown_or_missing_type_is_undefined() {
        let spec = parse("type: hyperv\n");
        assert_eq!(spec.type_, ProviderType::Undefined);
        assert!(!spec.type_.is_supported());
        assert_eq!(parse("url: x\n").type_, ProviderType::Undefined);
    }

    #[test]
    fn host_provider_has_empty_url() {
        let host = Provider::new(
            "host",
            ProviderSpec {
                type_: ProviderType::OpenShift,
                url: String::new(),
                secret: ObjectRef::default(),
                settings: BTreeMap::new(),
            },
        );
        assert!(host.is_host());
        assert!(!host.is_ready());
    }

    #[test]
    fn capabilities_select_conversion_and_warm() {
        assert!(ProviderType::VSphere.capabilities().guest_conversion);
        assert!(ProviderType::Ova.capabilities().guest_conversion);
        assert!(!ProviderType::OVirt.capabilities().guest_conversion);
        assert!(ProviderType::OVirt.capabilities().warm);
        assert!(!ProviderType::OpenStack.capabilities().warm);
        assert!(ProviderType::OpenShift.capabilities().target);
        assert!(!ProviderType::VSphere.capabilities().target);
    }

    #[test]
    fn ovirt_needs_ca_unless_insecure() {
        assert!(ProviderType::OVirt
            .required_secret_keys(false)
            .contains(&"cacert"));
        assert!(!ProviderType::OVirt
            .required_secret_keys(true)
            .contains(&"cacert"));
    }

    #[test]
    fn default_transfer_network_from_annotation() {
        let mut p = Provider::new(
            "host",
            ProviderSpec {
                type_: ProviderType::OpenShift,
                url: String::new(),
                secret: ObjectRef::default(),
                settings: BTreeMap::new(),
            },
        );
        assert_eq!(p.default_transfer_network(), None);
        p.annotations_mut().insert(
            ANN_DEFAULT_TRANSFER_NETWORK.to_string(),
            "my-network".to_string(),
        );
        assert_eq!(p.default_transfer_network(), Some("my-network"));
    }
}
