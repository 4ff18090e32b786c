//! Host CRD: an ESXi host of a vSphere provider reached directly for disk
//! transfer.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::Conditions;
use crate::refs::{ObjectRef, Ref};

/// Host names an inventory host and the address and credentials used to
/// transfer disks from it without going through vCenter.
///
/// ```yaml
/// apiVersion: forklift.konveyor.io/v1beta1
/// kind: Host
/// metadata:
///   name: esx-01
///   namespace: konveyor-forklift
/// spec:
///   provider:
///     namespace: konveyor-forklift
///     name: vsphere-prod
///   id: host-44
///   ipAddress: 10.10.0.21
///   secret:
///     namespace: konveyor-forklift
///     name: esx-01-creds
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "Host",
    namespaced,
    status = "HostStatus",
    printcolumn = r#"{"name":"Id","type":"string","jsonPath":".spec.id"}"#,
    printcolumn = r#"{"name":"Ip","type":"string","jsonPath":".spec.ipAddress"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HostSpec {
    /// Source provider the host belongs to
    #[serde(default)]
    pub provider: ObjectRef,

    /// Host in the provider's inventory
    #[serde(flatten)]
    pub ref_: Ref,

    /// Management address of the host
    #[serde(default)]
    pub ip_address: String,

    /// Secret holding the host credentials
    #[serde(default)]
    pub secret: ObjectRef,
}

/// Host status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostStatus {
    /// Last generation processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Validation conditions
    #[serde(default)]
    pub conditions: Conditions,
}

impl Host {
    /// Validated and reachable
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.conditions.is_ready())
    }

    /// Provider ref, defaulted to the host's namespace
    pub fn provider_ref(&self) -> ObjectRef {
        self.spec
            .provider
            .or_namespace(&self.namespace().unwrap_or_default())
    }

    /// Secret ref, defaulted to the host's namespace
    pub fn secret_ref(&self) -> ObjectRef {
        if self.spec.secret.name.is_empty() {
            return ObjectRef::default();
        }
        self.spec
            .secret
            .or_namespace(&self.namespace().unwrap_or_default())
    }

    /// Generation of the spec, 0 when unset
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(yaml: &str) -> Host {
        let mut host = Host::new("esx-01", serde_yaml::from_str(yaml).expect("valid host spec"));
        host.metadata.namespace = Some("forklift".into());
        host
    }

    #[test]
    fn inventory_ref_is_inline() {
        let host = host(
            r#"
provider: {namespace: forklift, name: vsphere}
id: host-44
ipAddress: 10.10.0.21
secret: {name: esx-creds}
"#,
        );
        assert_eq!(host.spec.ref_, Ref::with_id("host-44"));
        assert_eq!(host.spec.ip_address, "10.10.0.21");

        let json = serde_json::to_value(&host.spec).expect("spec serializes");
        assert_eq!(json["id"], "host-44");
        assert!(json.get("ref_").is_none());
    }

    #[test]
    fn refs_default_to_own_namespace() {
        let host = host("{provider: {name: vsphere}, name: esx-01.lab, secret: {name: creds}}");
        assert_eq!(host.provider_ref(), ObjectRef::new("forklift", "vsphere"));
        assert_eq!(host.secret_ref(), ObjectRef::new("forklift", "creds"));
        assert!(!host.is_ready());
    }

    #[test]
    fn unnamed_secret_stays_unset() {
        let host = host("{id: host-44}");
        assert!(!host.secret_ref().is_set());
        assert!(host.spec.ip_address.is_empty());
    }
}
