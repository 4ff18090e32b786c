//! StorageMap CRD: translation of source datastores/domains to storage classes

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{MapStatus, ProviderPair};
use crate::refs::Ref;

/// StorageMap maps source storage onto target storage classes.
///
/// ```yaml
/// apiVersion: forklift.konveyor.io/v1beta1
/// kind: StorageMap
/// metadata:
///   name: prod-storage
/// spec:
///   provider:
///     source: {namespace: forklift, name: vsphere-prod}
///     destination: {namespace: forklift, name: host}
///   map:
///     - source: {id: datastore-1}
///       destination: {storageClass: standard, volumeMode: Block}
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "StorageMap",
    namespaced,
    status = "MapStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StorageMapSpec {
    /// Provider pair
    pub provider: ProviderPair,

    /// Ordered mapping pairs; the first match wins
    #[serde(default)]
    pub map: Vec<StoragePair>,
}

/// One source storage and its storage class
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoragePair {
    /// Source datastore / storage domain / volume type
    #[serde(default)]
    pub source: Ref,
    /// Target storage
    pub destination: DestinationStorage,
}

/// Target side of a storage pair
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DestinationStorage {
    /// Storage class name
    #[serde(default)]
    pub storage_class: String,
    /// `Filesystem` or `Block`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<String>,
    /// `ReadWriteOnce`, `ReadWriteMany`, ...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<String>,
}

impl DestinationStorage {
    /// Destination with only a storage class
    pub fn class(storage_class: impl Into<String>) -> Self {
        Self {
            storage_class: storage_class.into(),
            ..Default::default()
        }
    }
}

impl StorageMap {
    /// First pair whose source id equals `id`
    pub fn find_storage(&self, id: &str) -> Option<&StoragePair> {
        self.spec.map.iter().find(|p| p.source.id == id)
    }

    /// First pair whose source name equals `name`
    pub fn find_storage_by_name(&self, name: &str) -> Option<&StoragePair> {
        self.spec.map.iter().find(|p| p.source.name == name)
    }

    /// Pair for a source storage, preferring the id. An empty id or name
    /// never matches.
    pub fn find_storage_for(&self, id: &str, name: &str) -> Option<&StoragePair> {
        if !id.is_empty() {
            if let Some(pair) = self.find_storage(id) {
                return Some(pair);
            }
        }
        if name.is_empty() {
            return None;
        }
        self.spec
            .map
            .iter()
            .find(|p| p.source.id.is_empty() && p.source.name == name)
    }

    /// Ready according to the last validation pass
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.conditions.is_ready())
    }
}
