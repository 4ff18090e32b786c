//! Types shared by several CRDs

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::Conditions;
use crate::refs::{ObjectRef, Ref};

/// Source and destination providers of a map or plan
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderPair {
    /// Provider VMs are migrated from
    #[serde(default)]
    pub source: ObjectRef,
    /// Provider VMs are migrated to (a `openshift` provider)
    #[serde(default)]
    pub destination: ObjectRef,
}

/// Status shared by NetworkMap and StorageMap
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MapStatus {
    /// Last generation processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Validation conditions
    #[serde(default)]
    pub conditions: Conditions,

    /// Source refs resolved against inventory on the last pass
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<Ref>,
}

/// Identity and generation of a resource at a point in time
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Generation {
    /// Namespace
    #[serde(default)]
    pub namespace: String,
    /// Name
    #[serde(default)]
    pub name: String,
    /// UID
    #[serde(default)]
    pub uid: String,
    /// `metadata.generation`
    #[serde(default)]
    pub generation: i64,
}

impl Generation {
    /// Capture the identity of a resource
    pub fn of<K: kube::Resource>(obj: &K) -> Self {
        let meta = obj.meta();
        Self {
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
            uid: meta.uid.clone().unwrap_or_default(),
            generation: meta.generation.unwrap_or_default(),
        }
    }

    /// The same resource (uid, or namespace/name when uids are absent)
    pub fn same_object(&self, other: &Generation) -> bool {
        if !self.uid.is_empty() && !other.uid.is_empty() {
            return self.uid == other.uid;
        }
        self.namespace == other.namespace && self.name == other.name
    }

    /// Reference form
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(&self.namespace, &self.name)
    }
}
