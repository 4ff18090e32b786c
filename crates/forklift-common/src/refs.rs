//! References to source-side inventory objects and to cluster resources

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to an object in a provider's inventory
///
/// The first non-empty field wins for lookup: `id`, then `namespace`+`name`,
/// then `name`. A `name` of the form `ns/name` is treated as namespaced.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Ref {
    /// Inventory identifier
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Object name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Object namespace (namespaced sources only)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Object type (e.g. a network type on the source)
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub type_: String,
}

/// How a [`Ref`] should be resolved
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefLookup<'a> {
    /// By inventory id
    Id(&'a str),
    /// By namespace and name
    Namespaced {
        /// Namespace
        namespace: &'a str,
        /// Name
        name: &'a str,
    },
    /// By plain name
    Name(&'a str),
}

impl Ref {
    /// Reference by id
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Reference by name
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// True when neither id nor name is set
    pub fn not_set(&self) -> bool {
        self.id.is_empty() && self.name.is_empty()
    }

    /// Resolution strategy, or `None` when the ref is empty
    pub fn lookup(&self) -> Option<RefLookup<'_>> {
        if !self.id.is_empty() {
            return Some(RefLookup::Id(&self.id));
        }
        if self.name.is_empty() {
            return None;
        }
        if !self.namespace.is_empty() {
            return Some(RefLookup::Namespaced {
                namespace: &self.namespace,
                name: &self.name,
            });
        }
        match self.name.split_once('/') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                Some(RefLookup::Namespaced { namespace, name })
            }
            _ => Some(RefLookup::Name(&self.name)),
        }
    }

    /// True when this ref designates the given inventory object
    pub fn matches(&self, id: &str, namespace: &str, name: &str) -> bool {
        match self.lookup() {
            Some(RefLookup::Id(ref_id)) => ref_id == id,
            Some(RefLookup::Namespaced {
                namespace: ns,
                name: n,
            }) => ns == namespace && n == name,
            Some(RefLookup::Name(n)) => n == name,
            None => false,
        }
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.id.is_empty(), self.name.is_empty()) {
            (false, false) => write!(f, "id:{} name:'{}'", self.id, self.name),
            (false, true) => write!(f, "id:{}", self.id),
            (true, false) if !self.namespace.is_empty() => {
                write!(f, "name:'{}/{}'", self.namespace, self.name)
            }
            (true, false) => write!(f, "name:'{}'", self.name),
            (true, true) => write!(f, "<empty>"),
        }
    }
}

/// Reference to a namespaced cluster resource
#[derive(
    Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    /// Resource namespace
    #[serde(default)]
    pub namespace: String,
    /// Resource name
    #[serde(default)]
    pub name: String,
}

impl ObjectRef {
    /// Create a reference
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Both namespace and name are set
    pub fn is_set(&self) -> bool {
        !self.namespace.is_empty() && !self.name.is_empty()
    }

    /// The same reference, in `namespace` when it names none
    pub fn or_namespace(&self, namespace: &str) -> ObjectRef {
        if self.namespace.is_empty() {
            ObjectRef::new(namespace, self.name.clone())
        } else {
            self.clone()
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
