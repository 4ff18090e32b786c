//! Condition algebra shared by every resource status
//!
//! A [`Conditions`] set is keyed by condition type. Reconcilers rebuild the
//! whole set on each pass:
//!
//! ```text
//! status.conditions.begin_staging();
//! status.conditions.set_condition(...);   // any number of times
//! status.conditions.end_staging();
//! status.conditions.set_ready(!status.conditions.has_blocker_condition(), "...");
//! ```
//!
//! While staging, writes land in a separate working set; the published list
//! (the one serialized into the resource) is only replaced by
//! [`Conditions::end_staging`]. Conditions that were not set again during the
//! pass are dropped, unless they are durable.

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Resource has passed validation
pub const READY: &str = "Ready";
/// Reconcile returned an error
pub const RECONCILE_FAILED: &str = "ReconcileFailed";

/// Condition reasons shared across resources
pub mod reason {
    /// A required field is empty
    pub const NOT_SET: &str = "NotSet";
    /// A referenced object does not exist
    pub const NOT_FOUND: &str = "NotFound";
    /// More than one object matched where one was expected
    pub const NOT_UNIQUE: &str = "NotUnique";
    /// The value is outside the supported set
    pub const NOT_SUPPORTED: &str = "NotSupported";
    /// A name lookup matched several objects
    pub const AMBIGUOUS: &str = "Ambiguous";
    /// The value is malformed
    pub const NOT_VALID: &str = "NotValid";
    /// A field changed after it was locked
    pub const MODIFIED: &str = "Modified";
    /// The user asked for it
    pub const USER_REQUESTED: &str = "UserRequested";
    /// A process has finished
    pub const COMPLETED: &str = "Completed";
    /// A process has started
    pub const STARTED: &str = "Started";
    /// A connectivity check ran
    pub const TESTED: &str = "Tested";
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// The assertion holds
    True,
    /// The assertion does not hold
    False,
    /// Not yet determined
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// How a condition affects readiness
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum Category {
    /// Must hold for the resource to be ready
    Required,
    /// Informational
    #[default]
    Advisory,
    /// Blocks reconcile and readiness
    Critical,
    /// Blocks readiness
    Error,
    /// Warning; does not block readiness
    Warn,
}

impl Category {
    /// Critical and Error conditions block `Ready`
    pub fn is_blocker(self) -> bool {
        matches!(self, Category::Critical | Category::Error)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Required => "Required",
            Self::Advisory => "Advisory",
            Self::Critical => "Critical",
            Self::Error => "Error",
            Self::Warn => "Warn",
        };
        write!(f, "{s}")
    }
}

/// A typed assertion about a resource's observed state
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g. `SourceNetworkNotValid`)
    #[serde(rename = "type")]
    pub type_: String,

    /// Whether the assertion holds
    pub status: ConditionStatus,

    /// Effect on readiness
    pub category: Category,

    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: DateTime<Utc>,

    /// Survives staging even when not set again
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub durable: bool,

    /// Items referenced by the message (e.g. unresolved refs)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<String>,
}

impl Condition {
    /// Create a `True` condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        category: Category,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status: ConditionStatus::True,
            category,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
            durable: false,
            items: Vec::new(),
        }
    }

    /// Replace the status
    pub fn with_status(mut self, status: ConditionStatus) -> Self {
        self.status = status;
        self
    }

    /// Attach referenced items
    pub fn with_items(mut self, items: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.items = items.into_iter().map(Into::into).collect();
        self
    }

    /// Mark as durable
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// True when the condition is asserted
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    /// Equality ignoring the transition timestamp
    pub fn same_as(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.category == other.category
            && self.reason == other.reason
            && self.message == other.message
            && self.durable == other.durable
            && self.items == other.items
    }
}

/// Managed set of conditions keyed by type
///
/// Serializes as the bare published list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Conditions {
    list: Vec<Condition>,
    staged: Option<Vec<Condition>>,
}

impl Serialize for Conditions {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.list.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Conditions {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<Condition>::deserialize(deserializer).map(Self::from_list)
    }
}

impl JsonSchema for Conditions {
    fn schema_name() -> String {
        "Conditions".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        gen.subschema_for::<Vec<Condition>>()
    }
}

impl Conditions {
    /// Build a published set from a list
    pub fn from_list(list: Vec<Condition>) -> Self {
        Self { list, staged: None }
    }

    /// The published list, as watchers see it
    pub fn published(&self) -> &[Condition] {
        &self.list
    }

    /// True between `begin_staging` and `end_staging`
    pub fn is_staging(&self) -> bool {
        self.staged.is_some()
    }

    fn working(&self) -> &[Condition] {
        self.staged.as_deref().unwrap_or(&self.list)
    }

    fn working_mut(&mut self) -> &mut Vec<Condition> {
        match self.staged {
            Some(ref mut staged) => staged,
            None => &mut self.list,
        }
    }

    /// Iterate the working set
    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.working().iter()
    }

    /// Start a pass. Only durable conditions carry over automatically.
    pub fn begin_staging(&mut self) {
        let carried = self.list.iter().filter(|c| c.durable).cloned().collect();
        self.staged = Some(carried);
    }

    /// Publish the working set, dropping anything not set during the pass
    pub fn end_staging(&mut self) {
        if let Some(staged) = self.staged.take() {
            self.list = staged;
        }
    }

    /// Carry existing conditions of the given types into the working set
    pub fn stage_condition(&mut self, types: &[&str]) {
        let Some(staged) = self.staged.as_mut() else {
            return;
        };
        for c in self.list.iter().filter(|c| types.contains(&c.type_.as_str())) {
            if !staged.iter().any(|s| s.type_ == c.type_) {
                staged.push(c.clone());
            }
        }
    }

    /// Add or update conditions. The transition time only moves when the
    /// condition actually changes.
    pub fn set_condition(&mut self, condition: Condition) {
        let previous = self
            .list
            .iter()
            .find(|c| c.type_ == condition.type_)
            .cloned();
        let working = self.working_mut();
        match working.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                if !existing.same_as(&condition) {
                    *existing = condition;
                }
            }
            None => {
                let mut condition = condition;
                if let Some(prev) = previous.filter(|p| p.same_as(&condition)) {
                    condition.last_transition_time = prev.last_transition_time;
                }
                working.push(condition);
            }
        }
    }

    /// Merge another set into this one
    pub fn update_conditions(&mut self, other: &Conditions) {
        for c in other.iter() {
            self.set_condition(c.clone());
        }
    }

    /// Remove conditions by type
    pub fn delete_condition(&mut self, types: &[&str]) {
        self.working_mut()
            .retain(|c| !types.contains(&c.type_.as_str()));
    }

    /// Find a condition by type in the working set
    pub fn find_condition(&self, type_: &str) -> Option<&Condition> {
        self.working().iter().find(|c| c.type_ == type_)
    }

    /// All of the given types are present and `True`
    pub fn has_condition(&self, types: &[&str]) -> bool {
        !types.is_empty()
            && types
                .iter()
                .all(|t| self.find_condition(t).is_some_and(Condition::is_true))
    }

    /// Any of the given types is present and `True`
    pub fn has_any_condition(&self, types: &[&str]) -> bool {
        types
            .iter()
            .any(|t| self.find_condition(t).is_some_and(Condition::is_true))
    }

    /// Any `True` condition has one of the given categories
    pub fn has_condition_category(&self, categories: &[Category]) -> bool {
        self.working()
            .iter()
            .any(|c| c.is_true() && categories.contains(&c.category))
    }

    /// A `Critical` condition is present; reconcile should stop
    pub fn has_critical_condition(&self) -> bool {
        self.has_condition_category(&[Category::Critical])
    }

    /// An `Error` condition is present
    pub fn has_error_condition(&self) -> bool {
        self.has_condition_category(&[Category::Error])
    }

    /// A `Warn` condition is present
    pub fn has_warn_condition(&self) -> bool {
        self.has_condition_category(&[Category::Warn])
    }

    /// A condition that blocks `Ready` is present
    pub fn has_blocker_condition(&self) -> bool {
        self.has_condition_category(&[Category::Critical, Category::Error])
    }

    /// The `Ready` condition is present and `True`
    pub fn is_ready(&self) -> bool {
        self.has_condition(&[READY])
    }

    /// Set or clear `Ready`
    pub fn set_ready(&mut self, ready: bool, message: impl Into<String>) {
        if ready {
            self.set_condition(Condition::new(
                READY,
                Category::Required,
                reason::COMPLETED,
                message,
            ));
        } else {
            self.delete_condition(&[READY]);
        }
    }

    /// Messages of every blocking condition, for logs
    pub fn blocker_messages(&self) -> Vec<String> {
        self.working()
            .iter()
            .filter(|c| c.is_true() && c.category.is_blocker())
            .map(|c| format!("{}: {}", c.type_, c.message))
            .collect()
    }

    /// Number of conditions in the working set
    pub fn len(&self) -> usize {
        self.working().len()
    }

    /// True when the working set is empty
    pub fn is_empty(&self) -> bool {
        self.working().is_empty()
    }
}
