//! Migration CRD: one execution of a plan, with per-VM pipeline status

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Generation;
use crate::condition::Conditions;
use crate::refs::{ObjectRef, Ref};

/// Migration runs a plan once.
///
/// ```yaml
/// apiVersion: forklift.konveyor.io/v1beta1
/// kind: Migration
/// metadata:
///   name: wave-1-run-1
/// spec:
///   plan: {namespace: forklift, name: wave-1}
///   cutover: "2026-10-20T02:00:00Z"
///   cancel:
///     - id: vm-42
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "Migration",
    namespaced,
    status = "MigrationStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Running","type":"string","jsonPath":".status.conditions[?(@.type==\"Running\")].status"}"#,
    printcolumn = r#"{"name":"Succeeded","type":"string","jsonPath":".status.conditions[?(@.type==\"Succeeded\")].status"}"#,
    printcolumn = r#"{"name":"Failed","type":"string","jsonPath":".status.conditions[?(@.type==\"Failed\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSpec {
    /// Plan to execute
    #[serde(default)]
    pub plan: ObjectRef,

    /// When a warm migration performs its final copy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cutover: Option<DateTime<Utc>>,

    /// VMs to abort
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancel: Vec<Ref>,
}

/// Migration status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    /// Last generation processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Validation and progress conditions
    #[serde(default)]
    pub conditions: Conditions,

    /// When execution began
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,

    /// When every VM reached a terminal phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,

    /// Append-only activation records
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<Snapshot>,

    /// Per-VM pipeline status
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vms: Vec<VmStatus>,

    /// Disk transfer progress summed over every VM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
}

/// Generations of every resource involved in one activation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Migration identity
    pub migration: Generation,
    /// Plan identity
    pub plan: Generation,
    /// Map identities
    pub map: SnapshotMaps,
    /// Provider identities
    pub provider: SnapshotProviders,
    /// When the snapshot was taken
    pub created: DateTime<Utc>,
}

/// Map generations in a snapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMaps {
    /// NetworkMap
    pub network: Generation,
    /// StorageMap
    pub storage: Generation,
}

/// Provider generations in a snapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotProviders {
    /// Source provider
    pub source: Generation,
    /// Destination provider
    pub destination: Generation,
}

impl Snapshot {
    /// Maps or providers moved relative to `other`. Plan generation is not
    /// compared.
    pub fn dependencies_changed(&self, other: &Snapshot) -> bool {
        self.map != other.map || self.provider != other.provider
    }
}

/// Per-VM position in its itinerary
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum VmPhase {
    /// Waiting for the scheduler
    #[default]
    Pending,
    /// Admitted; source power state recorded
    Started,
    /// Pre-migration hook
    PreHook,
    /// Guest inspection
    Inspecting,
    /// Disk transfer set up
    TransferringDisks,
    /// Warm: first full copy
    InitialCopy,
    /// Warm: delta copies until cutover
    IncrementalCopy,
    /// Warm: source powered off, final delta
    Cutover,
    /// Guest conversion
    Converting,
    /// Target VM created
    CreatingTarget,
    /// Post-migration hook
    PostHook,
    /// Done
    Completed,
    /// Aborted by the user
    Canceled,
}

impl VmPhase {
    /// No further work will happen
    pub fn is_terminal(self) -> bool {
        matches!(self, VmPhase::Completed | VmPhase::Canceled)
    }
}

/// Source power state
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PowerState {
    /// Running
    On,
    /// Stopped
    Off,
    /// Unreported
    Unknown,
}

/// Status of one VM in a migration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmStatus {
    /// Source VM
    #[serde(flatten)]
    pub source: Ref,

    /// Name of the created VM
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_name: String,

    /// Itinerary phase
    #[serde(default)]
    pub phase: VmPhase,

    /// Ordered pipeline steps
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pipeline: Vec<Task>,

    /// Admission time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,

    /// Terminal time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,

    /// Errors rolled up from steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,

    /// Per-VM advisories (worker warnings, ...)
    #[serde(default)]
    pub conditions: Conditions,

    /// Source power state recorded when the VM started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_power_state: Option<PowerState>,

    /// Guest OS reported by inspection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operating_system: Option<String>,

    /// Warm copy bookkeeping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm: Option<WarmStatus>,
}

/// Warm copy bookkeeping
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WarmStatus {
    /// Copies performed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub precopies: Vec<Precopy>,
    /// Earliest time of the next incremental copy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_precopy_at: Option<DateTime<Utc>>,
    /// Consecutive failed copies
    #[serde(default)]
    pub failures: u32,
}

/// One warm copy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Precopy {
    /// Copy start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    /// Copy end
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

/// Progress state of a task
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TaskPhase {
    /// Not started
    #[default]
    Pending,
    /// In progress
    Running,
    /// Finished (possibly with an error)
    Completed,
}

/// Units of work
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// Units done
    pub completed: i64,
    /// Units expected
    pub total: i64,
    /// Unit name (e.g. `MB`)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub units: String,
}

/// Error attached to a task
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    /// Phase the error occurred in
    pub phase: String,
    /// Deduplicated reasons
    #[serde(default)]
    pub reasons: Vec<String>,
}

impl TaskError {
    /// Append reasons, skipping duplicates
    pub fn add(&mut self, reasons: impl IntoIterator<Item = impl Into<String>>) {
        for r in reasons {
            let r = r.into();
            if !self.reasons.contains(&r) {
                self.reasons.push(r);
            }
        }
    }
}

/// A pipeline step or one of its sub-tasks
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Step name (e.g. `DiskTransfer`) or sub-task name (disk id)
    pub name: String,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Progress state
    #[serde(default)]
    pub phase: TaskPhase,
    /// Work done
    #[serde(default)]
    pub progress: Progress,
    /// Start time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    /// Completion time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
    /// Accumulated error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Nested tasks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<Task>,
}

impl Task {
    /// New pending task
    pub fn new(name: impl Into<String>, description: impl Into<String>, total: i64, units: &str) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            progress: Progress {
                completed: 0,
                total,
                units: units.to_string(),
            },
            ..Default::default()
        }
    }

    /// Mark as running (idempotent)
    pub fn mark_started(&mut self) {
        if self.started.is_none() {
            self.started = Some(Utc::now());
        }
        if self.phase == TaskPhase::Pending {
            self.phase = TaskPhase::Running;
        }
    }

    /// Mark as finished (idempotent)
    pub fn mark_completed(&mut self) {
        self.mark_started();
        if self.completed.is_none() {
            self.completed = Some(Utc::now());
        }
        self.phase = TaskPhase::Completed;
    }

    /// Finished
    pub fn is_completed(&self) -> bool {
        self.phase == TaskPhase::Completed
    }

    /// Record an error; reasons are deduplicated
    pub fn add_error(&mut self, phase: impl Into<String>, reasons: impl IntoIterator<Item = impl Into<String>>) {
        let phase = phase.into();
        let error = self.error.get_or_insert_with(|| TaskError {
            phase,
            reasons: Vec::new(),
        });
        error.add(reasons);
    }

    /// This task or any sub-task has an error
    pub fn has_error(&self) -> bool {
        self.error.is_some() || self.tasks.iter().any(Task::has_error)
    }

    /// Sub-task by name
    pub fn find_task_mut(&mut self, name: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.name == name)
    }

    /// Roll sub-task progress and errors up into this task. Completes the
    /// task when every sub-task has completed.
    pub fn reflect(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        self.progress.completed = self.tasks.iter().map(|t| t.progress.completed).sum();
        self.progress.total = self.tasks.iter().map(|t| t.progress.total).sum();

        let reasons: Vec<String> = self
            .tasks
            .iter()
            .filter_map(|t| t.error.as_ref())
            .flat_map(|e| e.reasons.iter().cloned())
            .collect();
        if !reasons.is_empty() {
            self.add_error(self.name.clone(), reasons);
        }

        if self.tasks.iter().any(|t| t.phase != TaskPhase::Pending) {
            self.mark_started();
        }
        if self.tasks.iter().all(Task::is_completed) {
            self.mark_completed();
        }
    }
}

impl VmStatus {
    /// Pending status for a plan VM
    pub fn new(source: Ref, target_name: impl Into<String>) -> Self {
        Self {
            source,
            target_name: target_name.into(),
            ..Default::default()
        }
    }

    /// Admitted and not yet terminal
    pub fn is_running(&self) -> bool {
        self.started.is_some() && !self.is_completed()
    }

    /// Reached a terminal phase
    pub fn is_completed(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Step by name
    pub fn find_step(&self, name: &str) -> Option<&Task> {
        self.pipeline.iter().find(|s| s.name == name)
    }

    /// Mutable step by name
    pub fn find_step_mut(&mut self, name: &str) -> Option<&mut Task> {
        self.pipeline.iter_mut().find(|s| s.name == name)
    }

    /// Any error on the VM or its steps
    pub fn has_error(&self) -> bool {
        self.error.is_some() || self.pipeline.iter().any(Task::has_error)
    }

    /// Record an error on the VM itself
    pub fn add_error(&mut self, phase: impl Into<String>, reasons: impl IntoIterator<Item = impl Into<String>>) {
        let phase = phase.into();
        self.error
            .get_or_insert_with(|| TaskError {
                phase,
                reasons: Vec::new(),
            })
            .add(reasons);
    }

    /// Roll step errors up to the VM
    pub fn reflect(&mut self) {
        for step in &mut self.pipeline {
            step.reflect();
        }
        let errors: Vec<(String, Vec<String>)> = self
            .pipeline
            .iter()
            .filter_map(|s| s.error.as_ref().map(|e| (e.phase.clone(), e.reasons.clone())))
            .collect();
        for (phase, reasons) in errors {
            self.add_error(phase, reasons);
        }
    }

    /// Summed progress over every step with the given units
    pub fn progress(&self, units: &str) -> Progress {
        let steps = self.pipeline.iter().filter(|s| s.progress.units == units);
        let (completed, total) = steps.fold((0, 0), |(c, t), s| {
            (c + s.progress.completed, t + s.progress.total)
        });
        Progress {
            completed,
            total,
            units: units.to_string(),
        }
    }

    /// Move to a terminal phase
    pub fn finish(&mut self, phase: VmPhase) {
        self.phase = phase;
        if self.completed.is_none() {
            self.completed = Some(Utc::now());
        }
    }
}

impl MigrationStatus {
    /// Latest snapshot
    pub fn active_snapshot(&self) -> Option<&Snapshot> {
        self.history.last()
    }

    /// VM status by source identity
    pub fn find_vm(&self, source: &Ref) -> Option<&VmStatus> {
        self.vms.iter().find(|v| same_vm(&v.source, source))
    }

    /// Mutable VM status by source identity
    pub fn find_vm_mut(&mut self, source: &Ref) -> Option<&mut VmStatus> {
        self.vms.iter_mut().find(|v| same_vm(&v.source, source))
    }

    /// Every VM reached a terminal phase
    pub fn all_completed(&self) -> bool {
        !self.vms.is_empty() && self.vms.iter().all(VmStatus::is_completed)
    }
}

fn same_vm(a: &Ref, b: &Ref) -> bool {
    if !a.id.is_empty() && !b.id.is_empty() {
        return a.id == b.id;
    }
    !a.name.is_empty() && a.name == b.name && a.namespace == b.namespace
}

impl Migration {
    /// The VM is listed in `spec.cancel`
    pub fn is_canceled(&self, vm: &VmStatus) -> bool {
        self.spec
            .cancel
            .iter()
            .any(|c| c.matches(&vm.source.id, &vm.source.namespace, &vm.source.name))
    }

    /// Cutover time has arrived
    pub fn cutover_due(&self, now: DateTime<Utc>) -> bool {
        self.spec.cutover.is_some_and(|c| c <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(name: &str, completed: i64, total: i64) -> Task {
        let mut t = Task::new(name, "disk", total, "MB");
        t.progress.completed = completed;
        t
    }

    mod tasks {
        use super::*;

        #[test]
        fn reflect_sums_sub_tasks() {
            let mut step = Task::new("DiskTransfer", "Transfer disks.", 0, "MB");
            step.tasks = vec![disk("d1", 100, 200), disk("d2", 50, 50)];
            step.tasks[1].mark_completed();
            step.reflect();

            assert_eq!(step.progress.completed, 150);
            assert_eq!(step.progress.total, 250);
            assert_eq!(step.phase, TaskPhase::Running);

            step.tasks[0].mark_completed();
            step.reflect();
            assert!(step.is_completed());
        }

        #[test]
        fn errors_are_deduplicated() {
            let mut t = Task::new("ImageConversion", "", 1, "");
            t.add_error("Converting", ["disk full", "disk full"]);
            t.add_error("Converting", ["disk full", "timeout"]);
            let e = t.error.unwrap();
            assert_eq!(e.reasons, vec!["disk full".to_string(), "timeout".to_string()]);
        }

        #[test]
        fn sub_task_error_rolls_up() {
            let mut step = Task::new("DiskTransfer", "", 0, "MB");
            let mut d = disk("d1", 0, 10);
            d.add_error("TransferringDisks", ["io error"]);
            step.tasks.push(d);
            assert!(step.has_error());
            step.reflect();
            assert_eq!(step.error.as_ref().unwrap().reasons, vec!["io error".to_string()]);
        }
    }

    mod vms {
        use super::*;

        #[test]
        fn running_means_started_and_not_terminal() {
            let mut vm = VmStatus::new(Ref::with_id("vm-1"), "web");
            assert!(!vm.is_running());
            vm.started = Some(Utc::now());
            vm.phase = VmPhase::TransferringDisks;
            assert!(vm.is_running());
            vm.finish(VmPhase::Completed);
            assert!(!vm.is_running());
            assert!(vm.is_completed());
        }

        #[test]
        fn vm_progress_sums_matching_units() {
            let mut vm = VmStatus::new(Ref::with_id("vm-1"), "web");
            let mut transfer = Task::new("DiskTransfer", "", 0, "MB");
            transfer.tasks = vec![disk("d1", 10, 20), disk("d2", 5, 30)];
            vm.pipeline = vec![Task::new("Initialize", "", 1, ""), transfer];
            vm.reflect();
            let p = vm.progress("MB");
            assert_eq!((p.completed, p.total), (15, 50));
        }

        #[test]
        fn step_error_rolls_up_to_vm() {
            let mut vm = VmStatus::new(Ref::with_id("vm-1"), "web");
            let mut step = Task::new("ImageConversion", "", 1, "");
            step.add_error("Converting", ["virt-v2v failed"]);
            vm.pipeline.push(step);
            vm.reflect();
            assert!(vm.has_error());
            assert_eq!(vm.error.as_ref().unwrap().reasons, vec!["virt-v2v failed".to_string()]);
        }
    }

    #[test]
    fn cancel_matches_by_id_or_name() {
        let mut m = Migration::new(
            "run",
            MigrationSpec {
                plan: ObjectRef::new("ns", "plan"),
                cutover: None,
                cancel: vec![Ref::with_name("db")],
            },
        );
        let web = VmStatus::new(
            Ref {
                id: "vm-1".into(),
                name: "web".into(),
                ..Default::default()
            },
            "web",
        );
        let db = VmStatus::new(
            Ref {
                id: "vm-2".into(),
                name: "db".into(),
                ..Default::default()
            },
            "db",
        );
        assert!(!m.is_canceled(&web));
        assert!(m.is_canceled(&db));

        m.spec.cancel = vec![Ref::with_id("vm-1"), Ref::with_id("unknown")];
        assert!(m.is_canceled(&web));
        assert!(!m.is_canceled(&db));
    }

    #[test]
    fn snapshot_dependency_change_ignores_plan() {
        let a = Snapshot::default();
        let mut b = a.clone();
        b.plan.generation = 7;
        assert!(!b.dependencies_changed(&a));
        b.map.network.generation = 2;
        assert!(b.dependencies_changed(&a));
    }

    #[test]
    fn cutover_due() {
        let now = Utc::now();
        let mut m = Migration::new("run", MigrationSpec::default_for_test());
        assert!(!m.cutover_due(now));
        m.spec.cutover = Some(now - chrono::Duration::seconds(1));
        assert!(m.cutover_due(now));
    }

    impl MigrationSpec {
        fn default_for_test() -> Self {
            Self {
                plan: ObjectRef::new("ns", "plan"),
                cutover: None,
                cancel: vec![],
            }
        }
    }
}
