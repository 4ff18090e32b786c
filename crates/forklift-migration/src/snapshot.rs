//! Activation snapshots
//!
//! `status.history` is append-only. The last entry is the active snapshot.

use chrono::Utc;

use forklift_common::crd::{
    Generation, Migration, MigrationStatus, NetworkMap, Plan, Provider, Snapshot, SnapshotMaps,
    SnapshotProviders, StorageMap,
};

/// Resources involved in an activation
pub struct Resolved<'a> {
    /// The plan
    pub plan: &'a Plan,
    /// Source provider
    pub source: &'a Provider,
    /// Destination provider
    pub destination: &'a Provider,
    /// Network map
    pub network_map: &'a NetworkMap,
    /// Storage map
    pub storage_map: &'a StorageMap,
}

/// How the current generations relate to the active snapshot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Change {
    /// First activation, snapshot appended
    Created,
    /// Nothing moved
    Unchanged,
    /// A map or provider moved; a new snapshot was appended
    DependenciesChanged,
}

/// Findings that do not touch the history
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Drift {
    /// `spec.plan` now names another plan
    pub plan_replaced: bool,
    /// The plan's generation moved since activation
    pub plan_modified: bool,
}

/// Capture the generations of everything involved
pub fn capture(migration: &Migration, r: &Resolved<'_>) -> Snapshot {
    Snapshot {
        migration: Generation::of(migration),
        plan: Generation::of(r.plan),
        map: SnapshotMaps {
            network: Generation::of(r.network_map),
            storage: Generation::of(r.storage_map),
        },
        provider: SnapshotProviders {
            source: Generation::of(r.source),
            destination: Generation::of(r.destination),
        },
        created: Utc::now(),
    }
}

/// Compare a fresh capture with the active snapshot
pub fn drift(status: &MigrationStatus, current: &Snapshot) -> Drift {
    let Some(active) = status.active_snapshot() else {
        return Drift::default();
    };
    let plan_replaced = !active.plan.same_object(&current.plan);
    Drift {
        plan_replaced,
        plan_modified: !plan_replaced && active.plan.generation != current.plan.generation,
    }
}

/// Locate or append the active snapshot.
///
/// The plan identity of the first snapshot is kept in later entries: a
/// running migration keeps executing the plan it was started with.
pub fn ensure(status: &mut MigrationStatus, mut current: Snapshot) -> Change {
    let Some(active) = status.active_snapshot() else {
        status.history.push(current);
        return Change::Created;
    };
    if !current.dependencies_changed(active) {
        return Change::Unchanged;
    }
    current.plan = active.plan.clone();
    status.history.push(current);
    Change::DependenciesChanged
}
