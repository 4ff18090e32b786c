//! Inventory watch-manager
//!
//! One poller per provider lists the watched kinds on an interval and diffs
//! the result by id. The first complete listing establishes parity and emits
//! nothing; after that, `Created` and `Deleted` events are matched against the
//! source refs that map reconcilers subscribed with, and the affected maps are
//! enqueued on bounded channels. A full channel drops the enqueue; the next
//! resync of the map controller catches the drift.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Inventory, InventoryKind, InventoryProvider, Resource};
use crate::refs::{ObjectRef, Ref};
use crate::settings::Settings;
use crate::Result;

/// Change observed between two listings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    /// New id
    Created,
    /// Known id with a new revision
    Updated,
    /// Id no longer listed
    Deleted,
}

/// One inventory change
#[derive(Clone, Debug, PartialEq)]
pub struct InventoryEvent {
    /// What happened
    pub event_type: EventType,
    /// Kind of the object
    pub kind: InventoryKind,
    /// The object (last known state for deletions)
    pub resource: Resource,
}

/// Kind of map that subscribes to inventory changes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MapKind {
    /// NetworkMap, watches networks
    Network,
    /// StorageMap, watches storage
    Storage,
}

impl MapKind {
    /// Inventory kind the map refers to
    pub fn inventory_kind(self) -> InventoryKind {
        match self {
            MapKind::Network => InventoryKind::Network,
            MapKind::Storage => InventoryKind::Storage,
        }
    }
}

/// Receiving ends of the map event channels
#[derive(Debug)]
pub struct WatchReceivers {
    /// NetworkMaps to reconcile
    pub network_maps: mpsc::Receiver<ObjectRef>,
    /// StorageMaps to reconcile
    pub storage_maps: mpsc::Receiver<ObjectRef>,
}

/// Compute events that turn `old` into `new`, ordered by id
pub fn diff(
    kind: InventoryKind,
    old: &BTreeMap<String, Resource>,
    new: &BTreeMap<String, Resource>,
) -> Vec<InventoryEvent> {
    let mut events = Vec::new();
    for (id, resource) in new {
        let event_type = match old.get(id) {
            None => EventType::Created,
            Some(prev) if prev.revision != resource.revision => EventType::Updated,
            Some(_) => continue,
        };
        events.push(InventoryEvent {
            event_type,
            kind,
            resource: resource.clone(),
        });
    }
    for (id, resource) in old {
        if !new.contains_key(id) {
            events.push(InventoryEvent {
                event_type: EventType::Deleted,
                kind,
                resource: resource.clone(),
            });
        }
    }
    events
}

#[derive(Clone, Debug)]
struct Subscription {
    provider_uid: String,
    refs: Vec<Ref>,
}

struct ProviderWatch {
    parity: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    inventory: Arc<dyn Inventory>,
    poll_interval: Duration,
    registry: Mutex<HashMap<String, ProviderWatch>>,
    subscriptions: DashMap<(MapKind, ObjectRef), Subscription>,
    network_tx: mpsc::Sender<ObjectRef>,
    storage_tx: mpsc::Sender<ObjectRef>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for (_, watch) in self.registry.get_mut().drain() {
            if let Some(task) = watch.task {
                task.abort();
            }
        }
    }
}

/// Last listing of every watched kind for one provider
#[derive(Debug, Default)]
pub struct PollState {
    known: BTreeMap<InventoryKind, BTreeMap<String, Resource>>,
    parity: bool,
}

impl PollState {
    /// First complete listing has been taken
    pub fn has_parity(&self) -> bool {
        self.parity
    }
}

/// Registry of inventory watches, shared by every controller
#[derive(Clone)]
pub struct WatchManager {
    inner: Arc<Inner>,
}

impl WatchManager {
    /// Kinds polled for every provider
    pub const WATCHED: [InventoryKind; 2] = [InventoryKind::Network, InventoryKind::Storage];

    /// Create the manager and the receiving ends of its event channels
    pub fn new(inventory: Arc<dyn Inventory>, settings: &Settings) -> (Self, WatchReceivers) {
        let capacity = settings.watch_channel_capacity.max(1);
        let (network_tx, network_maps) = mpsc::channel(capacity);
        let (storage_tx, storage_maps) = mpsc::channel(capacity);
        let manager = Self {
            inner: Arc::new(Inner {
                inventory,
                poll_interval: settings.inventory_poll_interval,
                registry: Mutex::new(HashMap::new()),
                subscriptions: DashMap::new(),
                network_tx,
                storage_tx,
            }),
        };
        (
            manager,
            WatchReceivers {
                network_maps,
                storage_maps,
            },
        )
    }

    /// Start polling a provider's inventory unless already watched
    pub fn ensure_watch(&self, provider: &InventoryProvider) {
        let mut registry = self.inner.registry.lock();
        if registry.contains_key(&provider.uid) {
            return;
        }
        let parity = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(poll_loop(
            Arc::downgrade(&self.inner),
            provider.clone(),
            parity.clone(),
        ));
        info!(provider = %provider, "inventory watch started");
        registry.insert(
            provider.uid.clone(),
            ProviderWatch {
                parity,
                task: Some(task),
            },
        );
    }

    /// A watch exists and has completed its first listing
    pub fn has_parity(&self, provider_uid: &str) -> bool {
        self.inner
            .registry
            .lock()
            .get(provider_uid)
            .is_some_and(|w| w.parity.load(Ordering::Acquire))
    }

    /// A watch is registered for the provider
    pub fn is_watched(&self, provider_uid: &str) -> bool {
        self.inner.registry.lock().contains_key(provider_uid)
    }

    /// Stop polling a provider and drop its subscriptions
    pub fn stop(&self, provider_uid: &str) {
        if let Some(watch) = self.inner.registry.lock().remove(provider_uid) {
            if let Some(task) = watch.task {
                task.abort();
            }
            info!(provider = %provider_uid, "inventory watch stopped");
        }
        self.inner
            .subscriptions
            .retain(|_, s| s.provider_uid != provider_uid);
    }

    /// Register (or replace) the source refs a map depends on
    pub fn subscribe(&self, kind: MapKind, map: ObjectRef, provider_uid: &str, refs: Vec<Ref>) {
        self.inner.subscriptions.insert(
            (kind, map),
            Subscription {
                provider_uid: provider_uid.to_string(),
                refs,
            },
        );
    }

    /// Forget a map
    pub fn unsubscribe(&self, kind: MapKind, map: &ObjectRef) {
        self.inner.subscriptions.remove(&(kind, map.clone()));
    }

    /// Enqueue the maps affected by `events`. Returns how many were enqueued.
    pub fn dispatch(&self, provider_uid: &str, events: &[InventoryEvent]) -> usize {
        let mut targets: BTreeSet<(MapKind, ObjectRef)> = BTreeSet::new();
        for event in events {
            if event.event_type == EventType::Updated {
                continue;
            }
            let r = &event.resource;
            for entry in self.inner.subscriptions.iter() {
                let (kind, map) = entry.key();
                let sub = entry.value();
                if sub.provider_uid == provider_uid
                    && kind.inventory_kind() == event.kind
                    && sub.refs.iter().any(|s| s.matches(&r.id, &r.namespace, &r.name))
                {
                    targets.insert((*kind, map.clone()));
                }
            }
        }

        let mut sent = 0;
        for (kind, map) in targets {
            let tx = match kind {
                MapKind::Network => &self.inner.network_tx,
                MapKind::Storage => &self.inner.storage_tx,
            };
            match tx.try_send(map.clone()) {
                Ok(()) => sent += 1,
                Err(e) => warn!(map = %map, ?kind, error = %e, "dropped inventory event"),
            }
        }
        sent
    }

    /// List every watched kind once and dispatch the changes.
    ///
    /// Nothing is dispatched until one listing of every kind has succeeded.
    pub async fn poll_once(&self, provider: &InventoryProvider, state: &mut PollState) -> Result<()> {
        let mut listed = BTreeMap::new();
        for kind in Self::WATCHED {
            let list = self.inner.inventory.list(provider, kind).await?;
            let by_id: BTreeMap<String, Resource> =
                list.into_iter().map(|r| (r.id.clone(), r)).collect();
            listed.insert(kind, by_id);
        }

        if state.parity {
            let empty = BTreeMap::new();
            let events: Vec<InventoryEvent> = listed
                .iter()
                .flat_map(|(kind, new)| diff(*kind, state.known.get(kind).unwrap_or(&empty), new))
                .collect();
            if !events.is_empty() {
                let sent = self.dispatch(&provider.uid, &events);
                debug!(provider = %provider, events = events.len(), sent, "inventory changes");
            }
        }
        state.known = listed;
        state.parity = true;
        Ok(())
    }

    #[cfg(test)]
    fn set_parity_for_test(&self, provider_uid: &str, parity: bool) {
        self.inner.registry.lock().insert(
            provider_uid.to_string(),
            ProviderWatch {
                parity: Arc::new(AtomicBool::new(parity)),
                task: None,
            },
        );
    }
}

/// The watch-manager as controllers see it
pub trait WatchRegistry: Send + Sync {
    /// Start polling a provider's inventory unless already watched
    fn ensure_watch(&self, provider: &InventoryProvider);

    /// A watch exists and has completed its first listing
    fn has_parity(&self, provider_uid: &str) -> bool;

    /// Register (or replace) the source refs a map depends on
    fn subscribe(&self, kind: MapKind, map: ObjectRef, provider_uid: &str, refs: Vec<Ref>);

    /// Forget a map
    fn unsubscribe(&self, kind: MapKind, map: &ObjectRef);
}

impl WatchRegistry for WatchManager {
    fn ensure_watch(&self, provider: &InventoryProvider) {
        WatchManager::ensure_watch(self, provider)
    }

    fn has_parity(&self, provider_uid: &str) -> bool {
        WatchManager::has_parity(self, provider_uid)
    }

    fn subscribe(&self, kind: MapKind, map: ObjectRef, provider_uid: &str, refs: Vec<Ref>) {
        WatchManager::subscribe(self, kind, map, provider_uid, refs)
    }

    fn unsubscribe(&self, kind: MapKind, map: &ObjectRef) {
        WatchManager::unsubscribe(self, kind, map)
    }
}

async fn poll_loop(inner: Weak<Inner>, provider: InventoryProvider, parity: Arc<AtomicBool>) {
    let mut state = PollState::default();
    loop {
        let Some(strong) = inner.upgrade() else {
            return;
        };
        let interval = strong.poll_interval;
        let manager = WatchManager { inner: strong };
        match manager.poll_once(&provider, &mut state).await {
            Ok(()) => {
                if !parity.swap(true, Ordering::AcqRel) {
                    info!(provider = %provider, "inventory parity reached");
                }
            }
            Err(e) => warn!(provider = %provider, error = %e, "inventory poll failed"),
        }
        drop(manager);
        tokio::time::sleep(interval).await;
    }
}
