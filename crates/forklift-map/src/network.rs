//! NetworkMap reconciler

use std::collections::BTreeSet;
use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use forklift_common::condition::{reason, Category, Condition, Conditions};
use forklift_common::crd::{MapStatus, NetworkDestination, NetworkMap, Provider};
use forklift_common::inventory::{find, InventoryKind, InventoryProvider, Lookup, MapKind};
use forklift_common::refs::{ObjectRef, Ref};
use forklift_common::{Error, REQUEUE_RESYNC, REQUEUE_SLOW};

use crate::controller::Context;
use crate::validation::{qualified_pair, validate_provider_pair, validate_sources};

const SOURCE_NETWORK_NOT_VALID: &str = "SourceNetworkNotValid";
const DESTINATION_NETWORK_NOT_VALID: &str = "DestinationNetworkNotValid";
const NETWORK_TYPE_NOT_VALID: &str = "NetworkTypeNotValid";

/// Reconcile a NetworkMap
#[instrument(skip(map, ctx), fields(map = %map.name_any()))]
pub async fn reconcile_network_map(map: Arc<NetworkMap>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = map.name_any();
    let namespace = map.namespace().unwrap_or_default();
    info!("reconciling network map");

    let current = map.status.clone().unwrap_or_default();
    let mut conditions = current.conditions.clone();
    conditions.begin_staging();

    let pair = qualified_pair(&map.spec.provider, &namespace);
    let source = ctx.fetch_provider(&pair.source).await?;
    let destination = ctx.fetch_provider(&pair.destination).await?;
    let providers = validate_provider_pair(&pair, source, destination, &mut conditions);

    let mut references = Vec::new();
    if let Some(providers) = &providers {
        let handle = InventoryProvider::of(&providers.source);
        let refs: Vec<&Ref> = map.spec.map.iter().map(|p| &p.source).collect();
        references = validate_sources(
            ctx.inventory.as_ref(),
            &handle,
            InventoryKind::Network,
            &refs,
            SOURCE_NETWORK_NOT_VALID,
            &mut conditions,
        )
        .await?;
        validate_destinations(&ctx, &map, &namespace, &providers.destination, &mut conditions)
            .await?;

        ctx.watches.ensure_watch(&handle);
        ctx.watches.subscribe(
            MapKind::Network,
            ObjectRef::new(&namespace, &name),
            &handle.uid,
            refs.into_iter().cloned().collect(),
        );
    }

    let ready = !conditions.has_blocker_condition();
    if ready {
        conditions.set_ready(true, "The network map is ready.");
    } else {
        warn!(blockers = ?conditions.blocker_messages(), "network map not valid");
    }
    conditions.end_staging();

    let status = MapStatus {
        observed_generation: map.metadata.generation,
        conditions,
        references,
    };
    if status != current {
        ctx.kube
            .patch_network_map_status(&name, &namespace, &status)
            .await?;
        info!(ready, "network map status updated");
    } else {
        debug!("status unchanged, skipping update");
    }

    if providers.is_none() {
        return Ok(Action::requeue(REQUEUE_SLOW));
    }
    Ok(Action::requeue(REQUEUE_RESYNC))
}

async fn validate_destinations(
    ctx: &Context,
    map: &NetworkMap,
    namespace: &str,
    destination: &Provider,
    conditions: &mut Conditions,
) -> Result<(), Error> {
    let mut not_set = false;
    let mut not_found = BTreeSet::new();
    let mut bad_types = BTreeSet::new();

    for pair in &map.spec.map {
        let Some(decoded) = pair.destination.decode() else {
            bad_types.insert(pair.destination.type_.clone());
            continue;
        };
        let NetworkDestination::Multus {
            namespace: nad_namespace,
            name,
        } = decoded
        else {
            continue;
        };
        if name.is_empty() {
            not_set = true;
            continue;
        }
        let nad_namespace = if nad_namespace.is_empty() {
            namespace
        } else {
            nad_namespace
        };
        if !attachment_exists(ctx, destination, nad_namespace, name).await? {
            not_found.insert(format!("{nad_namespace}/{name}"));
        }
    }

    if !bad_types.is_empty() {
        conditions.set_condition(
            Condition::new(
                NETWORK_TYPE_NOT_VALID,
                Category::Critical,
                reason::NOT_VALID,
                "Destination network type not valid.",
            )
            .with_items(bad_types),
        );
    }
    if not_set {
        conditions.set_condition(Condition::new(
            DESTINATION_NETWORK_NOT_VALID,
            Category::Critical,
            reason::NOT_SET,
            "Destination network name must be set for multus.",
        ));
    } else if !not_found.is_empty() {
        conditions.set_condition(
            Condition::new(
                DESTINATION_NETWORK_NOT_VALID,
                Category::Critical,
                reason::NOT_FOUND,
                "Destination network not found.",
            )
            .with_items(not_found),
        );
    }
    Ok(())
}

async fn attachment_exists(
    ctx: &Context,
    destination: &Provider,
    namespace: &str,
    name: &str,
) -> Result<bool, Error> {
    if destination.is_host() {
        return ctx.kube.network_attachment_exists(name, namespace).await;
    }
    let r = Ref {
        namespace: namespace.to_string(),
        name: name.to_string(),
        ..Default::default()
    };
    let lookup = find(
        ctx.inventory.as_ref(),
        &InventoryProvider::of(destination),
        InventoryKind::Network,
        &r,
    )
    .await?;
    Ok(matches!(lookup, Lookup::Found(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::MockKubeClient;
    use crate::validation::tests::{host, provider, vsphere, MockInventory, MockWatches};
    use crate::validation::{DESTINATION_PROVIDER_NOT_READY, SOURCE_PROVIDER_NOT_VALID};
    use forklift_common::crd::{DestinationNetwork, NetworkMapSpec, NetworkPair, ProviderPair, ProviderType};
    use forklift_common::inventory::Resource;
    use kube::api::ObjectMeta;
    use std::sync::Mutex;

    type Captured = Arc<Mutex<Vec<MapStatus>>>;

    fn network_map(pairs: Vec<NetworkPair>) -> NetworkMap {
        NetworkMap {
            metadata: ObjectMeta {
                name: Some("net".into()),
                namespace: Some("forklift".into()),
                generation: Some(2),
                ..Default::default()
            },
            spec: NetworkMapSpec {
                provider: ProviderPair {
                    source: ObjectRef {
                        name: "vsphere".into(),
                        ..Default::default()
                    },
                    destination: ObjectRef {
                        name: "host".into(),
                        ..Default::default()
                    },
                },
                map: pairs,
            },
            status: None,
        }
    }

    fn pair(source: Ref, destination: DestinationNetwork) -> NetworkPair {
        NetworkPair {
            source,
            destination,
        }
    }

    fn source_networks() -> MockInventory {
        let mut inv = MockInventory::new();
        inv.expect_get().returning(|_, _, id| {
            Ok(match id {
                "net-1" | "net-2" => Lookup::Found(Resource {
                    id: id.into(),
                    name: format!("name-{id}"),
                    ..Default::default()
                }),
                _ => Lookup::NotFound,
            })
        });
        inv
    }

    fn watches() -> MockWatches {
        let mut w = MockWatches::new();
        w.expect_ensure_watch().return_const(());
        w.expect_subscribe().return_const(());
        w
    }

    fn cluster(providers: Vec<Provider>, nads: &'static [&'static str]) -> (MockKubeClient, Captured) {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let mut kube = MockKubeClient::new();
        kube.expect_get_provider().returning(move |name, _| {
            Ok(providers.iter().find(|p| p.name_any() == name).cloned())
        });
        kube.expect_network_attachment_exists()
            .returning(move |name, ns| Ok(nads.contains(&format!("{ns}/{name}").as_str())));
        kube.expect_patch_network_map_status()
            .returning(move |_, _, status| {
                sink.lock()
                    .expect("mutex should not be poisoned")
                    .push(status.clone());
                Ok(())
            });
        (kube, captured)
    }

    fn context(kube: MockKubeClient, inv: MockInventory, watches: MockWatches) -> Arc<Context> {
        Arc::new(Context::new(Arc::new(kube), Arc::new(inv), Arc::new(watches)))
    }

    fn last(captured: &Captured) -> MapStatus {
        captured
            .lock()
            .expect("mutex should not be poisoned")
            .last()
            .cloned()
            .expect("status should have been written")
    }

    #[tokio::test]
    async fn valid_map_is_ready_with_references() {
        let (kube, captured) = cluster(vec![vsphere(true), host(true)], &["forklift/vlan10"]);
        let mut w = MockWatches::new();
        w.expect_ensure_watch().times(1).return_const(());
        w.expect_subscribe()
            .withf(|kind, map, uid, refs| {
                *kind == MapKind::Network
                    && map.to_string() == "forklift/net"
                    && uid == "uid-vsphere"
                    && refs.len() == 2
            })
            .times(1)
            .return_const(());
        let ctx = context(kube, source_networks(), w);
        let map = network_map(vec![
            pair(Ref::with_id("net-1"), DestinationNetwork::pod()),
            pair(Ref::with_id("net-2"), DestinationNetwork::multus("", "vlan10")),
        ]);

        let action = reconcile_network_map(Arc::new(map), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_RESYNC));
        let status = last(&captured);
        assert!(status.conditions.is_ready());
        assert_eq!(status.observed_generation, Some(2));
        let names: Vec<&str> = status.references.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["name-net-1", "name-net-2"]);
    }

    #[tokio::test]
    async fn missing_source_network_blocks_ready() {
        let (kube, captured) = cluster(vec![vsphere(true), host(true)], &[]);
        let ctx = context(kube, source_networks(), watches());
        let map = network_map(vec![pair(Ref::with_id("net-7"), DestinationNetwork::pod())]);

        reconcile_network_map(Arc::new(map), ctx).await.unwrap();
        let status = last(&captured);
        let c = status
            .conditions
            .find_condition(SOURCE_NETWORK_NOT_VALID)
            .unwrap();
        assert_eq!(c.reason, reason::NOT_FOUND);
        assert_eq!(c.items, vec!["id:net-7".to_string()]);
        assert!(!status.conditions.is_ready());
    }

    #[tokio::test]
    async fn destination_problems_are_reported() {
        let (kube, captured) = cluster(vec![vsphere(true), host(true)], &[]);
        let ctx = context(kube, source_networks(), watches());
        let map = network_map(vec![
            pair(Ref::with_id("net-1"), DestinationNetwork::multus("other", "gone")),
            pair(
                Ref::with_id("net-2"),
                DestinationNetwork {
                    type_: "bridge".into(),
                    ..Default::default()
                },
            ),
        ]);

        reconcile_network_map(Arc::new(map), ctx).await.unwrap();
        let status = last(&captured);
        let c = status
            .conditions
            .find_condition(DESTINATION_NETWORK_NOT_VALID)
            .unwrap();
        assert_eq!(c.reason, reason::NOT_FOUND);
        assert_eq!(c.items, vec!["other/gone".to_string()]);
        let c = status.conditions.find_condition(NETWORK_TYPE_NOT_VALID).unwrap();
        assert_eq!(c.items, vec!["bridge".to_string()]);
    }

    #[tokio::test]
    async fn multus_without_name_is_not_set() {
        let (kube, captured) = cluster(vec![vsphere(true), host(true)], &[]);
        let ctx = context(kube, source_networks(), watches());
        let map = network_map(vec![pair(
            Ref::with_id("net-1"),
            DestinationNetwork::multus("forklift", ""),
        )]);

        reconcile_network_map(Arc::new(map), ctx).await.unwrap();
        let status = last(&captured);
        assert_eq!(
            status
                .conditions
                .find_condition(DESTINATION_NETWORK_NOT_VALID)
                .map(|c| c.reason.as_str()),
            Some(reason::NOT_SET)
        );
    }

    #[tokio::test]
    async fn remote_destination_is_checked_in_inventory() {
        let remote = provider("remote", ProviderType::OpenShift, "https://remote:6443", true);
        let (kube, captured) = cluster(vec![vsphere(true), remote], &[]);
        let mut inv = source_networks();
        inv.expect_list()
            .withf(|p, kind| p.uid == "uid-remote" && *kind == InventoryKind::Network)
            .returning(|_, _| {
                Ok(vec![Resource {
                    id: "nad-1".into(),
                    namespace: "vms".into(),
                    name: "vlan10".into(),
                    ..Default::default()
                }])
            });
        let ctx = context(kube, inv, watches());
        let mut map = network_map(vec![pair(
            Ref::with_id("net-1"),
            DestinationNetwork::multus("vms", "vlan10"),
        )]);
        map.spec.provider.destination.name = "remote".into();

        reconcile_network_map(Arc::new(map), ctx).await.unwrap();
        assert!(last(&captured).conditions.is_ready());
    }

    #[tokio::test]
    async fn unready_provider_skips_inventory_and_requeues_slow() {
        let (kube, captured) = cluster(vec![vsphere(true), host(false)], &[]);
        let mut inv = MockInventory::new();
        inv.expect_get().never();
        let mut w = MockWatches::new();
        w.expect_subscribe().never();
        let ctx = context(kube, inv, w);
        let map = network_map(vec![pair(Ref::with_id("net-1"), DestinationNetwork::pod())]);

        let action = reconcile_network_map(Arc::new(map), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_SLOW));
        let status = last(&captured);
        assert!(status.conditions.has_condition(&[DESTINATION_PROVIDER_NOT_READY]));
        assert!(status.references.is_empty());
    }

    #[tokio::test]
    async fn inventory_failure_is_a_reconcile_error() {
        let (kube, captured) = cluster(vec![vsphere(true), host(true)], &[]);
        let mut inv = MockInventory::new();
        inv.expect_get()
            .returning(|p, k, _| Err(Error::inventory(&p.name, k.to_string(), "status: 503")));
        let ctx = context(kube, inv, MockWatches::new());
        let map = network_map(vec![pair(Ref::with_id("net-1"), DestinationNetwork::pod())]);

        let err = reconcile_network_map(Arc::new(map), ctx).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(captured.lock().unwrap().is_empty());
    }

    /// Story: a map names a provider that does not exist yet. Once the user
    /// creates it the map becomes Ready and the NotFound condition is gone.
    #[tokio::test]
    async fn story_provider_created_later() {
        let (kube_missing, captured) = cluster(vec![host(true)], &[]);
        let ctx = context(kube_missing, MockInventory::new(), MockWatches::new());
        let map = network_map(vec![pair(Ref::with_id("net-1"), DestinationNetwork::pod())]);
        reconcile_network_map(Arc::new(map.clone()), ctx).await.unwrap();
        let first = last(&captured);
        assert_eq!(
            first
                .conditions
                .find_condition(SOURCE_PROVIDER_NOT_VALID)
                .map(|c| c.reason.as_str()),
            Some(reason::NOT_FOUND)
        );

        let (kube_fixed, captured) = cluster(vec![vsphere(true), host(true)], &[]);
        let ctx = context(kube_fixed, source_networks(), watches());
        let mut map = map;
        map.status = Some(first);
        reconcile_network_map(Arc::new(map), ctx).await.unwrap();
        let status = last(&captured);
        assert!(status.conditions.find_condition(SOURCE_PROVIDER_NOT_VALID).is_none());
        assert!(status.conditions.is_ready());
    }

    #[tokio::test]
    async fn unchanged_status_is_not_written() {
        let (kube_first, captured) = cluster(vec![vsphere(true), host(true)], &[]);
        let ctx = context(kube_first, source_networks(), watches());
        let mut map = network_map(vec![pair(Ref::with_id("net-1"), DestinationNetwork::pod())]);
        reconcile_network_map(Arc::new(map.clone()), ctx).await.unwrap();
        map.status = Some(last(&captured));

        let mut kube = MockKubeClient::new();
        kube.expect_get_provider().returning(|name, _| {
            Ok(Some(if name == "vsphere" { vsphere(true) } else { host(true) }))
        });
        kube.expect_patch_network_map_status().never();
        let ctx = context(kube, source_networks(), watches());
        reconcile_network_map(Arc::new(map), ctx).await.unwrap();
    }
}
