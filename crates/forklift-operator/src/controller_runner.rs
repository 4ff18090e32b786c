//! Controller runner - builds controller futures for each reconciler
//!
//! Each `build_*` function returns a Vec of boxed futures that can be composed
//! by the caller. Cross-resource triggers are `.watches()` mappers that look
//! up the dependents of a changed object in the controller's own store; the
//! inventory watch-manager feeds the map controllers through `reconcile_on`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource, ResourceExt};
use tokio_stream::wrappers::ReceiverStream;

use forklift_common::crd::{Hook, Host, Migration, NetworkMap, Plan, Provider, StorageMap};
use forklift_common::inventory::{Inventory, WatchReceivers, WatchRegistry};
use forklift_common::refs::ObjectRef as ResourceRef;
use forklift_common::{Error, Settings};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Objects in `store` whose `refs` name `dependency`. References without a
/// namespace resolve in the referring object's namespace.
pub fn dependents<K, D>(
    store: &Store<K>,
    dependency: &D,
    refs: impl Fn(&K) -> Vec<ResourceRef>,
) -> Vec<ObjectRef<K>>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
    D: ResourceExt,
{
    let name = dependency.name_any();
    let namespace = dependency.namespace().unwrap_or_default();
    store
        .state()
        .iter()
        .map(|k| k.as_ref())
        .filter(|k| {
            let own = k.namespace().unwrap_or_default();
            refs(k).iter().any(|r| {
                let r = r.or_namespace(&own);
                r.name == name && r.namespace == namespace
            })
        })
        .map(ObjectRef::from_obj)
        .collect()
}

fn plan_dependencies(plan: &Plan) -> Vec<ResourceRef> {
    let spec = &plan.spec;
    let mut refs = vec![
        spec.provider.source.clone(),
        spec.provider.destination.clone(),
        spec.map.network.clone(),
        spec.map.storage.clone(),
    ];
    refs.extend(
        spec.vms
            .iter()
            .flat_map(|vm| vm.hooks.iter().map(|h| h.hook.clone())),
    );
    refs
}

/// Build the Provider controller, re-run when a provider's secret changes
pub fn build_provider_controllers(
    client: Client,
    inventory: Arc<dyn Inventory>,
    watches: Arc<dyn WatchRegistry>,
) -> Vec<ControllerFuture> {
    let ctx = Arc::new(forklift_provider::Context::from_client(
        client.clone(),
        inventory,
        watches,
    ));
    let providers: Api<Provider> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client);

    let ctrl = Controller::new(providers, watcher());
    let store = ctrl.store();
    let ctrl = ctrl
        .watches(secrets, watcher(), move |secret| {
            dependents(&store, &secret, |p: &Provider| vec![p.spec.secret.clone()])
        })
        .shutdown_on_signal()
        .run(
            forklift_provider::reconcile,
            forklift_provider::error_policy,
            ctx,
        )
        .for_each(log_reconcile_result("Provider"));

    tracing::info!("- Provider controller");
    vec![Box::pin(ctrl)]
}

fn host_dependencies(host: &Host) -> Vec<ResourceRef> {
    vec![host.spec.provider.clone(), host.spec.secret.clone()]
}

/// Build the Host controller, re-run when its provider or secret changes
pub fn build_host_controllers(client: Client, inventory: Arc<dyn Inventory>) -> Vec<ControllerFuture> {
    let ctx = Arc::new(forklift_host::Context::from_client(client.clone(), inventory));
    let hosts: Api<Host> = Api::all(client.clone());

    let ctrl = Controller::new(hosts, watcher());
    let (providers, secrets) = (ctrl.store(), ctrl.store());
    let ctrl = ctrl
        .watches(Api::<Provider>::all(client.clone()), watcher(), move |p| {
            dependents(&providers, &p, host_dependencies)
        })
        .watches(Api::<Secret>::all(client), watcher(), move |s| {
            dependents(&secrets, &s, host_dependencies)
        })
        .shutdown_on_signal()
        .run(forklift_host::reconcile, forklift_host::error_policy, ctx)
        .for_each(log_reconcile_result("Host"));

    tracing::info!("- Host controller");
    vec![Box::pin(ctrl)]
}

/// Build the NetworkMap and StorageMap controllers
///
/// Both re-run when one of their providers changes and when the inventory
/// watch-manager reports a created or deleted object they reference.
pub fn build_map_controllers(
    client: Client,
    inventory: Arc<dyn Inventory>,
    watches: Arc<dyn WatchRegistry>,
    receivers: WatchReceivers,
) -> Vec<ControllerFuture> {
    let ctx = Arc::new(forklift_map::Context::from_client(
        client.clone(),
        inventory,
        watches,
    ));
    let WatchReceivers {
        network_maps,
        storage_maps,
    } = receivers;

    let network: Api<NetworkMap> = Api::all(client.clone());
    let ctrl = Controller::new(network, watcher());
    let store = ctrl.store();
    let network_ctrl = ctrl
        .watches(Api::<Provider>::all(client.clone()), watcher(), move |provider| {
            dependents(&store, &provider, |m: &NetworkMap| {
                vec![m.spec.provider.source.clone(), m.spec.provider.destination.clone()]
            })
        })
        .reconcile_on(
            ReceiverStream::new(network_maps)
                .map(|r| ObjectRef::<NetworkMap>::new(&r.name).within(&r.namespace)),
        )
        .shutdown_on_signal()
        .run(
            forklift_map::reconcile_network_map,
            forklift_map::error_policy,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("NetworkMap"));

    let storage: Api<StorageMap> = Api::all(client.clone());
    let ctrl = Controller::new(storage, watcher());
    let store = ctrl.store();
    let storage_ctrl = ctrl
        .watches(Api::<Provider>::all(client), watcher(), move |provider| {
            dependents(&store, &provider, |m: &StorageMap| {
                vec![m.spec.provider.source.clone(), m.spec.provider.destination.clone()]
            })
        })
        .reconcile_on(
            ReceiverStream::new(storage_maps)
                .map(|r| ObjectRef::<StorageMap>::new(&r.name).within(&r.namespace)),
        )
        .shutdown_on_signal()
        .run(
            forklift_map::reconcile_storage_map,
            forklift_map::error_policy,
            ctx,
        )
        .for_each(log_reconcile_result("StorageMap"));

    tracing::info!("- NetworkMap controller");
    tracing::info!("- StorageMap controller");
    vec![Box::pin(network_ctrl), Box::pin(storage_ctrl)]
}

/// Build the Hook controller
pub fn build_hook_controllers(client: Client) -> Vec<ControllerFuture> {
    let ctx = Arc::new(forklift_hook::Context::from_client(client.clone()));
    let hooks: Api<Hook> = Api::all(client);
    let ctrl = Controller::new(hooks, watcher())
        .shutdown_on_signal()
        .run(forklift_hook::reconcile, forklift_hook::error_policy, ctx)
        .for_each(log_reconcile_result("Hook"));

    tracing::info!("- Hook controller");
    vec![Box::pin(ctrl)]
}

/// Build the Plan controller
///
/// A plan is revalidated when a provider, map or hook it references changes,
/// and when one of its migrations changes so `Executing` is mirrored.
pub fn build_plan_controllers(client: Client, inventory: Arc<dyn Inventory>) -> Vec<ControllerFuture> {
    let ctx = Arc::new(forklift_plan::Context::from_client(client.clone(), inventory));
    let plans: Api<Plan> = Api::all(client.clone());

    let ctrl = Controller::new(plans, watcher());
    let (providers, network, storage, hooks) =
        (ctrl.store(), ctrl.store(), ctrl.store(), ctrl.store());
    let ctrl = ctrl
        .watches(Api::<Provider>::all(client.clone()), watcher(), move |p| {
            dependents(&providers, &p, plan_dependencies)
        })
        .watches(Api::<NetworkMap>::all(client.clone()), watcher(), move |m| {
            dependents(&network, &m, plan_dependencies)
        })
        .watches(Api::<StorageMap>::all(client.clone()), watcher(), move |m| {
            dependents(&storage, &m, plan_dependencies)
        })
        .watches(Api::<Hook>::all(client.clone()), watcher(), move |h| {
            dependents(&hooks, &h, plan_dependencies)
        })
        .watches(Api::<Migration>::all(client), watcher(), |m| {
            let namespace = m.namespace().unwrap_or_default();
            let plan = m.spec.plan.or_namespace(&namespace);
            plan.is_set()
                .then(|| ObjectRef::<Plan>::new(&plan.name).within(&plan.namespace))
        })
        .shutdown_on_signal()
        .run(forklift_plan::reconcile, forklift_plan::error_policy, ctx)
        .for_each(log_reconcile_result("Plan"));

    tracing::info!("- Plan controller");
    vec![Box::pin(ctrl)]
}

/// Build the Migration controller, re-run when its plan changes
pub fn build_migration_controllers(
    client: Client,
    inventory: Arc<dyn Inventory>,
    settings: Settings,
) -> Result<Vec<ControllerFuture>, Error> {
    let ctx = Arc::new(forklift_migration::Context::from_client(
        client.clone(),
        inventory,
        settings,
    )?);
    let migrations: Api<Migration> = Api::all(client.clone());

    let ctrl = Controller::new(migrations, watcher());
    let store = ctrl.store();
    let ctrl = ctrl
        .watches(Api::<Plan>::all(client), watcher(), move |plan| {
            dependents(&store, &plan, |m: &Migration| vec![m.spec.plan.clone()])
        })
        .shutdown_on_signal()
        .run(
            forklift_migration::reconcile,
            forklift_migration::error_policy,
            ctx,
        )
        .for_each(log_reconcile_result("Migration"));

    tracing::info!("- Migration controller");
    Ok(vec![Box::pin(ctrl)])
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
