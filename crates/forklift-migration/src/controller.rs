//! Migration reconciliation controller
//!
//! Each pass:
//!
//! 1. Resolves the plan, its providers and maps
//! 2. Locates or appends the active snapshot; a replaced plan stops the run
//! 3. Starts execution once the plan is ready
//! 4. Runs one engine tick
//! 5. Publishes `Running`/`Executing` while VMs remain, then the terminal
//!    `Succeeded`/`Failed`/`Canceled` conditions

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use forklift_common::condition::{reason, Category, Condition, Conditions};
use forklift_common::crd::{
    Hook, Migration, MigrationStatus, NetworkMap, Plan, Provider, StorageMap, VmPhase,
};
use forklift_common::inventory::Inventory;
use forklift_common::kube_utils::patch_resource_status;
use forklift_common::refs::ObjectRef;
use forklift_common::{Error, Settings, REQUEUE_FAST, REQUEUE_RESYNC, REQUEUE_SLOW};

use crate::engine::Engine;
use crate::hook_runner::{HookRunner, JobHookRunner};
use crate::snapshot::{self, Change, Resolved};
use crate::target::{KubevirtTarget, TargetPlatform};
use crate::worker::{ConversionWorker, PodWorker};

const FIELD_MANAGER: &str = "forklift-migration";

/// `spec.plan` is unset or names a missing plan
pub const PLAN_NOT_VALID: &str = "PlanNotValid";
/// The plan (or one of its dependencies) is not ready
pub const PLAN_NOT_READY: &str = "PlanNotReady";
/// `spec.plan` changed after the migration started
pub const PLAN_REF_NOT_VALID: &str = "PlanRefNotValid";
/// The plan was edited while the migration runs
pub const PLAN_MODIFIED_WHILE_RUNNING: &str = "PlanModifiedWhileRunning";
/// VMs remain to be migrated
pub const RUNNING: &str = "Running";
/// The plan is executing under this migration
pub const EXECUTING: &str = "Executing";
/// Every VM completed without error
pub const SUCCEEDED: &str = "Succeeded";
/// At least one VM failed
pub const FAILED: &str = "Failed";
/// At least one VM was canceled
pub const CANCELED: &str = "Canceled";

/// Trait abstracting Kubernetes client operations for Migration
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a Plan by name and namespace
    async fn get_plan(&self, name: &str, namespace: &str) -> Result<Option<Plan>, Error>;

    /// Get a Provider by name and namespace
    async fn get_provider(&self, name: &str, namespace: &str) -> Result<Option<Provider>, Error>;

    /// Get a NetworkMap by name and namespace
    async fn get_network_map(&self, name: &str, namespace: &str)
        -> Result<Option<NetworkMap>, Error>;

    /// Get a StorageMap by name and namespace
    async fn get_storage_map(&self, name: &str, namespace: &str)
        -> Result<Option<StorageMap>, Error>;

    /// Get a Hook by name and namespace
    async fn get_hook(&self, name: &str, namespace: &str) -> Result<Option<Hook>, Error>;

    /// List migrations across all namespaces
    async fn list_migrations(&self) -> Result<Vec<Migration>, Error>;

    /// Patch the status of a Migration
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &MigrationStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_plan(&self, name: &str, namespace: &str) -> Result<Option<Plan>, Error> {
        let api: Api<Plan> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_provider(&self, name: &str, namespace: &str) -> Result<Option<Provider>, Error> {
        let api: Api<Provider> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_network_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<NetworkMap>, Error> {
        let api: Api<NetworkMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_storage_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<StorageMap>, Error> {
        let api: Api<StorageMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_hook(&self, name: &str, namespace: &str) -> Result<Option<Hook>, Error> {
        let api: Api<Hook> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_migrations(&self) -> Result<Vec<Migration>, Error> {
        let api: Api<Migration> = Api::all(self.client.clone());
        Ok(api.list(&Default::default()).await?.items)
    }

    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &MigrationStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<Migration>(&self.client, name, namespace, status, FIELD_MANAGER)
            .await?;
        Ok(())
    }
}

/// Controller context for the Migration reconciler
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Inventory service
    pub inventory: Arc<dyn Inventory>,
    /// Disk copy and guest conversion
    pub worker: Arc<dyn ConversionWorker>,
    /// Destination VM platform
    pub target: Arc<dyn TargetPlatform>,
    /// Hook execution
    pub hooks: Arc<dyn HookRunner>,
    /// Controller settings
    pub settings: Settings,
}

impl Context {
    /// Create a context from explicit collaborators
    pub fn new(
        kube: Arc<dyn KubeClient>,
        inventory: Arc<dyn Inventory>,
        worker: Arc<dyn ConversionWorker>,
        target: Arc<dyn TargetPlatform>,
        hooks: Arc<dyn HookRunner>,
        settings: Settings,
    ) -> Self {
        Self {
            kube,
            inventory,
            worker,
            target,
            hooks,
            settings,
        }
    }

    /// Create a context backed by a real cluster client
    pub fn from_client(
        client: Client,
        inventory: Arc<dyn Inventory>,
        settings: Settings,
    ) -> Result<Self, Error> {
        let worker = PodWorker::new(client.clone(), settings.virt_v2v_image.clone())?;
        Ok(Self::new(
            Arc::new(KubeClientImpl::new(client.clone())),
            inventory,
            Arc::new(worker),
            Arc::new(KubevirtTarget::new(client.clone())),
            Arc::new(JobHookRunner::new(client)),
            settings,
        ))
    }
}

/// Plan and everything it references
struct Dependencies {
    plan: Plan,
    source: Provider,
    destination: Provider,
    network_map: NetworkMap,
    storage_map: StorageMap,
}

impl Dependencies {
    fn resolved(&self) -> Resolved<'_> {
        Resolved {
            plan: &self.plan,
            source: &self.source,
            destination: &self.destination,
            network_map: &self.network_map,
            storage_map: &self.storage_map,
        }
    }
}

/// Reconcile a Migration
#[instrument(skip(migration, ctx), fields(migration = %migration.name_any()))]
pub async fn reconcile(migration: Arc<Migration>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = migration.name_any();
    let namespace = migration.namespace().unwrap_or_default();
    info!("reconciling migration");

    let current = migration.status.clone().unwrap_or_default();
    let mut status = current.clone();
    status.conditions.begin_staging();

    let action = if status.completed.is_some() {
        Action::requeue(REQUEUE_RESYNC)
    } else {
        execute(&ctx, &migration, &namespace, &mut status).await?
    };

    if !status.conditions.has_blocker_condition() {
        status.conditions.set_ready(true, "The migration is ready.");
    } else {
        warn!(blockers = ?status.conditions.blocker_messages(), "migration not ready");
    }
    status.conditions.end_staging();
    status.observed_generation = Some(migration.metadata.generation.unwrap_or_default());

    if status != current {
        ctx.kube.patch_status(&name, &namespace, &status).await?;
        info!(
            running = status.vms.iter().filter(|v| v.is_running()).count(),
            completed = status.vms.iter().filter(|v| v.is_completed()).count(),
            "migration status updated"
        );
    } else {
        debug!("status unchanged, skipping update");
    }
    Ok(action)
}

async fn execute(
    ctx: &Context,
    migration: &Migration,
    namespace: &str,
    status: &mut MigrationStatus,
) -> Result<Action, Error> {
    let Some(deps) = resolve(ctx, migration, namespace, &mut status.conditions).await? else {
        return Ok(Action::requeue(REQUEUE_SLOW));
    };
    let resolved = deps.resolved();
    let now = Utc::now();

    let captured = snapshot::capture(migration, &resolved);
    let drift = snapshot::drift(status, &captured);
    if drift.plan_replaced {
        status.conditions.set_condition(
            Condition::new(
                PLAN_REF_NOT_VALID,
                Category::Critical,
                reason::MODIFIED,
                "The plan reference cannot be changed after the migration started.",
            )
            .with_items([migration.spec.plan.or_namespace(namespace).to_string()]),
        );
        return Ok(Action::requeue(REQUEUE_SLOW));
    }

    if status.started.is_none() {
        if !deps.plan.is_ready() {
            status.conditions.set_condition(Condition::new(
                PLAN_NOT_READY,
                Category::Critical,
                reason::NOT_VALID,
                "The migration plan is not ready.",
            ));
            return Ok(Action::requeue(REQUEUE_SLOW));
        }
        status.started = Some(now);
        info!(plan = %deps.plan.name_any(), warm = deps.plan.is_warm(), "migration started");
    }
    match snapshot::ensure(status, captured) {
        Change::Created => debug!("snapshot created"),
        Change::DependenciesChanged => info!("maps or providers changed, snapshot appended"),
        Change::Unchanged => {}
    }
    if drift.plan_modified {
        status.conditions.set_condition(Condition::new(
            PLAN_MODIFIED_WHILE_RUNNING,
            Category::Advisory,
            reason::MODIFIED,
            "The plan was modified while the migration is running; the original plan is kept.",
        ));
    }

    let others = others(ctx, migration, &deps.source).await?;
    let before = status.vms.clone();
    Engine::new(ctx, migration, &resolved, now)
        .run(status, &others)
        .await?;

    if status.all_completed() {
        status.completed = Some(Utc::now());
        set_terminal(status);
        info!(
            failed = status.vms.iter().filter(|v| v.has_error()).count(),
            "migration completed"
        );
        return Ok(Action::requeue(REQUEUE_RESYNC));
    }

    status.conditions.set_condition(Condition::new(
        RUNNING,
        Category::Advisory,
        reason::STARTED,
        "The migration is running.",
    ));
    status.conditions.set_condition(
        Condition::new(
            EXECUTING,
            Category::Advisory,
            reason::STARTED,
            "The plan is executing.",
        )
        .with_items([deps.plan.name_any()]),
    );

    Ok(if status.vms != before {
        Action::requeue(REQUEUE_FAST)
    } else {
        Action::requeue(REQUEUE_SLOW)
    })
}

/// Resolve the plan and its references, reporting what is missing
async fn resolve(
    ctx: &Context,
    migration: &Migration,
    namespace: &str,
    conditions: &mut Conditions,
) -> Result<Option<Dependencies>, Error> {
    let plan_ref = migration.spec.plan.or_namespace(namespace);
    if !plan_ref.is_set() {
        conditions.set_condition(Condition::new(
            PLAN_NOT_VALID,
            Category::Critical,
            reason::NOT_SET,
            "The plan reference is not set.",
        ));
        return Ok(None);
    }
    let Some(plan) = ctx.kube.get_plan(&plan_ref.name, &plan_ref.namespace).await? else {
        conditions.set_condition(
            Condition::new(
                PLAN_NOT_VALID,
                Category::Critical,
                reason::NOT_FOUND,
                "The plan was not found.",
            )
            .with_items([plan_ref.to_string()]),
        );
        return Ok(None);
    };

    let plan_namespace = plan.namespace().unwrap_or_default();
    let at = |r: &ObjectRef| r.or_namespace(&plan_namespace);
    let (source, destination) = (at(&plan.spec.provider.source), at(&plan.spec.provider.destination));
    let (network, storage) = (at(&plan.spec.map.network), at(&plan.spec.map.storage));

    let source_provider = ctx.kube.get_provider(&source.name, &source.namespace).await?;
    let destination_provider = ctx
        .kube
        .get_provider(&destination.name, &destination.namespace)
        .await?;
    let network_map = ctx
        .kube
        .get_network_map(&network.name, &network.namespace)
        .await?;
    let storage_map = ctx
        .kube
        .get_storage_map(&storage.name, &storage.namespace)
        .await?;

    let missing: Vec<String> = [
        (source_provider.is_none(), "source provider", &source),
        (destination_provider.is_none(), "destination provider", &destination),
        (network_map.is_none(), "network map", &network),
        (storage_map.is_none(), "storage map", &storage),
    ]
    .into_iter()
    .filter(|(absent, _, _)| *absent)
    .map(|(_, what, r)| format!("{what} {r}"))
    .collect();

    match (source_provider, destination_provider, network_map, storage_map) {
        (Some(source), Some(destination), Some(network_map), Some(storage_map)) => {
            Ok(Some(Dependencies {
                plan,
                source,
                destination,
                network_map,
                storage_map,
            }))
        }
        _ => {
            conditions.set_condition(
                Condition::new(
                    PLAN_NOT_READY,
                    Category::Critical,
                    reason::NOT_FOUND,
                    "Resources referenced by the plan were not found.",
                )
                .with_items(missing),
            );
            Ok(None)
        }
    }
}

/// Started, unfinished migrations of other plans sharing the source provider
async fn others(
    ctx: &Context,
    migration: &Migration,
    source: &Provider,
) -> Result<Vec<Migration>, Error> {
    let uid = migration.uid();
    let source_uid = source.uid().unwrap_or_default();
    Ok(ctx
        .kube
        .list_migrations()
        .await?
        .into_iter()
        .filter(|m| m.uid() != uid)
        .filter(|m| {
            m.status.as_ref().is_some_and(|s| {
                s.started.is_some()
                    && s.completed.is_none()
                    && s
                        .active_snapshot()
                        .is_some_and(|snap| snap.provider.source.uid == source_uid)
            })
        })
        .collect())
}

/// Terminal conditions once every VM is done
fn set_terminal(status: &mut MigrationStatus) {
    let failed: Vec<String> = status
        .vms
        .iter()
        .filter(|v| v.has_error())
        .map(|v| v.source.to_string())
        .collect();
    let canceled: Vec<String> = status
        .vms
        .iter()
        .filter(|v| v.phase == VmPhase::Canceled)
        .map(|v| v.source.to_string())
        .collect();

    if !canceled.is_empty() {
        status.conditions.set_condition(
            Condition::new(
                CANCELED,
                Category::Advisory,
                reason::USER_REQUESTED,
                "The migration has been canceled.",
            )
            .with_items(canceled.clone())
            .durable(),
        );
    }
    if !failed.is_empty() {
        status.conditions.set_condition(
            Condition::new(
                FAILED,
                Category::Critical,
                reason::COMPLETED,
                "The migration has failed.",
            )
            .with_items(failed)
            .durable(),
        );
    } else if canceled.len() < status.vms.len() {
        status.conditions.set_condition(
            Condition::new(
                SUCCEEDED,
                Category::Advisory,
                reason::COMPLETED,
                "The migration has succeeded.",
            )
            .durable(),
        );
    }
}

/// Error policy for the Migration controller
pub fn error_policy(migration: Arc<Migration>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        migration = %migration.name_any(),
        namespace = %migration.namespace().unwrap_or_default(),
        "reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(REQUEUE_FAST)
    } else {
        Action::requeue(REQUEUE_SLOW)
    }
}
