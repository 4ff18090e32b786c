//! Plan reconciliation controller
//!
//! Each pass:
//!
//! 1. Locks the migration mode on first sight and flags later changes
//! 2. Stops at `Archived` for archived plans
//! 3. Mirrors `Executing` from any active migration of the plan
//! 4. Runs the validation chain, adopting the default transfer network and
//!    stamping the populator annotation once the providers resolve
//! 5. Publishes `Ready` when nothing blocks

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::DynamicObject;
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use forklift_common::condition::{reason, Category, Condition, Conditions};
use forklift_common::crd::{
    Hook, Migration, NetworkMap, Plan, PlanStatus, Provider, StorageMap,
};
use forklift_common::inventory::Inventory;
use forklift_common::kube_utils::{
    get_network_attachment, get_virtual_machine, patch_resource, patch_resource_status,
};
use forklift_common::refs::ObjectRef;
use forklift_common::{Error, REQUEUE_FAST, REQUEUE_RESYNC, REQUEUE_SLOW};

use crate::validation::{validate, Outcome};

const FIELD_MANAGER: &str = "forklift-plan";

/// Plan kept for history only
pub const ARCHIVED: &str = "Archived";
/// A migration of the plan is running
pub const EXECUTING: &str = "Executing";
/// `spec.warm` differs from the locked value
pub const WARM_MODE_NOT_VALID: &str = "WarmModeNotValid";

/// Trait abstracting Kubernetes client operations for Plan
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
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

    /// Whether a namespace exists
    async fn namespace_exists(&self, name: &str) -> Result<bool, Error>;

    /// Get a network attachment definition
    async fn get_network_attachment(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// Whether a virtual machine with this name exists on the target cluster
    async fn virtual_machine_exists(&self, name: &str, namespace: &str) -> Result<bool, Error>;

    /// List migrations in a namespace
    async fn list_migrations(&self, namespace: &str) -> Result<Vec<Migration>, Error>;

    /// Merge-patch the plan's metadata and spec
    async fn patch_plan(
        &self,
        name: &str,
        namespace: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Error>;

    /// Patch the status of a Plan
    async fn patch_status(&self, name: &str, namespace: &str, status: &PlanStatus)
        -> Result<(), Error>;
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

    async fn namespace_exists(&self, name: &str) -> Result<bool, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn get_network_attachment(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        Ok(get_network_attachment(&self.client, name, namespace).await?)
    }

    async fn virtual_machine_exists(&self, name: &str, namespace: &str) -> Result<bool, Error> {
        Ok(get_virtual_machine(&self.client, name, namespace)
            .await?
            .is_some())
    }

    async fn list_migrations(&self, namespace: &str) -> Result<Vec<Migration>, Error> {
        let api: Api<Migration> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&Default::default()).await?.items)
    }

    async fn patch_plan(
        &self,
        name: &str,
        namespace: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Error> {
        patch_resource::<Plan>(&self.client, name, namespace, patch, FIELD_MANAGER).await?;
        Ok(())
    }

    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &PlanStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<Plan>(&self.client, name, namespace, status, FIELD_MANAGER)
            .await?;
        Ok(())
    }
}

/// Controller context for the Plan reconciler
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Inventory service
    pub inventory: Arc<dyn Inventory>,
}

impl Context {
    /// Create a context from explicit collaborators
    pub fn new(kube: Arc<dyn KubeClient>, inventory: Arc<dyn Inventory>) -> Self {
        Self { kube, inventory }
    }

    /// Create a context backed by a real cluster client
    pub fn from_client(client: Client, inventory: Arc<dyn Inventory>) -> Self {
        Self::new(Arc::new(KubeClientImpl::new(client)), inventory)
    }
}

/// Reconcile a Plan
#[instrument(skip(plan, ctx), fields(plan = %plan.name_any()))]
pub async fn reconcile(plan: Arc<Plan>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = plan.name_any();
    let namespace = plan.namespace().unwrap_or_default();
    info!("reconciling plan");

    let current = plan.status.clone().unwrap_or_default();
    let warm = current.warm.unwrap_or(plan.spec.warm);
    let mut conditions = current.conditions.clone();
    conditions.begin_staging();

    if warm != plan.spec.warm {
        conditions.set_condition(Condition::new(
            WARM_MODE_NOT_VALID,
            Category::Critical,
            reason::MODIFIED,
            format!("The migration mode cannot be changed after creation (warm: {warm})."),
        ));
    }

    let outcome = if plan.spec.archived {
        conditions.set_condition(Condition::new(
            ARCHIVED,
            Category::Advisory,
            reason::USER_REQUESTED,
            "The plan has been archived.",
        ));
        Outcome::Archived
    } else {
        if let Some(migration) = active_migration(&ctx, &plan, &namespace).await? {
            conditions.set_condition(
                Condition::new(
                    EXECUTING,
                    Category::Advisory,
                    reason::STARTED,
                    "The plan is executing.",
                )
                .with_items([migration]),
            );
        }
        validate(&ctx, &plan, &mut conditions).await?
    };

    let ready = outcome == Outcome::Resolved && !conditions.has_blocker_condition();
    if ready {
        conditions.set_ready(true, "The migration plan is ready.");
    } else if outcome != Outcome::Archived {
        warn!(blockers = ?conditions.blocker_messages(), "plan not ready");
    }
    conditions.end_staging();

    let status = PlanStatus {
        observed_generation: Some(plan.generation()),
        conditions,
        warm: Some(warm),
    };
    if status != current {
        ctx.kube.patch_status(&name, &namespace, &status).await?;
        info!(ready, warm, "plan status updated");
    } else {
        debug!("status unchanged, skipping update");
    }

    Ok(match outcome {
        Outcome::ProvidersNotReady => Action::requeue(REQUEUE_SLOW),
        Outcome::Resolved | Outcome::Archived => Action::requeue(REQUEUE_RESYNC),
    })
}

/// Name of a started, unfinished migration of this plan
async fn active_migration(
    ctx: &Context,
    plan: &Plan,
    namespace: &str,
) -> Result<Option<String>, Error> {
    let this = ObjectRef::new(namespace, plan.name_any());
    let migrations = ctx.kube.list_migrations(namespace).await?;
    Ok(migrations
        .iter()
        .filter(|m| m.spec.plan.or_namespace(namespace) == this)
        .find(|m| {
            m.status
                .as_ref()
                .is_some_and(|s| s.started.is_some() && s.completed.is_none())
        })
        .map(|m| m.name_any()))
}

/// Whether a migration of the plan is mirrored as executing
pub fn is_executing(conditions: &Conditions) -> bool {
    conditions.has_condition(&[EXECUTING])
}

/// Error policy for the Plan controller
pub fn error_policy(plan: Arc<Plan>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        plan = %plan.name_any(),
        namespace = %plan.namespace().unwrap_or_default(),
        "reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(REQUEUE_FAST)
    } else {
        Action::requeue(REQUEUE_SLOW)
    }
}
