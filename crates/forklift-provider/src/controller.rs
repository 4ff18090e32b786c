//! Provider reconciliation controller
//!
//! Each pass recomputes the provider's conditions from scratch inside a
//! staging window and publishes them in one status write:
//!
//! 1. **Static checks**: type, URL and credentials secret
//! 2. **Connection**: one inventory listing proves the service can reach the
//!    platform with the given credentials
//! 3. **Inventory**: the watch-manager polls the provider; `Ready` waits for
//!    its first complete listing

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use forklift_common::condition::{reason, Category, Condition, Conditions};
use forklift_common::crd::{Provider, ProviderPhase, ProviderStatus};
use forklift_common::inventory::{Inventory, InventoryKind, InventoryProvider, WatchRegistry};
use forklift_common::kube_utils::{get_secret, patch_resource_status};
use forklift_common::{Error, REQUEUE_FAST, REQUEUE_RESYNC, REQUEUE_SLOW};

use crate::validation::{insecure_condition, validate_secret, validate_type, validate_url};

const FIELD_MANAGER: &str = "forklift-provider";

const CONNECTION_TEST_FAILED: &str = "ConnectionTestFailed";
const LOAD_INVENTORY: &str = "LoadInventory";
const INVENTORY_CREATED: &str = "InventoryCreated";
const VALIDATED: &str = "Validated";

/// Retry interval after the platform refused the connection
const CONNECTION_RETRY: Duration = Duration::from_secs(60);

/// Trait abstracting Kubernetes client operations for Provider
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a Secret by name and namespace
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error>;

    /// Patch the status of a Provider
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &ProviderStatus,
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
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        Ok(get_secret(&self.client, name, namespace).await?)
    }

    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &ProviderStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<Provider>(&self.client, name, namespace, status, FIELD_MANAGER)
            .await?;
        Ok(())
    }
}

/// Controller context for the Provider reconciler
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Inventory service
    pub inventory: Arc<dyn Inventory>,
    /// Inventory watch registry shared with the map controllers
    pub watches: Arc<dyn WatchRegistry>,
}

impl Context {
    /// Create a context from explicit collaborators
    pub fn new(
        kube: Arc<dyn KubeClient>,
        inventory: Arc<dyn Inventory>,
        watches: Arc<dyn WatchRegistry>,
    ) -> Self {
        Self {
            kube,
            inventory,
            watches,
        }
    }

    /// Create a context backed by a real cluster client
    pub fn from_client(
        client: Client,
        inventory: Arc<dyn Inventory>,
        watches: Arc<dyn WatchRegistry>,
    ) -> Self {
        Self::new(Arc::new(KubeClientImpl::new(client)), inventory, watches)
    }
}

/// Reconcile a Provider
#[instrument(skip(provider, ctx), fields(provider = %provider.name_any()))]
pub async fn reconcile(provider: Arc<Provider>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = provider.name_any();
    let namespace = provider.namespace().unwrap_or_default();
    info!(provider_type = %provider.spec.type_, "reconciling provider");

    let current = provider.status.clone().unwrap_or_default();
    let mut conditions = current.conditions.clone();
    conditions.begin_staging();
    let phase = validate(&provider, &ctx, &mut conditions).await?;
    conditions.end_staging();

    let status = ProviderStatus {
        observed_generation: Some(provider.generation()),
        phase,
        conditions,
    };
    if status != current {
        ctx.kube.patch_status(&name, &namespace, &status).await?;
        info!(phase = ?phase, "provider status updated");
    } else {
        debug!("status unchanged, skipping update");
    }

    Ok(match phase {
        ProviderPhase::Ready => Action::requeue(REQUEUE_RESYNC),
        ProviderPhase::Staging => Action::requeue(REQUEUE_SLOW),
        ProviderPhase::ConnectionFailed => Action::requeue(CONNECTION_RETRY),
        ProviderPhase::ValidationFailed | ProviderPhase::Pending => {
            Action::requeue(REQUEUE_RESYNC)
        }
    })
}

async fn validate(
    provider: &Provider,
    ctx: &Context,
    conditions: &mut Conditions,
) -> Result<ProviderPhase, Error> {
    if let Some(c) = validate_type(provider) {
        conditions.set_condition(c);
        return Ok(ProviderPhase::ValidationFailed);
    }
    if let Some(c) = validate_url(provider) {
        conditions.set_condition(c);
    }

    let secret_ref = &provider.spec.secret;
    let secret = if secret_ref.is_set() && !provider.is_host() {
        ctx.kube
            .get_secret(&secret_ref.name, &secret_ref.namespace)
            .await?
    } else {
        None
    };
    let check = validate_secret(provider, secret.as_ref());
    if let Some(c) = check.condition {
        conditions.set_condition(c);
    }
    if check.insecure {
        conditions.set_condition(insecure_condition());
    }

    if conditions.has_blocker_condition() {
        warn!(blockers = ?conditions.blocker_messages(), "provider not valid");
        return Ok(ProviderPhase::ValidationFailed);
    }
    conditions.set_condition(Condition::new(
        VALIDATED,
        Category::Advisory,
        reason::COMPLETED,
        "Validation has been completed.",
    ));

    let handle = InventoryProvider::of(provider);
    match ctx.inventory.list(&handle, InventoryKind::Network).await {
        Ok(_) => {}
        Err(e) if !e.is_retryable() => {
            warn!(error = %e, "connection test failed");
            conditions.set_condition(Condition::new(
                CONNECTION_TEST_FAILED,
                Category::Critical,
                reason::TESTED,
                format!("Connection test failed: {e}"),
            ));
            return Ok(ProviderPhase::ConnectionFailed);
        }
        Err(e) => debug!(error = %e, "inventory not loaded yet"),
    }

    ctx.watches.ensure_watch(&handle);
    if !ctx.watches.has_parity(&handle.uid) {
        conditions.set_condition(Condition::new(
            LOAD_INVENTORY,
            Category::Advisory,
            reason::STARTED,
            "Loading the inventory.",
        ));
        return Ok(ProviderPhase::Staging);
    }

    conditions.set_condition(Condition::new(
        INVENTORY_CREATED,
        Category::Required,
        reason::COMPLETED,
        "The inventory has been loaded.",
    ));
    conditions.set_ready(true, "The provider is ready.");
    Ok(ProviderPhase::Ready)
}

/// Error policy for the Provider controller
pub fn error_policy(provider: Arc<Provider>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        provider = %provider.name_any(),
        "reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(REQUEUE_FAST)
    } else {
        Action::requeue(REQUEUE_SLOW)
    }
}
