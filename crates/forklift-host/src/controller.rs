//! Host reconciliation controller
//!
//! Each pass recomputes the host's conditions inside a staging window:
//!
//! 1. **Provider**: must be a ready vSphere provider
//! 2. **Reference**: the host must resolve to one inventory host
//! 3. **Address and secret**: an IP address and `user`/`password` credentials
//! 4. **Connection**: a login to `https://{ip}/sdk`; `Ready` on success

use std::net::IpAddr;
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
use forklift_common::crd::{Host, HostStatus, Provider, ProviderType};
use forklift_common::inventory::{Inventory, InventoryProvider};
use forklift_common::kube_utils::{get_secret, patch_resource_status, secret_value};
use forklift_common::{Error, REQUEUE_FAST, REQUEUE_RESYNC, REQUEUE_SLOW};
use forklift_provider::{insecure_condition, validate_credentials};

use crate::connection::{sdk_endpoint, Credentials, HostConnection, SoapConnection};
use crate::validation::{validate_ip, validate_provider, validate_ref, IP_NOT_VALID};

const FIELD_MANAGER: &str = "forklift-host";

const VALIDATED: &str = "Validated";
const CONNECTION_TEST_SUCCEEDED: &str = "ConnectionTestSucceeded";
const CONNECTION_TEST_FAILED: &str = "ConnectionTestFailed";

/// Retry interval after the host refused the login
const CONNECTION_RETRY: Duration = Duration::from_secs(60);

/// Trait abstracting Kubernetes client operations for Host
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a Provider by name and namespace
    async fn get_provider(&self, name: &str, namespace: &str) -> Result<Option<Provider>, Error>;

    /// Get a Secret by name and namespace
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error>;

    /// Patch the status of a Host
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &HostStatus,
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
    async fn get_provider(&self, name: &str, namespace: &str) -> Result<Option<Provider>, Error> {
        let api: kube::Api<Provider> = kube::Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        Ok(get_secret(&self.client, name, namespace).await?)
    }

    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &HostStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<Host>(&self.client, name, namespace, status, FIELD_MANAGER).await?;
        Ok(())
    }
}

/// Controller context for the Host reconciler
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Inventory service
    pub inventory: Arc<dyn Inventory>,
    /// Host login test
    pub connection: Arc<dyn HostConnection>,
}

impl Context {
    /// Create a context from explicit collaborators
    pub fn new(
        kube: Arc<dyn KubeClient>,
        inventory: Arc<dyn Inventory>,
        connection: Arc<dyn HostConnection>,
    ) -> Self {
        Self {
            kube,
            inventory,
            connection,
        }
    }

    /// Create a context backed by a real cluster client
    pub fn from_client(client: Client, inventory: Arc<dyn Inventory>) -> Self {
        Self::new(
            Arc::new(KubeClientImpl::new(client)),
            inventory,
            Arc::new(SoapConnection::default()),
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Outcome {
    Ready,
    NotValid,
    ConnectionFailed,
}

/// Reconcile a Host
#[instrument(skip(host, ctx), fields(host = %host.name_any()))]
pub async fn reconcile(host: Arc<Host>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = host.name_any();
    let namespace = host.namespace().unwrap_or_default();
    info!(ip = %host.spec.ip_address, "reconciling host");

    let current = host.status.clone().unwrap_or_default();
    let mut conditions = current.conditions.clone();
    conditions.begin_staging();
    let outcome = validate(&host, &ctx, &mut conditions).await?;
    conditions.end_staging();

    let status = HostStatus {
        observed_generation: Some(host.generation()),
        conditions,
    };
    if status != current {
        ctx.kube.patch_status(&name, &namespace, &status).await?;
        info!(outcome = ?outcome, "host status updated");
    } else {
        debug!("status unchanged, skipping update");
    }

    Ok(match outcome {
        Outcome::ConnectionFailed => Action::requeue(CONNECTION_RETRY),
        Outcome::Ready | Outcome::NotValid => Action::requeue(REQUEUE_RESYNC),
    })
}

async fn validate(host: &Host, ctx: &Context, conditions: &mut Conditions) -> Result<Outcome, Error> {
    let provider_ref = host.provider_ref();
    let provider = if provider_ref.name.is_empty() {
        None
    } else {
        ctx.kube
            .get_provider(&provider_ref.name, &provider_ref.namespace)
            .await?
    };
    match validate_provider(&provider_ref, provider.as_ref()) {
        Ok(provider) => {
            let handle = InventoryProvider::of(provider);
            if let Some(c) = validate_ref(ctx.inventory.as_ref(), &handle, &host.spec.ref_).await? {
                conditions.set_condition(c);
            }
        }
        Err(c) => conditions.set_condition(c),
    }

    let ip = match validate_ip(&host.spec.ip_address) {
        Ok(ip) => Some(ip),
        Err(c) => {
            conditions.set_condition(c);
            None
        }
    };

    let secret_ref = host.secret_ref();
    let secret = if secret_ref.is_set() {
        ctx.kube
            .get_secret(&secret_ref.name, &secret_ref.namespace)
            .await?
    } else {
        None
    };
    let check = validate_credentials(ProviderType::VSphere, &secret_ref, secret.as_ref());
    if let Some(c) = check.condition {
        conditions.set_condition(c);
    }
    if check.insecure {
        conditions.set_condition(insecure_condition());
    }

    if conditions.has_blocker_condition() {
        warn!(blockers = ?conditions.blocker_messages(), "host not valid");
        return Ok(Outcome::NotValid);
    }
    let (Some(ip), Some(secret)) = (ip, secret) else {
        return Ok(Outcome::NotValid);
    };
    conditions.set_condition(Condition::new(
        VALIDATED,
        Category::Advisory,
        reason::COMPLETED,
        "The host has been validated.",
    ));

    let credentials = Credentials {
        user: secret_value(&secret, "user").unwrap_or_default(),
        password: secret_value(&secret, "password").unwrap_or_default(),
        insecure: check.insecure,
    };
    connection_test(ip, &credentials, ctx, conditions).await
}

async fn connection_test(
    ip: IpAddr,
    credentials: &Credentials,
    ctx: &Context,
    conditions: &mut Conditions,
) -> Result<Outcome, Error> {
    let endpoint = match sdk_endpoint(ip) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            conditions.set_condition(
                Condition::new(
                    IP_NOT_VALID,
                    Category::Critical,
                    reason::NOT_VALID,
                    "The `ipAddress` is not valid.",
                )
                .with_items([e.to_string()]),
            );
            return Ok(Outcome::NotValid);
        }
    };

    match ctx.connection.test(&endpoint, credentials).await {
        Ok(()) => {
            conditions.set_condition(Condition::new(
                CONNECTION_TEST_SUCCEEDED,
                Category::Required,
                reason::TESTED,
                "Connection test, succeeded.",
            ));
            conditions.set_ready(true, "The host is ready.");
            Ok(Outcome::Ready)
        }
        Err(e) => {
            warn!(endpoint = %endpoint, error = %e, "connection test failed");
            conditions.set_condition(Condition::new(
                CONNECTION_TEST_FAILED,
                Category::Critical,
                reason::TESTED,
                format!("Connection test, failed: {e}"),
            ));
            Ok(Outcome::ConnectionFailed)
        }
    }
}

/// Error policy for the Host controller
pub fn error_policy(host: Arc<Host>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        host = %host.name_any(),
        "reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(REQUEUE_FAST)
    } else {
        Action::requeue(REQUEUE_SLOW)
    }
}
