//! Shared plumbing of the NetworkMap and StorageMap controllers

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::error;

#[cfg(test)]
use mockall::automock;

use forklift_common::crd::{MapStatus, NetworkMap, Provider, StorageMap};
use forklift_common::inventory::{Inventory, WatchRegistry};
use forklift_common::kube_utils::{get_network_attachment, get_storage_class, patch_resource_status};
use forklift_common::refs::ObjectRef;
use forklift_common::{Error, REQUEUE_FAST, REQUEUE_SLOW};

const FIELD_MANAGER: &str = "forklift-map";

/// Trait abstracting Kubernetes client operations for the map controllers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a Provider by name and namespace
    async fn get_provider(&self, name: &str, namespace: &str) -> Result<Option<Provider>, Error>;

    /// Whether a network attachment definition exists on the local cluster
    async fn network_attachment_exists(&self, name: &str, namespace: &str)
        -> Result<bool, Error>;

    /// Whether a storage class exists on the local cluster
    async fn storage_class_exists(&self, name: &str) -> Result<bool, Error>;

    /// Patch the status of a NetworkMap
    async fn patch_network_map_status(
        &self,
        name: &str,
        namespace: &str,
        status: &MapStatus,
    ) -> Result<(), Error>;

    /// Patch the status of a StorageMap
    async fn patch_storage_map_status(
        &self,
        name: &str,
        namespace: &str,
        status: &MapStatus,
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

    async fn network_attachment_exists(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<bool, Error> {
        Ok(get_network_attachment(&self.client, name, namespace)
            .await?
            .is_some())
    }

    async fn storage_class_exists(&self, name: &str) -> Result<bool, Error> {
        Ok(get_storage_class(&self.client, name).await?.is_some())
    }

    async fn patch_network_map_status(
        &self,
        name: &str,
        namespace: &str,
        status: &MapStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<NetworkMap>(&self.client, name, namespace, status, FIELD_MANAGER)
            .await?;
        Ok(())
    }

    async fn patch_storage_map_status(
        &self,
        name: &str,
        namespace: &str,
        status: &MapStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<StorageMap>(&self.client, name, namespace, status, FIELD_MANAGER)
            .await?;
        Ok(())
    }
}

/// Controller context shared by both map reconcilers
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Inventory service
    pub inventory: Arc<dyn Inventory>,
    /// Inventory watch registry
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

    /// Fetch the provider a map points at; an unnamed ref is `None`
    pub(crate) async fn fetch_provider(&self, r: &ObjectRef) -> Result<Option<Provider>, Error> {
        if r.name.is_empty() {
            return Ok(None);
        }
        self.kube.get_provider(&r.name, &r.namespace).await
    }
}

/// Error policy for both map controllers
pub fn error_policy<K: ResourceExt>(map: Arc<K>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        map = %map.name_any(),
        namespace = %map.namespace().unwrap_or_default(),
        "reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(REQUEUE_FAST)
    } else {
        Action::requeue(REQUEUE_SLOW)
    }
}

