//! Target platform contract and its KubeVirt implementation

use async_trait::async_trait;
use kube::api::{DynamicObject, PostParams};
use kube::{Api, Client};
use tracing::info;

#[cfg(test)]
use mockall::automock;

use forklift_common::kube_utils::{get_virtual_machine, virtual_machine_resource};
use forklift_common::Error;

/// Creates VMs on the destination
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TargetPlatform: Send + Sync {
    /// Create a VM from a rendered object; returns the stored object
    async fn create_vm(
        &self,
        namespace: &str,
        vm: &serde_json::Value,
    ) -> Result<serde_json::Value, Error>;

    /// A VM with this name exists
    async fn exists(&self, namespace: &str, name: &str) -> Result<bool, Error>;
}

/// `kubevirt.io/v1` VirtualMachines on the local cluster
pub struct KubevirtTarget {
    client: Client,
}

impl KubevirtTarget {
    /// Create a target backed by `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TargetPlatform for KubevirtTarget {
    async fn create_vm(
        &self,
        namespace: &str,
        vm: &serde_json::Value,
    ) -> Result<serde_json::Value, Error> {
        let object: DynamicObject = serde_json::from_value(vm.clone())?;
        let name = object.metadata.name.clone().unwrap_or_default();
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &virtual_machine_resource());
        let created = api
            .create(&PostParams::default(), &object)
            .await
            .map_err(|e| Error::target(namespace, &name, e.to_string()))?;
        info!(namespace, vm = %name, "target vm created");
        Ok(serde_json::to_value(created)?)
    }

    async fn exists(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        Ok(get_virtual_machine(&self.client, name, namespace)
            .await?
            .is_some())
    }
}
