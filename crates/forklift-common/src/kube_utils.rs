//! Small helpers around the Kubernetes API used by every controller

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Patch the status sub-resource of a namespaced resource.
///
/// Serializes `status` into `{ "status": <status> }` and applies it via
/// merge-patch.
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl serde::Serialize,
    field_manager: &str,
) -> std::result::Result<(), kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Merge-patch metadata annotations and spec fields of a namespaced resource
pub async fn patch_resource<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    patch: &serde_json::Value,
    field_manager: &str,
) -> std::result::Result<(), kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    api.patch(name, &PatchParams::apply(field_manager), &Patch::Merge(patch))
        .await?;
    Ok(())
}

/// Fetch a secret, `None` when it does not exist
pub async fn get_secret(
    client: &Client,
    name: &str,
    namespace: &str,
) -> std::result::Result<Option<Secret>, kube::Error> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    secrets.get_opt(name).await
}

/// API resource of Multus network attachment definitions
pub fn network_attachment_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk("k8s.cni.cncf.io", "v1", "NetworkAttachmentDefinition");
    ApiResource::from_gvk_with_plural(&gvk, "network-attachment-definitions")
}

/// Fetch a network attachment definition, `None` when it does not exist
pub async fn get_network_attachment(
    client: &Client,
    name: &str,
    namespace: &str,
) -> std::result::Result<Option<DynamicObject>, kube::Error> {
    let api: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), namespace, &network_attachment_resource());
    api.get_opt(name).await
}

/// API resource of KubeVirt virtual machines
pub fn virtual_machine_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk("kubevirt.io", "v1", "VirtualMachine");
    ApiResource::from_gvk_with_plural(&gvk, "virtualmachines")
}

/// Fetch a KubeVirt virtual machine, `None` when it does not exist
pub async fn get_virtual_machine(
    client: &Client,
    name: &str,
    namespace: &str,
) -> std::result::Result<Option<DynamicObject>, kube::Error> {
    let api: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), namespace, &virtual_machine_resource());
    api.get_opt(name).await
}

/// Fetch a storage class, `None` when it does not exist
pub async fn get_storage_class(
    client: &Client,
    name: &str,
) -> std::result::Result<Option<StorageClass>, kube::Error> {
    let api: Api<StorageClass> = Api::all(client.clone());
    api.get_opt(name).await
}

/// Keys present in a secret's `data` and `stringData`
pub fn secret_keys(secret: &Secret) -> Vec<String> {
    let mut keys: Vec<String> = secret
        .data
        .iter()
        .flat_map(|d| d.keys().cloned())
        .chain(secret.string_data.iter().flat_map(|d| d.keys().cloned()))
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

/// Decoded value of a secret key, from `data` or `stringData`
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    if let Some(v) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return String::from_utf8(v.0.clone()).ok();
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(key))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn secret() -> Secret {
        Secret {
            data: Some(BTreeMap::from([
                ("user".to_string(), ByteString(b"admin".to_vec())),
                ("password".to_string(), ByteString(b"s3cret".to_vec())),
            ])),
            string_data: Some(BTreeMap::from([(
                "insecureSkipVerify".to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        }
    }

    #[test]
    fn network_attachment_resource_uses_plural() {
        let ar = network_attachment_resource();
        assert_eq!(ar.group, "k8s.cni.cncf.io");
        assert_eq!(ar.plural, "network-attachment-definitions");
        assert_eq!(ar.api_version, "k8s.cni.cncf.io/v1");
    }

    #[test]
    fn virtual_machine_resource_is_kubevirt_v1() {
        let ar = virtual_machine_resource();
        assert_eq!(ar.api_version, "kubevirt.io/v1");
        assert_eq!(ar.kind, "VirtualMachine");
        assert_eq!(ar.plural, "virtualmachines");
    }

    #[test]
    fn keys_merge_data_and_string_data() {
        assert_eq!(
            secret_keys(&secret()),
            vec!["insecureSkipVerify", "password", "user"]
        );
    }

    #[test]
    fn values_decode_from_either_map() {
        let s = secret();
        assert_eq!(secret_value(&s, "user").as_deref(), Some("admin"));
        assert_eq!(secret_value(&s, "insecureSkipVerify").as_deref(), Some("true"));
        assert_eq!(secret_value(&s, "token"), None);
    }
}
