//! Validators shared by the mapping and plan controllers

use std::collections::BTreeSet;

use tracing::debug;

use forklift_common::condition::{reason, Category, Condition, Conditions};
use forklift_common::crd::{Provider, ProviderPair};
use forklift_common::inventory::{find, Inventory, InventoryKind, InventoryProvider, Lookup};
use forklift_common::refs::{ObjectRef, Ref};
use forklift_common::Result;

/// Source provider missing or of the wrong type
pub const SOURCE_PROVIDER_NOT_VALID: &str = "SourceProviderNotValid";
/// Destination provider missing or of the wrong type
pub const DESTINATION_PROVIDER_NOT_VALID: &str = "DestinationProviderNotValid";
/// Source provider exists but is not ready
pub const SOURCE_PROVIDER_NOT_READY: &str = "SourceProviderNotReady";
/// Destination provider exists but is not ready
pub const DESTINATION_PROVIDER_NOT_READY: &str = "DestinationProviderNotReady";

/// Provider of the wrong kind for its role
pub const TYPE_NOT_VALID: &str = "TypeNotValid";
/// Referenced resource is not ready
pub const NOT_READY: &str = "NotReady";

/// Both providers of a pair, validated and ready
#[derive(Clone, Debug)]
pub struct ResolvedProviders {
    /// Source provider
    pub source: Provider,
    /// Destination provider
    pub destination: Provider,
}

#[derive(Clone, Copy)]
enum Role {
    Source,
    Destination,
}

impl Role {
    fn not_valid(self) -> &'static str {
        match self {
            Role::Source => SOURCE_PROVIDER_NOT_VALID,
            Role::Destination => DESTINATION_PROVIDER_NOT_VALID,
        }
    }

    fn not_ready(self) -> &'static str {
        match self {
            Role::Source => SOURCE_PROVIDER_NOT_READY,
            Role::Destination => DESTINATION_PROVIDER_NOT_READY,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Role::Source => "source",
            Role::Destination => "destination",
        }
    }

    fn type_fits(self, provider: &Provider) -> bool {
        let caps = provider.spec.type_.capabilities();
        match self {
            Role::Source => caps.source,
            Role::Destination => caps.target,
        }
    }
}

fn check_provider(
    role: Role,
    r: &ObjectRef,
    provider: Option<&Provider>,
    conditions: &mut Conditions,
) -> bool {
    let not_valid = |reason: &str| {
        Condition::new(
            role.not_valid(),
            Category::Critical,
            reason,
            format!("The {} provider is not valid.", role.label()),
        )
    };
    if r.name.is_empty() {
        conditions.set_condition(not_valid(reason::NOT_SET));
        return false;
    }
    let Some(provider) = provider else {
        conditions.set_condition(not_valid(reason::NOT_FOUND).with_items([r.to_string()]));
        return false;
    };
    if !role.type_fits(provider) {
        conditions.set_condition(
            not_valid(TYPE_NOT_VALID).with_items([provider.spec.type_.as_str()]),
        );
        return false;
    }
    if !provider.is_ready() {
        conditions.set_condition(
            Condition::new(
                role.not_ready(),
                Category::Critical,
                NOT_READY,
                format!("The {} provider does not have a Ready condition.", role.label()),
            )
            .with_items([r.to_string()]),
        );
        return false;
    }
    true
}

/// Validate the provider pair of a map or plan.
///
/// `pair` must already carry namespaces. The source provider must be able to
/// act as a source and the destination must be a target platform; both must
/// be `Ready`. Returns the providers when they can be used.
pub fn validate_provider_pair(
    pair: &ProviderPair,
    source: Option<Provider>,
    destination: Option<Provider>,
    conditions: &mut Conditions,
) -> Option<ResolvedProviders> {
    let source_ok = check_provider(Role::Source, &pair.source, source.as_ref(), conditions);
    let destination_ok = check_provider(
        Role::Destination,
        &pair.destination,
        destination.as_ref(),
        conditions,
    );
    match (source_ok, destination_ok, source, destination) {
        (true, true, Some(source), Some(destination)) => Some(ResolvedProviders {
            source,
            destination,
        }),
        _ => None,
    }
}

/// Provider pair with defaulted namespaces
pub fn qualified_pair(pair: &ProviderPair, namespace: &str) -> ProviderPair {
    ProviderPair {
        source: pair.source.or_namespace(namespace),
        destination: pair.destination.or_namespace(namespace),
    }
}

/// Resolve source refs against the source provider's inventory.
///
/// Unset refs, refs that resolve to nothing and ambiguous names are reported
/// on `condition_type`. Returns the resolved objects as refs carrying their
/// inventory ids. Inventory failures other than not-found are returned.
pub async fn validate_sources(
    inventory: &dyn Inventory,
    provider: &InventoryProvider,
    kind: InventoryKind,
    refs: &[&Ref],
    condition_type: &str,
    conditions: &mut Conditions,
) -> Result<Vec<Ref>> {
    let mut not_set = 0usize;
    let mut not_found = BTreeSet::new();
    let mut ambiguous = BTreeSet::new();
    let mut resolved: Vec<Ref> = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();

    for r in refs {
        if r.not_set() {
            not_set += 1;
            continue;
        }
        if !seen.insert(r.to_string()) {
            continue;
        }
        match find(inventory, provider, kind, r).await? {
            Lookup::Found(object) => {
                if !resolved.iter().any(|x| x.id == object.id) {
                    resolved.push(Ref {
                        id: object.id,
                        name: object.name,
                        namespace: object.namespace,
                        type_: object.type_,
                    });
                }
            }
            Lookup::NotFound => {
                not_found.insert(r.to_string());
            }
            Lookup::Ambiguous => {
                ambiguous.insert(r.to_string());
            }
        }
    }
    debug!(
        provider = %provider,
        %kind,
        resolved = resolved.len(),
        not_found = not_found.len(),
        "source refs checked"
    );

    let message = format!("Source {kind} not valid.");
    if not_set > 0 {
        // unresolved refs are kept as items of the single condition
        conditions.set_condition(
            Condition::new(
                condition_type,
                Category::Critical,
                reason::NOT_SET,
                format!("{message} {not_set} source reference(s) have neither id nor name."),
            )
            .with_items(not_found.into_iter().chain(ambiguous)),
        );
    } else if !not_found.is_empty() {
        conditions.set_condition(
            Condition::new(condition_type, Category::Critical, reason::NOT_FOUND, message)
                .with_items(not_found),
        );
    } else if !ambiguous.is_empty() {
        conditions.set_condition(
            Condition::new(condition_type, Category::Critical, reason::AMBIGUOUS, message)
                .with_items(ambiguous),
        );
    }
    Ok(resolved)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use forklift_common::crd::{ProviderSpec, ProviderStatus, ProviderType};
    use forklift_common::inventory::{MapKind, Resource, Vm, WatchRegistry};
    use kube::api::ObjectMeta;
    use mockall::mock;
    use std::collections::BTreeMap;

    mock! {
        pub Inventory {}

        #[async_trait]
        impl Inventory for Inventory {
            async fn get(
                &self,
                provider: &InventoryProvider,
                kind: InventoryKind,
                id: &str,
            ) -> Result<Lookup<Resource>>;
            async fn list(&self, provider: &InventoryProvider, kind: InventoryKind)
                -> Result<Vec<Resource>>;
            async fn get_vm(&self, provider: &InventoryProvider, id: &str) -> Result<Lookup<Vm>>;
            async fn list_vms(&self, provider: &InventoryProvider) -> Result<Vec<Vm>>;
        }
    }

    mock! {
        pub Watches {}

        impl WatchRegistry for Watches {
            fn ensure_watch(&self, provider: &InventoryProvider);
            fn has_parity(&self, provider_uid: &str) -> bool;
            fn subscribe(&self, kind: MapKind, map: ObjectRef, provider_uid: &str, refs: Vec<Ref>);
            fn unsubscribe(&self, kind: MapKind, map: &ObjectRef);
        }
    }

    pub(crate) fn provider(name: &str, type_: ProviderType, url: &str, ready: bool) -> Provider {
        let mut conditions = Conditions::default();
        conditions.set_ready(ready, "ready");
        Provider {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("forklift".into()),
                uid: Some(format!("uid-{name}")),
                generation: Some(1),
                ..Default::default()
            },
            spec: ProviderSpec {
                type_,
                url: url.into(),
                secret: ObjectRef::default(),
                settings: BTreeMap::new(),
            },
            status: Some(ProviderStatus {
                conditions,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn vsphere(ready: bool) -> Provider {
        provider("vsphere", ProviderType::VSphere, "https://vcenter/sdk", ready)
    }

    pub(crate) fn host(ready: bool) -> Provider {
        provider("host", ProviderType::OpenShift, "", ready)
    }

    fn pair() -> ProviderPair {
        ProviderPair {
            source: ObjectRef::new("forklift", "vsphere"),
            destination: ObjectRef::new("forklift", "host"),
        }
    }

    mod provider_pair {
        use super::*;

        #[test]
        fn ready_pair_resolves() {
            let mut c = Conditions::default();
            let resolved = validate_provider_pair(&pair(), Some(vsphere(true)), Some(host(true)), &mut c);
            assert!(resolved.is_some());
            assert!(c.is_empty());
        }

        #[test]
        fn unset_and_missing_providers() {
            let mut c = Conditions::default();
            let p = ProviderPair {
                source: ObjectRef::default(),
                destination: ObjectRef::new("forklift", "gone"),
            };
            assert!(validate_provider_pair(&p, None, None, &mut c).is_none());
            assert_eq!(
                c.find_condition(SOURCE_PROVIDER_NOT_VALID).map(|x| x.reason.as_str()),
                Some(reason::NOT_SET)
            );
            let dest = c.find_condition(DESTINATION_PROVIDER_NOT_VALID).unwrap();
            assert_eq!(dest.reason, reason::NOT_FOUND);
            assert_eq!(dest.items, vec!["forklift/gone".to_string()]);
        }

        #[test]
        fn destination_must_be_target() {
            let mut c = Conditions::default();
            let resolved =
                validate_provider_pair(&pair(), Some(vsphere(true)), Some(vsphere(true)), &mut c);
            assert!(resolved.is_none());
            assert_eq!(
                c.find_condition(DESTINATION_PROVIDER_NOT_VALID)
                    .map(|x| x.reason.as_str()),
                Some(TYPE_NOT_VALID)
            );
        }

        #[test]
        fn not_ready_source_is_reported() {
            let mut c = Conditions::default();
            assert!(
                validate_provider_pair(&pair(), Some(vsphere(false)), Some(host(true)), &mut c)
                    .is_none()
            );
            assert!(c.has_condition(&[SOURCE_PROVIDER_NOT_READY]));
            assert!(c.has_blocker_condition());
        }

        #[test]
        fn pair_namespaces_default_to_owner() {
            let p = ProviderPair {
                source: ObjectRef {
                    name: "vsphere".into(),
                    ..Default::default()
                },
                destination: ObjectRef::new("other", "host"),
            };
            let q = qualified_pair(&p, "forklift");
            assert_eq!(q.source, ObjectRef::new("forklift", "vsphere"));
            assert_eq!(q.destination, ObjectRef::new("other", "host"));
        }
    }

    mod sources {
        use super::*;

        fn network(id: &str, name: &str) -> Resource {
            Resource {
                id: id.into(),
                name: name.into(),
                ..Default::default()
            }
        }

        fn handle() -> InventoryProvider {
            InventoryProvider::of(&vsphere(true))
        }

        #[tokio::test]
        async fn resolved_refs_carry_ids() {
            let mut inv = MockInventory::new();
            inv.expect_get().returning(|_, _, id| {
                Ok(if id == "net-1" {
                    Lookup::Found(network("net-1", "prod"))
                } else {
                    Lookup::NotFound
                })
            });
            inv.expect_list()
                .returning(|_, _| Ok(vec![network("net-1", "prod"), network("net-2", "dev")]));

            let by_id = Ref::with_id("net-1");
            let by_name = Ref::with_name("dev");
            let mut c = Conditions::default();
            let resolved = validate_sources(
                &inv,
                &handle(),
                InventoryKind::Network,
                &[&by_id, &by_name],
                "SourceNetworkNotValid",
                &mut c,
            )
            .await
            .unwrap();
            assert!(c.is_empty());
            let ids: Vec<&str> = resolved.iter().map(|r| r.id.as_str()).collect();
            assert_eq!(ids, vec!["net-1", "net-2"]);
        }

        #[tokio::test]
        async fn unresolved_refs_are_items() {
            let mut inv = MockInventory::new();
            inv.expect_get().returning(|_, _, _| Ok(Lookup::NotFound));
            let missing = Ref::with_id("net-9");
            let mut c = Conditions::default();
            validate_sources(
                &inv,
                &handle(),
                InventoryKind::Network,
                &[&missing, &missing],
                "SourceNetworkNotValid",
                &mut c,
            )
            .await
            .unwrap();
            let cond = c.find_condition("SourceNetworkNotValid").unwrap();
            assert_eq!(cond.reason, reason::NOT_FOUND);
            assert_eq!(cond.items, vec!["id:net-9".to_string()]);
        }

        #[tokio::test]
        async fn empty_ref_is_not_set_without_lookup() {
            let inv = MockInventory::new();
            let empty = Ref::default();
            let mut c = Conditions::default();
            validate_sources(
                &inv,
                &handle(),
                InventoryKind::Storage,
                &[&empty],
                "SourceStorageNotValid",
                &mut c,
            )
            .await
            .unwrap();
            assert_eq!(
                c.find_condition("SourceStorageNotValid").map(|x| x.reason.as_str()),
                Some(reason::NOT_SET)
            );
        }

        #[tokio::test]
        async fn not_set_keeps_unresolved_refs_as_items() {
            let mut inv = MockInventory::new();
            inv.expect_get().returning(|_, _, _| Ok(Lookup::NotFound));
            let empty = Ref::default();
            let missing = Ref::with_id("net-9");
            let mut c = Conditions::default();
            validate_sources(
                &inv,
                &handle(),
                InventoryKind::Network,
                &[&empty, &missing],
                "SourceNetworkNotValid",
                &mut c,
            )
            .await
            .unwrap();
            let cond = c.find_condition("SourceNetworkNotValid").unwrap();
            assert_eq!(cond.reason, reason::NOT_SET);
            assert_eq!(cond.items, vec!["id:net-9".to_string()]);
        }

        #[tokio::test]
        async fn inventory_failure_is_returned() {
            let mut inv = MockInventory::new();
            inv.expect_get().returning(|p, k, _| {
                Err(forklift_common::Error::inventory(&p.name, k.to_string(), "timeout"))
            });
            let r = Ref::with_id("net-1");
            let mut c = Conditions::default();
            let err = validate_sources(
                &inv,
                &handle(),
                InventoryKind::Network,
                &[&r],
                "SourceNetworkNotValid",
                &mut c,
            )
            .await
            .unwrap_err();
            assert!(err.is_retryable());
            assert!(c.is_empty());
        }
    }
}
