//! Static checks of a Host: owning provider, inventory reference and address

use std::net::IpAddr;

use forklift_common::condition::{reason, Category, Condition};
use forklift_common::crd::{Provider, ProviderType};
use forklift_common::inventory::{find, Inventory, InventoryKind, InventoryProvider, Lookup};
use forklift_common::refs::{ObjectRef, Ref};
use forklift_common::Result;

pub(crate) const PROVIDER_NOT_VALID: &str = "ProviderNotValid";
pub(crate) const PROVIDER_NOT_READY: &str = "ProviderNotReady";
pub(crate) const TYPE_NOT_VALID: &str = "TypeNotValid";
pub(crate) const REF_NOT_VALID: &str = "RefNotValid";
pub(crate) const IP_NOT_VALID: &str = "IpNotValid";

const TYPE_ERR: &str = "TypeErr";
const NOT_READY: &str = "NotReady";

/// The owning provider, when it is a ready vSphere provider
pub fn validate_provider<'a>(
    r: &ObjectRef,
    provider: Option<&'a Provider>,
) -> std::result::Result<&'a Provider, Condition> {
    let not_valid = |reason: &str| {
        Condition::new(
            PROVIDER_NOT_VALID,
            Category::Critical,
            reason,
            "The provider is not valid.",
        )
    };
    if r.name.is_empty() {
        return Err(not_valid(reason::NOT_SET));
    }
    let Some(provider) = provider else {
        return Err(not_valid(reason::NOT_FOUND).with_items([r.to_string()]));
    };
    if provider.spec.type_ != ProviderType::VSphere {
        return Err(Condition::new(
            TYPE_NOT_VALID,
            Category::Critical,
            TYPE_ERR,
            "Provider type not supported.",
        )
        .with_items([provider.spec.type_.as_str()]));
    }
    if !provider.is_ready() {
        return Err(Condition::new(
            PROVIDER_NOT_READY,
            Category::Critical,
            NOT_READY,
            "The provider does not have a Ready condition.",
        )
        .with_items([r.to_string()]));
    }
    Ok(provider)
}

/// `RefNotValid` when the host reference is unset or does not resolve to
/// exactly one inventory host. Inventory failures are returned.
pub async fn validate_ref(
    inventory: &dyn Inventory,
    provider: &InventoryProvider,
    r: &Ref,
) -> Result<Option<Condition>> {
    if r.not_set() {
        return Ok(Some(Condition::new(
            REF_NOT_VALID,
            Category::Critical,
            reason::NOT_SET,
            "The `id` is not valid.",
        )));
    }
    let condition = match find(inventory, provider, InventoryKind::Host, r).await? {
        Lookup::Found(_) => None,
        Lookup::NotFound => Some(Condition::new(
            REF_NOT_VALID,
            Category::Critical,
            reason::NOT_FOUND,
            "Referenced host not found.",
        )),
        Lookup::Ambiguous => Some(Condition::new(
            REF_NOT_VALID,
            Category::Critical,
            reason::AMBIGUOUS,
            "Host reference is ambiguous.",
        )),
    };
    Ok(condition.map(|c| c.with_items([r.to_string()])))
}

/// The management address, or `IpNotValid`
pub fn validate_ip(raw: &str) -> std::result::Result<IpAddr, Condition> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Condition::new(
            IP_NOT_VALID,
            Category::Critical,
            reason::NOT_SET,
            "The `ipAddress` is not valid.",
        ));
    }
    raw.parse().map_err(|_| {
        Condition::new(
            IP_NOT_VALID,
            Category::Critical,
            reason::NOT_VALID,
            "The `ipAddress` is not valid.",
        )
        .with_items([raw])
    })
}
