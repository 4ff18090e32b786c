//! Transfer network adoption and validation

use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info};

use forklift_common::condition::{reason, Category, Condition, Conditions};
use forklift_common::crd::{Plan, PlanSpec, Provider};
use forklift_common::refs::ObjectRef;
use forklift_common::validation::is_ip_address;
use forklift_common::{Error, ANN_NETWORK_ROUTE, ANN_POPULATOR_LABELS, ROUTE_NONE};

use crate::controller::Context;

/// Transfer network missing or with a malformed route
pub const TRANSFER_NETWORK_NOT_VALID: &str = "TransferNetworkNotValid";
/// Transfer network has no route annotation
pub const TRANSFER_NETWORK_MISSING_DEFAULT_ROUTE: &str = "TransferNetworkMissingDefaultRoute";

/// Resolve the destination provider's default transfer network annotation.
///
/// The value is `name` (looked up in the target namespace) or
/// `namespace/name`.
fn default_transfer_network(destination: &Provider, target_namespace: &str) -> Option<ObjectRef> {
    let value = destination.default_transfer_network()?;
    let r = match value.split_once('/') {
        Some((namespace, name)) => ObjectRef::new(namespace, name),
        None => ObjectRef::new(target_namespace, value),
    };
    (!r.namespace.is_empty() && !r.name.is_empty()).then_some(r)
}

/// Adopt the default transfer network and stamp the populator annotation.
///
/// A transfer network already in the spec is never replaced. The adopted
/// network is written to the plan and to `spec` so the rest of the pass
/// validates it.
pub(crate) async fn prepare(
    ctx: &Context,
    plan: &Plan,
    destination: &Provider,
    spec: &mut PlanSpec,
) -> Result<(), Error> {
    let mut patch = serde_json::Map::new();

    if spec.transfer_network.is_none() {
        if let Some(candidate) = default_transfer_network(destination, &spec.target_namespace) {
            let found = ctx
                .kube
                .get_network_attachment(&candidate.name, &candidate.namespace)
                .await?
                .is_some();
            if found {
                info!(network = %candidate, "adopting default transfer network");
                patch.insert(
                    "spec".into(),
                    json!({ "transferNetwork": { "namespace": candidate.namespace, "name": candidate.name } }),
                );
                spec.transfer_network = Some(candidate);
            } else {
                debug!(network = %candidate, "default transfer network not found");
            }
        }
    }

    if !plan.has_populator_labels() {
        patch.insert(
            "metadata".into(),
            json!({ "annotations": { ANN_POPULATOR_LABELS: "True" } }),
        );
    }

    if !patch.is_empty() {
        ctx.kube
            .patch_plan(
                &plan.name_any(),
                &plan.namespace().unwrap_or_default(),
                &serde_json::Value::Object(patch),
            )
            .await?;
    }
    Ok(())
}

/// Check the transfer network attachment and its route annotation
pub(crate) async fn validate_transfer_network(
    ctx: &Context,
    spec: &PlanSpec,
    namespace: &str,
    conditions: &mut Conditions,
) -> Result<(), Error> {
    let Some(network) = &spec.transfer_network else {
        return Ok(());
    };
    let r = network.or_namespace(namespace);
    let Some(nad) = ctx.kube.get_network_attachment(&r.name, &r.namespace).await? else {
        conditions.set_condition(
            Condition::new(
                TRANSFER_NETWORK_NOT_VALID,
                Category::Critical,
                reason::NOT_FOUND,
                "Transfer network is not valid.",
            )
            .with_items([r.to_string()]),
        );
        return Ok(());
    };
    match nad.annotations().get(ANN_NETWORK_ROUTE) {
        None => conditions.set_condition(Condition::new(
            TRANSFER_NETWORK_MISSING_DEFAULT_ROUTE,
            Category::Warn,
            reason::NOT_VALID,
            "Transfer network missing default route annotation.",
        )),
        Some(route) if route != ROUTE_NONE && !is_ip_address(route) => {
            conditions.set_condition(
                Condition::new(
                    TRANSFER_NETWORK_NOT_VALID,
                    Category::Critical,
                    reason::NOT_VALID,
                    "Transfer network default route annotation is not a valid IP address.",
                )
                .with_items([route.as_str()]),
            )
        }
        Some(_) => {}
    }
    Ok(())
}
