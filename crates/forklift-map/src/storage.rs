//! StorageMap reconciler

use std::collections::BTreeSet;
use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use forklift_common::condition::{reason, Category, Condition, Conditions};
use forklift_common::crd::{MapStatus, Provider, StorageMap};
use forklift_common::inventory::{find, InventoryKind, InventoryProvider, Lookup, MapKind};
use forklift_common::refs::{ObjectRef, Ref};
use forklift_common::{Error, REQUEUE_RESYNC, REQUEUE_SLOW};

use crate::controller::Context;
use crate::validation::{qualified_pair, validate_provider_pair, validate_sources};

const SOURCE_STORAGE_NOT_VALID: &str = "SourceStorageNotValid";
const DESTINATION_STORAGE_NOT_VALID: &str = "DestinationStorageNotValid";

/// Reconcile a StorageMap
#[instrument(skip(map, ctx), fields(map = %map.name_any()))]
pub async fn reconcile_storage_map(map: Arc<StorageMap>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = map.name_any();
    let namespace = map.namespace().unwrap_or_default();
    info!("reconciling storage map");

    let current = map.status.clone().unwrap_or_default();
    let mut conditions = current.conditions.clone();
    conditions.begin_staging();

    let pair = qualified_pair(&map.spec.provider, &namespace);
    let source = ctx.fetch_provider(&pair.source).await?;
    let destination = ctx.fetch_provider(&pair.destination).await?;
    let providers = validate_provider_pair(&pair, source, destination, &mut conditions);

    let mut references = Vec::new();
    if let Some(providers) = &providers {
        let handle = InventoryProvider::of(&providers.source);
        let refs: Vec<&Ref> = map.spec.map.iter().map(|p| &p.source).collect();
        references = validate_sources(
            ctx.inventory.as_ref(),
            &handle,
            InventoryKind::Storage,
            &refs,
            SOURCE_STORAGE_NOT_VALID,
            &mut conditions,
        )
        .await?;
        validate_destinations(&ctx, &map, &providers.destination, &mut conditions).await?;

        ctx.watches.ensure_watch(&handle);
        ctx.watches.subscribe(
            MapKind::Storage,
            ObjectRef::new(&namespace, &name),
            &handle.uid,
            refs.into_iter().cloned().collect(),
        );
    }

    let ready = !conditions.has_blocker_condition();
    if ready {
        conditions.set_ready(true, "The storage map is ready.");
    } else {
        warn!(blockers = ?conditions.blocker_messages(), "storage map not valid");
    }
    conditions.end_staging();

    let status = MapStatus {
        observed_generation: map.metadata.generation,
        conditions,
        references,
    };
    if status != current {
        ctx.kube
            .patch_storage_map_status(&name, &namespace, &status)
            .await?;
        info!(ready, "storage map status updated");
    } else {
        debug!("status unchanged, skipping update");
    }

    if providers.is_none() {
        return Ok(Action::requeue(REQUEUE_SLOW));
    }
    Ok(Action::requeue(REQUEUE_RESYNC))
}

async fn validate_destinations(
    ctx: &Context,
    map: &StorageMap,
    destination: &Provider,
    conditions: &mut Conditions,
) -> Result<(), Error> {
    let mut not_set = false;
    let mut not_found = BTreeSet::new();
    let mut checked = BTreeSet::new();

    for pair in &map.spec.map {
        let class = pair.destination.storage_class.trim();
        if class.is_empty() {
            not_set = true;
            continue;
        }
        if !checked.insert(class) {
            continue;
        }
        if !class_exists(ctx, destination, class).await? {
            not_found.insert(class.to_string());
        }
    }

    if not_set {
        conditions.set_condition(Condition::new(
            DESTINATION_STORAGE_NOT_VALID,
            Category::Critical,
            reason::NOT_SET,
            "Destination storage class must be set.",
        ));
    } else if !not_found.is_empty() {
        conditions.set_condition(
            Condition::new(
                DESTINATION_STORAGE_NOT_VALID,
                Category::Critical,
                reason::NOT_FOUND,
                "Destination storage class not found.",
            )
            .with_items(not_found),
        );
    }
    Ok(())
}

async fn class_exists(ctx: &Context, destination: &Provider, class: &str) -> Result<bool, Error> {
    if destination.is_host() {
        return ctx.kube.storage_class_exists(class).await;
    }
    let lookup = find(
        ctx.inventory.as_ref(),
        &InventoryProvider::of(destination),
        InventoryKind::Storage,
        &Ref::with_name(class),
    )
    .await?;
    Ok(matches!(lookup, Lookup::Found(_)))
}
