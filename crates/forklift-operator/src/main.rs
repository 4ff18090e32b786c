//! Forklift Operator - VM migration control plane

mod controller_runner;
mod webhook;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use forklift_common::crd::{Hook, Host, Migration, NetworkMap, Plan, Provider, StorageMap};
use forklift_common::inventory::{Inventory, InventoryClient, WatchManager};
use forklift_common::settings::{
    DEFAULT_HOOK_IMAGE, DEFAULT_INVENTORY_URL, DEFAULT_VIRT_V2V_IMAGE,
};
use forklift_common::Settings;

/// Forklift - CRD-driven migration of virtual machines onto the cluster
#[derive(Parser, Debug)]
#[command(name = "forklift-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Inventory service base URL
    #[arg(long, env = "INVENTORY_URL", default_value = DEFAULT_INVENTORY_URL)]
    inventory_url: String,

    /// Bearer token presented to the inventory service
    #[arg(long, env = "INVENTORY_TOKEN", hide_env_values = true)]
    inventory_token: Option<String>,

    /// Deadline of a single inventory call, in seconds
    #[arg(long, env = "INVENTORY_TIMEOUT_SECS", default_value_t = 30)]
    inventory_timeout_secs: u64,

    /// Inventory watch poll interval, in seconds
    #[arg(long, env = "INVENTORY_POLL_INTERVAL_SECS", default_value_t = 10)]
    inventory_poll_interval_secs: u64,

    /// Capacity of each inventory watch event channel
    #[arg(long, env = "WATCH_CHANNEL_CAPACITY", default_value_t = 100)]
    watch_channel_capacity: usize,

    /// Disks in flight per source host across all migrations of a provider
    #[arg(long, env = "MAX_VM_INFLIGHT", default_value_t = 20)]
    max_vm_inflight: usize,

    /// Conversion worker image
    #[arg(long, env = "VIRT_V2V_IMAGE", default_value = DEFAULT_VIRT_V2V_IMAGE)]
    virt_v2v_image: String,

    /// Hook runner image used when a hook names none
    #[arg(long, env = "HOOK_IMAGE", default_value = DEFAULT_HOOK_IMAGE)]
    hook_image: String,

    /// Minutes between warm incremental copies
    #[arg(long, env = "PRECOPY_INTERVAL_MINUTES", default_value_t = 60)]
    precopy_interval_minutes: u64,

    /// Directory holding tls.crt / tls.key (and optionally ca.crt) for the
    /// Plan admission webhook; the webhook is not served when unset
    #[arg(long, env = "WEBHOOK_CERT_DIR")]
    webhook_cert_dir: Option<PathBuf>,

    /// Namespace the operator (and its webhook Service) runs in
    #[arg(long, env = "POD_NAMESPACE", default_value = "konveyor-forklift")]
    namespace: String,
}

impl Cli {
    fn settings(&self) -> Settings {
        Settings {
            inventory_url: self.inventory_url.clone(),
            inventory_timeout: Duration::from_secs(self.inventory_timeout_secs),
            inventory_poll_interval: Duration::from_secs(self.inventory_poll_interval_secs),
            watch_channel_capacity: self.watch_channel_capacity,
            max_vm_inflight: self.max_vm_inflight,
            virt_v2v_image: self.virt_v2v_image.clone(),
            hook_image: self.hook_image.clone(),
            precopy_interval: Duration::from_secs(self.precopy_interval_minutes * 60),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_manifests()?);
        return Ok(());
    }

    run_controllers(&cli).await
}

/// Every CRD the operator serves
fn crds() -> Vec<CustomResourceDefinition> {
    vec![
        Provider::crd(),
        Host::crd(),
        NetworkMap::crd(),
        StorageMap::crd(),
        Hook::crd(),
        Plan::crd(),
        Migration::crd(),
    ]
}

/// All CRDs as one multi-document YAML stream
fn crd_manifests() -> anyhow::Result<String> {
    let docs = crds()
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
    Ok(docs.join("---\n"))
}

/// Ensure all forklift CRDs are installed
///
/// Server-side apply keeps the installed versions matching the operator.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("forklift-controller").force();

    for crd in crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD...");
        api.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install {} CRD: {}", name, e))?;
    }
    Ok(())
}

async fn run_controllers(cli: &Cli) -> anyhow::Result<()> {
    let settings = cli.settings();

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let mut inventory = InventoryClient::new(&settings.inventory_url, settings.inventory_timeout)
        .map_err(|e| anyhow::anyhow!("Failed to create inventory client: {}", e))?;
    if let Some(token) = &cli.inventory_token {
        inventory = inventory.with_token(token.clone());
    }
    let inventory: Arc<dyn Inventory> = Arc::new(inventory);

    let (watches, receivers) = WatchManager::new(inventory.clone(), &settings);
    let watches = Arc::new(watches);

    tracing::info!(
        inventory = %settings.inventory_url,
        max_vm_inflight = settings.max_vm_inflight,
        "Starting controllers:"
    );

    let mut controllers: Vec<controller_runner::ControllerFuture> = Vec::new();
    controllers.extend(controller_runner::build_provider_controllers(
        client.clone(),
        inventory.clone(),
        watches.clone(),
    ));
    controllers.extend(controller_runner::build_host_controllers(
        client.clone(),
        inventory.clone(),
    ));
    controllers.extend(controller_runner::build_map_controllers(
        client.clone(),
        inventory.clone(),
        watches,
        receivers,
    ));
    controllers.extend(controller_runner::build_hook_controllers(client.clone()));
    controllers.extend(controller_runner::build_plan_controllers(
        client.clone(),
        inventory.clone(),
    ));
    controllers.extend(
        controller_runner::build_migration_controllers(client.clone(), inventory, settings)
            .map_err(|e| anyhow::anyhow!("Failed to start migration controller: {}", e))?,
    );

    if let Some(cert_dir) = cli.webhook_cert_dir.clone() {
        webhook::ensure_webhook_config(&client, &cli.namespace, &cert_dir).await?;
        tracing::info!("- Plan admission webhook");
        controllers.push(Box::pin(async move {
            if let Err(e) = webhook::serve(&cert_dir).await {
                tracing::error!(error = %e, "Plan admission webhook stopped");
            }
        }));
    }

    futures::future::join_all(controllers).await;

    tracing::info!("Shutting down");
    Ok(())
}
