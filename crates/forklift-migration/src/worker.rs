//! Conversion worker contract and its pod implementation
//!
//! One worker runs per VM and stage. It reports per-disk progress through a
//! pod annotation and completion through the pod phase, or through the
//! completion annotation when it stays up to serve its results. While
//! running it serves an HTTP surface on port 8080:
//!
//! - `GET /vm`: rendered target VM (YAML), `204` for in-place conversions
//! - `GET /inspection`: guest inspection XML
//! - `GET /warnings`: JSON `[{reason, message}]`, `204` when empty
//! - `POST /shutdown`: `204`, terminates the worker

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client, ResourceExt};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use forklift_common::crd::ProviderType;
use forklift_common::inventory::Vm;
use forklift_common::refs::ObjectRef;
use forklift_common::validation::sanitize_dns_label;
use forklift_common::{Error, LABEL_MIGRATION, LABEL_PLAN, LABEL_VM};

use crate::inspection::{self, OperatingSystem, OsFamily};

/// Port of the worker HTTP surface
pub const WORKER_PORT: u16 = 8080;

/// Pod annotation carrying the JSON progress report
pub const ANN_PROGRESS: &str = "forklift.konveyor.io/progress";

/// Worker annotation set to `true` once its stage is done
pub const ANN_COMPLETED: &str = "forklift.konveyor.io/completed";

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// What a worker is asked to do
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Cold: copy every disk, then convert
    Transfer,
    /// Warm: full copy (0) or delta copy (n)
    Precopy(u32),
    /// Warm: final delta with the source powered off
    Cutover,
    /// Warm: guest conversion of the copied disks
    Convert,
}

impl Stage {
    /// Name segment and `STAGE` value
    pub fn label(&self) -> String {
        match self {
            Stage::Transfer => "transfer".to_string(),
            Stage::Precopy(n) => format!("precopy-{n}"),
            Stage::Cutover => "cutover".to_string(),
            Stage::Convert => "convert".to_string(),
        }
    }
}

/// Where a worker runs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerHandle {
    /// Namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
}

impl WorkerHandle {
    /// Deterministic handle per (migration, vm, stage)
    pub fn new(namespace: &str, migration_uid: &str, vm_id: &str, stage: Stage) -> Self {
        let uid: String = migration_uid.chars().take(8).collect();
        Self {
            namespace: namespace.to_string(),
            name: sanitize_dns_label(&format!("{}-{uid}-{vm_id}", stage.label())),
        }
    }
}

/// Everything a worker needs to run one stage
#[derive(Clone, Debug)]
pub struct WorkerRequest {
    /// Where it runs
    pub handle: WorkerHandle,
    /// What it does
    pub stage: Stage,
    /// Migration UID (label)
    pub migration_uid: String,
    /// Plan UID (label)
    pub plan_uid: String,
    /// Source provider type
    pub source_type: ProviderType,
    /// Source provider URL
    pub source_url: String,
    /// Source provider credentials
    pub secret: ObjectRef,
    /// Source VM as seen in inventory
    pub vm: Vm,
    /// Name of the target VM
    pub target_name: String,
    /// Power the source off before copying
    pub power_off_source: bool,
    /// Customization branch, once inspected
    pub os_family: Option<OsFamily>,
}

/// Bytes copied for one disk
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiskProgress {
    /// Disk id
    pub disk_id: String,
    /// Bytes copied
    pub bytes_transferred: u64,
    /// Bytes expected
    pub total_bytes: u64,
}

/// Completion signal
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Stage finished
    Succeeded,
    /// Stage failed
    Failed(Vec<String>),
}

/// Observed worker state
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerStatus {
    /// Progress stream, last report
    pub progress: Vec<DiskProgress>,
    /// Set once the worker has terminated
    pub completion: Option<Completion>,
}

/// Advisory reported by a worker
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct WorkerWarning {
    /// Machine-readable reason
    #[serde(default)]
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

/// Disk copy and guest conversion, one worker per VM and stage
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConversionWorker: Send + Sync {
    /// Start the worker; a worker that already exists is left alone
    async fn launch(&self, request: &WorkerRequest) -> Result<(), Error>;

    /// Current state, `None` when the worker does not exist
    async fn status(&self, handle: &WorkerHandle) -> Result<Option<WorkerStatus>, Error>;

    /// Rendered target VM, `None` for in-place conversions
    async fn rendered_vm(&self, handle: &WorkerHandle) -> Result<Option<serde_json::Value>, Error>;

    /// Guest inspection, `None` until available
    async fn inspection(&self, handle: &WorkerHandle) -> Result<Option<OperatingSystem>, Error>;

    /// Advisories collected during conversion
    async fn warnings(&self, handle: &WorkerHandle) -> Result<Vec<WorkerWarning>, Error>;

    /// Ask the worker to terminate
    async fn shutdown(&self, handle: &WorkerHandle) -> Result<(), Error>;

    /// Remove the worker (cancellation, failure)
    async fn release(&self, handle: &WorkerHandle) -> Result<(), Error>;
}

/// Build the worker pod for a request
pub fn build_pod(request: &WorkerRequest, image: &str) -> Pod {
    let labels = BTreeMap::from([
        (LABEL_MIGRATION.to_string(), request.migration_uid.clone()),
        (LABEL_PLAN.to_string(), request.plan_uid.clone()),
        (LABEL_VM.to_string(), sanitize_dns_label(&request.vm.id)),
        (
            "app.kubernetes.io/managed-by".to_string(),
            "forklift-migration".to_string(),
        ),
    ]);

    let mut vars = vec![
        env("STAGE", request.stage.label()),
        env("SOURCE_TYPE", request.source_type.as_str()),
        env("SOURCE_URL", &request.source_url),
        env("SOURCE_SECRET", request.secret.to_string()),
        env("VM_ID", &request.vm.id),
        env("VM_NAME", &request.vm.name),
        env("TARGET_NAME", &request.target_name),
        env("POWER_OFF_SOURCE", request.power_off_source.to_string()),
        env(
            "DISKS",
            request
                .vm
                .disks
                .iter()
                .map(|d| d.id.as_str())
                .collect::<Vec<_>>()
                .join(","),
        ),
    ];
    if let Some(family) = request.os_family {
        vars.push(env("CUSTOMIZATION_SCRIPTS", family.scripts()));
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(request.handle.name.clone()),
            namespace: Some(request.handle.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "virt-v2v".to_string(),
                image: Some(image.to_string()),
                env: Some(vars),
                termination_message_policy: Some("FallbackToLogsOnError".to_string()),
                ports: Some(vec![k8s_openapi::api::core::v1::ContainerPort {
                    container_port: i32::from(WORKER_PORT),
                    name: Some("http".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Read progress and completion off a worker pod
pub fn observe(pod: &Pod) -> WorkerStatus {
    let progress = pod
        .annotations()
        .get(ANN_PROGRESS)
        .and_then(|raw| serde_json::from_str::<Vec<DiskProgress>>(raw).ok())
        .unwrap_or_default();

    let status = pod.status.as_ref();
    let done = pod
        .annotations()
        .get(ANN_COMPLETED)
        .is_some_and(|v| v == "true");
    let completion = match status.and_then(|s| s.phase.as_deref()) {
        Some("Succeeded") => Some(Completion::Succeeded),
        Some("Running") if done => Some(Completion::Succeeded),
        Some("Failed") => {
            let reasons: Vec<String> = status
                .and_then(|s| s.container_statuses.as_ref())
                .into_iter()
                .flatten()
                .filter_map(|c| c.state.as_ref()?.terminated.as_ref()?.message.clone())
                .flat_map(|m| {
                    m.lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(String::from)
                        .collect::<Vec<_>>()
                })
                .collect();
            Some(Completion::Failed(if reasons.is_empty() {
                vec!["worker pod failed".to_string()]
            } else {
                reasons
            }))
        }
        _ => None,
    };
    WorkerStatus {
        progress,
        completion,
    }
}

/// Workers as pods in the target namespace
pub struct PodWorker {
    client: Client,
    http: reqwest::Client,
    image: String,
}

impl PodWorker {
    /// Create a worker runner using `image`
    pub fn new(client: Client, image: impl Into<String>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::internal_with_context("worker", format!("http client: {e}")))?;
        Ok(Self {
            client,
            http,
            image: image.into(),
        })
    }

    fn api(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Base URL of a running worker, `None` until the pod has an IP
    async fn endpoint(&self, handle: &WorkerHandle) -> Result<Option<String>, Error> {
        let pod = self.api(&handle.namespace).get_opt(&handle.name).await?;
        Ok(pod
            .and_then(|p| p.status)
            .and_then(|s| s.pod_ip)
            .map(|ip| format!("http://{ip}:{WORKER_PORT}")))
    }

    async fn get(
        &self,
        handle: &WorkerHandle,
        path: &str,
    ) -> Result<Option<(StatusCode, String)>, Error> {
        let Some(base) = self.endpoint(handle).await? else {
            return Ok(None);
        };
        let response = self
            .http
            .get(format!("{base}{path}"))
            .send()
            .await
            .map_err(|e| Error::worker(&handle.name, format!("GET {path}: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::worker(&handle.name, format!("GET {path}: {e}")))?;
        Ok(Some((status, body)))
    }
}

#[async_trait]
impl ConversionWorker for PodWorker {
    async fn launch(&self, request: &WorkerRequest) -> Result<(), Error> {
        let api = self.api(&request.handle.namespace);
        if api.get_opt(&request.handle.name).await?.is_some() {
            return Ok(());
        }
        let pod = build_pod(request, &self.image);
        match api.create(&PostParams::default(), &pod).await {
            Ok(_) => {
                info!(worker = %request.handle.name, stage = %request.stage.label(), "worker launched");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn status(&self, handle: &WorkerHandle) -> Result<Option<WorkerStatus>, Error> {
        let pod = self.api(&handle.namespace).get_opt(&handle.name).await?;
        Ok(pod.as_ref().map(observe))
    }

    async fn rendered_vm(&self, handle: &WorkerHandle) -> Result<Option<serde_json::Value>, Error> {
        match self.get(handle, "/vm").await? {
            Some((status, body)) if status == StatusCode::OK => serde_yaml::from_str(&body)
                .map(Some)
                .map_err(|e| Error::worker(&handle.name, format!("rendered vm: {e}"))),
            Some((status, _)) if status == StatusCode::NO_CONTENT => Ok(None),
            Some((status, _)) => Err(Error::worker(&handle.name, format!("GET /vm: {status}"))),
            None => Err(Error::worker(&handle.name, "worker is not running")),
        }
    }

    async fn inspection(&self, handle: &WorkerHandle) -> Result<Option<OperatingSystem>, Error> {
        match self.get(handle, "/inspection").await? {
            Some((status, body)) if status == StatusCode::OK => inspection::parse(&body).map(Some),
            Some((status, _)) => {
                debug!(worker = %handle.name, %status, "inspection not available yet");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn warnings(&self, handle: &WorkerHandle) -> Result<Vec<WorkerWarning>, Error> {
        match self.get(handle, "/warnings").await? {
            Some((status, body)) if status == StatusCode::OK => Ok(serde_json::from_str(&body)?),
            _ => Ok(Vec::new()),
        }
    }

    async fn shutdown(&self, handle: &WorkerHandle) -> Result<(), Error> {
        let Some(base) = self.endpoint(handle).await? else {
            return Ok(());
        };
        let response = self
            .http
            .post(format!("{base}/shutdown"))
            .send()
            .await
            .map_err(|e| Error::worker(&handle.name, format!("POST /shutdown: {e}")))?;
        if response.status() != StatusCode::NO_CONTENT {
            return Err(Error::worker(
                &handle.name,
                format!("POST /shutdown: {}", response.status()),
            ));
        }
        Ok(())
    }

    async fn release(&self, handle: &WorkerHandle) -> Result<(), Error> {
        match self
            .api(&handle.namespace)
            .delete(&handle.name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
