//! Hook-runner contract and its Job implementation
//!
//! A hook runs at most once per (migration, VM, step): the Job name is
//! derived from those three, so a second invocation observes the first
//! Job instead of creating another.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::PostParams;
use kube::{Api, Client, ResourceExt};
use serde::Serialize;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use forklift_common::crd::Hook;
use forklift_common::refs::Ref;
use forklift_common::validation::sanitize_dns_label;
use forklift_common::{Error, API_GROUP, LABEL_MIGRATION, LABEL_PLAN, LABEL_VM};

/// Hook invocation
#[derive(Clone, Debug)]
pub struct HookRequest {
    /// The hook to run
    pub hook: Hook,
    /// `PreHook` or `PostHook`
    pub step: String,
    /// Migration name
    pub migration: String,
    /// Migration namespace; the Job runs here
    pub namespace: String,
    /// Migration UID
    pub migration_uid: String,
    /// Plan name
    pub plan: String,
    /// Plan UID
    pub plan_uid: String,
    /// Source VM
    pub vm: Ref,
    /// Target VM name
    pub target_name: String,
    /// Target namespace
    pub target_namespace: String,
    /// Image used when the hook does not name one
    pub default_image: String,
}

/// Observed hook outcome
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HookOutcome {
    /// Still running
    Running,
    /// Finished successfully
    Succeeded,
    /// Finished with an error
    Failed(Vec<String>),
}

/// Runs hooks
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HookRunner: Send + Sync {
    /// Start the hook if needed and report its state
    async fn run(&self, request: &HookRequest) -> Result<HookOutcome, Error>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HookContext<'a> {
    migration: &'a str,
    plan: &'a str,
    vm: &'a Ref,
    target_name: &'a str,
    target_namespace: &'a str,
    step: &'a str,
}

/// Deterministic Job name
pub fn job_name(request: &HookRequest) -> String {
    let uid: String = request.migration_uid.chars().take(8).collect();
    let vm = if request.vm.id.is_empty() {
        &request.vm.name
    } else {
        &request.vm.id
    };
    sanitize_dns_label(&format!("hook-{uid}-{vm}-{}", request.step))
}

/// Build the hook Job
pub fn build_job(request: &HookRequest) -> Result<Job, Error> {
    let context = serde_json::to_string(&HookContext {
        migration: &request.migration,
        plan: &request.plan,
        vm: &request.vm,
        target_name: &request.target_name,
        target_namespace: &request.target_namespace,
        step: &request.step,
    })?;

    let labels = BTreeMap::from([
        (LABEL_MIGRATION.to_string(), request.migration_uid.clone()),
        (LABEL_PLAN.to_string(), request.plan_uid.clone()),
        (
            LABEL_VM.to_string(),
            sanitize_dns_label(if request.vm.id.is_empty() {
                &request.vm.name
            } else {
                &request.vm.id
            }),
        ),
    ]);

    let image = if request.hook.spec.image.is_empty() {
        request.default_image.clone()
    } else {
        request.hook.spec.image.clone()
    };
    let mut env = vec![EnvVar {
        name: "HOOK_CONTEXT".to_string(),
        value: Some(context),
        ..Default::default()
    }];
    if let Some(playbook) = &request.hook.spec.playbook {
        env.push(EnvVar {
            name: "PLAYBOOK".to_string(),
            value: Some(playbook.clone()),
            ..Default::default()
        });
    }

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(job_name(request)),
            namespace: Some(request.namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![OwnerReference {
                api_version: format!("{API_GROUP}/v1beta1"),
                kind: "Migration".to_string(),
                name: request.migration.clone(),
                uid: request.migration_uid.clone(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            active_deadline_seconds: Some(request.hook.deadline_secs()),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "hook".to_string(),
                        image: Some(image),
                        env: Some(env),
                        ..Default::default()
                    }],
                    service_account_name: request.hook.spec.service_account.clone(),
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Outcome of a hook Job
pub fn outcome(job: &Job) -> HookOutcome {
    let conditions = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();
    if conditions
        .iter()
        .any(|c| c.type_ == "Complete" && c.status == "True")
    {
        return HookOutcome::Succeeded;
    }
    match conditions
        .iter()
        .find(|c| c.type_ == "Failed" && c.status == "True")
    {
        Some(c) => HookOutcome::Failed(vec![c
            .message
            .clone()
            .or_else(|| c.reason.clone())
            .unwrap_or_else(|| "hook job failed".to_string())]),
        None => HookOutcome::Running,
    }
}

/// Hooks as batch Jobs in the migration namespace
pub struct JobHookRunner {
    client: Client,
}

impl JobHookRunner {
    /// Create a runner backed by `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HookRunner for JobHookRunner {
    async fn run(&self, request: &HookRequest) -> Result<HookOutcome, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), &request.namespace);
        let name = job_name(request);
        if let Some(job) = api.get_opt(&name).await? {
            return Ok(outcome(&job));
        }
        let job = build_job(request)?;
        match api.create(&PostParams::default(), &job).await {
            Ok(created) => {
                info!(job = %created.name_any(), hook = %request.hook.name_any(), step = %request.step, "hook job created");
                Ok(HookOutcome::Running)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(HookOutcome::Running),
            Err(e) => Err(e.into()),
        }
    }
}
