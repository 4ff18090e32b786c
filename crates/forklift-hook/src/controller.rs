//! Hook reconciliation controller

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use forklift_common::condition::{reason, Category, Condition, Conditions};
use forklift_common::crd::{Hook, HookStatus};
use forklift_common::kube_utils::patch_resource_status;
use forklift_common::{Error, REQUEUE_FAST, REQUEUE_RESYNC, REQUEUE_SLOW};

use crate::image::validate_image;

const FIELD_MANAGER: &str = "forklift-hook";

const IMAGE_NOT_VALID: &str = "ImageNotValid";
const PLAYBOOK_NOT_VALID: &str = "PlaybookNotValid";

/// Trait abstracting Kubernetes client operations for Hook
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Patch the status of a Hook
    async fn patch_status(&self, name: &str, namespace: &str, status: &HookStatus)
        -> Result<(), Error>;
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
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &HookStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<Hook>(&self.client, name, namespace, status, FIELD_MANAGER).await?;
        Ok(())
    }
}

/// Controller context for the Hook reconciler
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
}

impl Context {
    /// Create a context backed by a real cluster client
    pub fn from_client(client: Client) -> Self {
        Self {
            kube: Arc::new(KubeClientImpl::new(client)),
        }
    }
}

/// Reconcile a Hook
#[instrument(skip(hook, ctx), fields(hook = %hook.name_any()))]
pub async fn reconcile(hook: Arc<Hook>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = hook.name_any();
    let namespace = hook.namespace().unwrap_or_default();
    info!("reconciling hook");

    let current = hook.status.clone().unwrap_or_default();
    let mut conditions = current.conditions.clone();
    conditions.begin_staging();
    validate(&hook, &mut conditions);
    let ready = !conditions.has_blocker_condition();
    if ready {
        conditions.set_ready(true, "The hook is ready.");
    } else {
        warn!(blockers = ?conditions.blocker_messages(), "hook not valid");
    }
    conditions.end_staging();

    let status = HookStatus {
        observed_generation: hook.metadata.generation,
        conditions,
    };
    if status != current {
        ctx.kube.patch_status(&name, &namespace, &status).await?;
        info!(ready, "hook status updated");
    } else {
        debug!("status unchanged, skipping update");
    }
    Ok(Action::requeue(REQUEUE_RESYNC))
}

fn validate(hook: &Hook, conditions: &mut Conditions) {
    let image = hook.spec.image.trim();
    if image.is_empty() {
        conditions.set_condition(Condition::new(
            IMAGE_NOT_VALID,
            Category::Critical,
            reason::NOT_SET,
            "The image must be specified.",
        ));
    } else if let Err(e) = validate_image(image) {
        conditions.set_condition(
            Condition::new(
                IMAGE_NOT_VALID,
                Category::Critical,
                reason::NOT_VALID,
                format!("The image is not valid: {e}."),
            )
            .with_items([image]),
        );
    }

    let playbook = hook.spec.playbook.as_deref().unwrap_or_default();
    if !playbook.is_empty() && STANDARD.decode(playbook.trim()).is_err() {
        conditions.set_condition(Condition::new(
            PLAYBOOK_NOT_VALID,
            Category::Critical,
            reason::NOT_VALID,
            "The playbook is not valid base64.",
        ));
    }
}

/// Error policy for the Hook controller
pub fn error_policy(hook: Arc<Hook>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(?error, hook = %hook.name_any(), "reconciliation failed");
    if error.is_retryable() {
        Action::requeue(REQUEUE_FAST)
    } else {
        Action::requeue(REQUEUE_SLOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forklift_common::crd::HookSpec;
    use kube::api::ObjectMeta;
    use std::sync::Mutex;

    fn hook(image: &str, playbook: Option<&str>) -> Hook {
        Hook {
            metadata: ObjectMeta {
                name: Some("pre".into()),
                namespace: Some("forklift".into()),
                generation: Some(1),
                ..Default::default()
            },
            spec: HookSpec {
                image: image.into(),
                playbook: playbook.map(String::from),
                service_account: None,
                deadline: None,
            },
            status: None,
        }
    }

    fn capture_context() -> (Arc<Context>, Arc<Mutex<Vec<HookStatus>>>) {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let mut kube = MockKubeClient::new();
        kube.expect_patch_status().returning(move |_, _, status| {
            sink.lock()
                .expect("mutex should not be poisoned")
                .push(status.clone());
            Ok(())
        });
        (Arc::new(Context { kube: Arc::new(kube) }), updates)
    }

    fn last(updates: &Arc<Mutex<Vec<HookStatus>>>) -> HookStatus {
        updates
            .lock()
            .expect("mutex should not be poisoned")
            .last()
            .cloned()
            .expect("status should have been written")
    }

    #[tokio::test]
    async fn valid_hook_is_ready() {
        let (ctx, updates) = capture_context();
        let playbook = STANDARD.encode("- hosts: localhost\n  tasks: []\n");
        reconcile(
            Arc::new(hook("quay.io/kubev2v/hook-runner:latest", Some(&playbook))),
            ctx,
        )
        .await
        .unwrap();
        let status = last(&updates);
        assert!(status.conditions.is_ready());
        assert_eq!(status.observed_generation, Some(1));
    }

    #[tokio::test]
    async fn missing_image_is_not_set() {
        let (ctx, updates) = capture_context();
        reconcile(Arc::new(hook("", None)), ctx).await.unwrap();
        let status = last(&updates);
        let c = status.conditions.find_condition(IMAGE_NOT_VALID).unwrap();
        assert_eq!(c.reason, reason::NOT_SET);
        assert!(!status.conditions.is_ready());
    }

    #[tokio::test]
    async fn bad_playbook_blocks_ready() {
        let (ctx, updates) = capture_context();
        reconcile(
            Arc::new(hook("quay.io/kubev2v/hook-runner", Some("not base64 !!"))),
            ctx,
        )
        .await
        .unwrap();
        let status = last(&updates);
        assert!(status.conditions.has_condition(&[PLAYBOOK_NOT_VALID]));
        assert!(!status.conditions.is_ready());
    }

    /// Story: the user fixes an invalid image; the hook becomes Ready and the
    /// old ImageNotValid condition is gone.
    #[tokio::test]
    async fn story_image_fix_makes_hook_ready() {
        let (ctx, updates) = capture_context();
        reconcile(Arc::new(hook("Quay.io/Bad Image", None)), ctx.clone())
            .await
            .unwrap();
        let failed = last(&updates);
        assert_eq!(
            failed.conditions.find_condition(IMAGE_NOT_VALID).map(|c| c.reason.as_str()),
            Some(reason::NOT_VALID)
        );

        let mut fixed = hook("quay.io/kubev2v/hook-runner", None);
        fixed.status = Some(failed);
        reconcile(Arc::new(fixed), ctx).await.unwrap();
        let status = last(&updates);
        assert!(status.conditions.find_condition(IMAGE_NOT_VALID).is_none());
        assert!(status.conditions.is_ready());
    }
}
