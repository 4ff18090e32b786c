//! Validating admission webhook for Plans
//!
//! A plan's migration mode is locked once created: updates that toggle
//! `spec.warm` are denied before they reach the store.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;

use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use k8s_openapi::api::admissionregistration::v1::{
    RuleWithOperations, ServiceReference, ValidatingWebhook, ValidatingWebhookConfiguration,
    WebhookClientConfig,
};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DynamicObject, ObjectMeta, Patch, PatchParams};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::Client;
use tracing::{debug, error, info, warn};

use forklift_common::crd::{validate_update, Plan};
use forklift_common::API_GROUP;

/// Port the webhook listens on inside the operator pod
pub const WEBHOOK_PORT: u16 = 9443;

/// Service fronting the webhook
pub const WEBHOOK_SERVICE: &str = "forklift-webhook";

/// Path of the Plan validation endpoint
pub const VALIDATE_PLANS_PATH: &str = "/validate/plans";

const WEBHOOK_CONFIGURATION: &str = "forklift-plan-validator";

/// Router with every admission endpoint
pub fn webhook_router() -> Router {
    Router::new()
        .route(VALIDATE_PLANS_PATH, post(validate_plans))
        .route("/healthz", get(|| async { "ok" }))
}

/// Handle a validating admission review for a Plan
pub async fn validate_plans(
    Json(body): Json<AdmissionReview<Plan>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<Plan> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(review_plan(&req).into_review())
}

/// Admission decision for one Plan request
pub fn review_plan(req: &AdmissionRequest<Plan>) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);
    if !matches!(req.operation, Operation::Update) {
        return response;
    }
    let (Some(old), Some(new)) = (&req.old_object, &req.object) else {
        debug!(uid = %req.uid, "update without both objects, allowing");
        return response;
    };
    match validate_update(old, new) {
        Ok(()) => response,
        Err(e) => {
            warn!(uid = %req.uid, plan = %req.name, error = %e, "Plan update denied");
            response.deny(e.to_string())
        }
    }
}

/// Serve the webhook over TLS with `tls.crt` / `tls.key` from `cert_dir`
pub async fn serve(cert_dir: &Path) -> anyhow::Result<()> {
    let tls = RustlsConfig::from_pem_file(cert_dir.join("tls.crt"), cert_dir.join("tls.key"))
        .await
        .map_err(|e| anyhow::anyhow!("TLS config error: {}", e))?;
    let addr = SocketAddr::from(([0, 0, 0, 0], WEBHOOK_PORT));

    info!(addr = %addr, "Plan admission webhook started");
    axum_server::bind_rustls(addr, tls)
        .serve(webhook_router().into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("Webhook server error: {}", e))
}

fn webhook_service(namespace: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(WEBHOOK_SERVICE.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                "app".to_string(),
                "forklift-operator".to_string(),
            )])),
            ports: Some(vec![ServicePort {
                name: Some("https".to_string()),
                port: 443,
                target_port: Some(IntOrString::Int(i32::from(WEBHOOK_PORT))),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn webhook_configuration(namespace: &str, ca_bundle: Vec<u8>) -> ValidatingWebhookConfiguration {
    ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(WEBHOOK_CONFIGURATION.to_string()),
            ..Default::default()
        },
        webhooks: Some(vec![ValidatingWebhook {
            name: format!("plans.{API_GROUP}"),
            admission_review_versions: vec!["v1".to_string()],
            side_effects: "None".to_string(),
            failure_policy: Some("Fail".to_string()),
            match_policy: Some("Equivalent".to_string()),
            rules: Some(vec![RuleWithOperations {
                operations: Some(vec!["UPDATE".to_string()]),
                api_groups: Some(vec![API_GROUP.to_string()]),
                api_versions: Some(vec!["v1beta1".to_string()]),
                resources: Some(vec!["plans".to_string()]),
                scope: Some("Namespaced".to_string()),
            }]),
            client_config: WebhookClientConfig {
                service: Some(ServiceReference {
                    name: WEBHOOK_SERVICE.to_string(),
                    namespace: namespace.to_string(),
                    path: Some(VALIDATE_PLANS_PATH.to_string()),
                    port: Some(443),
                }),
                ca_bundle: Some(k8s_openapi::ByteString(ca_bundle)),
                ..Default::default()
            },
            ..Default::default()
        }]),
    }
}

/// Install the webhook Service and ValidatingWebhookConfiguration
///
/// The CA bundle is `ca.crt` from `cert_dir`, or `tls.crt` for a
/// self-signed serving certificate.
pub async fn ensure_webhook_config(
    client: &Client,
    namespace: &str,
    cert_dir: &Path,
) -> anyhow::Result<()> {
    let ca_bundle = match tokio::fs::read(cert_dir.join("ca.crt")).await {
        Ok(ca) => ca,
        Err(_) => tokio::fs::read(cert_dir.join("tls.crt"))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read webhook certificate: {}", e))?,
    };
    let params = PatchParams::apply("forklift-controller").force();

    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    services
        .patch(WEBHOOK_SERVICE, &params, &Patch::Apply(&webhook_service(namespace)))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create webhook Service: {}", e))?;

    let configs: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    configs
        .patch(
            WEBHOOK_CONFIGURATION,
            &params,
            &Patch::Apply(&webhook_configuration(namespace, ca_bundle)),
        )
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create ValidatingWebhookConfiguration: {}", e))?;

    info!("Webhook configuration installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use forklift_common::crd::{PlanMaps, PlanSpec, PlanStatus, ProviderPair};
    use serde_json::json;

    fn plan(warm: bool) -> Plan {
        let mut plan = Plan::new(
            "wave-1",
            PlanSpec {
                provider: ProviderPair::default(),
                map: PlanMaps::default(),
                target_namespace: "migrated".into(),
                vms: vec![],
                warm,
                archived: false,
                transfer_network: None,
            },
        );
        plan.metadata.namespace = Some("forklift".into());
        plan
    }

    fn review(operation: &str, old: Option<&Plan>, new: &Plan) -> AdmissionReview<Plan> {
        serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "req-1",
                "kind": {"group": API_GROUP, "version": "v1beta1", "kind": "Plan"},
                "resource": {"group": API_GROUP, "version": "v1beta1", "resource": "plans"},
                "name": "wave-1",
                "namespace": "forklift",
                "operation": operation,
                "userInfo": {},
                "object": new,
                "oldObject": old,
                "dryRun": false
            }
        }))
        .expect("admission review should deserialize")
    }

    async fn allowed(review: AdmissionReview<Plan>) -> bool {
        let Json(out) = validate_plans(Json(review)).await;
        out.response.expect("review should carry a response").allowed
    }

    #[tokio::test]
    async fn warm_flip_is_denied() {
        assert!(!allowed(review("UPDATE", Some(&plan(false)), &plan(true))).await);
        assert!(!allowed(review("UPDATE", Some(&plan(true)), &plan(false))).await);
    }

    #[tokio::test]
    async fn recorded_mode_wins_over_old_spec() {
        let mut old = plan(true);
        old.status = Some(PlanStatus {
            warm: Some(false),
            ..Default::default()
        });
        assert!(!allowed(review("UPDATE", Some(&old), &plan(true))).await);
        assert!(allowed(review("UPDATE", Some(&old), &plan(false))).await);
    }

    #[tokio::test]
    async fn other_edits_and_creates_are_allowed() {
        let mut edited = plan(false);
        edited.spec.target_namespace = "elsewhere".into();
        assert!(allowed(review("UPDATE", Some(&plan(false)), &edited)).await);
        assert!(allowed(review("CREATE", None, &plan(true))).await);
    }

    #[test]
    fn configuration_targets_plan_updates() {
        let config = webhook_configuration("konveyor-forklift", b"ca".to_vec());
        let hook = &config.webhooks.expect("one webhook")[0];
        let rule = &hook.rules.as_ref().expect("rules")[0];

        assert_eq!(rule.operations.as_deref(), Some(&["UPDATE".to_string()][..]));
        assert_eq!(rule.resources.as_deref(), Some(&["plans".to_string()][..]));
        assert_eq!(hook.failure_policy.as_deref(), Some("Fail"));
        let service = hook.client_config.service.as_ref().expect("service reference");
        assert_eq!(service.path.as_deref(), Some(VALIDATE_PLANS_PATH));
        assert_eq!(service.namespace, "konveyor-forklift");
    }
}
