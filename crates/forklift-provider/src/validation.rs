//! Static checks of a Provider: type, endpoint URL and credentials secret

use k8s_openapi::api::core::v1::Secret;
use url::Url;

use forklift_common::condition::{reason, Category, Condition};
use forklift_common::crd::{Provider, ProviderType};
use forklift_common::kube_utils::{secret_keys, secret_value};
use forklift_common::refs::ObjectRef;

/// Secret key that disables TLS verification of the provider endpoint
pub const INSECURE_SKIP_VERIFY: &str = "insecureSkipVerify";

pub(crate) const TYPE_NOT_SUPPORTED: &str = "ProviderTypeNotSupported";
pub(crate) const URL_NOT_VALID: &str = "UrlNotValid";
/// Credentials secret missing or incomplete
pub const SECRET_NOT_VALID: &str = "SecretNotValid";
pub(crate) const CONNECTION_INSECURE: &str = "ConnectionInsecure";

const MALFORMED: &str = "Malformed";
const DATA_ERR: &str = "DataErr";
const SKIP_TLS: &str = "SkipTLSVerification";

/// Outcome of looking at the credentials secret
#[derive(Clone, Debug, PartialEq)]
pub struct SecretCheck {
    /// Blocking finding, if any
    pub condition: Option<Condition>,
    /// TLS verification is disabled
    pub insecure: bool,
}

/// `ProviderTypeNotSupported` when the type is missing or unknown
pub fn validate_type(provider: &Provider) -> Option<Condition> {
    if provider.spec.type_.is_supported() {
        return None;
    }
    Some(Condition::new(
        TYPE_NOT_SUPPORTED,
        Category::Critical,
        reason::NOT_SUPPORTED,
        format!(
            "The provider type is not supported; expected one of: {}.",
            ProviderType::ALL.map(|t| t.as_str()).join(", ")
        ),
    ))
}

/// `UrlNotValid` when a remote provider has no URL or an unusable one.
///
/// OVA providers point at an NFS export (`server:/path`); every other remote
/// type needs an absolute URL with a host.
pub fn validate_url(provider: &Provider) -> Option<Condition> {
    if provider.is_host() {
        return None;
    }
    let raw = provider.spec.url.trim();
    if raw.is_empty() {
        return Some(Condition::new(
            URL_NOT_VALID,
            Category::Critical,
            reason::NOT_SET,
            "The `url` is required.",
        ));
    }

    let valid = match provider.spec.type_ {
        ProviderType::Ova => is_nfs_path(raw),
        _ => Url::parse(raw).is_ok_and(|u| u.has_host()),
    };
    if valid {
        return None;
    }
    Some(
        Condition::new(
            URL_NOT_VALID,
            Category::Critical,
            MALFORMED,
            "The `url` is malformed.",
        )
        .with_items([raw]),
    )
}

fn is_nfs_path(raw: &str) -> bool {
    match raw.split_once(':') {
        Some((server, path)) => {
            !server.is_empty() && !server.contains('/') && path.starts_with('/') && path.len() > 1
        }
        None => false,
    }
}

/// Check the credentials secret.
///
/// The local cluster authenticates with the controller's own service account
/// and needs no secret.
pub fn validate_secret(provider: &Provider, secret: Option<&Secret>) -> SecretCheck {
    if provider.is_host() {
        return SecretCheck {
            condition: None,
            insecure: false,
        };
    }
    validate_credentials(provider.spec.type_, &provider.spec.secret, secret)
}

/// Check a credentials secret for a platform of type `type_`.
///
/// `secret` is the object `secret_ref` resolved to, if any.
pub fn validate_credentials(
    type_: ProviderType,
    secret_ref: &ObjectRef,
    secret: Option<&Secret>,
) -> SecretCheck {
    if !secret_ref.is_set() {
        return SecretCheck {
            condition: Some(Condition::new(
                SECRET_NOT_VALID,
                Category::Critical,
                reason::NOT_SET,
                "The `secret` is not valid.",
            )),
            insecure: false,
        };
    }
    let Some(secret) = secret else {
        return SecretCheck {
            condition: Some(
                Condition::new(
                    SECRET_NOT_VALID,
                    Category::Critical,
                    reason::NOT_FOUND,
                    "The `secret` is not valid.",
                )
                .with_items([secret_ref.to_string()]),
            ),
            insecure: false,
        };
    };

    let insecure = secret_value(secret, INSECURE_SKIP_VERIFY)
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));
    let present = secret_keys(secret);
    let missing: Vec<&str> = type_
        .required_secret_keys(insecure)
        .into_iter()
        .filter(|k| !present.iter().any(|p| p == k))
        .collect();

    let condition = (!missing.is_empty()).then(|| {
        Condition::new(
            SECRET_NOT_VALID,
            Category::Critical,
            DATA_ERR,
            "The `secret` is missing required keys.",
        )
        .with_items(missing)
    });
    SecretCheck {
        condition,
        insecure,
    }
}

/// `ConnectionInsecure` advisory when TLS verification is skipped
pub fn insecure_condition() -> Condition {
    Condition::new(
        CONNECTION_INSECURE,
        Category::Warn,
        SKIP_TLS,
        "TLS is susceptible to machine-in-the-middle attacks when certificate verification is skipped.",
    )
}
