//! Error types for the forklift control plane
//!
//! Errors carry enough context (resource, provider, VM) to be actionable in
//! logs. Validation findings are *not* errors: they are written to the
//! resource as conditions. Errors are reserved for system failures that the
//! reconcile framework should retry.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for forklift operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Inventory service error
    #[error("inventory error [{provider}/{kind}]: {message}")]
    Inventory {
        /// Provider whose inventory was queried
        provider: String,
        /// Resource kind being queried (vm, network, datastore, ...)
        kind: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Malformed resource that cannot be processed at all
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Namespaced name of the offending resource
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.vms[0]")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Conversion worker error
    #[error("worker error for vm {vm}: {message}")]
    Worker {
        /// VM the worker belongs to
        vm: String,
        /// Description of what failed
        message: String,
    },

    /// Hook runner error
    #[error("hook error [{step}] for vm {vm}: {message}")]
    Hook {
        /// VM the hook runs for
        vm: String,
        /// Pipeline step (PreHook, PostHook)
        step: String,
        /// Description of what failed
        message: String,
    },

    /// Target platform error
    #[error("target error for {namespace}/{name}: {message}")]
    Target {
        /// Target namespace
        namespace: String,
        /// Target VM name
        name: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "watch")
        context: String,
    },
}

impl Error {
    /// Create an inventory error that will be retried
    pub fn inventory(
        provider: impl Into<String>,
        kind: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Inventory {
            provider: provider.into(),
            kind: kind.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create an inventory error that requires a fix before retrying
    pub fn inventory_permanent(
        provider: impl Into<String>,
        kind: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Inventory {
            provider: provider.into(),
            kind: kind.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific resource field
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a conversion worker error
    pub fn worker(vm: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Worker {
            vm: vm.into(),
            message: msg.into(),
        }
    }

    /// Create a hook runner error
    pub fn hook(vm: impl Into<String>, step: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Hook {
            vm: vm.into(),
            step: step.into(),
            message: msg.into(),
        }
    }

    /// Create a target platform error
    pub fn target(
        namespace: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Target {
            namespace: namespace.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a user fix. Kubernetes 4xx
    /// responses are not retried; everything transient is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Inventory { retryable, .. } => *retryable,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Worker { .. } => true,
            Error::Hook { .. } => true,
            Error::Target { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Check whether this is a Kubernetes "not found" response
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 404
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
