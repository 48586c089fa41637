//! Error types for the capic controllers
//!
//! Errors are structured with fields to aid debugging in production. Every
//! failure coming back from the cloud is classified at the client boundary
//! into an [`ErrorClass`], so the reconcilers only ever branch on the
//! taxonomy below and never on raw transport errors.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Classification of a cloud-side failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ErrorClass {
    /// Network timeout, rate limit, temporary capacity shortage
    Transient,
    /// Invalid configuration, permanently denied quota, missing image or location
    Permanent,
    /// The addressed cloud resource (or request) does not exist
    NotFound,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::NotFound => write!(f, "not-found"),
        }
    }
}

/// Main error type for capic operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Resource with invalid configuration (namespace/name)
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.numCores")
        field: Option<String>,
    },

    /// Classified cloud API failure
    #[error("cloud error [{operation}, {class}] for {resource}: {message}")]
    Cloud {
        /// Resource the call was made for
        resource: String,
        /// Cloud operation that failed (e.g. "create_server")
        operation: String,
        /// Classification that drives retry behavior
        class: ErrorClass,
        /// Message reported by the cloud or transport
        message: String,
    },

    /// A cloud resource recorded in status vanished without the provider deleting it
    #[error("instance {instance_id} of {resource} was deleted outside of the provider")]
    ExternalDeletion {
        /// Resource that owned the instance
        resource: String,
        /// Provider-assigned instance id
        instance_id: String,
    },

    /// Credential reference could not be resolved
    #[error("credentials error for {resource}: {message}")]
    Credentials {
        /// Resource referencing the credentials
        resource: String,
        /// Description of what failed
        message: String,
        /// False when the referenced Secret exists but is malformed
        retryable: bool,
    },

    /// Optimistic-concurrency update rejected
    #[error("conflict updating {resource}: {message}")]
    Conflict {
        /// Resource whose stored version changed
        resource: String,
        /// Description of the conflict
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "tracker")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
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

    /// Create a classified cloud error
    pub fn cloud(
        resource: impl Into<String>,
        operation: impl Into<String>,
        class: ErrorClass,
        msg: impl Into<String>,
    ) -> Self {
        Self::Cloud {
            resource: resource.into(),
            operation: operation.into(),
            class,
            message: msg.into(),
        }
    }

    /// Create an external-deletion error
    pub fn external_deletion(resource: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self::ExternalDeletion {
            resource: resource.into(),
            instance_id: instance_id.into(),
        }
    }

    /// Credentials are not available yet (e.g. Secret not created); retried
    pub fn credentials_unavailable(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Credentials {
            resource: resource.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Credentials exist but cannot be used; requires operator action
    pub fn credentials_invalid(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Credentials {
            resource: resource.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a conflict error
    pub fn conflict(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: msg.into(),
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

    /// Classify this error along the reconciler taxonomy
    ///
    /// Kubernetes 4xx responses other than 401/403/404/409/429 are
    /// configuration problems and count as permanent. Auth failures of the
    /// controller's own service account say nothing about the resource and
    /// are retried, as is everything else on the Kubernetes side.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 404 => ErrorClass::NotFound,
                kube::Error::Api(ae) if matches!(ae.code, 401 | 403 | 409 | 429) => {
                    ErrorClass::Transient
                }
                kube::Error::Api(ae) if (400..500).contains(&ae.code) => ErrorClass::Permanent,
                _ => ErrorClass::Transient,
            },
            Error::Validation { .. } => ErrorClass::Permanent,
            Error::Cloud { class, .. } => *class,
            Error::ExternalDeletion { .. } => ErrorClass::Permanent,
            Error::Credentials { retryable, .. } => {
                if *retryable {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            Error::Conflict { .. } => ErrorClass::Transient,
            Error::Serialization { .. } => ErrorClass::Permanent,
            Error::Internal { .. } => ErrorClass::Transient,
        }
    }

    /// Check if this error is retryable
    ///
    /// Not-found is reported as retryable: whether a missing resource is
    /// fatal depends on the caller (a missing server during delete is success).
    pub fn is_retryable(&self) -> bool {
        self.class() != ErrorClass::Permanent
    }

    /// Check if this error must move the resource to Failed
    pub fn is_permanent(&self) -> bool {
        self.class() == ErrorClass::Permanent
    }

    /// Check if this error reports a missing cloud or Kubernetes resource
    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }

    /// Check if this is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// Short, operator-facing failure cause written to `status.failureReason`
    pub fn reason(&self) -> String {
        match self {
            Error::Validation { message, .. } => message.clone(),
            Error::Cloud { message, .. } => message.clone(),
            Error::Credentials { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Get the resource name if this error is associated with one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Validation { resource, .. } => Some(resource),
            Error::Cloud { resource, .. } => Some(resource),
            Error::ExternalDeletion { resource, .. } => Some(resource),
            Error::Credentials { resource, .. } => Some(resource),
            Error::Conflict { resource, .. } => Some(resource),
            Error::Kube { .. } | Error::Serialization { .. } | Error::Internal { .. } => None,
        }
    }

    /// Label used for the error in logs
    pub fn kind_label(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "kube",
            Error::Validation { .. } => "validation",
            Error::Cloud { .. } => "cloud",
            Error::ExternalDeletion { .. } => "external_deletion",
            Error::Credentials { .. } => "credentials",
            Error::Conflict { .. } => "conflict",
            Error::Serialization { .. } => "serialization",
            Error::Internal { .. } => "internal",
        }
    }
}
