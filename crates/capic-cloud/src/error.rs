//! Classification of cloud failures
//!
//! Every failure leaves this crate as a [`CloudError`] carrying an
//! [`ErrorClass`]; raw transport errors never reach the reconcilers.

use capic_common::{Error, ErrorClass};
use thiserror::Error;

/// Result type of every client call
pub type CloudResult<T> = std::result::Result<T, CloudError>;

/// A classified cloud failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct CloudError {
    /// Retry classification
    pub class: ErrorClass,
    /// HTTP status, when the failure came from a response
    pub status: Option<u16>,
    /// Message from the platform or transport
    pub message: String,
}

impl CloudError {
    /// Retryable failure
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            status: None,
            message: message.into(),
        }
    }

    /// Non-retryable failure
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            status: None,
            message: message.into(),
        }
    }

    /// The addressed resource does not exist
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::NotFound,
            status: Some(404),
            message: message.into(),
        }
    }

    /// Failure from an HTTP response
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            class: classify_status(status),
            status: Some(status),
            message: message.into(),
        }
    }

    /// Failure reported by a finished asynchronous request
    pub fn from_request_failure(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            class: classify_request_failure(&message),
            status: None,
            message,
        }
    }

    /// Whether the resource is absent
    pub fn is_not_found(&self) -> bool {
        self.class == ErrorClass::NotFound
    }

    /// Attach resource and operation context
    pub fn into_error(self, resource: &str, operation: &str) -> Error {
        Error::cloud(resource, operation, self.class, self.message)
    }
}

impl From<reqwest::Error> for CloudError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.to_string());
        }
        if err.is_decode() {
            return Self::permanent(format!("unexpected response body: {}", err));
        }
        if err.is_builder() {
            return Self::permanent(format!("invalid request: {}", err));
        }
        // timeouts, connection failures, interrupted bodies
        Self::transient(err.to_string())
    }
}

/// Classify an HTTP status code
pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        404 => ErrorClass::NotFound,
        408 | 429 => ErrorClass::Transient,
        500..=599 => ErrorClass::Transient,
        400..=499 => ErrorClass::Permanent,
        _ => ErrorClass::Transient,
    }
}

/// Classify the message of a failed asynchronous request
///
/// Capacity shortages and timeouts clear up on their own; everything else
/// (bad image, quota, invalid sizing) needs an operator.
pub fn classify_request_failure(message: &str) -> ErrorClass {
    const TRANSIENT_MARKERS: [&str; 6] = [
        "capacity",
        "timeout",
        "timed out",
        "temporar",
        "try again",
        "resource busy",
    ];
    let lower = message.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorClass::Transient
    } else if lower.contains("not found") && lower.contains("request") {
        ErrorClass::NotFound
    } else {
        ErrorClass::Permanent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(429), ErrorClass::Transient);
        assert_eq!(classify_status(503), ErrorClass::Transient);
        assert_eq!(classify_status(404), ErrorClass::NotFound);
        assert_eq!(classify_status(400), ErrorClass::Permanent);
        assert_eq!(classify_status(401), ErrorClass::Permanent);
        assert_eq!(classify_status(403), ErrorClass::Permanent);
        assert_eq!(classify_status(422), ErrorClass::Permanent);
    }

    #[test]
    fn test_request_failure_classification() {
        assert_eq!(
            classify_request_failure("Insufficient capacity in zone ZONE_1"),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_request_failure("Operation timed out"),
            ErrorClass::Transient
        );
        assert_eq!(classify_request_failure("image not found"), ErrorClass::Permanent);
        assert_eq!(
            classify_request_failure("quota exceeded for cores"),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn test_into_error_keeps_class_and_message() {
        let err = CloudError::from_status(422, "image not found").into_error("default/m1", "create_server");
        assert!(err.is_permanent());
        assert_eq!(err.reason(), "image not found");
    }
}
