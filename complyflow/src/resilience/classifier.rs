//! Fault taxonomy and classification.
//!
//! Every other resilience component decides what to do with a failure by
//! asking for its [`ErrorCategory`]. [`ErrorClassifier::is_retryable`] is the
//! only place retry eligibility is defined.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Classification of a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Temporary failure that is expected to succeed on retry.
    Transient,
    /// Rate limiting by the downstream dependency.
    Throttling,
    /// Permission or credential failure.
    Authentication,
    /// Malformed input or schema mismatch.
    Validation,
    /// A referenced resource does not exist.
    NotFound,
    /// Downstream outage.
    ServiceUnavailable,
    /// The operation did not finish in time.
    Timeout,
    /// Known failure that will not succeed on retry.
    Permanent,
    /// Unrecognized failure.
    Unknown,
}

impl ErrorCategory {
    /// Returns the wire name of the category.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Throttling => "throttling",
            Self::Authentication => "authentication",
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Timeout => "timeout",
            Self::Permanent => "permanent",
            Self::Unknown => "unknown",
        }
    }

    /// Shorthand for [`ErrorClassifier::is_retryable`].
    #[must_use]
    pub fn is_retryable(self) -> bool {
        ErrorClassifier::is_retryable(self)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(Self::Transient),
            "throttling" => Ok(Self::Throttling),
            "authentication" => Ok(Self::Authentication),
            "validation" => Ok(Self::Validation),
            "not_found" | "resource_not_found" => Ok(Self::NotFound),
            "service_unavailable" => Ok(Self::ServiceUnavailable),
            "timeout" => Ok(Self::Timeout),
            "permanent" => Ok(Self::Permanent),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown error category '{other}'")),
        }
    }
}

/// Anything that can be placed in the fault taxonomy.
///
/// Implemented by every error a resilient call can surface, so the retry
/// executor and the dead-letter builder never inspect concrete error types.
pub trait Classify {
    /// Returns the taxonomy value for this fault.
    fn category(&self) -> ErrorCategory;

    /// Minimum delay suggested by the provider before the next attempt.
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// Short type name recorded in dead-letter messages.
    fn error_type(&self) -> String;
}

/// Maps provider error codes into the fault taxonomy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classifies a generic storage/queue/platform error code.
    #[must_use]
    pub fn classify_code(code: &str) -> ErrorCategory {
        match code {
            "ThrottlingException" | "TooManyRequestsException" | "RequestLimitExceeded"
            | "Throttling" => ErrorCategory::Throttling,
            "UnauthorizedOperation" | "AccessDenied" | "InvalidUserID.NotFound"
            | "TokenRefreshRequired" => ErrorCategory::Authentication,
            "NoSuchKey" | "ResourceNotFoundException" | "NoSuchBucket" | "ItemNotFound" => {
                ErrorCategory::NotFound
            }
            "ValidationException" | "InvalidParameterValue" | "MalformedPolicyDocument" => {
                ErrorCategory::Validation
            }
            "ServiceUnavailable" | "InternalError" | "ServiceException" => {
                ErrorCategory::ServiceUnavailable
            }
            "InternalServerError" | "RequestTimeout" | "ServiceFailure" => {
                ErrorCategory::Transient
            }
            "Timeout" | "TimeoutError" | "DeadlineExceeded" => ErrorCategory::Timeout,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Classifies an error code returned by the text-generation provider,
    /// falling back to the generic table.
    #[must_use]
    pub fn classify_model_code(code: &str) -> ErrorCategory {
        match code {
            "ThrottlingException" => ErrorCategory::Throttling,
            "ValidationException" => ErrorCategory::Validation,
            "ModelNotReadyException" => ErrorCategory::ServiceUnavailable,
            "InternalServerException" => ErrorCategory::Transient,
            "AccessDeniedException" => ErrorCategory::Authentication,
            other => Self::classify_code(other),
        }
    }

    /// Returns true only for categories worth retrying.
    #[must_use]
    pub fn is_retryable(category: ErrorCategory) -> bool {
        matches!(
            category,
            ErrorCategory::Transient
                | ErrorCategory::Throttling
                | ErrorCategory::ServiceUnavailable
                | ErrorCategory::Timeout
        )
    }
}
