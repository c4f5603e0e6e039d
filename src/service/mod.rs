use thiserror::Error;

use crate::db::{PolicyRecord, StoreError};
use crate::opa::OpaError;

pub mod constraints;
pub mod evaluation;
pub mod labels;
pub mod merge;
pub mod policies;
pub mod validation;

pub use evaluation::{EvaluationRequest, EvaluationResponse, EvaluationService};
pub use policies::PolicyService;

type BoxedCause = Box<dyn std::error::Error + Send + Sync>;

/// Closed set of error kinds surfaced by the service layer. Every variant
/// carries a human-readable message plus a detail string; `Internal`
/// additionally wraps the originating cause.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{message}")]
    InvalidArgument { message: String, detail: String },
    #[error("{message}")]
    NotFound { message: String, detail: String },
    #[error("{message}")]
    AlreadyExists { message: String, detail: String },
    #[error("{message}")]
    FailedPrecondition { message: String, detail: String },
    #[error("{message}")]
    Rejected { message: String, detail: String },
    #[error("{message}")]
    PolicyConflict { message: String, detail: String },
    #[error("{message}")]
    Internal {
        message: String,
        detail: String,
        #[source]
        source: Option<BoxedCause>,
    },
}

impl ServiceError {
    pub fn invalid_argument(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
            detail: detail.into(),
        }
    }

    pub fn not_found(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
            detail: detail.into(),
        }
    }

    pub fn policy_not_found(policy_id: &str) -> Self {
        Self::not_found(
            "Policy not found",
            format!("Policy with ID '{policy_id}' does not exist"),
        )
    }

    pub fn already_exists(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::AlreadyExists {
            message: message.into(),
            detail: detail.into(),
        }
    }

    pub fn failed_precondition(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::FailedPrecondition {
            message: message.into(),
            detail: detail.into(),
        }
    }

    pub fn internal(
        message: impl Into<String>,
        detail: impl Into<String>,
        source: Option<BoxedCause>,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            detail: detail.into(),
            source,
        }
    }

    pub fn rejected(policy_id: &str, reason: &str) -> Self {
        Self::Rejected {
            message: format!("Request rejected by policy '{policy_id}'"),
            detail: reason.to_string(),
        }
    }

    pub fn policy_conflict(lower_policy_id: &str, field: &str, higher_policy_id: &str) -> Self {
        Self::PolicyConflict {
            message: format!(
                "Policy '{lower_policy_id}' attempted to modify field '{field}' \
                 which was set by higher-priority policy '{higher_policy_id}'"
            ),
            detail: format!(
                "Field '{field}' is immutable after being set by policy '{higher_policy_id}'"
            ),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::InvalidArgument { message, .. }
            | Self::NotFound { message, .. }
            | Self::AlreadyExists { message, .. }
            | Self::FailedPrecondition { message, .. }
            | Self::Rejected { message, .. }
            | Self::PolicyConflict { message, .. }
            | Self::Internal { message, .. } => message,
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            Self::InvalidArgument { detail, .. }
            | Self::NotFound { detail, .. }
            | Self::AlreadyExists { detail, .. }
            | Self::FailedPrecondition { detail, .. }
            | Self::Rejected { detail, .. }
            | Self::PolicyConflict { detail, .. }
            | Self::Internal { detail, .. } => detail,
        }
    }

    /// Maps a store failure for `attempted` to its service kind.
    pub fn from_store(err: StoreError, attempted: &PolicyRecord, operation: &str) -> Self {
        match err {
            StoreError::IdTaken => Self::already_exists(
                "Policy already exists",
                format!("A policy with ID '{}' already exists", attempted.id),
            ),
            StoreError::DisplayNamePolicyTypeTaken => Self::already_exists(
                "Policy display name and policy type already exists",
                format!(
                    "A policy with display name '{}' and policy type '{}' already exists",
                    attempted.display_name, attempted.policy_type
                ),
            ),
            StoreError::PriorityPolicyTypeTaken => Self::already_exists(
                "Policy priority and policy type already exists",
                format!(
                    "A policy with priority '{}' and policy type '{}' already exists",
                    attempted.priority, attempted.policy_type
                ),
            ),
            StoreError::NotFound => Self::policy_not_found(&attempted.id),
            StoreError::Database(cause) => Self::internal(
                format!("Failed to {operation} policy"),
                cause.to_string(),
                Some(Box::new(cause)),
            ),
        }
    }

    /// Maps an engine failure to its service kind. An engine-side missing
    /// source during get or evaluate means the registry row exists without
    /// its Rego mirror, so it surfaces as an internal invariant violation
    /// rather than a not-found.
    pub fn from_engine(err: OpaError, operation: &str) -> Self {
        match err {
            OpaError::InvalidRego(diagnostics) => Self::invalid_argument(
                "Invalid Rego code",
                format!("The Rego code contains syntax errors: {diagnostics}"),
            ),
            OpaError::PolicyNotFound => Self::internal(
                format!("Policy Rego source not found in engine during {operation}"),
                "The engine does not have the Rego source for this policy".to_string(),
                Some(Box::new(err)),
            ),
            OpaError::Unavailable(_) => Self::internal(
                format!("Policy engine unavailable during {operation}"),
                "Unable to communicate with the policy engine".to_string(),
                Some(Box::new(err)),
            ),
            OpaError::ClientInternal(_) => Self::internal(
                format!("Engine client error during {operation}"),
                "An unexpected error occurred while communicating with the policy engine"
                    .to_string(),
                Some(Box::new(err)),
            ),
        }
    }
}
