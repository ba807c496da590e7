use service_core::error::AppError;
use thiserror::Error;

use super::repository::RepositoryError;
use super::validation::ValidationRule;

#[derive(Error, Debug)]
pub enum EntitlementsError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed ({rule}): {message}")]
    Validation {
        rule: ValidationRule,
        message: String,
    },

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// An unwind step failed after a forward failure. The graph needs
    /// external reconciliation.
    #[error(
        "Partial rollback failure: {} step(s) not reverted after: {original}",
        .unreverted.len()
    )]
    PartialRollbackFailure {
        original: String,
        unreverted: Vec<String>,
    },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EntitlementsError {
    pub fn validation(rule: ValidationRule, message: impl Into<String>) -> Self {
        EntitlementsError::Validation {
            rule,
            message: message.into(),
        }
    }

    /// Rule violated, when this is a validation failure.
    pub fn rule(&self) -> Option<ValidationRule> {
        match self {
            EntitlementsError::Validation { rule, .. } => Some(*rule),
            _ => None,
        }
    }

    /// Conditions a caller may retry with a fresh attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EntitlementsError::Unavailable(_)
                | EntitlementsError::ServiceUnavailable(_)
                | EntitlementsError::Redis(_)
        )
    }
}

impl From<RepositoryError> for EntitlementsError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(e) => EntitlementsError::NotFound(e),
            RepositoryError::Conflict(e) => EntitlementsError::Conflict(e),
            RepositoryError::Unavailable(e) => EntitlementsError::Unavailable(e),
            RepositoryError::Internal(e) => EntitlementsError::Internal(e),
        }
    }
}

impl From<EntitlementsError> for AppError {
    fn from(err: EntitlementsError) -> Self {
        match err {
            EntitlementsError::NotFound(e) => AppError::NotFound(anyhow::anyhow!(e)),
            e @ EntitlementsError::Validation { .. } => AppError::BadRequest(anyhow::anyhow!(e)),
            e @ EntitlementsError::InvalidIdentifier(_) => {
                AppError::BadRequest(anyhow::anyhow!(e))
            }
            e @ EntitlementsError::InvalidFilter(_) => AppError::BadRequest(anyhow::anyhow!(e)),
            EntitlementsError::Conflict(e) => AppError::Conflict(anyhow::anyhow!(e)),
            EntitlementsError::Unavailable(_) | EntitlementsError::ServiceUnavailable(_) => {
                AppError::ServiceUnavailable
            }
            e @ EntitlementsError::PartialRollbackFailure { .. } => {
                AppError::InternalError(anyhow::anyhow!(e))
            }
            EntitlementsError::Redis(e) => AppError::RedisError(e),
            EntitlementsError::Internal(e) => AppError::InternalError(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::axum::http::StatusCode;

    #[test]
    fn test_repository_errors_stay_distinct() {
        assert!(matches!(
            EntitlementsError::from(RepositoryError::NotFound("g".into())),
            EntitlementsError::NotFound(_)
        ));
        assert!(matches!(
            EntitlementsError::from(RepositoryError::Conflict("g".into())),
            EntitlementsError::Conflict(_)
        ));
        assert!(matches!(
            EntitlementsError::from(RepositoryError::Unavailable("g".into())),
            EntitlementsError::Unavailable(_)
        ));
    }

    #[test]
    fn test_app_error_mapping() {
        let cases = [
            (
                EntitlementsError::NotFound("group".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                EntitlementsError::validation(ValidationRule::CyclicMembership, "cycle"),
                StatusCode::BAD_REQUEST,
            ),
            (
                EntitlementsError::Conflict("edge".into()),
                StatusCode::CONFLICT,
            ),
            (
                EntitlementsError::ServiceUnavailable("lock".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                EntitlementsError::PartialRollbackFailure {
                    original: "conflict".into(),
                    unreverted: vec!["insert_edge".into()],
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(AppError::from(err).status_code(), expected);
        }
    }

    #[test]
    fn test_partial_rollback_message() {
        let err = EntitlementsError::PartialRollbackFailure {
            original: "Conflict: edge".into(),
            unreverted: vec!["a".into(), "b".into()],
        };
        assert_eq!(
            err.to_string(),
            "Partial rollback failure: 2 step(s) not reverted after: Conflict: edge"
        );
    }
}
