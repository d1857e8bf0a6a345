// Error kinds shared by the server, storage layer and distributor

use thiserror::Error;

/// Result type alias for jobmon operations
pub type Result<T> = std::result::Result<T, JobmonError>;

/// Errors surfaced across the coordination boundary.
///
/// Each variant corresponds to one wire-visible `error_kind`; only
/// `Conflict` is retryable.
#[derive(Debug, Error)]
pub enum JobmonError {
    /// Caller requested a status incompatible with the observed one
    #[error("invalid transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: i64,
        from: String,
        to: String,
    },

    /// Referenced entity does not exist
    #[error("{0}")]
    NotFound(String),

    /// Row-lock timeout or concurrent unique violation; safe to retry
    #[error("conflict: {0}")]
    Conflict(String),

    /// Authenticated but not the owner and not an admin
    #[error("not authorized: {0}")]
    AuthorizationDenied(String),

    /// Auth enabled and no identity resolved
    #[error("no identity on request")]
    Unauthenticated,

    /// Cluster plugin raised an unclassified failure
    #[error("cluster integration error: {0}")]
    Integration(String),

    /// Malformed request body
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl JobmonError {
    /// Wire name of the error kind.
    pub fn kind_str(&self) -> &'static str {
        match self {
            JobmonError::InvalidTransition { .. } => "invalid_transition",
            JobmonError::NotFound(_) => "not_found",
            JobmonError::Conflict(_) => "conflict",
            JobmonError::AuthorizationDenied(_) => "authorization_denied",
            JobmonError::Unauthenticated => "unauthenticated",
            JobmonError::Integration(_) => "integration_error",
            JobmonError::SchemaViolation(_) => "schema_violation",
            JobmonError::Configuration(_) => "configuration_error",
            JobmonError::Internal(_) => "internal_error",
        }
    }

    /// Only lock timeouts and unique-violation races are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobmonError::Conflict(_))
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        JobmonError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        JobmonError::Conflict(msg.into())
    }

    pub fn integration(msg: impl Into<String>) -> Self {
        JobmonError::Integration(msg.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        JobmonError::SchemaViolation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        JobmonError::Configuration(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflict_is_retryable() {
        assert!(JobmonError::conflict("lock timeout").is_retryable());
        assert!(!JobmonError::not_found("workflow 1").is_retryable());
        assert!(!JobmonError::InvalidTransition {
            entity: "task",
            id: 1,
            from: "D".into(),
            to: "R".into(),
        }
        .is_retryable());
    }

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(JobmonError::Unauthenticated.kind_str(), "unauthenticated");
        assert_eq!(JobmonError::conflict("x").kind_str(), "conflict");
        assert_eq!(JobmonError::schema("x").kind_str(), "schema_violation");
    }
}
