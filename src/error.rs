use thiserror::Error;

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for AuditError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            other => Self::StoreUnavailable(format!("Database error: {}", other)),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for AuditError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::StoreUnavailable(format!("Migration error: {}", err))
    }
}

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Chain head moved during append")]
    HeadConflict,

    #[error("Append retries exhausted after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    #[error("Append deadline exceeded after {attempts} attempts")]
    DeadlineExceeded { attempts: u32 },

    #[error("Audit store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unsupported canonical schema version: {0}")]
    UnsupportedSchemaVersion(u32),
}

impl AuditError {
    pub fn validation(field: &str, reason: impl std::fmt::Display) -> Self {
        Self::Validation(format!("{}: {}", field, reason))
    }

    pub fn entry_not_found(id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("audit entry {}", id))
    }

    /// Whether the caller may resubmit the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::HeadConflict
                | Self::RetryExhausted { .. }
                | Self::DeadlineExceeded { .. }
                | Self::StoreUnavailable(_)
        )
    }

    /// Stable machine-readable code used in API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::HeadConflict => "head_conflict",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::NotFound(_) => "not_found",
            Self::Config(_) => "config_error",
            Self::Serialization(_) => "serialization_error",
            Self::UnsupportedSchemaVersion(_) => "unsupported_schema_version",
        }
    }
}

pub type Result<T> = std::result::Result<T, AuditError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(AuditError::HeadConflict.is_retryable());
        assert!(AuditError::RetryExhausted { attempts: 5 }.is_retryable());
        assert!(AuditError::DeadlineExceeded { attempts: 1 }.is_retryable());
        assert!(AuditError::StoreUnavailable("down".into()).is_retryable());
        assert!(!AuditError::Validation("bad".into()).is_retryable());
        assert!(!AuditError::NotFound("x".into()).is_retryable());
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: AuditError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn test_validation_message_names_field() {
        let err = AuditError::validation("actor_id", "must not be blank");
        assert_eq!(err.to_string(), "Validation error: actor_id: must not be blank");
    }
}
