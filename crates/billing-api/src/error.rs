use billing_core::{Capability, ConflictReport, ValidationErrors};

/// Every failure the API reports. Store errors never leave this crate untranslated.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),
    #[error("{entity} not found")]
    NotFound { entity: &'static str },
    /// Version mismatch; carries both sides so the caller can reconcile.
    #[error("version conflict on {} {}", .0.details.entity, .0.details.id)]
    Conflict(Box<ConflictReport>),
    #[error("invalid login credentials")]
    InvalidCredentials,
    #[error("invalid or expired authentication token")]
    Unauthorized,
    #[error("operator lacks capability {0}")]
    Forbidden(Capability),
    #[error("store temporarily unavailable: {0}")]
    Transient(String),
    #[error("internal error: {0:#}")]
    Internal(anyhow::Error),
}

impl ApiError {
    /// Stable machine-readable code, shared with HTTP error bodies.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "failed_validation",
            Self::NotFound { .. } => "not_found",
            Self::Conflict(_) => "version_conflict",
            Self::InvalidCredentials => "invalid_credentials",
            Self::Unauthorized => "invalid_token",
            Self::Forbidden(_) => "not_permitted",
            Self::Transient(_) => "temporarily_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the whole operation may be retried as-is.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if billing_store_sqlite::is_transient(&err) {
            Self::Transient(err.to_string())
        } else {
            Self::Internal(err)
        }
    }
}

impl From<ValidationErrors> for ApiError {
    fn from(errors: ValidationErrors) -> Self {
        Self::Validation(errors)
    }
}
