use thiserror::Error;

/// Service-wide error taxonomy.
///
/// Every variant carries a human-readable message; `id()` gives a stable
/// machine identifier and `is_operational()` distinguishes expected runtime
/// failures from programmer/boot errors. Only `Fatal` terminates the process
/// (exit code 1 at boot).
#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl AppError {
    /// Stable identifier for logs and subscriber-visible error payloads.
    pub fn id(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::NotFound(_) => "not_found",
            AppError::ServiceUnavailable(_) => "service_unavailable",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Conflict(_) => "conflict",
            AppError::Transient(_) => "transient",
            AppError::Fatal(_) => "fatal",
        }
    }

    /// Operational errors are expected during normal operation and must not
    /// take the process down.
    pub fn is_operational(&self) -> bool {
        !matches!(self, AppError::Fatal(_))
    }

    /// Retryable errors back off and try again; everything else surfaces.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Transient(_) | AppError::ServiceUnavailable(_)
        )
    }
}
