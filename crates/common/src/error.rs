//! Common error types shared across crates.

use thiserror::Error;

/// Top-level service error type.
///
/// Variants map to HTTP status codes returned to callers:
/// - [`ServiceError::BadRequest`] → 400
/// - [`ServiceError::NotFound`] → 404
/// - [`ServiceError::Unprocessable`] → 422
/// - [`ServiceError::EncryptionFailure`] → 500
/// - [`ServiceError::Unavailable`] → 503
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request was malformed, such as an unknown record kind.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The addressed entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A stored field could not be decrypted (tampered, legacy plaintext, or wrong key).
    #[error("unprocessable: {0}")]
    Unprocessable(String),

    /// Encryption failed; the record must not be persisted.
    #[error("encryption failure: {0}")]
    EncryptionFailure(String),

    /// The encryption key is missing, corrupt, or its storage is unreachable.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// An unexpected internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Returns the HTTP status code that should be sent for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            ServiceError::BadRequest(_) => 400,
            ServiceError::NotFound(_) => 404,
            ServiceError::Unprocessable(_) => 422,
            ServiceError::EncryptionFailure(_) => 500,
            ServiceError::Unavailable(_) => 503,
            ServiceError::Internal(_) => 500,
        }
    }

    /// Short machine-readable code placed in the `code` field of error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::BadRequest(_) => "bad_request",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Unprocessable(_) => "unrecoverable_field",
            ServiceError::EncryptionFailure(_) => "encryption_failed",
            ServiceError::Unavailable(_) => "service_unavailable",
            ServiceError::Internal(_) => "internal_error",
        }
    }
}
