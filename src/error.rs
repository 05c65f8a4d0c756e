//! Error types for docq.

use thiserror::Error;

use crate::schema::ValidationErrors;

#[derive(Debug, Error)]
pub enum Error {
    #[error("payload validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when the backing store could not be reached at all, as opposed to
    /// rejecting a well-formed request.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Error::StoreUnavailable(_) => true,
            Error::Store(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    /// The field-level errors when this is a validation failure.
    pub fn validation_errors(&self) -> Option<&ValidationErrors> {
        match self {
            Error::Validation(errors) => Some(errors),
            _ => None,
        }
    }
}

impl From<ValidationErrors> for Error {
    fn from(errors: ValidationErrors) -> Self {
        Error::Validation(errors)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
