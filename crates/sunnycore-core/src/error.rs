//! Error taxonomy shared by every component.
//!
//! Every component returns one of these tagged kinds; the Pipeline is the
//! single place that decides retry vs surface vs swallow (see `pipeline`).

use thiserror::Error;

/// Abstract error kind a component can raise.
///
/// `TransientError` leaves store state untouched and is retried by the
/// Scheduler at the next tick. `FatalError` and `AuthError` are terminal for
/// the affected row/user. `InvariantError` means the store itself reported a
/// consistency violation and must abort the pipeline immediately.
/// `ModelError` is specific to the Classifier/summariser boundary.
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("transient error: {0}")]
    Transient(String),

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("model error: {0}")]
    Model(String),
}

impl CoreError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_invariant(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }

    /// The `ErrorKind` a ProcessingLog records alongside this error (§4.2).
    pub fn kind(&self) -> crate::model::ErrorKind {
        match self {
            Self::Transient(_) => crate::model::ErrorKind::Transient,
            Self::Fatal(_) => crate::model::ErrorKind::Fatal,
            Self::Auth(_) => crate::model::ErrorKind::Auth,
            Self::Invariant(_) => crate::model::ErrorKind::Invariant,
            Self::Model(_) => crate::model::ErrorKind::Model,
        }
    }
}

/// Result alias used across component boundaries.
pub type CoreResult<T> = Result<T, CoreError>;

// Components built on sqlx/reqwest/etc surface their own error types at
// their boundary; these conversions fold them into the shared taxonomy at
// the point they cross into Pipeline-visible code.

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                CoreError::transient(err.to_string())
            }
            sqlx::Error::RowNotFound => CoreError::fatal("row not found"),
            _ => CoreError::invariant(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            CoreError::transient(err.to_string())
        } else if let Some(status) = err.status() {
            if status.is_server_side_error() {
                CoreError::transient(err.to_string())
            } else {
                CoreError::fatal(err.to_string())
            }
        } else {
            CoreError::fatal(err.to_string())
        }
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        CoreError::fatal(err.to_string())
    }
}
