//! Error types for the update operator.
//!
//! Cluster API failures are classified into a small taxonomy so that callers
//! can decide what to retry: conflicts and transient failures are retried by
//! the node store, everything else surfaces to the reconciler, which logs and
//! waits for the next pass.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for operator operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency conflict on an update. Retryable.
    #[error("update conflict: {0}")]
    Conflict(#[source] kube::Error),

    /// Transient cluster API failure (network, server 5xx). Retryable.
    #[error("transient cluster error: {0}")]
    Transient(#[source] kube::Error),

    /// Non-retryable cluster API failure.
    #[error("cluster error: {0}")]
    Fatal(#[source] kube::Error),

    /// Invalid configuration, fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Classify a kube-rs error into the operator's taxonomy.
    ///
    /// HTTP 404 becomes [`Error::NotFound`], 409 [`Error::Conflict`], 429 and
    /// 5xx [`Error::Transient`]. Other API responses (auth, validation) are
    /// [`Error::Fatal`]. Non-API failures are transport-level and treated as
    /// transient.
    pub fn from_kube(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(ae.message.clone()),
            kube::Error::Api(ae) if ae.code == 409 => Error::Conflict(err),
            kube::Error::Api(ae) if ae.code == 429 || ae.code >= 500 => Error::Transient(err),
            kube::Error::Api(_) => Error::Fatal(err),
            _ => Error::Transient(err),
        }
    }

    /// Whether the operation that produced this error may be re-attempted.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::Transient(_))
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Error::from_kube(err)
    }
}
