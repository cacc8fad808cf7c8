//! Error types for the Tally operator

use std::io;

/// Result type alias using the operator error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the operator core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Infrastructure failure that may succeed on retry
    #[error("transient failure: {0}")]
    Transient(String),

    /// The peer dropped an established connection (EOF / broken pipe)
    #[error("connection reset: {0}")]
    ConnectionReset(String),

    /// A referenced view or table has not been materialized yet
    #[error("dependency not ready: {0}")]
    DependencyNotReady(String),

    /// Spec validation failed
    #[error("validation failed: {0}")]
    Validation(String),

    /// A table already exists with a different schema
    #[error("table conflict: {0}")]
    TableConflict(String),

    /// Template rendering failed
    #[error("render failed: {0}")]
    Render(String),

    /// Query dependencies form a cycle
    #[error("dependency cycle: {0}")]
    DependencyCycle(String),

    /// A referenced resource does not exist
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    /// Presto or Hive rejected a query
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Prometheus query failed
    #[error("prometheus query failed: {0}")]
    Prometheus(String),

    /// Shutdown signal observed during a blocking operation
    #[error("shutdown signal received")]
    Shutdown,

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// HTTP transport error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a not-found error on a namespaced resource.
    pub fn not_found(kind: &'static str, namespace: &str, name: &str) -> Self {
        Error::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// True when the error signals a dropped connection that a fresh
    /// session may fix (Hive reconnect path).
    pub fn is_connection_reset(&self) -> bool {
        match self {
            Error::ConnectionReset(_) => true,
            Error::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// True for errors that must never be retried: re-running the same
    /// input cannot change the outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::TableConflict(_)
                | Error::Render(_)
                | Error::DependencyCycle(_)
                | Error::NotFound { .. }
        )
    }

    /// True for infrastructure errors worth a local retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient(_) | Error::ConnectionReset(_) | Error::Io(_) => true,
            Error::Http(err) => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }
}
