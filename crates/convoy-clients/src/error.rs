//! Error types shared across service clients.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for client operations. Clients fold these into
/// [`crate::Outcome`] values at their public boundary.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport-level HTTP failure (refused, reset, timed out).
    #[error("{service} unreachable: {source}")]
    Http {
        /// Service being addressed.
        service: &'static str,
        /// Source transport error.
        #[source]
        source: reqwest::Error,
    },
    /// The service answered with an error status.
    #[error("{service} API error {status}: {body}")]
    Status {
        /// Service being addressed.
        service: &'static str,
        /// HTTP status code.
        status: u16,
        /// Response body, truncated for event details.
        body: String,
    },
    /// Authentication failed with every known credential.
    #[error("{service} authentication failed: {detail}")]
    Auth {
        /// Service being addressed.
        service: &'static str,
        /// Failure detail.
        detail: String,
    },
    /// A mounted service config file is missing or incomplete.
    #[error("service config file problem at {}: {detail}", .path.display())]
    ConfigFile {
        /// Path inspected.
        path: PathBuf,
        /// What was wrong.
        detail: String,
    },
    /// The client depends on state another service has not produced yet.
    #[error("waiting for {detail}")]
    MissingDependency {
        /// What is still missing.
        detail: String,
    },
    /// SQLite lookup against a service's user store failed.
    #[error("sqlite read failed on {}", .path.display())]
    Database {
        /// Database file inspected.
        path: PathBuf,
        /// Source database error.
        #[source]
        source: sqlx::Error,
    },
    /// Filesystem operation failed.
    #[error("filesystem operation failed during {operation} on {}", .path.display())]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Source IO error.
        #[source]
        source: io::Error,
    },
    /// Unexpected response shape.
    #[error("unexpected payload from {service}: {detail}")]
    Payload {
        /// Service being addressed.
        service: &'static str,
        /// What was malformed.
        detail: String,
    },
    /// Persistence through the store failed.
    #[error(transparent)]
    Store(#[from] convoy_store::StoreError),
    /// Container runtime operation failed.
    #[error(transparent)]
    Compose(#[from] convoy_compose::ComposeError),
}

impl ClientError {
    /// Wrap an IO error with its operation and path.
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Whether this error is a 401/403 worth a credential refresh.
    #[must_use]
    pub const fn is_auth_status(&self) -> bool {
        matches!(
            self,
            Self::Status {
                status: 401 | 403,
                ..
            }
        )
    }
}

/// Convenience alias for client results.
pub type ClientResult<T> = Result<T, ClientError>;
