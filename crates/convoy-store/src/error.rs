//! Error types for persistence operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No configuration document exists yet.
    #[error("missing stack configuration at {}", .path.display())]
    ConfigMissing {
        /// Expected document location.
        path: PathBuf,
    },
    /// The document violated an invariant.
    #[error(transparent)]
    Config(#[from] convoy_config::ConfigError),
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
    /// YAML (de)serialisation failed.
    #[error("yaml processing failed during {operation} on {}", .path.display())]
    Yaml {
        /// Operation identifier.
        operation: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Source error.
        #[source]
        source: serde_yaml::Error,
    },
    /// JSON (de)serialisation failed beyond recovery.
    #[error("json processing failed during {operation} on {}", .path.display())]
    Json {
        /// Operation identifier.
        operation: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Source error.
        #[source]
        source: serde_json::Error,
    },
    /// A directory could not be created or adjusted; carries the exact shell
    /// remediation the operator should run.
    #[error(
        "insufficient permissions on {dir}; run: sudo chown -R {uid}:{gid} {dir} && sudo chmod -R 775 {dir}",
        dir = .path.display()
    )]
    PathPermission {
        /// Path that could not be prepared.
        path: PathBuf,
        /// Expected owning uid.
        uid: u32,
        /// Expected owning gid.
        gid: u32,
        /// Source IO error.
        #[source]
        source: io::Error,
    },
    /// Password hashing failed.
    #[error("failed to process password hash: {detail}")]
    PasswordHash {
        /// Hashing error detail.
        detail: String,
    },
    /// A requested run does not exist in the run log.
    #[error("unknown run {run_id}")]
    UnknownRun {
        /// Requested run id.
        run_id: String,
    },
}

impl StoreError {
    /// Wrap an IO error with its operation and path.
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;
