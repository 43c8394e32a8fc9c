//! Error types for rendering and container runtime operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for compose operations.
#[derive(Debug, Error)]
pub enum ComposeError {
    /// A required template is missing from the template tree.
    #[error("template not found: {name}")]
    TemplateNotFound {
        /// Template name requested.
        name: String,
    },
    /// Template evaluation failed.
    #[error("failed to render template {name}")]
    Render {
        /// Template name being rendered.
        name: String,
        /// Source engine error.
        #[source]
        source: minijinja::Error,
    },
    /// JSON (de)serialisation failed.
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
    /// A subprocess could not be spawned.
    #[error("failed to spawn {program}")]
    Spawn {
        /// Program name.
        program: String,
        /// Source IO error.
        #[source]
        source: io::Error,
    },
    /// A subprocess exceeded its deadline and was killed.
    #[error("{program} timed out after {seconds}s")]
    Timeout {
        /// Program name.
        program: String,
        /// Deadline in seconds.
        seconds: u64,
    },
    /// A subprocess that must succeed exited nonzero.
    #[error("{program} exited with status {status}: {stderr}")]
    CommandFailed {
        /// Program name.
        program: String,
        /// Exit status.
        status: i32,
        /// Captured stderr.
        stderr: String,
    },
}

impl ComposeError {
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

/// Convenience alias for compose results.
pub type ComposeResult<T> = Result<T, ComposeError>;
