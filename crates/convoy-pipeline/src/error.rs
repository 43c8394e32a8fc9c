//! Error types for the media pipeline.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Store access failed.
    #[error(transparent)]
    Store(#[from] convoy_store::StoreError),
    /// Torrent client access failed.
    #[error(transparent)]
    Client(#[from] convoy_clients::ClientError),
    /// Subprocess plumbing failed.
    #[error(transparent)]
    Compose(#[from] convoy_compose::ComposeError),
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
    /// Login to the torrent client was rejected.
    #[error("torrent client authentication failed")]
    QbAuthFailed,
    /// A completed torrent carried no usable video payload.
    #[error("no video files found in torrent payload")]
    NoVideoFile,
}

impl PipelineError {
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

/// Convenience alias for pipeline results.
pub type PipelineResult<T> = Result<T, PipelineError>;
