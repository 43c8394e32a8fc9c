//! Error types for configuration validation.

use thiserror::Error;

/// Primary error type for configuration document handling.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Document version is newer than this build supports.
    #[error("unsupported configuration version {found} (supported <= {supported})")]
    UnsupportedVersion {
        /// Version found in the document.
        found: u32,
        /// Highest version this build accepts.
        supported: u32,
    },
    /// A configured path is not absolute.
    #[error("path for {field} must be absolute (got {value})")]
    RelativePath {
        /// Dot-path of the offending field.
        field: &'static str,
        /// Offending value.
        value: String,
    },
    /// Two enabled services share the same host port.
    #[error("host port {port} assigned to both {first} and {second}")]
    PortConflict {
        /// Conflicting port.
        port: u16,
        /// First claimant.
        first: &'static str,
        /// Second claimant.
        second: &'static str,
    },
    /// A host port is zero.
    #[error("host port for {service} must be >= 1")]
    InvalidPort {
        /// Service owning the port.
        service: &'static str,
    },
    /// A media-policy language token is not a valid ISO-639-2 code.
    #[error("invalid language code '{code}' in {field}")]
    InvalidLanguageCode {
        /// Dot-path of the list containing the token.
        field: &'static str,
        /// Offending token.
        code: String,
    },
    /// A download category label is empty.
    #[error("download category {field} must not be empty")]
    EmptyCategory {
        /// Dot-path of the category field.
        field: &'static str,
    },
    /// Service name outside the managed set.
    #[error("unknown service '{name}'")]
    UnknownService {
        /// Name that failed to resolve.
        name: String,
    },
}

/// Convenience alias for configuration results.
pub type ConfigResult<T> = Result<T, ConfigError>;
