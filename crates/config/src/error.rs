//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from loading or validating configuration and genesis documents
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file could not be read or written
    #[error("failed to access {path:?}: {source}")]
    FileAccess {
        /// The offending path
        path: PathBuf,
        /// The underlying I/O error
        source: std::io::Error,
    },

    /// The document could not be parsed
    #[error("invalid document: {0}")]
    Parse(#[from] serde_json::Error),

    /// The genesis document has no validators
    #[error("genesis document has no validators")]
    NoValidators,

    /// A validator appears twice in the genesis document
    #[error("duplicate genesis validator: {0}")]
    DuplicateValidator(String),

    /// A genesis validator is malformed
    #[error("invalid genesis validator {name}: {reason}")]
    InvalidValidator {
        /// Validator name or address
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// The chain id is empty or too long
    #[error("invalid chain id: {0}")]
    InvalidChainId(String),

    /// The initial height is not positive
    #[error("initial height must be >= 1, got {0}")]
    InvalidInitialHeight(i64),

    /// The consensus parameters are inconsistent
    #[error("invalid consensus params: {0}")]
    InvalidConsensusParams(String),

    /// A timeout value is invalid
    #[error("invalid timeout configuration: {0}")]
    InvalidTimeout(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
