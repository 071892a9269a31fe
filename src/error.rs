/// Error types for federation operations.
///
/// This module provides the error hierarchy covering every failure mode in
/// the engine. All errors are well-typed and can be pattern-matched for
/// precise handling at the boundary.
use thiserror::Error;

/// The main error type for federation operations.
///
/// All fallible operations in this crate return `Result<T, FederationError>`.
#[derive(Error, Debug)]
pub enum FederationError {
    /// The access policy rejected the write.
    #[error("access denied")]
    AccessDenied,

    /// Document not found in the specified collection.
    #[error("'{id}' not found in collection '{collection}'")]
    NotFound {
        /// The collection that was queried
        collection: String,
        /// The document id that was not found
        id: String,
    },

    /// Serialization error when converting data to/from JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Canonical encoding error (log entry signing bytes).
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// Invalid input at the API boundary.
    #[error("invalid input: {reason}")]
    InvalidInput {
        /// Description of why the input is invalid
        reason: String,
    },

    /// A public key or signature failed to decode or verify.
    #[error("identity error: {0}")]
    Identity(String),

    /// Network-level failure (dial failure, unreachable site).
    #[error("network error: {0}")]
    Network(String),

    /// Document runtime failure (closed store, registry error).
    #[error("runtime error: {0}")]
    Runtime(String),

    /// A deadline elapsed before the operation completed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The operation was cancelled by an abort signal.
    ///
    /// Expected during shutdown and unsubscribe; never surfaced as a
    /// failure at the service boundary.
    #[error("aborted")]
    Aborted,
}

impl FederationError {
    /// The short error string exposed by the service façade.
    pub fn boundary_message(&self) -> String {
        match self {
            FederationError::AccessDenied => "access denied".to_string(),
            FederationError::NotFound { .. } => "not found".to_string(),
            FederationError::Serialization(_) | FederationError::InvalidInput { .. } => {
                "invalid input".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Result type alias for federation operations.
pub type FedResult<T> = Result<T, FederationError>;
