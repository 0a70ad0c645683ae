//! Error types for the tusk-crypto crate

use crate::checksum::ChecksumAlgorithm;
use thiserror::Error;

/// Result type alias using `CryptoError`
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur while hashing uploads or handling transfer tokens
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Computed digest does not match the declared one
    #[error("invalid checksum: expected {algorithm} {expected} got {actual}")]
    ChecksumMismatch {
        algorithm: ChecksumAlgorithm,
        expected: String,
        actual: String,
    },

    /// Unknown checksum algorithm name
    #[error("unsupported checksum algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// No shared secret configured for token signing
    #[error("no transfer secret configured")]
    MissingSecret,

    /// Token signing failed
    #[error("error signing token for target {target}: {source}")]
    TokenSigning {
        target: String,
        #[source]
        source: jsonwebtoken::errors::Error,
    },

    /// Token was rejected (bad signature, expired, wrong audience)
    #[error("invalid transfer token: {0}")]
    InvalidToken(#[source] jsonwebtoken::errors::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
