//! Error types for the tusk-core crate

use crate::state::UploadState;
use thiserror::Error;
use tusk_crypto::CryptoError;
use tusk_tree::TreeError;

/// Result type alias using `UploadError`
pub type Result<T> = std::result::Result<T, UploadError>;

/// Errors that can occur while driving an upload
#[derive(Error, Debug)]
pub enum UploadError {
    /// Data sent to an upload that no longer accepts it
    #[error("upload is {0}, not accepting data")]
    NotReceiving(UploadState),

    /// Chunk offset does not match the session offset
    #[error("offset mismatch: expected {expected}, got {actual}")]
    OffsetMismatch { expected: u64, actual: u64 },

    /// Copying a chunk into the staging file failed
    #[error("chunk write failed after {written} bytes: {source}")]
    WriteInterrupted {
        written: u64,
        #[source]
        source: std::io::Error,
    },

    /// Length declared on an upload whose size is already known
    #[error("upload size is not deferred")]
    SizeNotDeferred,

    /// Declared length smaller than the bytes already received
    #[error("declared length {length} is below the current offset {offset}")]
    LengthBelowOffset { length: u64, offset: u64 },

    /// Finish requested before the length was declared
    #[error("upload size is still deferred")]
    SizeDeferred,

    /// Finish requested before all declared bytes arrived
    #[error("upload is incomplete: {offset} of {size} bytes received")]
    Incomplete { offset: u64, size: u64 },

    /// Declared size exceeds the configured maximum
    #[error("upload of {size} bytes exceeds the maximum of {max}")]
    UploadTooLarge { size: u64, max: u64 },

    /// A concatenation part does not expose a staging area
    #[error("upload {0} cannot be concatenated")]
    NotConcatenable(String),

    /// Upload state machine violation
    #[error("invalid upload state transition: {from} -> {to}")]
    InvalidTransition { from: UploadState, to: UploadState },

    /// No session with this id
    #[error("upload session not found: {0}")]
    SessionNotFound(String),

    /// Checksum or token failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Creating or updating the node for the upload failed
    #[error("failed to create node for upload: {0}")]
    NodeCreation(#[source] TreeError),

    /// Moving the staged bytes into blob storage failed
    #[error("failed to upload file to blobstore: {0}")]
    BlobUpload(#[source] TreeError),

    /// Resolving the transfer URL failed
    #[error("failed to resolve upload url: {0}")]
    Url(#[source] CryptoError),

    /// Publishing the bytes-received event failed
    #[error(transparent)]
    Publish(#[from] crate::events::PublishError),

    /// Size propagation still failing after retries; the upload itself is committed
    #[error("propagation for node {node_id} failed after {attempts} attempts: {source}")]
    PropagationFailed {
        node_id: String,
        attempts: u32,
        #[source]
        source: TreeError,
    },

    /// Storage tree error
    #[error("tree error: {0}")]
    Tree(#[from] TreeError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl UploadError {
    /// Whether the upload failed verification
    pub fn is_checksum_mismatch(&self) -> bool {
        matches!(self, Self::Crypto(CryptoError::ChecksumMismatch { .. }))
    }

    /// Whether the object was committed despite this error
    pub fn is_partial_success(&self) -> bool {
        matches!(self, Self::PropagationFailed { .. })
    }
}

impl From<serde_json::Error> for UploadError {
    fn from(err: serde_json::Error) -> Self {
        UploadError::Serialization(err.to_string())
    }
}
