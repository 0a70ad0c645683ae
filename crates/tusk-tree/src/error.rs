//! Error types for the tusk-tree crate

use thiserror::Error;

/// Result type alias using `TreeError`
pub type Result<T> = std::result::Result<T, TreeError>;

/// Errors that can occur in storage tree operations
#[derive(Error, Debug)]
pub enum TreeError {
    /// Node not found
    #[error("node not found: {space_id}/{node_id}")]
    NodeNotFound { space_id: String, node_id: String },

    /// A child with this name already exists under the parent
    #[error("already exists: {parent_id}/{name}")]
    AlreadyExists { parent_id: String, name: String },

    /// Parent link missing
    #[error("no child {name} under {parent_id}")]
    LinkNotFound { parent_id: String, name: String },

    /// Operation needs a different node kind
    #[error("node {node_id} is not a {expected}")]
    InvalidNodeKind { node_id: String, expected: String },

    /// Operation not permitted on this node
    #[error("not permitted: {0}")]
    NotPermitted(String),

    /// Blob not found
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Version snapshot not found
    #[error("version not found: {0}")]
    VersionNotFound(String),

    /// Recycle bin item not found
    #[error("recycle item not found: {space_id}/{key}")]
    RecycleItemNotFound { space_id: String, key: String },

    /// Missing or malformed attribute
    #[error("invalid attribute {name} on {node_id}: {reason}")]
    InvalidAttribute {
        node_id: String,
        name: String,
        reason: String,
    },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TreeError {
    /// Whether this error means the addressed entity does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NodeNotFound { .. }
                | Self::LinkNotFound { .. }
                | Self::BlobNotFound(_)
                | Self::VersionNotFound(_)
                | Self::RecycleItemNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for TreeError {
    fn from(err: serde_json::Error) -> Self {
        TreeError::Serialization(err.to_string())
    }
}
