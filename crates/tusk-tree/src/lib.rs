//! # Tusk Tree
//!
//! Storage tree contract for the Tusk upload engine.
//!
//! This crate provides:
//! - **Node model**: files and directories addressed by space and node id, carrying
//!   extended attributes (checksums, blob id, sizes, processing markers)
//! - **Tree trait**: blob I/O, directory and node CRUD, recycle bin, size propagation
//! - **Lookup trait**: node bookkeeping the upload engine needs to commit and roll back
//! - **MemoryTree**: a complete in-memory backend with optional JSON snapshots
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Upload Orchestrator          │
//! ├────────────────────┬────────────────────┤
//! │     Tree Trait     │    Lookup Trait    │
//! ├────────────────────┴────────────────────┤
//! │      MemoryTree  │  other backends      │
//! └─────────────────────────────────────────┘
//! ```

pub mod error;
pub mod memory;
pub mod node;
pub mod pending;

pub use error::{Result, TreeError};
pub use memory::MemoryTree;
pub use node::{attrs, Attributes, Node, NodeInfo, NodeKind, ResourceId};
pub use pending::{CommitAction, PendingCommit};

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;

/// Predicate selecting which attribute names to copy
pub type AttributeFilter = dyn Fn(&str) -> bool + Send + Sync;

/// The storage backend contract consumed by uploads
#[async_trait]
pub trait Tree: Send + Sync {
    /// Prepare backend storage
    async fn setup(&self) -> Result<()>;

    /// Metadata summary of a node
    async fn get_md(&self, node: &Node) -> Result<NodeInfo>;

    /// Direct children of a directory
    async fn list_folder(&self, node: &Node) -> Result<Vec<Node>>;

    /// Create a directory entry and link it into its parent
    async fn create_dir(&self, node: &Node) -> Result<()>;

    /// Relink `old` under the parent and name of `new`
    async fn move_node(&self, old: &Node, new: &Node) -> Result<()>;

    /// Move a node into the recycle bin
    async fn delete(&self, node: &Node) -> Result<()>;

    /// Prepare restoring a recycle bin item, optionally to a different target.
    ///
    /// The pending commit lists the restored node followed by its new parent.
    async fn restore_recycle_item(
        &self,
        space_id: &str,
        key: &str,
        target: Option<&Node>,
    ) -> Result<PendingCommit>;

    /// Prepare purging a recycle bin item and its blob
    async fn purge_recycle_item(&self, space_id: &str, key: &str) -> Result<PendingCommit>;

    /// Move staged bytes into permanent blob storage under the node's blob id
    async fn write_blob(&self, node: &Node, bin_path: &Path) -> Result<()>;

    /// Read a node's blob
    async fn read_blob(&self, node: &Node) -> Result<Bytes>;

    /// Remove a node's blob
    async fn delete_blob(&self, node: &Node) -> Result<()>;

    /// Apply a signed size change to every ancestor of `node`
    async fn propagate(&self, node: &Node, size_diff: i64) -> Result<()>;
}

/// Node bookkeeping used to materialize and roll back uploads
#[async_trait]
pub trait Lookup: Send + Sync {
    /// Read a node by id
    async fn read_node(&self, space_id: &str, node_id: &str) -> Result<Node>;

    /// Resolve a child of `parent_id` by name
    async fn child(&self, space_id: &str, parent_id: &str, name: &str) -> Result<Option<Node>>;

    /// Persist a new node entry and link it into its parent
    async fn create_node(&self, node: &Node) -> Result<()>;

    /// Merge attributes into a stored node, returning the updated node
    async fn set_attributes(&self, node: &Node, attributes: Attributes) -> Result<Node>;

    /// Snapshot the node's current attributes and return the version path
    async fn create_version(&self, node: &Node) -> Result<String>;

    /// Copy filtered attributes from a version snapshot onto the live node
    async fn copy_metadata(
        &self,
        versions_path: &str,
        node: &Node,
        filter: &AttributeFilter,
    ) -> Result<()>;

    /// Remove a version snapshot
    async fn remove_version(&self, versions_path: &str) -> Result<()>;

    /// Remove the node's storage entry
    async fn remove_node_entry(&self, node: &Node) -> Result<()>;

    /// Remove the node's link from its parent directory
    async fn remove_child_link(&self, node: &Node) -> Result<()>;

    /// Flag the node as being post-processed by `upload_id`
    async fn mark_processing(&self, node: &Node, upload_id: &str) -> Result<()>;

    /// Clear the processing flag if it still belongs to `upload_id`
    async fn unmark_processing(&self, node: &Node, upload_id: &str) -> Result<()>;

    /// Owner (or manager) of a space
    async fn space_owner(&self, space_id: &str) -> Result<Option<String>>;
}
