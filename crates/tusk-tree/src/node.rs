//! Node model and attribute names

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Extended attributes of a node, keyed by attribute name
pub type Attributes = BTreeMap<String, Vec<u8>>;

/// Well-known attribute names
pub mod attrs {
    /// Prefix of all checksum attributes, followed by the algorithm name
    pub const CHECKSUM_PREFIX: &str = "user.tusk.cs.";
    /// Node type (`file` or `dir`)
    pub const TYPE_ATTR: &str = "user.tusk.type";
    /// Id of the blob holding the file content
    pub const BLOB_ID_ATTR: &str = "user.tusk.blobid";
    /// Size of the blob in bytes, decimal
    pub const BLOBSIZE_ATTR: &str = "user.tusk.blobsize";
    /// Modification time, RFC 3339
    pub const MTIME_ATTR: &str = "user.tusk.mtime";
    /// Accumulated size of a directory subtree, decimal
    pub const TREESIZE_ATTR: &str = "user.tusk.treesize";
    /// Last time anything below a directory changed, RFC 3339
    pub const TMTIME_ATTR: &str = "user.tusk.tmtime";
    /// Id of the upload still post-processing this node
    pub const PROCESSING_ATTR: &str = "user.tusk.processing";

    /// Attribute name holding the digest of `algorithm`
    pub fn checksum(algorithm: &str) -> String {
        format!("{}{}", CHECKSUM_PREFIX, algorithm)
    }
}

/// Kind of a tree node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

impl NodeKind {
    /// Value stored in the type attribute
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "dir",
        }
    }
}

/// Globally unique address of a node
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub space_id: String,
    pub opaque_id: String,
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.space_id, self.opaque_id)
    }
}

/// A file or directory entry of the tree
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Space this node belongs to
    pub space_id: String,
    /// Node id, unique within the space
    pub id: String,
    /// Parent directory; `None` only for a space root
    pub parent_id: Option<String>,
    /// Name within the parent
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Node {
    /// Create a file node
    pub fn new_file(
        space_id: impl Into<String>,
        id: impl Into<String>,
        parent_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::new(space_id, id, Some(parent_id.into()), name, NodeKind::File)
    }

    /// Create a directory node
    pub fn new_dir(
        space_id: impl Into<String>,
        id: impl Into<String>,
        parent_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::new(space_id, id, Some(parent_id.into()), name, NodeKind::Directory)
    }

    /// Create the root directory of a space; its id equals the space id
    pub fn space_root(space_id: impl Into<String>) -> Self {
        let space_id = space_id.into();
        Self::new(space_id.clone(), space_id, None, "", NodeKind::Directory)
    }

    fn new(
        space_id: impl Into<String>,
        id: impl Into<String>,
        parent_id: Option<String>,
        name: impl Into<String>,
        kind: NodeKind,
    ) -> Self {
        let mut attributes = Attributes::new();
        attributes.insert(attrs::TYPE_ATTR.to_string(), kind.as_str().as_bytes().to_vec());
        Self {
            space_id: space_id.into(),
            id: id.into(),
            parent_id,
            name: name.into(),
            kind,
            attributes,
        }
    }

    /// Storage path of the node entry, used as a stable handle in logs and version keys
    pub fn internal_path(&self) -> String {
        format!("spaces/{}/nodes/{}", self.space_id, self.id)
    }

    /// Storage path of the parent directory entry
    pub fn parent_path(&self) -> Option<String> {
        self.parent_id
            .as_ref()
            .map(|parent| format!("spaces/{}/nodes/{}", self.space_id, parent))
    }

    pub fn resource_id(&self) -> ResourceId {
        ResourceId {
            space_id: self.space_id.clone(),
            opaque_id: self.id.clone(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    /// Raw attribute value
    pub fn attribute(&self, name: &str) -> Option<&[u8]> {
        self.attributes.get(name).map(Vec::as_slice)
    }

    /// Attribute value as UTF-8
    pub fn attribute_str(&self, name: &str) -> Option<&str> {
        self.attribute(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Set an attribute from a string value
    pub fn set_attribute_str(&mut self, name: &str, value: &str) {
        self.attributes
            .insert(name.to_string(), value.as_bytes().to_vec());
    }

    pub fn blob_id(&self) -> Option<&str> {
        self.attribute_str(attrs::BLOB_ID_ATTR)
            .filter(|id| !id.is_empty())
    }

    pub fn blob_size(&self) -> Option<u64> {
        self.attribute_str(attrs::BLOBSIZE_ATTR)
            .and_then(|v| v.parse().ok())
    }

    pub fn tree_size(&self) -> u64 {
        self.attribute_str(attrs::TREESIZE_ATTR)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn mtime(&self) -> Option<DateTime<Utc>> {
        self.attribute_str(attrs::MTIME_ATTR)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    /// Id of the upload currently post-processing this node, if any
    pub fn processing_id(&self) -> Option<&str> {
        self.attribute_str(attrs::PROCESSING_ATTR)
    }

    pub fn is_processing(&self) -> bool {
        self.processing_id().is_some()
    }

    /// Stored digest for a checksum algorithm name
    pub fn checksum(&self, algorithm: &str) -> Option<&[u8]> {
        self.attribute(&attrs::checksum(algorithm))
    }
}

/// Metadata summary returned by [`crate::Tree::get_md`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub resource_id: ResourceId,
    pub name: String,
    pub kind: NodeKind,
    /// Blob size for files, subtree size for directories
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
    /// Upload still post-processing this node
    pub processing: Option<String>,
    /// Hex digests keyed by algorithm name
    pub checksums: BTreeMap<String, String>,
}

impl From<&Node> for NodeInfo {
    fn from(node: &Node) -> Self {
        let checksums = node
            .attributes
            .iter()
            .filter_map(|(name, value)| {
                name.strip_prefix(attrs::CHECKSUM_PREFIX)
                    .map(|algorithm| (algorithm.to_string(), hex::encode(value)))
            })
            .collect();
        let (size, mtime) = match node.kind {
            NodeKind::File => (node.blob_size().unwrap_or(0), node.mtime()),
            NodeKind::Directory => (
                node.tree_size(),
                node.attribute_str(attrs::TMTIME_ATTR)
                    .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                    .map(|t| t.with_timezone(&Utc))
                    .or_else(|| node.mtime()),
            ),
        };
        Self {
            resource_id: node.resource_id(),
            name: node.name.clone(),
            kind: node.kind,
            size,
            mtime,
            processing: node.processing_id().map(str::to_string),
            checksums,
        }
    }
}
