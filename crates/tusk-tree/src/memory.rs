//! In-memory storage tree for testing and single-process deployments
//!
//! All state lives in concurrent maps. A tree opened with [`MemoryTree::open`]
//! remembers its snapshot file and [`MemoryTree::flush`] writes the whole tree
//! there as JSON, so short-lived processes can share one tree.

use crate::{
    attrs, AttributeFilter, Attributes, CommitAction, Lookup, Node, NodeInfo, NodeKind,
    PendingCommit, Result, Tree, TreeError,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

type NodeKey = (String, String);
type LinkKey = (String, String, String);

/// A deleted node waiting in the recycle bin
#[derive(Clone, Debug, Serialize, Deserialize)]
struct TrashedItem {
    node: Node,
    deleted_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    nodes: DashMap<NodeKey, Node>,
    links: DashMap<LinkKey, String>,
    versions: DashMap<String, Attributes>,
    blobs: DashMap<String, Bytes>,
    trash: DashMap<NodeKey, TrashedItem>,
    owners: DashMap<String, String>,
}

/// An in-memory tree
#[derive(Clone, Default)]
pub struct MemoryTree {
    inner: Arc<Inner>,
    snapshot: Option<PathBuf>,
}

#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    nodes: Vec<Node>,
    links: Vec<LinkEntry>,
    versions: BTreeMap<String, Attributes>,
    /// Blob id to hex-encoded content
    blobs: BTreeMap<String, String>,
    trash: Vec<TrashEntry>,
    owners: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct LinkEntry {
    space_id: String,
    parent_id: String,
    name: String,
    child_id: String,
}

#[derive(Serialize, Deserialize)]
struct TrashEntry {
    space_id: String,
    key: String,
    item: TrashedItem,
}

fn node_key(space_id: &str, node_id: &str) -> NodeKey {
    (space_id.to_string(), node_id.to_string())
}

fn link_key(space_id: &str, parent_id: &str, name: &str) -> LinkKey {
    (space_id.to_string(), parent_id.to_string(), name.to_string())
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(TreeError::NotPermitted(format!("invalid node name: {:?}", name)));
    }
    Ok(())
}

/// Bytes a node accounts for in its ancestors' tree size
fn accounted_size(node: &Node) -> u64 {
    match node.kind {
        NodeKind::File => node.blob_size().unwrap_or(0),
        NodeKind::Directory => node.tree_size(),
    }
}

impl MemoryTree {
    /// Create an empty tree without a snapshot file
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a tree backed by a JSON snapshot; a missing file yields an empty tree
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tree = Self {
            inner: Arc::new(Inner::default()),
            snapshot: Some(path.clone()),
        };

        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(tree),
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = serde_json::from_slice(&raw)?;
        tree.restore(snapshot)?;
        debug!(path = %path.display(), nodes = tree.node_count(), "loaded tree snapshot");
        Ok(tree)
    }

    /// Write the snapshot file, if this tree has one
    pub async fn flush(&self) -> Result<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_vec_pretty(&self.snapshot_state())?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Create the root directory of a space and record its owner
    pub fn create_space(&self, space_id: &str, owner: &str) -> Node {
        let key = node_key(space_id, space_id);
        let root = self
            .inner
            .nodes
            .entry(key)
            .or_insert_with(|| {
                let mut root = Node::space_root(space_id);
                root.set_attribute_str(attrs::MTIME_ATTR, &now_rfc3339());
                root
            })
            .clone();
        self.inner
            .owners
            .insert(space_id.to_string(), owner.to_string());
        root
    }

    /// Number of stored nodes
    pub fn node_count(&self) -> usize {
        self.inner.nodes.len()
    }

    /// Whether a blob is stored
    pub fn has_blob(&self, blob_id: &str) -> bool {
        self.inner.blobs.contains_key(blob_id)
    }

    /// Whether a version snapshot exists
    pub fn has_version(&self, versions_path: &str) -> bool {
        self.inner.versions.contains_key(versions_path)
    }

    /// Keys of the recycle bin items of a space
    pub fn recycle_keys(&self, space_id: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .trash
            .iter()
            .filter(|entry| entry.key().0 == space_id)
            .map(|entry| entry.key().1.clone())
            .collect();
        keys.sort();
        keys
    }

    fn stored(&self, space_id: &str, node_id: &str) -> Result<Node> {
        self.inner
            .nodes
            .get(&node_key(space_id, node_id))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TreeError::NodeNotFound {
                space_id: space_id.to_string(),
                node_id: node_id.to_string(),
            })
    }

    fn stored_dir(&self, space_id: &str, node_id: &str) -> Result<Node> {
        let node = self.stored(space_id, node_id)?;
        if !node.is_dir() {
            return Err(TreeError::InvalidNodeKind {
                node_id: node_id.to_string(),
                expected: "directory".to_string(),
            });
        }
        Ok(node)
    }

    fn ensure_free(&self, space_id: &str, parent_id: &str, name: &str, owner_id: &str) -> Result<()> {
        match self.inner.links.get(&link_key(space_id, parent_id, name)) {
            Some(existing) if existing.value() != owner_id => Err(TreeError::AlreadyExists {
                parent_id: parent_id.to_string(),
                name: name.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn insert_linked(&self, node: Node) {
        if let Some(parent_id) = &node.parent_id {
            self.inner.links.insert(
                link_key(&node.space_id, parent_id, &node.name),
                node.id.clone(),
            );
        }
        self.inner
            .nodes
            .insert(node_key(&node.space_id, &node.id), node);
    }

    fn unlink(&self, node: &Node) -> bool {
        let Some(parent_id) = &node.parent_id else {
            return false;
        };
        self.inner
            .links
            .remove_if(&link_key(&node.space_id, parent_id, &node.name), |_, child| {
                *child == node.id
            })
            .is_some()
    }

    /// Ids of `root_id` and everything below it
    fn subtree(&self, space_id: &str, root_id: &str) -> Vec<String> {
        let mut ids = vec![root_id.to_string()];
        let mut cursor = 0;
        while cursor < ids.len() {
            let parent = ids[cursor].clone();
            let children: Vec<String> = self
                .inner
                .links
                .iter()
                .filter(|entry| entry.key().0 == space_id && entry.key().1 == parent)
                .map(|entry| entry.value().clone())
                .collect();
            ids.extend(children);
            cursor += 1;
        }
        ids
    }

    fn purge_subtree(&self, node: &Node) {
        for id in self.subtree(&node.space_id, &node.id) {
            if let Some((_, removed)) = self.inner.nodes.remove(&node_key(&node.space_id, &id)) {
                self.unlink(&removed);
                if let Some(blob_id) = removed.blob_id() {
                    self.inner.blobs.remove(blob_id);
                }
            }
        }
        // the trashed root itself is no longer in the node map
        if let Some(blob_id) = node.blob_id() {
            self.inner.blobs.remove(blob_id);
        }
    }

    fn snapshot_state(&self) -> Snapshot {
        Snapshot {
            nodes: self.inner.nodes.iter().map(|e| e.value().clone()).collect(),
            links: self
                .inner
                .links
                .iter()
                .map(|e| LinkEntry {
                    space_id: e.key().0.clone(),
                    parent_id: e.key().1.clone(),
                    name: e.key().2.clone(),
                    child_id: e.value().clone(),
                })
                .collect(),
            versions: self
                .inner
                .versions
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            blobs: self
                .inner
                .blobs
                .iter()
                .map(|e| (e.key().clone(), hex::encode(e.value())))
                .collect(),
            trash: self
                .inner
                .trash
                .iter()
                .map(|e| TrashEntry {
                    space_id: e.key().0.clone(),
                    key: e.key().1.clone(),
                    item: e.value().clone(),
                })
                .collect(),
            owners: self
                .inner
                .owners
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }

    fn restore(&self, snapshot: Snapshot) -> Result<()> {
        for node in snapshot.nodes {
            self.inner
                .nodes
                .insert(node_key(&node.space_id, &node.id), node);
        }
        for link in snapshot.links {
            self.inner.links.insert(
                link_key(&link.space_id, &link.parent_id, &link.name),
                link.child_id,
            );
        }
        for (path, attributes) in snapshot.versions {
            self.inner.versions.insert(path, attributes);
        }
        for (id, content) in snapshot.blobs {
            let data = hex::decode(&content)
                .map_err(|e| TreeError::Serialization(format!("blob {}: {}", id, e)))?;
            self.inner.blobs.insert(id, Bytes::from(data));
        }
        for entry in snapshot.trash {
            self.inner
                .trash
                .insert(node_key(&entry.space_id, &entry.key), entry.item);
        }
        for (space_id, owner) in snapshot.owners {
            self.inner.owners.insert(space_id, owner);
        }
        Ok(())
    }
}

#[async_trait]
impl Tree for MemoryTree {
    async fn setup(&self) -> Result<()> {
        if let Some(parent) = self.snapshot.as_deref().and_then(Path::parent) {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn get_md(&self, node: &Node) -> Result<NodeInfo> {
        let stored = self.stored(&node.space_id, &node.id)?;
        Ok(NodeInfo::from(&stored))
    }

    async fn list_folder(&self, node: &Node) -> Result<Vec<Node>> {
        self.stored_dir(&node.space_id, &node.id)?;
        let mut children: Vec<(String, String)> = self
            .inner
            .links
            .iter()
            .filter(|e| e.key().0 == node.space_id && e.key().1 == node.id)
            .map(|e| (e.key().2.clone(), e.value().clone()))
            .collect();
        children.sort();
        children
            .into_iter()
            .map(|(_, id)| self.stored(&node.space_id, &id))
            .collect()
    }

    #[instrument(skip(self, node), fields(space = %node.space_id, id = %node.id))]
    async fn create_dir(&self, node: &Node) -> Result<()> {
        if !node.is_dir() {
            return Err(TreeError::InvalidNodeKind {
                node_id: node.id.clone(),
                expected: "directory".to_string(),
            });
        }
        let parent_id = node
            .parent_id
            .as_deref()
            .ok_or_else(|| TreeError::NotPermitted("directory without parent".to_string()))?;
        validate_name(&node.name)?;
        self.stored_dir(&node.space_id, parent_id)?;
        if self.inner.links.contains_key(&link_key(&node.space_id, parent_id, &node.name)) {
            return Err(TreeError::AlreadyExists {
                parent_id: parent_id.to_string(),
                name: node.name.clone(),
            });
        }

        let mut dir = node.clone();
        dir.set_attribute_str(attrs::MTIME_ATTR, &now_rfc3339());
        self.insert_linked(dir);
        Ok(())
    }

    #[instrument(skip(self, old, new), fields(space = %old.space_id, id = %old.id))]
    async fn move_node(&self, old: &Node, new: &Node) -> Result<()> {
        let stored = self.stored(&old.space_id, &old.id)?;
        let new_parent = new
            .parent_id
            .as_deref()
            .ok_or_else(|| TreeError::NotPermitted("cannot move to space root".to_string()))?;
        validate_name(&new.name)?;
        self.stored_dir(&old.space_id, new_parent)?;
        self.ensure_free(&old.space_id, new_parent, &new.name, &stored.id)?;

        let size = accounted_size(&stored) as i64;
        self.propagate(&stored, -size).await?;
        self.unlink(&stored);

        let mut moved = stored;
        moved.parent_id = Some(new_parent.to_string());
        moved.name = new.name.clone();
        self.insert_linked(moved.clone());
        self.propagate(&moved, size).await
    }

    #[instrument(skip(self, node), fields(space = %node.space_id, id = %node.id))]
    async fn delete(&self, node: &Node) -> Result<()> {
        let stored = self.stored(&node.space_id, &node.id)?;
        if stored.parent_id.is_none() {
            return Err(TreeError::NotPermitted("cannot delete a space root".to_string()));
        }

        self.propagate(&stored, -(accounted_size(&stored) as i64)).await?;
        self.unlink(&stored);
        self.inner
            .nodes
            .remove(&node_key(&stored.space_id, &stored.id));

        let key = Uuid::new_v4().to_string();
        debug!(key = %key, "moved node to recycle bin");
        self.inner.trash.insert(
            node_key(&stored.space_id, &key),
            TrashedItem {
                node: stored,
                deleted_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn restore_recycle_item(
        &self,
        space_id: &str,
        key: &str,
        target: Option<&Node>,
    ) -> Result<PendingCommit> {
        let item = self
            .inner
            .trash
            .get(&node_key(space_id, key))
            .map(|e| e.value().clone())
            .ok_or_else(|| TreeError::RecycleItemNotFound {
                space_id: space_id.to_string(),
                key: key.to_string(),
            })?;

        let mut restored = item.node;
        if let Some(target) = target {
            restored.parent_id = target.parent_id.clone();
            restored.name = target.name.clone();
        }
        let parent_id = restored
            .parent_id
            .clone()
            .ok_or_else(|| TreeError::NotPermitted("restore target has no parent".to_string()))?;
        validate_name(&restored.name)?;
        let parent = self.stored_dir(space_id, &parent_id)?;
        self.ensure_free(space_id, &parent_id, &restored.name, &restored.id)?;

        let action = RestoreAction {
            tree: self.clone(),
            key: node_key(space_id, key),
            node: restored.clone(),
        };
        Ok(PendingCommit::new(vec![restored, parent], Box::new(action)))
    }

    async fn purge_recycle_item(&self, space_id: &str, key: &str) -> Result<PendingCommit> {
        let item = self
            .inner
            .trash
            .get(&node_key(space_id, key))
            .map(|e| e.value().clone())
            .ok_or_else(|| TreeError::RecycleItemNotFound {
                space_id: space_id.to_string(),
                key: key.to_string(),
            })?;

        let action = PurgeAction {
            tree: self.clone(),
            key: node_key(space_id, key),
            node: item.node.clone(),
        };
        Ok(PendingCommit::new(vec![item.node], Box::new(action)))
    }

    #[instrument(skip(self, node, bin_path), fields(id = %node.id))]
    async fn write_blob(&self, node: &Node, bin_path: &Path) -> Result<()> {
        let stored = self.stored(&node.space_id, &node.id)?;
        let blob_id = stored
            .blob_id()
            .ok_or_else(|| TreeError::InvalidAttribute {
                node_id: node.id.clone(),
                name: attrs::BLOB_ID_ATTR.to_string(),
                reason: "missing".to_string(),
            })?
            .to_string();

        let data = tokio::fs::read(bin_path).await?;
        debug!(blob_id = %blob_id, size = data.len(), "stored blob");
        self.inner.blobs.insert(blob_id, Bytes::from(data));
        Ok(())
    }

    async fn read_blob(&self, node: &Node) -> Result<Bytes> {
        let stored = self.stored(&node.space_id, &node.id)?;
        let blob_id = stored
            .blob_id()
            .ok_or_else(|| TreeError::BlobNotFound(node.id.clone()))?;
        self.inner
            .blobs
            .get(blob_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| TreeError::BlobNotFound(blob_id.to_string()))
    }

    async fn delete_blob(&self, node: &Node) -> Result<()> {
        let blob_id = node
            .blob_id()
            .ok_or_else(|| TreeError::BlobNotFound(node.id.clone()))?;
        self.inner
            .blobs
            .remove(blob_id)
            .map(|_| ())
            .ok_or_else(|| TreeError::BlobNotFound(blob_id.to_string()))
    }

    #[instrument(skip(self, node), fields(id = %node.id))]
    async fn propagate(&self, node: &Node, size_diff: i64) -> Result<()> {
        let now = now_rfc3339();
        let mut next = node.parent_id.clone();
        while let Some(parent_id) = next {
            let key = node_key(&node.space_id, &parent_id);
            let Some(mut parent) = self.inner.nodes.get_mut(&key) else {
                return Err(TreeError::NodeNotFound {
                    space_id: node.space_id.clone(),
                    node_id: parent_id,
                });
            };
            if size_diff != 0 {
                let size = (parent.tree_size() as i64 + size_diff).max(0);
                parent.set_attribute_str(attrs::TREESIZE_ATTR, &size.to_string());
            }
            parent.set_attribute_str(attrs::TMTIME_ATTR, &now);
            next = parent.parent_id.clone();
        }
        Ok(())
    }
}

#[async_trait]
impl Lookup for MemoryTree {
    async fn read_node(&self, space_id: &str, node_id: &str) -> Result<Node> {
        self.stored(space_id, node_id)
    }

    async fn child(&self, space_id: &str, parent_id: &str, name: &str) -> Result<Option<Node>> {
        let child_id = self
            .inner
            .links
            .get(&link_key(space_id, parent_id, name))
            .map(|e| e.value().clone());
        match child_id {
            Some(id) => self.stored(space_id, &id).map(Some),
            None => Ok(None),
        }
    }

    async fn create_node(&self, node: &Node) -> Result<()> {
        let parent_id = node
            .parent_id
            .as_deref()
            .ok_or_else(|| TreeError::NotPermitted("node without parent".to_string()))?;
        validate_name(&node.name)?;
        self.stored_dir(&node.space_id, parent_id)?;
        self.ensure_free(&node.space_id, parent_id, &node.name, &node.id)?;
        self.insert_linked(node.clone());
        Ok(())
    }

    async fn set_attributes(&self, node: &Node, attributes: Attributes) -> Result<Node> {
        let mut stored = self
            .inner
            .nodes
            .get_mut(&node_key(&node.space_id, &node.id))
            .ok_or_else(|| TreeError::NodeNotFound {
                space_id: node.space_id.clone(),
                node_id: node.id.clone(),
            })?;
        stored.attributes.extend(attributes);
        Ok(stored.clone())
    }

    async fn create_version(&self, node: &Node) -> Result<String> {
        let stored = self.stored(&node.space_id, &node.id)?;
        let path = format!("{}.REV.{}", stored.internal_path(), now_rfc3339());
        self.inner
            .versions
            .insert(path.clone(), stored.attributes);
        Ok(path)
    }

    async fn copy_metadata(
        &self,
        versions_path: &str,
        node: &Node,
        filter: &AttributeFilter,
    ) -> Result<()> {
        let source = self
            .inner
            .versions
            .get(versions_path)
            .map(|e| e.value().clone())
            .ok_or_else(|| TreeError::VersionNotFound(versions_path.to_string()))?;

        let mut stored = self
            .inner
            .nodes
            .get_mut(&node_key(&node.space_id, &node.id))
            .ok_or_else(|| TreeError::NodeNotFound {
                space_id: node.space_id.clone(),
                node_id: node.id.clone(),
            })?;
        for (name, value) in source {
            if filter(&name) {
                stored.attributes.insert(name, value);
            }
        }
        Ok(())
    }

    async fn remove_version(&self, versions_path: &str) -> Result<()> {
        self.inner
            .versions
            .remove(versions_path)
            .map(|_| ())
            .ok_or_else(|| TreeError::VersionNotFound(versions_path.to_string()))
    }

    async fn remove_node_entry(&self, node: &Node) -> Result<()> {
        self.inner
            .nodes
            .remove(&node_key(&node.space_id, &node.id))
            .map(|_| ())
            .ok_or_else(|| TreeError::NodeNotFound {
                space_id: node.space_id.clone(),
                node_id: node.id.clone(),
            })
    }

    async fn remove_child_link(&self, node: &Node) -> Result<()> {
        if self.unlink(node) {
            return Ok(());
        }
        Err(TreeError::LinkNotFound {
            parent_id: node.parent_id.clone().unwrap_or_default(),
            name: node.name.clone(),
        })
    }

    async fn mark_processing(&self, node: &Node, upload_id: &str) -> Result<()> {
        let mut stored = self
            .inner
            .nodes
            .get_mut(&node_key(&node.space_id, &node.id))
            .ok_or_else(|| TreeError::NodeNotFound {
                space_id: node.space_id.clone(),
                node_id: node.id.clone(),
            })?;
        stored.set_attribute_str(attrs::PROCESSING_ATTR, upload_id);
        Ok(())
    }

    async fn unmark_processing(&self, node: &Node, upload_id: &str) -> Result<()> {
        let mut stored = self
            .inner
            .nodes
            .get_mut(&node_key(&node.space_id, &node.id))
            .ok_or_else(|| TreeError::NodeNotFound {
                space_id: node.space_id.clone(),
                node_id: node.id.clone(),
            })?;
        // a newer upload may have taken over the node in the meantime
        if stored.processing_id() == Some(upload_id) {
            stored.attributes.remove(attrs::PROCESSING_ATTR);
        }
        Ok(())
    }

    async fn space_owner(&self, space_id: &str) -> Result<Option<String>> {
        Ok(self.inner.owners.get(space_id).map(|e| e.value().clone()))
    }
}

struct RestoreAction {
    tree: MemoryTree,
    key: NodeKey,
    node: Node,
}

#[async_trait]
impl CommitAction for RestoreAction {
    async fn apply(self: Box<Self>) -> Result<()> {
        let parent_id = self.node.parent_id.clone().unwrap_or_default();
        self.tree
            .ensure_free(&self.node.space_id, &parent_id, &self.node.name, &self.node.id)?;
        if self.tree.inner.trash.remove(&self.key).is_none() {
            return Err(TreeError::RecycleItemNotFound {
                space_id: self.key.0.clone(),
                key: self.key.1.clone(),
            });
        }
        let size = accounted_size(&self.node) as i64;
        self.tree.insert_linked(self.node.clone());
        self.tree.propagate(&self.node, size).await
    }
}

struct PurgeAction {
    tree: MemoryTree,
    key: NodeKey,
    node: Node,
}

#[async_trait]
impl CommitAction for PurgeAction {
    async fn apply(self: Box<Self>) -> Result<()> {
        if self.tree.inner.trash.remove(&self.key).is_none() {
            return Err(TreeError::RecycleItemNotFound {
                space_id: self.key.0.clone(),
                key: self.key.1.clone(),
            });
        }
        self.tree.purge_subtree(&self.node);
        Ok(())
    }
}
