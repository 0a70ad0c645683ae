//! Node materialization for a verified upload

use crate::Upload;
use chrono::{SecondsFormat, Utc};
use tracing::debug;
use tusk_tree::{attrs, Attributes, Node, NodeKind, TreeError};
use uuid::Uuid;

impl Upload {
    /// Create the target node, or turn the existing one into a new version,
    /// carrying `attributes` plus blob id, blob size, type and mtime.
    ///
    /// The node is recorded on the upload as soon as it exists so that a
    /// failure later in this method is rolled back by cleanup.
    pub(crate) async fn create_node_for_upload(
        &mut self,
        mut attributes: Attributes,
    ) -> Result<(), TreeError> {
        let lookup = self.engine.lookup.clone();
        let size = self.session.offset;
        let mtime = self
            .session
            .mtime
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(SecondsFormat::Nanos, true);

        attributes.insert(attrs::TYPE_ATTR.to_string(), NodeKind::File.as_str().into());
        attributes.insert(attrs::BLOB_ID_ATTR.to_string(), Uuid::new_v4().to_string().into_bytes());
        attributes.insert(attrs::BLOBSIZE_ATTR.to_string(), size.to_string().into_bytes());
        attributes.insert(attrs::MTIME_ATTR.to_string(), mtime.into_bytes());

        let existing = match lookup
            .read_node(&self.session.space_root, &self.session.node_id)
            .await
        {
            Ok(node) => Some(node),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        let node = match existing {
            Some(old) => {
                if old.is_dir() {
                    return Err(TreeError::InvalidNodeKind {
                        node_id: old.id,
                        expected: "file".to_string(),
                    });
                }
                self.session.versions_path = lookup.create_version(&old).await?;
                self.session.size_diff = size as i64 - old.blob_size().unwrap_or(0) as i64;
                self.node = Some(old.clone());
                debug!(node_id = %old.id, versions_path = %self.session.versions_path, "overwriting node");
                lookup.set_attributes(&old, attributes).await?
            }
            None => {
                let mut node = Node::new_file(
                    self.session.space_root.clone(),
                    self.session.node_id.clone(),
                    self.session.node_parent_id.clone(),
                    self.session.node_name.clone(),
                );
                node.attributes.extend(attributes);
                lookup.create_node(&node).await?;
                self.session.size_diff = size as i64;
                self.node = Some(node.clone());
                debug!(node_id = %node.id, "created node");
                node
            }
        };

        self.session.filesize = size;
        lookup.mark_processing(&node, &self.session.id).await?;
        self.node = Some(lookup.read_node(&node.space_id, &node.id).await?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::store::MemorySessionStore;
    use crate::{Engine, EngineConfig, NewUpload};
    use std::sync::Arc;
    use tusk_tree::{attrs, Lookup, MemoryTree, Node, Tree};

    fn engine(tree: &MemoryTree, dir: &tempfile::TempDir, async_uploads: bool) -> Engine {
        let config = EngineConfig {
            async_uploads,
            ..Default::default()
        };
        Engine::new(
            config,
            Arc::new(MemorySessionStore::new(dir.path())),
            Arc::new(tree.clone()),
            Arc::new(tree.clone()),
        )
    }

    #[tokio::test]
    async fn test_new_node_carries_upload_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let tree = MemoryTree::new();
        tree.create_space("space", "alice");
        let engine = engine(&tree, &dir, true);

        let mut upload = engine
            .initiate(NewUpload::new("space", "space", "a.bin").with_size(3))
            .await
            .unwrap();
        upload.write_chunk(0, &mut &b"abc"[..]).await.unwrap();
        upload.finish_upload().await.unwrap();

        let node = upload.node().unwrap();
        assert_eq!(node.attribute_str(attrs::TYPE_ATTR), Some("file"));
        assert_eq!(node.blob_size(), Some(3));
        assert!(node.blob_id().is_some());
        assert!(node.mtime().is_some());
        assert_eq!(node.processing_id(), Some(upload.id()));
        assert_eq!(upload.session().size_diff, 3);
        assert!(upload.session().versions_path.is_empty());
    }

    #[tokio::test]
    async fn test_existing_node_becomes_version() {
        let dir = tempfile::tempdir().unwrap();
        let tree = MemoryTree::new();
        tree.create_space("space", "alice");
        let mut old = Node::new_file("space", "n1", "space", "a.bin");
        old.set_attribute_str(attrs::BLOB_ID_ATTR, "old-blob");
        old.set_attribute_str(attrs::BLOBSIZE_ATTR, "10");
        tree.create_node(&old).await.unwrap();
        let engine = engine(&tree, &dir, false);

        let mut upload = engine
            .initiate(NewUpload::new("space", "space", "a.bin").with_size(4))
            .await
            .unwrap();
        assert_eq!(upload.session().node_id, "n1");
        upload.write_chunk(0, &mut &b"abcd"[..]).await.unwrap();
        upload.finish_upload().await.unwrap();

        assert!(tree.has_version(&upload.session().versions_path));
        assert_eq!(upload.session().size_diff, -6);
        let node = tree.read_node("space", "n1").await.unwrap();
        assert_ne!(node.blob_id(), Some("old-blob"));
        assert_eq!(tree.read_blob(&node).await.unwrap().as_ref(), b"abcd");
    }

    #[tokio::test]
    async fn test_directory_target_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tree = MemoryTree::new();
        tree.create_space("space", "alice");
        tree.create_dir(&Node::new_dir("space", "d1", "space", "docs"))
            .await
            .unwrap();
        let engine = engine(&tree, &dir, false);

        let result = engine
            .initiate(NewUpload::new("space", "space", "docs").with_size(1))
            .await;
        assert!(result.is_err());
    }
}
