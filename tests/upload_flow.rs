//! Integration tests for the upload lifecycle
//!
//! These tests drive uploads end to end through the engine, the file session
//! store and the in-memory tree.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tusk_core::{
    ChannelPublisher, Engine, EngineConfig, FileSessionStore, NewUpload, SessionStore,
    UploadError, UploadState,
};
use tusk_crypto::{checksum_reader, ChecksumAlgorithm, ExpectedChecksum};
use tusk_tree::{
    attrs, AttributeFilter, Attributes, Lookup, MemoryTree, Node, NodeInfo, PendingCommit, Tree,
    TreeError,
};

const SPACE: &str = "space";

/// A tree whose blob writes and propagation can be made to fail
#[derive(Clone, Default)]
struct FlakyTree {
    inner: MemoryTree,
    fail_blob_writes: Arc<AtomicBool>,
    failing_propagations: Arc<AtomicU32>,
    propagations: Arc<AtomicU32>,
}

impl FlakyTree {
    fn fail_propagations(&self, count: u32) {
        self.failing_propagations.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Tree for FlakyTree {
    async fn setup(&self) -> tusk_tree::Result<()> {
        self.inner.setup().await
    }

    async fn get_md(&self, node: &Node) -> tusk_tree::Result<NodeInfo> {
        self.inner.get_md(node).await
    }

    async fn list_folder(&self, node: &Node) -> tusk_tree::Result<Vec<Node>> {
        self.inner.list_folder(node).await
    }

    async fn create_dir(&self, node: &Node) -> tusk_tree::Result<()> {
        self.inner.create_dir(node).await
    }

    async fn move_node(&self, old: &Node, new: &Node) -> tusk_tree::Result<()> {
        self.inner.move_node(old, new).await
    }

    async fn delete(&self, node: &Node) -> tusk_tree::Result<()> {
        self.inner.delete(node).await
    }

    async fn restore_recycle_item(
        &self,
        space_id: &str,
        key: &str,
        target: Option<&Node>,
    ) -> tusk_tree::Result<PendingCommit> {
        self.inner.restore_recycle_item(space_id, key, target).await
    }

    async fn purge_recycle_item(&self, space_id: &str, key: &str) -> tusk_tree::Result<PendingCommit> {
        self.inner.purge_recycle_item(space_id, key).await
    }

    async fn write_blob(&self, node: &Node, bin_path: &Path) -> tusk_tree::Result<()> {
        if self.fail_blob_writes.load(Ordering::SeqCst) {
            return Err(TreeError::Io(io::Error::new(io::ErrorKind::Other, "disk full")));
        }
        self.inner.write_blob(node, bin_path).await
    }

    async fn read_blob(&self, node: &Node) -> tusk_tree::Result<Bytes> {
        self.inner.read_blob(node).await
    }

    async fn delete_blob(&self, node: &Node) -> tusk_tree::Result<()> {
        self.inner.delete_blob(node).await
    }

    async fn propagate(&self, node: &Node, size_diff: i64) -> tusk_tree::Result<()> {
        self.propagations.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_propagations.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_propagations.store(failing - 1, Ordering::SeqCst);
            return Err(TreeError::Io(io::Error::new(io::ErrorKind::Other, "backend busy")));
        }
        self.inner.propagate(node, size_diff).await
    }
}

/// A lookup whose first node read after a processing mark fails
#[derive(Clone, Default)]
struct RereadFailingLookup {
    inner: MemoryTree,
    fail_next_read: Arc<AtomicBool>,
}

#[async_trait]
impl Lookup for RereadFailingLookup {
    async fn read_node(&self, space_id: &str, node_id: &str) -> tusk_tree::Result<Node> {
        if self.fail_next_read.swap(false, Ordering::SeqCst) {
            return Err(TreeError::Io(io::Error::new(io::ErrorKind::Other, "metadata unavailable")));
        }
        self.inner.read_node(space_id, node_id).await
    }

    async fn child(&self, space_id: &str, parent_id: &str, name: &str) -> tusk_tree::Result<Option<Node>> {
        self.inner.child(space_id, parent_id, name).await
    }

    async fn create_node(&self, node: &Node) -> tusk_tree::Result<()> {
        self.inner.create_node(node).await
    }

    async fn set_attributes(&self, node: &Node, attributes: Attributes) -> tusk_tree::Result<Node> {
        self.inner.set_attributes(node, attributes).await
    }

    async fn create_version(&self, node: &Node) -> tusk_tree::Result<String> {
        self.inner.create_version(node).await
    }

    async fn copy_metadata(
        &self,
        versions_path: &str,
        node: &Node,
        filter: &AttributeFilter,
    ) -> tusk_tree::Result<()> {
        self.inner.copy_metadata(versions_path, node, filter).await
    }

    async fn remove_version(&self, versions_path: &str) -> tusk_tree::Result<()> {
        self.inner.remove_version(versions_path).await
    }

    async fn remove_node_entry(&self, node: &Node) -> tusk_tree::Result<()> {
        self.inner.remove_node_entry(node).await
    }

    async fn remove_child_link(&self, node: &Node) -> tusk_tree::Result<()> {
        self.inner.remove_child_link(node).await
    }

    async fn mark_processing(&self, node: &Node, upload_id: &str) -> tusk_tree::Result<()> {
        self.inner.mark_processing(node, upload_id).await?;
        self.fail_next_read.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn unmark_processing(&self, node: &Node, upload_id: &str) -> tusk_tree::Result<()> {
        self.inner.unmark_processing(node, upload_id).await
    }

    async fn space_owner(&self, space_id: &str) -> tusk_tree::Result<Option<String>> {
        self.inner.space_owner(space_id).await
    }
}

/// Yields `data` once, then reports a dropped connection as `UnexpectedEof`
struct DisconnectingReader {
    data: Vec<u8>,
    done: bool,
}

impl AsyncRead for DisconnectingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.done {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client disconnected",
            )));
        }
        let data = std::mem::take(&mut self.data);
        buf.put_slice(&data);
        self.done = true;
        Poll::Ready(Ok(()))
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    tree: FlakyTree,
    store: Arc<FileSessionStore>,
    config: EngineConfig,
}

impl Fixture {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let tree = FlakyTree::default();
        tree.inner.create_space(SPACE, "alice");
        let mut config = EngineConfig {
            root: dir.path().to_path_buf(),
            propagation_backoff_ms: 1,
            ..Default::default()
        };
        config.tokens.transfer_shared_secret = "integration-secret".to_string();
        let store = Arc::new(FileSessionStore::open(config.uploads_dir()).await.unwrap());
        Self {
            dir,
            tree,
            store,
            config,
        }
    }

    fn engine(&self) -> Engine {
        Engine::new(
            self.config.clone(),
            self.store.clone(),
            Arc::new(self.tree.clone()),
            Arc::new(self.tree.inner.clone()),
        )
    }

    fn async_engine(&self) -> Engine {
        let mut config = self.config.clone();
        config.async_uploads = true;
        Engine::new(
            config,
            self.store.clone(),
            Arc::new(self.tree.clone()),
            Arc::new(self.tree.inner.clone()),
        )
    }

    async fn child(&self, name: &str) -> Option<Node> {
        self.tree.inner.child(SPACE, SPACE, name).await.unwrap()
    }
}

/// An existing file node, as left by an earlier upload
async fn seed_file(tree: &MemoryTree, id: &str, name: &str) -> Node {
    let mut node = Node::new_file(SPACE, id, SPACE, name);
    node.set_attribute_str(attrs::BLOB_ID_ATTR, "old-blob");
    node.set_attribute_str(attrs::BLOBSIZE_ATTR, "3");
    node.set_attribute_str(attrs::MTIME_ATTR, "2024-01-01T00:00:00Z");
    tree.create_node(&node).await.unwrap();
    node
}

async fn sha1_of(data: &[u8]) -> String {
    checksum_reader(&mut &data[..])
        .await
        .unwrap()
        .hex(ChecksumAlgorithm::Sha1)
}

/// Deferred length, one chunk, verified content digest
#[tokio::test]
async fn test_deferred_length_upload_commits() {
    let fx = Fixture::new().await;
    let engine = fx.engine();
    let data = vec![7u8; 1024];
    let sha1 = sha1_of(&data).await;

    let mut upload = engine
        .initiate(
            NewUpload::new(SPACE, SPACE, "report.bin")
                .with_checksum(ExpectedChecksum::new(ChecksumAlgorithm::Sha1, sha1)),
        )
        .await
        .unwrap();
    assert!(upload.get_info().size_is_deferred);

    upload.declare_length(1024).await.unwrap();
    assert_eq!(upload.write_chunk(0, &mut &data[..]).await.unwrap(), 1024);
    assert_eq!(upload.offset(), upload.session().size);
    upload.finish_upload().await.unwrap();

    let node = fx.child("report.bin").await.unwrap();
    for algorithm in ChecksumAlgorithm::PRIORITY {
        let digest = node.checksum(algorithm.as_str()).unwrap();
        assert_eq!(digest.len(), algorithm.digest_len());
    }
    let root = fx.tree.inner.read_node(SPACE, SPACE).await.unwrap();
    assert_eq!(root.tree_size(), 1024);
    assert_eq!(fx.tree.propagations.load(Ordering::SeqCst), 1);
    assert_eq!(fx.tree.inner.read_blob(&node).await.unwrap().as_ref(), &data[..]);
}

/// Chunks land in submission order
#[tokio::test]
async fn test_chunks_concatenate_in_order() {
    let fx = Fixture::new().await;
    let engine = fx.engine();
    let chunks: [&[u8]; 3] = [b"first,", b"second,", b"third"];
    let total: usize = chunks.iter().map(|c| c.len()).sum();

    let mut upload = engine
        .initiate(NewUpload::new(SPACE, SPACE, "chunks.txt").with_size(total as u64))
        .await
        .unwrap();
    for chunk in chunks {
        let offset = upload.offset();
        upload.write_chunk(offset, &mut &chunk[..]).await.unwrap();
    }
    assert_eq!(upload.offset(), total as u64);

    let staged = tokio::fs::read(&upload.session().bin_path).await.unwrap();
    assert_eq!(staged, b"first,second,third");
    upload.finish_upload().await.unwrap();
}

/// A client disconnect mid-chunk is a pause that survives a restart
#[tokio::test]
async fn test_disconnect_pauses_and_resumes() {
    let fx = Fixture::new().await;
    let engine = fx.engine();

    let mut upload = engine
        .initiate(NewUpload::new(SPACE, SPACE, "paused.bin").with_size(300))
        .await
        .unwrap();
    upload.write_chunk(0, &mut &[1u8; 100][..]).await.unwrap();

    let mut reader = DisconnectingReader {
        data: vec![2u8; 50],
        done: false,
    };
    assert_eq!(upload.write_chunk(100, &mut reader).await.unwrap(), 50);
    assert_eq!(upload.offset(), 150);
    let id = upload.id().to_string();
    drop(upload);

    // a different engine instance picks up from the staged bytes
    let engine = fx.engine();
    let mut upload = engine.load(&id).await.unwrap();
    assert_eq!(upload.offset(), 150);
    upload.write_chunk(150, &mut &[3u8; 150][..]).await.unwrap();
    upload.finish_upload().await.unwrap();

    let node = fx.child("paused.bin").await.unwrap();
    assert_eq!(node.blob_size(), Some(300));
}

/// A wrong content digest leaves nothing behind
#[tokio::test]
async fn test_checksum_mismatch_reverts_everything() {
    let fx = Fixture::new().await;
    let engine = fx.engine();

    let mut upload = engine
        .initiate(
            NewUpload::new(SPACE, SPACE, "bad.bin")
                .with_size(5)
                .with_checksum(ExpectedChecksum::new(
                    ChecksumAlgorithm::Sha1,
                    "0000000000000000000000000000000000000000",
                )),
        )
        .await
        .unwrap();
    upload.write_chunk(0, &mut &b"hello"[..]).await.unwrap();

    let err = upload.finish_upload().await.unwrap_err();
    assert!(err.is_checksum_mismatch());
    assert!(err.to_string().contains("sha1"));

    assert!(!upload.session().bin_path.exists());
    assert!(matches!(
        fx.store.get(upload.id()).await,
        Err(UploadError::SessionNotFound(_))
    ));
    assert!(fx.child("bad.bin").await.is_none());
    assert_eq!(fx.tree.propagations.load(Ordering::SeqCst), 0);
}

/// Only the highest priority declared digest is checked
#[tokio::test]
async fn test_checksum_priority_prefers_sha1() {
    let fx = Fixture::new().await;
    let engine = fx.engine();

    let upload = engine
        .initiate(NewUpload::new(SPACE, SPACE, "both.txt").with_size(5))
        .await
        .unwrap();
    let mut session = fx.store.get(upload.id()).await.unwrap();
    session.checksum_sha1 = sha1_of(b"hello").await.to_uppercase();
    session.checksum_md5 = "ffffffffffffffffffffffffffffffff".to_string();
    fx.store.persist(&session).await.unwrap();

    let mut upload = engine.load(&session.id).await.unwrap();
    upload.write_chunk(0, &mut &b"hello"[..]).await.unwrap();
    upload.finish_upload().await.unwrap();
    assert_eq!(upload.state(), UploadState::Done);
}

/// Asynchronous mode keeps the processing marker until the driver cleans up
#[tokio::test]
async fn test_async_processing_marker() {
    let fx = Fixture::new().await;
    let (publisher, mut events) = ChannelPublisher::new();
    let engine = fx.async_engine().with_publisher(Arc::new(publisher));

    let mut upload = engine
        .initiate(
            NewUpload::new(SPACE, SPACE, "scan-me.bin")
                .with_size(4)
                .with_executant("bob"),
        )
        .await
        .unwrap();
    upload.write_chunk(0, &mut &b"data"[..]).await.unwrap();
    upload.finish_upload().await.unwrap();
    assert_eq!(upload.state(), UploadState::ProcessingAsyncPending);

    let node = fx.child("scan-me.bin").await.unwrap();
    assert_eq!(node.processing_id(), Some(upload.id()));
    assert!(!fx.tree.inner.has_blob(node.blob_id().unwrap()));

    let event = events.recv().await.unwrap();
    assert_eq!(event.upload_id, upload.id());
    assert_eq!(event.space_owner.as_deref(), Some("alice"));
    assert_eq!(event.executing_user, "bob");
    assert_eq!(event.filesize, 4);
    assert_eq!(event.resource_id, node.resource_id());
    let token = event.url.rsplit('/').next().unwrap();
    let claims = engine.issuer().validate(token).unwrap();
    assert!(claims.target.ends_with(&format!("tus/{}", upload.id())));

    let stored = fx.store.get(upload.id()).await.unwrap();
    assert_eq!(stored.state, UploadState::ProcessingAsyncPending);

    engine.resume_pending(upload.id()).await.unwrap();
    let node = fx.child("scan-me.bin").await.unwrap();
    assert!(!node.is_processing());
    assert_eq!(fx.tree.inner.read_blob(&node).await.unwrap().as_ref(), b"data");
    assert!(fx.store.get(upload.id()).await.is_err());
}

/// Resuming an upload that is not pending is refused
#[tokio::test]
async fn test_resume_pending_requires_pending_state() {
    let fx = Fixture::new().await;
    let engine = fx.engine();
    let upload = engine
        .initiate(NewUpload::new(SPACE, SPACE, "x.bin").with_size(1))
        .await
        .unwrap();

    assert!(matches!(
        engine.resume_pending(upload.id()).await,
        Err(UploadError::InvalidTransition {
            from: UploadState::Receiving,
            ..
        })
    ));
}

/// A failed overwrite restores exactly the allow-listed attributes
#[tokio::test]
async fn test_versioned_failure_restores_previous_version() {
    let fx = Fixture::new().await;
    let mut old = Node::new_file(SPACE, "n1", SPACE, "doc.txt");
    old.set_attribute_str(attrs::BLOB_ID_ATTR, "old-blob");
    old.set_attribute_str(attrs::BLOBSIZE_ATTR, "3");
    old.set_attribute_str(attrs::MTIME_ATTR, "2024-01-01T00:00:00Z");
    old.attributes.insert(attrs::checksum("sha1"), vec![0xaa; 20]);
    old.set_attribute_str("user.label", "before");
    fx.tree.inner.create_node(&old).await.unwrap();

    let engine = fx.async_engine();
    let mut upload = engine
        .initiate(NewUpload::new(SPACE, SPACE, "doc.txt").with_size(6))
        .await
        .unwrap();
    upload.write_chunk(0, &mut &b"newer!"[..]).await.unwrap();
    upload.finish_upload().await.unwrap();

    let versions_path = upload.session().versions_path.clone();
    assert!(fx.tree.inner.has_version(&versions_path));
    let mut label = tusk_tree::Attributes::new();
    label.insert("user.label".to_string(), b"after".to_vec());
    fx.tree.inner.set_attributes(&old, label).await.unwrap();

    fx.tree.fail_blob_writes.store(true, Ordering::SeqCst);
    let err = engine.resume_pending(upload.id()).await.unwrap_err();
    assert!(matches!(err, UploadError::BlobUpload(_)));

    let restored = fx.tree.inner.read_node(SPACE, "n1").await.unwrap();
    assert_eq!(restored.blob_id(), Some("old-blob"));
    assert_eq!(restored.blob_size(), Some(3));
    assert_eq!(restored.attribute_str(attrs::MTIME_ATTR), Some("2024-01-01T00:00:00Z"));
    assert_eq!(restored.checksum("sha1"), Some(&[0xaa; 20][..]));
    assert_eq!(restored.attribute_str("user.label"), Some("after"));
    assert!(!restored.is_processing());
    assert!(!fx.tree.inner.has_version(&versions_path));
    assert!(fx.store.get(upload.id()).await.is_err());
}

/// Cleanup and terminate can run repeatedly
#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let fx = Fixture::new().await;
    let engine = fx.engine();
    let mut upload = engine
        .initiate(NewUpload::new(SPACE, SPACE, "twice.txt").with_size(2))
        .await
        .unwrap();
    upload.write_chunk(0, &mut &b"ok"[..]).await.unwrap();
    upload.finish_upload().await.unwrap();

    upload.cleanup(false, false).await;
    upload.cleanup(false, false).await;
    assert!(fx.child("twice.txt").await.is_some());

    let mut other = engine
        .initiate(NewUpload::new(SPACE, SPACE, "gone.txt"))
        .await
        .unwrap();
    tokio::fs::remove_file(&other.session().bin_path).await.unwrap();
    other.terminate().await;
    other.terminate().await;
    assert_eq!(other.state(), UploadState::Failed);
}

/// Propagation is retried before giving up
#[tokio::test]
async fn test_propagation_retry_recovers() {
    let fx = Fixture::new().await;
    fx.tree.fail_propagations(2);
    let engine = fx.engine();

    let mut upload = engine
        .initiate(NewUpload::new(SPACE, SPACE, "retry.bin").with_size(8))
        .await
        .unwrap();
    upload.write_chunk(0, &mut &[0u8; 8][..]).await.unwrap();
    upload.finish_upload().await.unwrap();

    assert_eq!(fx.tree.propagations.load(Ordering::SeqCst), 3);
    let root = fx.tree.inner.read_node(SPACE, SPACE).await.unwrap();
    assert_eq!(root.tree_size(), 8);
}

/// Exhausted propagation retries leave a live object and a partial-success error
#[tokio::test]
async fn test_propagation_failure_is_partial_success() {
    let fx = Fixture::new().await;
    fx.tree.fail_propagations(u32::MAX);
    let engine = fx.engine();

    let mut upload = engine
        .initiate(NewUpload::new(SPACE, SPACE, "live.bin").with_size(8))
        .await
        .unwrap();
    upload.write_chunk(0, &mut &[0u8; 8][..]).await.unwrap();

    let err = upload.finish_upload().await.unwrap_err();
    assert!(err.is_partial_success());
    assert!(matches!(err, UploadError::PropagationFailed { attempts: 3, .. }));
    assert_eq!(upload.state(), UploadState::Done);

    let node = fx.child("live.bin").await.unwrap();
    assert!(fx.tree.inner.has_blob(node.blob_id().unwrap()));
}

/// Expired sessions are terminated by the sweep
#[tokio::test]
async fn test_sweep_expired_sessions() {
    let mut fx = Fixture::new().await;
    fx.config.session_ttl_secs = 0;
    let engine = fx.engine();

    let stale = engine
        .initiate(NewUpload::new(SPACE, SPACE, "stale.bin"))
        .await
        .unwrap();
    let later = chrono::Utc::now() + chrono::Duration::seconds(1);
    assert_eq!(engine.sweep_expired(later).await.unwrap(), 1);

    assert!(!stale.session().bin_path.exists());
    assert!(fx.store.list().await.unwrap().is_empty());
    assert!(fx.dir.path().join("uploads").exists());
}

/// Uploads over the configured maximum are refused up front
#[tokio::test]
async fn test_oversized_upload_rejected() {
    let mut fx = Fixture::new().await;
    fx.config.max_upload_size = 10;
    let engine = fx.engine();

    assert!(matches!(
        engine
            .initiate(NewUpload::new(SPACE, SPACE, "big.bin").with_size(11))
            .await,
        Err(UploadError::UploadTooLarge { size: 11, max: 10 })
    ));

    let mut deferred = engine
        .initiate(NewUpload::new(SPACE, SPACE, "big.bin"))
        .await
        .unwrap();
    assert!(matches!(
        deferred.declare_length(11).await,
        Err(UploadError::UploadTooLarge { .. })
    ));
}

/// Terminating a reloaded async upload removes the node it committed
#[tokio::test]
async fn test_terminate_reloaded_pending_upload_removes_node() {
    let fx = Fixture::new().await;
    let engine = fx.async_engine();

    let mut upload = engine
        .initiate(NewUpload::new(SPACE, SPACE, "pending.bin").with_size(4))
        .await
        .unwrap();
    upload.write_chunk(0, &mut &b"data"[..]).await.unwrap();
    upload.finish_upload().await.unwrap();
    assert!(fx.child("pending.bin").await.is_some());
    let id = upload.id().to_string();
    drop(upload);

    let mut upload = fx.async_engine().load(&id).await.unwrap();
    assert!(upload.node().is_none());
    upload.terminate().await;

    assert!(fx.child("pending.bin").await.is_none());
    assert!(upload.node().is_none());
    assert!(!upload.session().bin_path.exists());
    assert!(fx.store.get(&id).await.is_err());
    assert_eq!(upload.state(), UploadState::Failed);
}

/// Terminating a reloaded async overwrite restores the previous version
#[tokio::test]
async fn test_terminate_reloaded_pending_overwrite_restores_version() {
    let fx = Fixture::new().await;
    seed_file(&fx.tree.inner, "n2", "kept.txt").await;
    let engine = fx.async_engine();

    let mut upload = engine
        .initiate(NewUpload::new(SPACE, SPACE, "kept.txt").with_size(6))
        .await
        .unwrap();
    upload.write_chunk(0, &mut &b"newer!"[..]).await.unwrap();
    upload.finish_upload().await.unwrap();
    let versions_path = upload.session().versions_path.clone();
    let id = upload.id().to_string();
    drop(upload);

    let mut upload = fx.async_engine().load(&id).await.unwrap();
    upload.terminate().await;

    let restored = fx.tree.inner.read_node(SPACE, "n2").await.unwrap();
    assert_eq!(restored.blob_id(), Some("old-blob"));
    assert_eq!(restored.blob_size(), Some(3));
    assert!(!restored.is_processing());
    assert!(!fx.tree.inner.has_version(&versions_path));
    assert!(fx.store.get(&id).await.is_err());
}

/// Terminating an upload reloaded before commit leaves an existing node alone
#[tokio::test]
async fn test_terminate_uncommitted_upload_keeps_existing_node() {
    let fx = Fixture::new().await;
    seed_file(&fx.tree.inner, "n3", "other.txt").await;
    let engine = fx.engine();

    let upload = engine
        .initiate(NewUpload::new(SPACE, SPACE, "other.txt").with_size(6))
        .await
        .unwrap();
    let mut session = fx.store.get(upload.id()).await.unwrap();
    session.state = UploadState::Committing;
    fx.store.persist(&session).await.unwrap();

    let mut upload = engine.load(&session.id).await.unwrap();
    upload.terminate().await;

    let node = fx.tree.inner.read_node(SPACE, "n3").await.unwrap();
    assert_eq!(node.blob_id(), Some("old-blob"));
}

/// The sweep rolls back expired uploads still waiting for processing
#[tokio::test]
async fn test_sweep_rolls_back_expired_pending_upload() {
    let mut fx = Fixture::new().await;
    fx.config.session_ttl_secs = 0;
    let engine = fx.async_engine();

    let mut upload = engine
        .initiate(NewUpload::new(SPACE, SPACE, "abandoned.bin").with_size(4))
        .await
        .unwrap();
    upload.write_chunk(0, &mut &b"data"[..]).await.unwrap();
    upload.finish_upload().await.unwrap();
    assert!(fx.child("abandoned.bin").await.is_some());

    let later = chrono::Utc::now() + chrono::Duration::seconds(1);
    assert_eq!(engine.sweep_expired(later).await.unwrap(), 1);

    assert!(fx.child("abandoned.bin").await.is_none());
    assert!(fx.store.list().await.unwrap().is_empty());
}

/// A commit failing after the processing mark still clears the marker
#[tokio::test]
async fn test_failed_commit_clears_processing_marker() {
    let fx = Fixture::new().await;
    seed_file(&fx.tree.inner, "n4", "flaky.txt").await;
    let lookup = RereadFailingLookup {
        inner: fx.tree.inner.clone(),
        ..Default::default()
    };
    let engine = Engine::new(
        fx.config.clone(),
        fx.store.clone(),
        Arc::new(fx.tree.clone()),
        Arc::new(lookup),
    );

    let mut upload = engine
        .initiate(NewUpload::new(SPACE, SPACE, "flaky.txt").with_size(5))
        .await
        .unwrap();
    upload.write_chunk(0, &mut &b"fresh"[..]).await.unwrap();

    let err = upload.finish_upload().await.unwrap_err();
    assert!(matches!(err, UploadError::NodeCreation(_)));
    assert_eq!(upload.state(), UploadState::Failed);

    let node = fx.tree.inner.read_node(SPACE, "n4").await.unwrap();
    assert_eq!(node.blob_id(), Some("old-blob"));
    assert!(!node.is_processing());
    assert!(fx.store.get(upload.id()).await.is_err());
}
