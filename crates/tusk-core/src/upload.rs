//! Upload orchestrator
//!
//! An [`Upload`] binds one session to the engine's capability handles and
//! drives it through its lifecycle:
//!
//! ```text
//! write_chunk* / declare_length / concat_uploads
//!        │
//!   finish_upload ── verify ── create node ── publish ──┬── finalize ── cleanup   (sync)
//!                                                       └── persist, wait for driver (async)
//!        │
//!   propagate size change
//! ```

use crate::{
    events::BytesReceived, session::FileInfo, staging, transfer::join_url, Engine, Result,
    Session, UploadError, UploadState,
};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncRead;
use tracing::{debug, error, info, info_span, instrument, warn, Span};
use tusk_crypto::checksum_file;
use tusk_tree::{attrs, Attributes, Node};

/// Gateway path segment under which staged uploads are served
pub const TUS_PREFIX: &str = "tus/";

/// An upload whose staged bytes can be appended to another upload
pub trait StagedUpload: Send + Sync {
    fn upload_id(&self) -> &str;

    /// Staging file, if this upload exposes one
    fn staging_path(&self) -> Option<&Path>;
}

/// Attributes restored from the version snapshot when an overwrite fails
fn restorable_attribute(name: &str) -> bool {
    name.starts_with(attrs::CHECKSUM_PREFIX)
        || matches!(
            name,
            attrs::TYPE_ATTR | attrs::BLOB_ID_ATTR | attrs::BLOBSIZE_ATTR | attrs::MTIME_ATTR
        )
}

/// One upload session bound to the engine
pub struct Upload {
    pub(crate) session: Session,
    pub(crate) node: Option<Node>,
    pub(crate) engine: Engine,
    span: Span,
}

impl Upload {
    pub(crate) fn new(engine: Engine, session: Session) -> Self {
        let span = info_span!(parent: &engine.span, "upload", id = %session.id);
        Self {
            session,
            node: None,
            engine,
            span,
        }
    }

    pub fn id(&self) -> &str {
        &self.session.id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The committed node, once `finish_upload` created it
    pub fn node(&self) -> Option<&Node> {
        self.node.as_ref()
    }

    pub fn state(&self) -> UploadState {
        self.session.state
    }

    pub fn offset(&self) -> u64 {
        self.session.offset
    }

    pub(crate) fn transition(&mut self, next: UploadState) -> Result<()> {
        let current = self.session.state;
        if !current.can_transition_to(next) {
            return Err(UploadError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        debug!(upload_id = %self.session.id, from = %current, to = %next, "upload state change");
        self.session.state = next;
        Ok(())
    }

    fn ensure_receiving(&self) -> Result<()> {
        match self.session.state {
            UploadState::Receiving => Ok(()),
            other => Err(UploadError::NotReceiving(other)),
        }
    }

    /// Append a chunk read from `reader` at `offset`.
    ///
    /// A reader ending with `UnexpectedEof` pauses the upload: the bytes copied
    /// so far count and the call succeeds with the short count.
    #[instrument(parent = &self.span, skip(self, reader))]
    pub async fn write_chunk<R>(&mut self, offset: u64, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        self.ensure_receiving()?;
        if offset != self.session.offset {
            return Err(UploadError::OffsetMismatch {
                expected: self.session.offset,
                actual: offset,
            });
        }

        match staging::append(&self.session.bin_path, reader, self.session.remaining()).await {
            Ok(written) => {
                self.session.offset += written;
                debug!(written, offset = self.session.offset, "chunk written");
                Ok(written)
            }
            Err((written, source)) => {
                self.session.offset += written;
                warn!(written, "chunk write failed: {}", source);
                Err(UploadError::WriteInterrupted { written, source })
            }
        }
    }

    /// Progress as reported to resumable-upload clients
    pub fn get_info(&self) -> FileInfo {
        self.session.to_file_info()
    }

    /// Reader over the staged bytes
    pub async fn get_reader(&self) -> Result<tokio::fs::File> {
        Ok(tokio::fs::File::open(&self.session.bin_path).await?)
    }

    /// Set the total size of an upload created with a deferred length
    #[instrument(parent = &self.span, skip(self))]
    pub async fn declare_length(&mut self, length: u64) -> Result<()> {
        if !self.session.size_is_deferred {
            return Err(UploadError::SizeNotDeferred);
        }
        if length < self.session.offset {
            return Err(UploadError::LengthBelowOffset {
                length,
                offset: self.session.offset,
            });
        }
        if length > self.engine.config.max_upload_size {
            return Err(UploadError::UploadTooLarge {
                size: length,
                max: self.engine.config.max_upload_size,
            });
        }

        self.session.size = length;
        self.session.filesize = length;
        self.session.size_is_deferred = false;
        self.engine.store.persist(&self.session).await
    }

    /// Append the staged content of `parts`, in the given order.
    ///
    /// A failure part way leaves the already appended prefix in place.
    #[instrument(parent = &self.span, skip_all, fields(parts = parts.len()))]
    pub async fn concat_uploads(&mut self, parts: &[&dyn StagedUpload]) -> Result<()> {
        self.ensure_receiving()?;
        let sources = parts
            .iter()
            .map(|part| {
                part.staging_path()
                    .ok_or_else(|| UploadError::NotConcatenable(part.upload_id().to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        for source in sources {
            let mut file = tokio::fs::File::open(source).await?;
            let limit = self.session.remaining();
            match staging::append(&self.session.bin_path, &mut file, limit).await {
                Ok(written) => self.session.offset += written,
                Err((written, source)) => {
                    self.session.offset += written;
                    return Err(UploadError::WriteInterrupted { written, source });
                }
            }
        }
        debug!(offset = self.session.offset, "parts concatenated");
        Ok(())
    }

    /// Verify and commit the staged bytes.
    ///
    /// The size must be declared and fully received. In synchronous mode the blob is stored before returning. In
    /// asynchronous mode the upload is left in `ProcessingAsyncPending` for
    /// [`Engine::resume_pending`]. Size propagation runs last in both modes.
    #[instrument(parent = &self.span, skip_all, fields(upload_id = %self.session.id))]
    pub async fn finish_upload(&mut self) -> Result<()> {
        self.ensure_receiving()?;
        if self.session.size_is_deferred {
            return Err(UploadError::SizeDeferred);
        }
        if self.session.offset != self.session.size {
            return Err(UploadError::Incomplete {
                offset: self.session.offset,
                size: self.session.size,
            });
        }
        self.transition(UploadState::Committing)?;
        self.engine.store.persist(&self.session).await?;

        let sums = match checksum_file(&self.session.bin_path).await {
            Ok(sums) => sums,
            Err(e) => {
                self.fail().await;
                return Err(e.into());
            }
        };
        if let Some(expected) = self.session.expected_checksum() {
            if let Err(e) = sums.verify(&expected) {
                warn!(algorithm = %expected.algorithm, "checksum verification failed");
                self.fail().await;
                return Err(e.into());
            }
        }

        let mut attributes = Attributes::new();
        for (algorithm, digest) in sums.iter() {
            attributes.insert(attrs::checksum(algorithm.as_str()), digest.to_vec());
        }
        if let Err(e) = self.create_node_for_upload(attributes).await {
            error!(node_id = %self.session.node_id, "failed to create node: {}", e);
            self.fail().await;
            return Err(UploadError::NodeCreation(e));
        }

        if let Some(publisher) = self.engine.publisher.clone() {
            publisher.publish(self.bytes_received().await?).await?;
        }

        if self.engine.config.async_uploads {
            self.transition(UploadState::ProcessingAsyncPending)?;
            self.engine.store.persist(&self.session).await?;
            info!(node_id = %self.session.node_id, "upload committed, processing deferred");
        } else {
            self.transition(UploadState::ProcessingSync)?;
            let result = self.finalize().await;
            self.cleanup(result.is_err(), false).await;
            if let Err(e) = result {
                self.transition(UploadState::Failed)?;
                return Err(e);
            }
            self.transition(UploadState::Done)?;
            info!(node_id = %self.session.node_id, size = self.session.offset, "upload committed");
        }

        self.propagate().await
    }

    async fn bytes_received(&self) -> Result<BytesReceived> {
        let url = self.url()?;
        let space_owner = self.engine.lookup.space_owner(&self.session.space_root).await?;
        let resource_id = match &self.node {
            Some(node) => node.resource_id(),
            None => tusk_tree::ResourceId {
                space_id: self.session.space_root.clone(),
                opaque_id: self.session.node_id.clone(),
            },
        };
        Ok(BytesReceived {
            upload_id: self.session.id.clone(),
            url,
            space_owner,
            executing_user: self.session.executant.clone(),
            resource_id,
            filename: self.session.filename.clone(),
            filesize: self.session.filesize,
        })
    }

    /// Move the staged bytes into permanent blob storage.
    ///
    /// Cleanup is left to the caller.
    #[instrument(parent = &self.span, skip_all)]
    pub async fn finalize(&mut self) -> Result<()> {
        let node = match &self.node {
            Some(node) => node.clone(),
            None => {
                let node = self
                    .engine
                    .lookup
                    .read_node(&self.session.space_root, &self.session.node_id)
                    .await?;
                self.node = Some(node.clone());
                node
            }
        };

        self.engine
            .tree
            .write_blob(&node, &self.session.bin_path)
            .await
            .map_err(UploadError::BlobUpload)
    }

    /// Signed URL giving access to this upload's bytes through the data gateway
    pub fn url(&self) -> Result<String> {
        let tokens = &self.engine.config.tokens;
        let target = join_url(&[&tokens.download_endpoint, TUS_PREFIX, &self.session.id]);
        let token = self.engine.issuer.issue(&target).map_err(UploadError::Url)?;
        Ok(join_url(&[&tokens.data_gateway_endpoint, &token]))
    }

    /// Abort the upload, rolling back the node and removing staging file and session
    #[instrument(parent = &self.span, skip_all)]
    pub async fn terminate(&mut self) {
        self.cleanup_parts(true, true, true).await;
        self.unmark_processing().await;
        if !self.session.state.is_terminal() {
            self.session.state = UploadState::Failed;
        }
        info!(upload_id = %self.session.id, "upload terminated");
    }

    /// Clean up after processing.
    ///
    /// `failure` rolls back the node. Unless `keep_upload` is set the staging
    /// file and session record are removed. The processing marker is cleared
    /// either way.
    #[instrument(parent = &self.span, skip(self))]
    pub async fn cleanup(&mut self, failure: bool, keep_upload: bool) {
        self.cleanup_parts(failure, !keep_upload, !keep_upload).await;
        self.unmark_processing().await;
    }

    async fn fail(&mut self) {
        self.cleanup(true, false).await;
        self.session.state = UploadState::Failed;
    }

    async fn unmark_processing(&self) {
        let Some(node) = &self.node else {
            return;
        };
        if let Err(e) = self
            .engine
            .lookup
            .unmark_processing(node, &self.session.id)
            .await
        {
            error!(node_id = %node.id, "failed to unmark processing: {}", e);
        }
    }

    /// Node committed by this upload, also when the upload was reloaded
    /// from its session after the commit.
    ///
    /// A node found by id only counts if it still carries this upload's
    /// processing marker.
    async fn committed_node(&mut self) -> Option<Node> {
        if let Some(node) = &self.node {
            return Some(node.clone());
        }
        if self.session.state == UploadState::Receiving {
            return None;
        }

        match self
            .engine
            .lookup
            .read_node(&self.session.space_root, &self.session.node_id)
            .await
        {
            Ok(node) if node.processing_id() == Some(self.session.id.as_str()) => {
                self.node = Some(node.clone());
                Some(node)
            }
            Ok(_) => None,
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                error!(node_id = %self.session.node_id, "failed to resolve node for rollback: {}", e);
                None
            }
        }
    }

    async fn cleanup_parts(&mut self, clean_node: bool, clean_bin: bool, clean_info: bool) {
        if clean_node {
            self.rollback_node().await;
        }

        if clean_bin {
            if let Err(e) = staging::remove(&self.session.bin_path).await {
                error!(path = %self.session.bin_path.display(), "failed to remove staging file: {}", e);
            }
        }

        if clean_info {
            if let Err(e) = self.engine.store.purge(&self.session.id).await {
                error!(upload_id = %self.session.id, "failed to purge session: {}", e);
            }
        }
    }

    async fn rollback_node(&mut self) {
        let Some(node) = self.committed_node().await else {
            return;
        };
        let lookup = &self.engine.lookup;

        if self.session.versions_path.is_empty() {
            if let Err(e) = lookup.remove_node_entry(&node).await {
                error!(node_id = %node.id, "failed to remove node: {}", e);
            }
            if let Err(e) = lookup.remove_child_link(&node).await {
                error!(node_id = %node.id, "failed to remove node from parent: {}", e);
            }
            self.node = None;
            return;
        }

        let versions_path = &self.session.versions_path;
        if let Err(e) = lookup
            .copy_metadata(versions_path, &node, &restorable_attribute)
            .await
        {
            error!(node_id = %node.id, versions_path = %versions_path, "failed to restore node metadata: {}", e);
        }
        if let Err(e) = lookup.remove_version(versions_path).await {
            error!(versions_path = %versions_path, "failed to remove version: {}", e);
        }
    }

    async fn propagate(&self) -> Result<()> {
        let Some(node) = &self.node else {
            return Ok(());
        };
        let attempts = self.engine.config.propagation_retries + 1;
        let backoff = self.engine.config.propagation_backoff_ms;

        let mut attempt = 1;
        loop {
            match self.engine.tree.propagate(node, self.session.size_diff).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(attempt, node_id = %node.id, "propagation failed, retrying: {}", e);
                    tokio::time::sleep(Duration::from_millis(backoff * attempt as u64)).await;
                    attempt += 1;
                }
                Err(source) => {
                    error!(node_id = %node.id, attempts, "propagation failed: {}", source);
                    return Err(UploadError::PropagationFailed {
                        node_id: node.id.clone(),
                        attempts,
                        source,
                    });
                }
            }
        }
    }
}

impl StagedUpload for Upload {
    fn upload_id(&self) -> &str {
        &self.session.id
    }

    fn staging_path(&self) -> Option<&Path> {
        Some(&self.session.bin_path)
    }
}

impl std::fmt::Debug for Upload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upload")
            .field("session", &self.session)
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}
