//! Upload engine: shared capability handles and session entry points

use crate::{
    config::EngineConfig, events::Publisher, staging, store::SessionStore, Result, Session,
    Upload, UploadError, UploadState,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, info_span, instrument, warn, Span};
use tusk_crypto::{ChecksumAlgorithm, ExpectedChecksum, TokenIssuer};
use tusk_tree::{Lookup, Tree, TreeError};
use uuid::Uuid;

/// Parameters of a new upload
#[derive(Clone, Debug)]
pub struct NewUpload {
    pub space_id: String,
    /// Directory the file is uploaded into
    pub parent_id: String,
    pub name: String,
    /// Total size; `None` defers it until `declare_length`
    pub size: Option<u64>,
    pub checksum: Option<ExpectedChecksum>,
    pub executant: String,
    pub lock_id: String,
    pub metadata: BTreeMap<String, String>,
    pub mtime: Option<DateTime<Utc>>,
}

impl NewUpload {
    /// Upload `name` into `parent_id` with a deferred size
    pub fn new(
        space_id: impl Into<String>,
        parent_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            space_id: space_id.into(),
            parent_id: parent_id.into(),
            name: name.into(),
            size: None,
            checksum: None,
            executant: String::new(),
            lock_id: String::new(),
            metadata: BTreeMap::new(),
            mtime: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_checksum(mut self, checksum: ExpectedChecksum) -> Self {
        self.checksum = Some(checksum);
        self
    }

    pub fn with_executant(mut self, executant: impl Into<String>) -> Self {
        self.executant = executant.into();
        self
    }

    pub fn with_lock_id(mut self, lock_id: impl Into<String>) -> Self {
        self.lock_id = lock_id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_mtime(mut self, mtime: DateTime<Utc>) -> Self {
        self.mtime = Some(mtime);
        self
    }
}

/// Shared handles every upload is bound to
///
/// Cloning is cheap; all clones share the same store, tree and publisher.
#[derive(Clone)]
pub struct Engine {
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) tree: Arc<dyn Tree>,
    pub(crate) lookup: Arc<dyn Lookup>,
    pub(crate) publisher: Option<Arc<dyn Publisher>>,
    pub(crate) issuer: TokenIssuer,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) span: Span,
}

impl Engine {
    /// Create an engine without an event publisher
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn SessionStore>,
        tree: Arc<dyn Tree>,
        lookup: Arc<dyn Lookup>,
    ) -> Self {
        let issuer = TokenIssuer::new(
            config.tokens.transfer_shared_secret.clone(),
            Duration::seconds(config.tokens.transfer_expires_secs as i64),
        );
        Self {
            store,
            tree,
            lookup,
            publisher: None,
            issuer,
            config: Arc::new(config),
            span: info_span!("tusk"),
        }
    }

    /// Publish a bytes-received event for every committed upload
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Parent span of all upload spans
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    /// Start a new upload: resolve the target, create the staging file and
    /// persist the session.
    #[instrument(parent = &self.span, skip_all, fields(space = %request.space_id, name = %request.name))]
    pub async fn initiate(&self, request: NewUpload) -> Result<Upload> {
        if let Some(size) = request.size {
            if size > self.config.max_upload_size {
                return Err(UploadError::UploadTooLarge {
                    size,
                    max: self.config.max_upload_size,
                });
            }
        }

        let parent = self
            .lookup
            .read_node(&request.space_id, &request.parent_id)
            .await?;
        if !parent.is_dir() {
            return Err(TreeError::InvalidNodeKind {
                node_id: parent.id,
                expected: "directory".to_string(),
            }
            .into());
        }

        let node_id = match self
            .lookup
            .child(&request.space_id, &request.parent_id, &request.name)
            .await?
        {
            Some(existing) if existing.is_dir() => {
                return Err(TreeError::InvalidNodeKind {
                    node_id: existing.id,
                    expected: "file".to_string(),
                }
                .into())
            }
            Some(existing) => existing.id,
            None => Uuid::new_v4().to_string(),
        };

        let id = Uuid::new_v4().to_string();
        let bin_path = self.store.staging_path(&id);
        staging::create(&bin_path).await?;

        let declared = |algorithm: ChecksumAlgorithm| match &request.checksum {
            Some(c) if c.algorithm == algorithm => c.value.clone(),
            _ => String::new(),
        };
        let now = Utc::now();
        let session = Session {
            id,
            bin_path,
            offset: 0,
            size: request.size.unwrap_or(0),
            size_is_deferred: request.size.is_none(),
            checksum_sha1: declared(ChecksumAlgorithm::Sha1),
            checksum_md5: declared(ChecksumAlgorithm::Md5),
            checksum_adler32: declared(ChecksumAlgorithm::Adler32),
            space_root: request.space_id,
            node_id,
            node_parent_id: request.parent_id,
            filename: request.name.clone(),
            node_name: request.name,
            versions_path: String::new(),
            lock_id: request.lock_id,
            filesize: request.size.unwrap_or(0),
            size_diff: 0,
            executant: request.executant,
            state: UploadState::Receiving,
            metadata: request.metadata,
            mtime: request.mtime,
            created_at: now,
            expires: now + self.config.session_ttl(),
        };
        self.store.persist(&session).await?;

        info!(
            upload_id = %session.id,
            node_id = %session.node_id,
            deferred = session.size_is_deferred,
            "upload initiated"
        );
        Ok(Upload::new(self.clone(), session))
    }

    /// Rebuild an upload from its stored session
    pub async fn load(&self, id: &str) -> Result<Upload> {
        let session = self.store.get(id).await?;
        Ok(Upload::new(self.clone(), session))
    }

    /// Finish an upload left in `ProcessingAsyncPending`: store the blob, then
    /// clean up according to the outcome.
    #[instrument(parent = &self.span, skip(self))]
    pub async fn resume_pending(&self, id: &str) -> Result<()> {
        let mut upload = self.load(id).await?;
        if upload.state() != UploadState::ProcessingAsyncPending {
            return Err(UploadError::InvalidTransition {
                from: upload.state(),
                to: UploadState::Done,
            });
        }

        match upload.finalize().await {
            Ok(()) => {
                upload.cleanup(false, false).await;
                upload.transition(UploadState::Done)?;
                info!(upload_id = %id, "asynchronous processing finished");
                Ok(())
            }
            Err(e) => {
                warn!(upload_id = %id, "asynchronous processing failed: {}", e);
                upload.cleanup(true, false).await;
                upload.transition(UploadState::Failed)?;
                Err(e)
            }
        }
    }

    /// Terminate every unfinished session that expired before `now`
    #[instrument(parent = &self.span, skip(self))]
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut swept = 0;
        for session in self.store.list().await? {
            if !session.is_expired(now) {
                continue;
            }
            let id = session.id.clone();
            let mut upload = Upload::new(self.clone(), session);
            upload.terminate().await;
            info!(upload_id = %id, "expired upload terminated");
            swept += 1;
        }
        Ok(swept)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("publisher", &self.publisher.is_some())
            .finish_non_exhaustive()
    }
}
