//! Session persistence
//!
//! Sessions are saved only when the engine asks for it. On load the offset is
//! re-derived from the staging file, since chunk writes do not persist the
//! offset themselves.

use crate::{Result, Session, UploadError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Extension of session records next to their staging file
pub const INFO_EXTENSION: &str = "info";

/// Durable storage for upload sessions
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Save the session, replacing any previous record
    async fn persist(&self, session: &Session) -> Result<()>;

    /// Load a session; `SessionNotFound` when absent
    async fn get(&self, id: &str) -> Result<Session>;

    /// Remove a session record; removing a missing record succeeds
    async fn purge(&self, id: &str) -> Result<()>;

    /// All stored sessions
    async fn list(&self) -> Result<Vec<Session>>;

    /// Staging file location for an upload id
    fn staging_path(&self, id: &str) -> PathBuf;
}

/// Length of a staging file, `None` when it does not exist
async fn staged_len(path: &Path) -> Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn rederive_offset(mut session: Session) -> Result<Session> {
    if let Some(len) = staged_len(&session.bin_path).await? {
        if len != session.offset {
            debug!(
                upload_id = %session.id,
                recorded = session.offset,
                staged = len,
                "re-derived offset from staging file"
            );
            session.offset = len;
        }
    }
    Ok(session)
}

/// Sessions as JSON files under one directory
///
/// ```text
/// <dir>/<id>        staging bytes
/// <dir>/<id>.info   session record
/// ```
#[derive(Clone, Debug)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    /// Create a store rooted at `dir`, creating the directory if needed
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn info_path(&self, id: &str) -> Result<PathBuf> {
        // ids end up in file names
        Uuid::parse_str(id).map_err(|_| UploadError::SessionNotFound(id.to_string()))?;
        Ok(self.dir.join(format!("{}.{}", id, INFO_EXTENSION)))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn persist(&self, session: &Session) -> Result<()> {
        let path = self.info_path(&session.id)?;
        let tmp = path.with_extension("info.tmp");
        let raw = serde_json::to_vec_pretty(session)?;
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Session> {
        let path = self.info_path(id)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(UploadError::SessionNotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let session: Session = serde_json::from_slice(&raw)?;
        rederive_offset(session).await
    }

    async fn purge(&self, id: &str) -> Result<()> {
        let path = self.info_path(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(INFO_EXTENSION) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.get(id).await {
                Ok(session) => sessions.push(session),
                Err(e) => warn!(path = %path.display(), "skipping unreadable session: {}", e),
            }
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    fn staging_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }
}

/// In-memory session store with on-disk staging files, for testing
#[derive(Clone, Debug)]
pub struct MemorySessionStore {
    sessions: Arc<DashMap<String, Session>>,
    staging_dir: PathBuf,
}

impl MemorySessionStore {
    /// Create a store whose staging files live in `staging_dir`
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            staging_dir: staging_dir.into(),
        }
    }

    /// Number of stored sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn persist(&self, session: &Session) -> Result<()> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Session> {
        let session = self
            .sessions
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| UploadError::SessionNotFound(id.to_string()))?;
        rederive_offset(session).await
    }

    async fn purge(&self, id: &str) -> Result<()> {
        self.sessions.remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self.sessions.iter().map(|r| r.clone()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    fn staging_path(&self, id: &str) -> PathBuf {
        self.staging_dir.join(id)
    }
}
