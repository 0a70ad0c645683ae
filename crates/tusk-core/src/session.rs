//! Durable upload session record

use crate::state::UploadState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tusk_crypto::ExpectedChecksum;

/// Progress and identity of one upload
///
/// This is the only upload state trusted across process restarts. It is
/// persisted explicitly by the session store, never automatically.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Upload id (UUID v4)
    pub id: String,
    /// Staging file accumulating chunk data
    pub bin_path: PathBuf,
    /// Bytes appended to the staging file
    pub offset: u64,
    /// Declared total size, meaningful unless `size_is_deferred`
    pub size: u64,
    pub size_is_deferred: bool,

    /// Expected digests, hex; empty means not declared
    #[serde(default)]
    pub checksum_sha1: String,
    #[serde(default)]
    pub checksum_md5: String,
    #[serde(default)]
    pub checksum_adler32: String,

    /// Space the target node lives in
    pub space_root: String,
    /// Target node id, either existing or assigned at initiation
    pub node_id: String,
    /// Parent directory of the target
    pub node_parent_id: String,
    /// Name of the target within its parent
    pub node_name: String,
    /// Version snapshot taken when overwriting an existing node
    #[serde(default)]
    pub versions_path: String,

    #[serde(default)]
    pub lock_id: String,
    pub filename: String,
    /// Size of the file as known when committing
    pub filesize: u64,
    /// Size change to propagate to ancestors
    #[serde(default)]
    pub size_diff: i64,
    /// Acting user
    #[serde(default)]
    pub executant: String,

    #[serde(default)]
    pub state: UploadState,
    /// Free-form metadata from the creation request
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Client supplied modification time
    #[serde(default)]
    pub mtime: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

/// Progress report for the resumable protocol
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: String,
    pub offset: u64,
    pub size: u64,
    pub size_is_deferred: bool,
    pub metadata: BTreeMap<String, String>,
}

impl Session {
    /// The digest to verify, following the fixed algorithm priority
    pub fn expected_checksum(&self) -> Option<ExpectedChecksum> {
        ExpectedChecksum::select(&self.checksum_sha1, &self.checksum_md5, &self.checksum_adler32)
    }

    pub fn to_file_info(&self) -> FileInfo {
        FileInfo {
            id: self.id.clone(),
            offset: self.offset,
            size: self.size,
            size_is_deferred: self.size_is_deferred,
            metadata: self.metadata.clone(),
        }
    }

    /// Whether an unfinished session has outlived its expiry
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_terminal() && self.expires <= now
    }

    /// Whether all declared bytes have arrived
    pub fn is_complete(&self) -> bool {
        !self.size_is_deferred && self.offset == self.size
    }

    /// Bytes still accepted before reaching the declared size
    pub fn remaining(&self) -> Option<u64> {
        (!self.size_is_deferred).then(|| self.size.saturating_sub(self.offset))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;
    use tusk_crypto::ChecksumAlgorithm;

    pub(crate) fn sample_session() -> Session {
        let now = Utc::now();
        Session {
            id: "9b2f6a0e-5c1d-4e4b-9d57-0f5a3c1e2d11".to_string(),
            bin_path: PathBuf::from("/tmp/uploads/9b2f6a0e-5c1d-4e4b-9d57-0f5a3c1e2d11"),
            offset: 0,
            size: 1024,
            size_is_deferred: false,
            checksum_sha1: String::new(),
            checksum_md5: String::new(),
            checksum_adler32: String::new(),
            space_root: "space".to_string(),
            node_id: "node".to_string(),
            node_parent_id: "space".to_string(),
            node_name: "a.txt".to_string(),
            versions_path: String::new(),
            lock_id: String::new(),
            filename: "a.txt".to_string(),
            filesize: 1024,
            size_diff: 0,
            executant: "alice".to_string(),
            state: UploadState::Receiving,
            metadata: BTreeMap::new(),
            mtime: None,
            created_at: now,
            expires: now + Duration::hours(1),
        }
    }

    #[test]
    fn test_expected_checksum_priority() {
        let mut session = sample_session();
        assert!(session.expected_checksum().is_none());

        session.checksum_md5 = "abcd".to_string();
        session.checksum_adler32 = "1234".to_string();
        let expected = session.expected_checksum().unwrap();
        assert_eq!(expected.algorithm, ChecksumAlgorithm::Md5);
        assert_eq!(expected.value, "abcd");
    }

    #[test]
    fn test_file_info() {
        let mut session = sample_session();
        session.offset = 10;
        session.metadata.insert("filename".to_string(), "a.txt".to_string());

        let info = session.to_file_info();
        assert_eq!(info.offset, 10);
        assert_eq!(info.size, 1024);
        assert_eq!(info.metadata.get("filename").map(String::as_str), Some("a.txt"));
    }

    #[test]
    fn test_expiry_ignores_finished_sessions() {
        let mut session = sample_session();
        let later = session.expires + Duration::seconds(1);
        assert!(session.is_expired(later));
        assert!(!session.is_expired(session.created_at));

        session.state = UploadState::Done;
        assert!(!session.is_expired(later));
    }

    #[test]
    fn test_remaining() {
        let mut session = sample_session();
        session.offset = 1000;
        assert_eq!(session.remaining(), Some(24));
        assert!(!session.is_complete());

        session.size_is_deferred = true;
        assert_eq!(session.remaining(), None);
    }

    #[test]
    fn test_json_roundtrip_keeps_state() {
        let mut session = sample_session();
        session.state = UploadState::ProcessingAsyncPending;
        let json = serde_json::to_string(&session).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back, session);
    }
}
