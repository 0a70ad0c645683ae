//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Upload engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Data directory holding staging files and session records
    pub root: PathBuf,
    /// Leave blob materialization to an external driver
    pub async_uploads: bool,
    /// Extra propagation attempts after a failed first one
    pub propagation_retries: u32,
    /// Base backoff between propagation attempts (milliseconds)
    pub propagation_backoff_ms: u64,
    /// Lifetime of an unfinished upload session (seconds)
    pub session_ttl_secs: u64,
    /// Maximum declared upload size (bytes)
    pub max_upload_size: u64,
    /// Transfer token settings
    pub tokens: TokenOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data"),
            async_uploads: false,
            propagation_retries: 2,
            propagation_backoff_ms: 50,
            session_ttl_secs: 24 * 60 * 60, // 24 hours
            max_upload_size: 5 * 1024 * 1024 * 1024 * 1024, // 5 TB
            tokens: TokenOptions::default(),
        }
    }
}

impl EngineConfig {
    /// Directory holding staging files and `.info` session records
    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join("uploads")
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_ttl_secs as i64)
    }
}

/// Transfer token settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenOptions {
    /// Base URL uploads are downloadable from
    pub download_endpoint: String,
    /// Gateway that accepts signed transfer tokens
    pub data_gateway_endpoint: String,
    /// HS256 shared secret
    pub transfer_shared_secret: String,
    /// Token lifetime (seconds)
    pub transfer_expires_secs: u64,
}

impl Default for TokenOptions {
    fn default() -> Self {
        Self {
            download_endpoint: "https://localhost:9200/data".to_string(),
            data_gateway_endpoint: "https://localhost:9200/data".to_string(),
            transfer_shared_secret: String::new(),
            transfer_expires_secs: 24 * 60 * 60, // 24 hours
        }
    }
}

impl std::fmt::Debug for TokenOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenOptions")
            .field("download_endpoint", &self.download_endpoint)
            .field("data_gateway_endpoint", &self.data_gateway_endpoint)
            .field("transfer_shared_secret", &"<redacted>")
            .field("transfer_expires_secs", &self.transfer_expires_secs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(!config.async_uploads);
        assert_eq!(config.propagation_retries, 2);
        assert_eq!(config.uploads_dir(), PathBuf::from("./data/uploads"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"async_uploads": true, "tokens": {"transfer_shared_secret": "s"}}"#)
                .unwrap();
        assert!(config.async_uploads);
        assert_eq!(config.tokens.transfer_shared_secret, "s");
        assert_eq!(config.tokens.transfer_expires_secs, 86400);
        assert_eq!(config.session_ttl_secs, 86400);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let mut options = TokenOptions::default();
        options.transfer_shared_secret = "hunter2".to_string();
        assert!(!format!("{:?}", options).contains("hunter2"));
    }
}
