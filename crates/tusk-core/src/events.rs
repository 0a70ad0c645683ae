//! Bytes-received notifications for asynchronous consumers

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;
use tusk_tree::ResourceId;

/// Emitted once an upload is committed to the tree
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BytesReceived {
    pub upload_id: String,
    /// Signed URL granting access to the staged bytes
    pub url: String,
    pub space_owner: Option<String>,
    pub executing_user: String,
    pub resource_id: ResourceId,
    pub filename: String,
    pub filesize: u64,
}

/// Failure to hand an event to the transport
#[derive(Error, Debug)]
pub enum PublishError {
    /// The receiving side is gone
    #[error("event channel closed")]
    Closed,

    /// Transport specific failure
    #[error("failed to publish event: {0}")]
    Transport(String),
}

/// Event bus capability
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event: BytesReceived) -> std::result::Result<(), PublishError>;
}

/// Publishes into an unbounded tokio channel
#[derive(Clone, Debug)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<BytesReceived>,
}

impl ChannelPublisher {
    /// Create a publisher and the receiver its events arrive on
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BytesReceived>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, event: BytesReceived) -> std::result::Result<(), PublishError> {
        self.tx.send(event).map_err(|_| PublishError::Closed)
    }
}

/// Writes events to the log
#[derive(Clone, Copy, Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, event: BytesReceived) -> std::result::Result<(), PublishError> {
        info!(
            upload_id = %event.upload_id,
            resource = %event.resource_id,
            executant = %event.executing_user,
            filename = %event.filename,
            filesize = event.filesize,
            url = %event.url,
            "bytes received"
        );
        Ok(())
    }
}
