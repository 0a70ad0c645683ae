//! Upload lifecycle state machine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an upload
///
/// ```text
/// Receiving -> Committing -> ProcessingSync ---------> Done | Failed
///                        \-> ProcessingAsyncPending -> Done | Failed
/// ```
///
/// Any non-terminal state may also move to `Failed` when the upload is
/// terminated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    /// Accepting chunks
    #[default]
    Receiving,
    /// Verifying checksums and materializing the node
    Committing,
    /// Moving the blob in the caller's task
    ProcessingSync,
    /// Committed, waiting for an external driver to finalize
    ProcessingAsyncPending,
    /// Blob stored and cleanup done
    Done,
    /// Rolled back or terminated
    Failed,
}

impl UploadState {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: UploadState) -> bool {
        use UploadState::*;
        match (self, next) {
            (Done, _) | (Failed, _) => false,
            (_, Failed) => true,
            (Receiving, Committing) => true,
            (Committing, ProcessingSync) | (Committing, ProcessingAsyncPending) => true,
            (ProcessingSync, Done) | (ProcessingAsyncPending, Done) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Receiving => "receiving",
            Self::Committing => "committing",
            Self::ProcessingSync => "processing_sync",
            Self::ProcessingAsyncPending => "processing_async_pending",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
