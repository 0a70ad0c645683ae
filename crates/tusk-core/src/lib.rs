//! # Tusk Core
//!
//! Resumable, chunked upload engine on top of a storage tree.
//!
//! This crate provides:
//! - **Sessions**: durable upload progress records and the stores that keep them
//! - **Chunk staging**: append-only, pause-tolerant staging files
//! - **Upload orchestration**: verification, node commit, blob materialization,
//!   rollback and size propagation
//! - **Events**: bytes-received notifications for asynchronous consumers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Resumable upload verbs         │
//! ├─────────────────────────────────────────┤
//! │       Engine  ──  Upload (per session)  │
//! ├──────────────┬──────────────┬───────────┤
//! │ SessionStore │  Tree/Lookup │ Publisher │
//! ├──────────────┴──────────────┴───────────┤
//! │   Staging files   │   tusk-crypto       │
//! └─────────────────────────────────────────┘
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
mod processing;
pub mod session;
mod staging;
pub mod state;
pub mod store;
pub mod transfer;
pub mod upload;

pub use config::{EngineConfig, TokenOptions};
pub use engine::{Engine, NewUpload};
pub use error::{Result, UploadError};
pub use events::{BytesReceived, ChannelPublisher, LogPublisher, PublishError, Publisher};
pub use session::{FileInfo, Session};
pub use state::UploadState;
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
pub use upload::{StagedUpload, Upload, TUS_PREFIX};
