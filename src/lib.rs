//! # Tusk
//!
//! Resumable, chunked uploads into a tree-structured storage backend.
//!
//! This crate re-exports the workspace crates:
//! - [`crypto`]: checksum pipeline and transfer tokens
//! - [`tree`]: storage tree contract and the in-memory backend
//! - [`engine`]: sessions and the upload engine
//!
//! ## Example
//!
//! ```rust,ignore
//! use tusk::engine::{Engine, EngineConfig, MemorySessionStore, NewUpload};
//! use tusk::tree::MemoryTree;
//!
//! let tree = MemoryTree::new();
//! tree.create_space("space", "alice");
//! let engine = Engine::new(
//!     EngineConfig::default(),
//!     Arc::new(MemorySessionStore::new("/tmp/uploads")),
//!     Arc::new(tree.clone()),
//!     Arc::new(tree.clone()),
//! );
//!
//! let mut upload = engine.initiate(NewUpload::new("space", "space", "a.txt").with_size(5)).await?;
//! upload.write_chunk(0, &mut &b"hello"[..]).await?;
//! upload.finish_upload().await?;
//! ```

pub use tusk_core as engine;
pub use tusk_crypto as crypto;
pub use tusk_tree as tree;

pub use tusk_core::{Engine, EngineConfig, NewUpload, Upload, UploadError, UploadState};
pub use tusk_tree::{Lookup, MemoryTree, Node, Tree};
