//! Application state

use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tusk_core::{Engine, EngineConfig, FileSessionStore, LogPublisher};
use tusk_tree::{MemoryTree, Tree};

/// File name of the tree snapshot under the data root
pub const TREE_SNAPSHOT: &str = "tree.json";

/// Handles shared by all commands
pub struct AppState {
    /// Upload engine
    pub engine: Engine,
    /// Storage tree, persisted to a snapshot after each command
    pub tree: MemoryTree,
}

impl AppState {
    /// Open the session store and tree under the configured root
    pub async fn open(config: EngineConfig, log_events: bool) -> anyhow::Result<Self> {
        let snapshot: PathBuf = config.root.join(TREE_SNAPSHOT);
        let tree = MemoryTree::open(&snapshot).await?;
        tree.setup().await?;
        let store = FileSessionStore::open(config.uploads_dir()).await?;

        info!(
            root = %config.root.display(),
            nodes = tree.node_count(),
            async_uploads = config.async_uploads,
            "opened data root"
        );

        let mut engine = Engine::new(
            config,
            Arc::new(store),
            Arc::new(tree.clone()),
            Arc::new(tree.clone()),
        );
        if log_events {
            engine = engine.with_publisher(Arc::new(LogPublisher));
        }

        Ok(Self { engine, tree })
    }

    /// Persist the tree snapshot
    pub async fn flush(&self) -> anyhow::Result<()> {
        self.tree.flush().await?;
        Ok(())
    }
}
