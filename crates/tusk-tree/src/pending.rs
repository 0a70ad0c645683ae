//! Two-phase tree mutations
//!
//! Recycle restore and purge first resolve the nodes involved and hand them
//! back to the caller, who does its own bookkeeping before calling
//! [`PendingCommit::apply`]. Nothing changes in the tree until then.

use crate::{Node, Result};
use async_trait::async_trait;

/// The deferred side effect of a prepared mutation
#[async_trait]
pub trait CommitAction: Send {
    /// Perform the mutation
    async fn apply(self: Box<Self>) -> Result<()>;
}

/// A prepared mutation together with the nodes it affects
#[must_use = "a pending commit has no effect until applied"]
pub struct PendingCommit {
    nodes: Vec<Node>,
    action: Box<dyn CommitAction>,
}

impl PendingCommit {
    /// Wrap an action and the nodes it will touch
    pub fn new(nodes: Vec<Node>, action: Box<dyn CommitAction>) -> Self {
        Self { nodes, action }
    }

    /// Nodes affected by this mutation, in backend-defined order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Apply the mutation and return the affected nodes
    pub async fn apply(self) -> Result<Vec<Node>> {
        self.action.apply().await?;
        Ok(self.nodes)
    }

    /// Drop the mutation without applying it
    pub fn discard(self) -> Vec<Node> {
        self.nodes
    }
}

impl std::fmt::Debug for PendingCommit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCommit")
            .field("nodes", &self.nodes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Flag(Arc<AtomicBool>);

    #[async_trait]
    impl CommitAction for Flag {
        async fn apply(self: Box<Self>) -> Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_apply_runs_action() {
        let applied = Arc::new(AtomicBool::new(false));
        let node = Node::new_file("s", "n", "s", "f");
        let pending = PendingCommit::new(vec![node.clone()], Box::new(Flag(applied.clone())));

        assert_eq!(pending.nodes(), &[node.clone()]);
        assert!(!applied.load(Ordering::SeqCst));

        let nodes = pending.apply().await.unwrap();
        assert!(applied.load(Ordering::SeqCst));
        assert_eq!(nodes, vec![node]);
    }

    #[test]
    fn test_discard_skips_action() {
        let applied = Arc::new(AtomicBool::new(false));
        let pending = PendingCommit::new(vec![], Box::new(Flag(applied.clone())));
        assert!(pending.discard().is_empty());
        assert!(!applied.load(Ordering::SeqCst));
    }
}
