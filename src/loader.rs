//! Loader
//!
//! Parses a file node's contents and reconciles the resulting cases with the
//! node's existing children. The file's busy flag doubles as the per-file
//! load lock.

use std::sync::Arc;

use crate::error::{TreeError, TreeResult};
use crate::id::NodeId;
use crate::parser::Parser;
use crate::test_model::CaseSpan;
use crate::tree::SharedTree;

/// Loads case nodes for file nodes on demand
#[derive(Clone)]
pub struct Loader {
    tree: SharedTree,
    parser: Arc<dyn Parser>,
}

impl Loader {
    pub fn new(tree: SharedTree, parser: Arc<dyn Parser>) -> Self {
        Self { tree, parser }
    }

    /// Parse `file_id` and replace its children
    ///
    /// Returns `Ok(None)` when another load of the same file is in flight.
    /// On failure the file's existing children are left in place and its
    /// error field carries the message.
    pub async fn load(&self, file_id: &NodeId) -> TreeResult<Option<Vec<CaseSpan>>> {
        let path = {
            let mut tree = self.tree.lock();
            let node = tree
                .get(file_id)
                .filter(|node| node.is_file())
                .ok_or_else(|| TreeError::UnknownNode(file_id.to_string()))?;
            if node.busy {
                tracing::debug!(file = %node.location, "load already in flight, skipping");
                return Ok(None);
            }
            let path = node.location.path.clone();
            tree.set_busy(file_id, true);
            path
        };
        let _busy = BusyGuard::new(&self.tree, file_id);

        tracing::info!(file = %path.display(), "loading tests from file");

        let parsed = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => self
                .parser
                .parse(&contents)
                .map_err(|source| TreeError::Parse {
                    path: path.clone(),
                    source,
                }),
            Err(source) => Err(TreeError::io(&path, source)),
        };

        let mut tree = self.tree.lock();
        match parsed {
            Ok(cases) => {
                tree.set_error(file_id, None);
                let diff = tree.set_children(file_id, &cases)?;
                tracing::debug!(
                    file = %path.display(),
                    added = diff.added.len(),
                    removed = diff.removed.len(),
                    kept = diff.kept.len(),
                    "children reconciled"
                );
                Ok(Some(cases))
            }
            Err(err) => {
                tracing::warn!("parsing test file errored with reason: {}", err);
                tree.set_error(file_id, Some(err.node_message()));
                Err(err)
            }
        }
    }
}

/// Clears a node's busy flag when dropped, on every exit path
pub(crate) struct BusyGuard<'a> {
    tree: &'a SharedTree,
    id: &'a NodeId,
}

impl<'a> BusyGuard<'a> {
    pub(crate) fn new(tree: &'a SharedTree, id: &'a NodeId) -> Self {
        Self { tree, id }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.tree.lock().set_busy(self.id, false);
    }
}
