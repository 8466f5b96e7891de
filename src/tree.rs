//! Tree store
//!
//! An arena of File and Case nodes keyed by [`NodeId`]. The store owns every
//! node; callers hold ids, never references. Each mutation is reported to an
//! optional presentation sink as a [`TreeEvent`].

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::{TreeError, TreeResult};
use crate::id::{self, NodeId};
use crate::test_model::{CaseSpan, Location, Node, NodeKind, NodeOutcome, NodeSnapshot, TreeStats};

/// Notification for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TreeEvent {
    NodeCreated(NodeSnapshot),
    NodeUpdated(NodeSnapshot),
    NodeRemoved { id: NodeId, kind: NodeKind },
    /// A full discovery pass finished
    DiscoveryFinished { files: usize },
}

/// Result of [`TreeStore::upsert_file`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted {
    pub id: NodeId,
    pub created: bool,
}

/// What [`TreeStore::set_children`] changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildrenDiff {
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
    pub kept: Vec<NodeId>,
}

/// In-memory forest of file and case nodes
#[derive(Default)]
pub struct TreeStore {
    nodes: HashMap<NodeId, Node>,
    /// File ids in first-observation order
    files: Vec<NodeId>,
    next_serial: u64,
    event_tx: Option<UnboundedSender<TreeEvent>>,
}

impl TreeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sink that receives node notifications
    pub fn with_event_sender(mut self, tx: UnboundedSender<TreeEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn emit(&self, event: TreeEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// File node ids in first-observation order
    pub fn file_ids(&self) -> &[NodeId] {
        &self.files
    }

    pub fn files(&self) -> impl Iterator<Item = &Node> {
        self.files.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Children of a File node, in scan order
    pub fn children(&self, id: &NodeId) -> Vec<&Node> {
        self.nodes
            .get(id)
            .map(|node| {
                node.children
                    .iter()
                    .filter_map(|child| self.nodes.get(child))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn file_id_for_path(&self, path: &Path) -> Option<NodeId> {
        let key = path.to_str()?;
        let id = id::encode(key, None);
        self.nodes.contains_key(&id).then_some(id)
    }

    pub fn stats(&self) -> TreeStats {
        TreeStats::from_nodes(self.nodes.values())
    }

    /// Return the File node for `path`, creating it if needed
    pub fn upsert_file(&mut self, path: &Path) -> TreeResult<Upserted> {
        let key = path_key(path)?;
        let id = id::encode(key, None);

        if self.nodes.contains_key(&id) {
            tracing::debug!(file = %path.display(), "found a file node");
            return Ok(Upserted { id, created: false });
        }

        tracing::debug!(file = %path.display(), "creating a file node");
        let label = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| key.to_string());

        let node = Node {
            id: id.clone(),
            kind: NodeKind::File,
            label,
            location: Location::file(path),
            parent: None,
            children: Vec::new(),
            busy: false,
            error: None,
            last_outcome: None,
            serial: self.allocate_serial(),
            loaded: false,
            stale: false,
        };

        self.emit(TreeEvent::NodeCreated(node.snapshot()));
        self.nodes.insert(id.clone(), node);
        self.files.push(id.clone());

        Ok(Upserted { id, created: true })
    }

    /// Remove a File node and all its cases. Returns whether it existed.
    pub fn remove_file(&mut self, path: &Path) -> bool {
        match self.file_id_for_path(path) {
            Some(id) => self.remove_file_by_id(&id),
            None => false,
        }
    }

    pub fn remove_file_by_id(&mut self, id: &NodeId) -> bool {
        let Some(node) = self.nodes.get(id) else {
            return false;
        };
        if !node.is_file() {
            return false;
        }

        let children = node.children.clone();
        for child in children {
            self.remove_node(&child);
        }
        self.remove_node(id);
        self.files.retain(|file| file != id);
        true
    }

    /// Replace a File node's cases, preserving nodes whose id is unchanged
    pub fn set_children(&mut self, file_id: &NodeId, cases: &[CaseSpan]) -> TreeResult<ChildrenDiff> {
        let file = self
            .nodes
            .get(file_id)
            .filter(|node| node.is_file())
            .ok_or_else(|| TreeError::UnknownNode(file_id.to_string()))?;

        let path = file.location.path.clone();
        let key = path_key(&path)?.to_string();
        let previous_order = file.children.clone();
        let previous: HashSet<NodeId> = previous_order.iter().cloned().collect();

        let mut diff = ChildrenDiff::default();
        let mut order = Vec::with_capacity(cases.len());
        let mut seen = HashSet::with_capacity(cases.len());

        for case in cases {
            let case_id = id::encode(&key, Some(&case.name));
            if !seen.insert(case_id.clone()) {
                tracing::debug!(case = %case.name, "skipping duplicate case name");
                continue;
            }

            if previous.contains(&case_id) {
                self.refresh_case_location(&case_id, &path, case.line);
                diff.kept.push(case_id.clone());
            } else {
                let node = Node {
                    id: case_id.clone(),
                    kind: NodeKind::Case,
                    label: case.name.clone(),
                    location: Location::at(&path, case.line, 1),
                    parent: Some(file_id.clone()),
                    children: Vec::new(),
                    busy: false,
                    error: None,
                    last_outcome: None,
                    serial: self.allocate_serial(),
                    loaded: true,
                    stale: false,
                };
                self.emit(TreeEvent::NodeCreated(node.snapshot()));
                self.nodes.insert(case_id.clone(), node);
                diff.added.push(case_id.clone());
            }
            order.push(case_id);
        }

        for stale in previous_order.into_iter().filter(|id| !seen.contains(id)) {
            self.remove_node(&stale);
            diff.removed.push(stale);
        }

        if let Some(file) = self.nodes.get_mut(file_id) {
            file.children = order;
            file.loaded = true;
            file.stale = false;
        }

        Ok(diff)
    }

    pub fn set_busy(&mut self, id: &NodeId, busy: bool) {
        self.update(id, |node| {
            let changed = node.busy != busy;
            node.busy = busy;
            changed
        });
    }

    pub fn set_error(&mut self, id: &NodeId, error: Option<String>) {
        self.update(id, |node| {
            let changed = node.error != error;
            node.error = error;
            changed
        });
    }

    /// Flag a File node for reload on the next children request
    pub fn mark_stale(&mut self, id: &NodeId) {
        if let Some(node) = self.nodes.get_mut(id) {
            if node.is_file() {
                node.stale = true;
            }
        }
    }

    /// Store a run result; errored outcomes also set the node error
    pub fn record_outcome(&mut self, id: &NodeId, outcome: NodeOutcome) {
        self.update(id, |node| {
            node.error = match outcome.outcome {
                crate::test_model::Outcome::Errored => outcome.message.clone(),
                _ => None,
            };
            node.last_outcome = Some(outcome);
            true
        });
    }

    fn update(&mut self, id: &NodeId, f: impl FnOnce(&mut Node) -> bool) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        if !f(node) {
            return;
        }
        let snapshot = node.snapshot();
        self.emit(TreeEvent::NodeUpdated(snapshot));
    }

    fn refresh_case_location(&mut self, id: &NodeId, path: &Path, line: u32) {
        self.update(id, |node| {
            if node.location.line == Some(line) {
                return false;
            }
            node.location = Location::at(path, line, 1);
            true
        });
    }

    fn remove_node(&mut self, id: &NodeId) {
        if let Some(node) = self.nodes.remove(id) {
            self.emit(TreeEvent::NodeRemoved {
                id: node.id,
                kind: node.kind,
            });
        }
    }

    fn allocate_serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }
}

fn path_key(path: &Path) -> TreeResult<&str> {
    path.to_str().ok_or_else(|| TreeError::InvalidIdentifier {
        id: path.to_string_lossy().into_owned(),
        reason: "path is not valid UTF-8",
    })
}

/// Tree store shared between the discoverer, loader and runs
///
/// The lock is only taken for short synchronous sections and never held
/// across an `.await`.
#[derive(Clone, Default)]
pub struct SharedTree(Arc<Mutex<TreeStore>>);

impl SharedTree {
    pub fn new(store: TreeStore) -> Self {
        Self(Arc::new(Mutex::new(store)))
    }

    pub fn lock(&self) -> MutexGuard<'_, TreeStore> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
