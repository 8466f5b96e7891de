//! Session
//!
//! One editor-session's worth of state: the tree plus the discoverer, loader
//! and run coordinator that operate on it. Nothing here outlives the process.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::Config;
use crate::discovery::{Discoverer, TestFilePattern};
use crate::error::TreeResult;
use crate::executor::{CommandExecutor, Executor};
use crate::id::{decode, NodeId};
use crate::loader::Loader;
use crate::parser::{MarkerParser, Parser};
use crate::run::{CancelToken, RunCoordinator, RunEvent, RunSummary};
use crate::selection::{resolve, Plan};
use crate::test_model::{NodeSnapshot, TreeStats};
use crate::tree::{SharedTree, TreeEvent, TreeStore};
use crate::watcher::FsEvent;

/// Optional wiring for a [`Session`]
#[derive(Default)]
pub struct SessionOptions {
    pub refresh_on_save: bool,
    pub tree_events: Option<UnboundedSender<TreeEvent>>,
    pub run_events: Option<UnboundedSender<RunEvent>>,
}

/// A file node together with its cases
#[derive(Debug, Clone, serde::Serialize)]
pub struct FileListing {
    #[serde(flatten)]
    pub file: NodeSnapshot,
    pub children: Vec<NodeSnapshot>,
}

pub struct Session {
    tree: SharedTree,
    loader: Loader,
    discoverer: Discoverer,
    coordinator: RunCoordinator,
}

impl Session {
    pub fn new(
        pattern: TestFilePattern,
        parser: Arc<dyn Parser>,
        executor: Arc<dyn Executor>,
        options: SessionOptions,
    ) -> Self {
        let mut store = TreeStore::new();
        if let Some(tx) = options.tree_events {
            store = store.with_event_sender(tx);
        }
        let tree = SharedTree::new(store);

        let loader = Loader::new(tree.clone(), parser);
        let discoverer = Discoverer::new(tree.clone(), pattern, loader.clone())
            .with_refresh_on_save(options.refresh_on_save);
        let mut coordinator = RunCoordinator::new(tree.clone(), executor);
        if let Some(tx) = options.run_events {
            coordinator = coordinator.with_event_sender(tx);
        }

        Self {
            tree,
            loader,
            discoverer,
            coordinator,
        }
    }

    /// Build a session from a loaded config file located in `base_dir`
    pub fn from_config(config: &Config, base_dir: &Path, mut options: SessionOptions) -> Result<Self> {
        let root = config.root_dir(base_dir);
        let pattern = TestFilePattern::new(&root, &config.project.pattern)
            .with_context(|| format!("Invalid test file pattern in {}", config.project.name))?;

        let parser = Arc::new(MarkerParser::new(config.parser.markers.iter().cloned()));
        let executor = Arc::new(
            CommandExecutor::new(&config.runner.file_cmd, &config.runner.suite_cmd, base_dir)
                .with_case_cmd(config.runner.case_cmd.clone())
                .with_shell(&config.runner.shell),
        );

        options.refresh_on_save |= config.project.refresh_on_save;
        Ok(Self::new(pattern, parser, executor, options))
    }

    pub fn tree(&self) -> &SharedTree {
        &self.tree
    }

    pub fn pattern(&self) -> &TestFilePattern {
        self.discoverer.pattern()
    }

    pub fn stats(&self) -> TreeStats {
        self.tree.lock().stats()
    }

    pub fn discover(&self) -> TreeResult<Vec<NodeId>> {
        self.discoverer.discover_all()
    }

    pub async fn apply(&self, event: &FsEvent) -> TreeResult<()> {
        self.discoverer.apply(event).await
    }

    /// Children of a file node, loading them first if they are missing or stale
    ///
    /// A failed load leaves the previous children in place; they are returned
    /// as-is and the file node carries the error.
    pub async fn children(&self, file_id: &NodeId) -> TreeResult<Vec<NodeSnapshot>> {
        let needs_load = {
            let tree = self.tree.lock();
            let node = tree
                .get(file_id)
                .ok_or_else(|| crate::error::TreeError::UnknownNode(file_id.to_string()))?;
            node.needs_load()
        };

        if needs_load {
            if let Err(e) = self.loader.load(file_id).await {
                tracing::debug!("keeping previous children of {}: {}", file_id, e);
            }
        }

        let tree = self.tree.lock();
        Ok(tree.children(file_id).iter().map(|n| n.snapshot()).collect())
    }

    /// Load every file that needs it; returns the number of files that failed
    pub async fn load_all(&self) -> usize {
        let ids: Vec<NodeId> = self.tree.lock().file_ids().to_vec();
        let mut failures = 0;
        for id in ids {
            let needs_load = self.tree.lock().get(&id).is_some_and(|n| n.needs_load());
            if needs_load && self.loader.load(&id).await.is_err() {
                failures += 1;
            }
        }
        failures
    }

    /// Files and their cases in tree order
    pub fn listing(&self) -> Vec<FileListing> {
        let tree = self.tree.lock();
        tree.files()
            .map(|file| FileListing {
                file: file.snapshot(),
                children: tree.children(&file.id).iter().map(|n| n.snapshot()).collect(),
            })
            .collect()
    }

    pub fn plan(&self, include: &[NodeId], exclude: &[NodeId]) -> Plan {
        resolve(&self.tree.lock(), include, exclude)
    }

    /// Load the files owning any case ids in `ids`, so those cases are in the tree
    pub async fn materialize(&self, ids: &[NodeId]) {
        for id in ids.iter().filter(|id| id.is_case()) {
            let file_id = match decode(id.as_str()) {
                Ok(identity) => self.tree.lock().file_id_for_path(Path::new(&identity.file)),
                Err(e) => {
                    tracing::debug!("cannot materialize {}: {}", id, e);
                    continue;
                }
            };
            if let Some(file_id) = file_id {
                if let Err(e) = self.children(&file_id).await {
                    tracing::debug!("cannot materialize {}: {}", id, e);
                }
            }
        }
    }

    /// Resolve and execute a run request
    ///
    /// Case ids are materialized first. Included ids that still match nothing
    /// are reported in [`RunSummary::unresolved`] and fail the run.
    pub async fn run(&self, include: &[NodeId], exclude: &[NodeId], cancel: CancelToken) -> RunSummary {
        self.materialize(include).await;
        self.materialize(exclude).await;

        let unresolved: Vec<NodeId> = {
            let tree = self.tree.lock();
            include.iter().filter(|id| !tree.contains(id)).cloned().collect()
        };
        for id in &unresolved {
            tracing::warn!(id = %id, "requested node is not in the tree");
        }

        let plan = self.plan(include, exclude);
        let mut summary = self.coordinator.execute(plan, cancel).await;
        summary.unresolved = unresolved;
        summary
    }
}
