//! Test discovery module
//!
//! Finds test files under a root with a glob pattern, keeps one file node per
//! path and applies watcher events to the tree incrementally.

use std::path::{Component, Path, PathBuf};

use crate::error::{TreeError, TreeResult};
use crate::id::NodeId;
use crate::loader::Loader;
use crate::tree::{SharedTree, TreeEvent};
use crate::watcher::FsEvent;

const EXCLUDED_DIRS: &[&str] = &["target", "node_modules", "dist", "out", ".git"];

/// The naming convention that makes a file a test file
#[derive(Debug, Clone)]
pub struct TestFilePattern {
    root: PathBuf,
    glob: String,
    pattern: glob::Pattern,
}

impl TestFilePattern {
    pub fn new(root: &Path, glob: &str) -> TreeResult<Self> {
        Ok(Self {
            root: root.to_path_buf(),
            glob: glob.to_string(),
            pattern: glob::Pattern::new(glob)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `path` (absolute or root-relative) is a test file
    pub fn matches(&self, path: &Path) -> bool {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        if relative.is_absolute() {
            return false;
        }
        let excluded = relative.components().any(|c| match c {
            Component::Normal(name) => EXCLUDED_DIRS.iter().any(|dir| name == *dir),
            _ => false,
        });
        !excluded && self.pattern.matches_path(relative)
    }

    /// All matching files under the root, sorted
    pub fn scan(&self) -> TreeResult<Vec<PathBuf>> {
        let root = self.root.to_str().ok_or_else(|| TreeError::InvalidIdentifier {
            id: self.root.to_string_lossy().into_owned(),
            reason: "path is not valid UTF-8",
        })?;
        // The root is literal text; only the configured glob is a pattern
        let full = format!(
            "{}/{}",
            glob::Pattern::escape(root).trim_end_matches('/'),
            self.glob.trim_start_matches('/')
        );

        let mut paths = Vec::new();
        for entry in glob::glob(&full)? {
            match entry {
                Ok(path) if path.is_file() && self.matches(&path) => paths.push(path),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %e.path().display(), "skipping unreadable path: {}", e.error());
                }
            }
        }
        paths.sort();
        Ok(paths)
    }
}

/// Check whether `root` holds at least one test file
pub fn is_test_project(pattern: &TestFilePattern) -> bool {
    pattern.root().is_dir() && pattern.scan().map(|p| !p.is_empty()).unwrap_or(false)
}

/// Keeps file nodes in sync with the filesystem
#[derive(Clone)]
pub struct Discoverer {
    tree: SharedTree,
    pattern: TestFilePattern,
    loader: Loader,
    refresh_on_save: bool,
}

impl Discoverer {
    pub fn new(tree: SharedTree, pattern: TestFilePattern, loader: Loader) -> Self {
        Self {
            tree,
            pattern,
            loader,
            refresh_on_save: false,
        }
    }

    /// Reload changed files eagerly instead of on the next children request
    pub fn with_refresh_on_save(mut self, refresh: bool) -> Self {
        self.refresh_on_save = refresh;
        self
    }

    pub fn pattern(&self) -> &TestFilePattern {
        &self.pattern
    }

    /// Ensure a file node exists for every test file under the root
    pub fn discover_all(&self) -> TreeResult<Vec<NodeId>> {
        tracing::info!(root = %self.pattern.root().display(), "discovering test files");

        let paths = self.pattern.scan()?;
        let mut tree = self.tree.lock();
        let mut ids = Vec::with_capacity(paths.len());

        for path in &paths {
            match tree.upsert_file(path) {
                Ok(upserted) => ids.push(upserted.id),
                Err(e) => tracing::warn!("skipping {}: {}", path.display(), e),
            }
        }

        tracing::info!("found {} test file(s)", ids.len());
        tree.emit(TreeEvent::DiscoveryFinished { files: ids.len() });
        Ok(ids)
    }

    /// Apply one watcher event to the tree
    pub async fn apply(&self, event: &FsEvent) -> TreeResult<()> {
        let path = event.path();
        if !self.pattern.matches(path) {
            return Ok(());
        }

        match event {
            FsEvent::Created(_) | FsEvent::Changed(_) => {
                let upserted = self.tree.lock().upsert_file(path)?;
                if upserted.created {
                    tracing::info!(file = %path.display(), "new test file");
                    return Ok(());
                }

                if self.refresh_on_save {
                    // Failures are already attached to the node
                    if let Err(e) = self.loader.load(&upserted.id).await {
                        tracing::debug!("refresh of {} failed: {}", path.display(), e);
                    }
                } else {
                    tracing::debug!(file = %path.display(), "marking for reload");
                    self.tree.lock().mark_stale(&upserted.id);
                }
            }
            FsEvent::Deleted(_) => {
                if self.tree.lock().remove_file(path) {
                    tracing::info!(file = %path.display(), "test file removed");
                }
            }
        }

        Ok(())
    }
}
