//! Filesystem watcher
//!
//! Wraps a `notify` watcher and turns its raw events into [`FsEvent`]s for
//! test files (and the config file, if one is watched).

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use crate::discovery::TestFilePattern;
use crate::error::{TreeError, TreeResult};

const DEBOUNCE_MS: u64 = 300;

/// A change to a watched path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Created(PathBuf),
    Changed(PathBuf),
    /// Deleted or renamed away
    Deleted(PathBuf),
}

impl FsEvent {
    pub fn path(&self) -> &Path {
        match self {
            FsEvent::Created(p) | FsEvent::Changed(p) | FsEvent::Deleted(p) => p,
        }
    }
}

/// Translate one raw notify event
pub fn translate(event: &Event) -> Vec<FsEvent> {
    let paths = &event.paths;
    match &event.kind {
        EventKind::Create(_) => paths.iter().cloned().map(FsEvent::Created).collect(),
        EventKind::Remove(_) => paths.iter().cloned().map(FsEvent::Deleted).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.iter().cloned().map(FsEvent::Deleted).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.iter().cloned().map(FsEvent::Created).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match paths.as_slice() {
            [from, to] => vec![FsEvent::Deleted(from.clone()), FsEvent::Created(to.clone())],
            _ => Vec::new(),
        },
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .iter()
            .map(|p| {
                if p.exists() {
                    FsEvent::Created(p.clone())
                } else {
                    FsEvent::Deleted(p.clone())
                }
            })
            .collect(),
        EventKind::Modify(_) => paths.iter().cloned().map(FsEvent::Changed).collect(),
        _ => Vec::new(),
    }
}

/// Drops repeated `Changed` events for the same path within a short window
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last_changed: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_changed: HashMap::new(),
        }
    }

    pub fn admit(&mut self, event: &FsEvent, now: Instant) -> bool {
        match event {
            FsEvent::Changed(path) => match self.last_changed.get(path) {
                Some(last) if now.duration_since(*last) < self.window => false,
                _ => {
                    self.last_changed.insert(path.clone(), now);
                    true
                }
            },
            other => {
                self.last_changed.remove(other.path());
                true
            }
        }
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEBOUNCE_MS))
    }
}

/// Live watcher over a test root
pub struct TestWatcher {
    // Dropping the notify watcher stops event delivery
    _watcher: RecommendedWatcher,
    rx: UnboundedReceiver<FsEvent>,
    debouncer: Debouncer,
}

impl TestWatcher {
    /// Watch the pattern's root recursively, plus `extra` (e.g. the config file)
    pub fn start(pattern: &TestFilePattern, extra: Option<&Path>) -> TreeResult<Self> {
        let (tx, rx) = unbounded_channel();
        let filter = pattern.clone();
        let extra_path = extra.map(Path::to_path_buf);

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    for fs_event in translate(&event) {
                        let wanted = filter.matches(fs_event.path())
                            || extra_path.as_deref() == Some(fs_event.path());
                        if wanted {
                            let _ = tx.send(fs_event);
                        }
                    }
                }
                Err(e) => tracing::warn!("watcher error: {}", e),
            },
            Config::default(),
        )
        .map_err(|e| watch_error(pattern.root(), e))?;

        watcher
            .watch(pattern.root(), RecursiveMode::Recursive)
            .map_err(|e| watch_error(pattern.root(), e))?;

        if let Some(path) = extra {
            watcher
                .watch(path, RecursiveMode::NonRecursive)
                .map_err(|e| watch_error(path, e))?;
        }

        tracing::info!(root = %pattern.root().display(), "watching for changes");

        Ok(Self {
            _watcher: watcher,
            rx,
            debouncer: Debouncer::default(),
        })
    }

    /// Next debounced event; `None` once the watcher is gone
    pub async fn next(&mut self) -> Option<FsEvent> {
        loop {
            let event = self.rx.recv().await?;
            if self.debouncer.admit(&event, Instant::now()) {
                return Some(event);
            }
        }
    }
}

fn watch_error(path: &Path, error: notify::Error) -> TreeError {
    TreeError::io(path, std::io::Error::other(error.to_string()))
}
