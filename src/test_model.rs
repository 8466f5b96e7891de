//! Test model definitions
//!
//! Core data structures for tree nodes, their locations and the outcomes
//! recorded against them.

use colored::{ColoredString, Colorize};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::id::NodeId;

/// Kind of a tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// One test source file
    File,
    /// One named test inside a file
    Case,
}

/// Where a node lives in the source tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub path: PathBuf,
    /// 1-based line, Case nodes only
    pub line: Option<u32>,
    /// 1-based column, Case nodes only
    pub column: Option<u32>,
}

impl Location {
    pub fn file(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            line: None,
            column: None,
        }
    }

    pub fn at(path: &Path, line: u32, column: u32) -> Self {
        Self {
            path: path.to_path_buf(),
            line: Some(line),
            column: Some(column),
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}", self.path.display(), line),
            None => write!(f, "{}", self.path.display()),
        }
    }
}

/// Outcome of executing a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Passed,
    Failed,
    /// The executor itself failed for this node
    Errored,
}

impl Outcome {
    pub fn symbol(&self) -> &'static str {
        match self {
            Outcome::Passed => "✓",
            Outcome::Failed => "✗",
            Outcome::Errored => "!",
        }
    }

    pub fn colored_symbol(&self) -> ColoredString {
        match self {
            Outcome::Passed => self.symbol().green(),
            Outcome::Failed => self.symbol().red(),
            Outcome::Errored => self.symbol().yellow(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Passed => "passed",
            Outcome::Failed => "failed",
            Outcome::Errored => "errored",
        }
    }
}

/// Last recorded execution result of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub message: Option<String>,
}

/// A test case span produced by a parser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseSpan {
    pub name: String,
    /// 1-based line of the case declaration
    pub line: u32,
}

impl CaseSpan {
    pub fn new(name: impl Into<String>, line: u32) -> Self {
        Self {
            name: name.into(),
            line,
        }
    }
}

/// A node in the test tree (a file or a case)
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Display name (file name or case name)
    pub label: String,
    pub location: Location,
    /// File id for Case nodes
    pub parent: Option<NodeId>,
    /// Case ids in scan order, File nodes only
    pub children: Vec<NodeId>,
    /// Load or run in flight
    pub busy: bool,
    /// Last error, cleared on the next successful operation
    pub error: Option<String>,
    /// Last recorded run result
    pub last_outcome: Option<NodeOutcome>,
    /// Allocation number; unchanged for as long as this node value lives
    pub serial: u64,
    /// File nodes: children were computed at least once
    pub loaded: bool,
    /// File nodes: contents changed since the last load
    pub stale: bool,
}

impl Node {
    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    pub fn is_case(&self) -> bool {
        self.kind == NodeKind::Case
    }

    pub fn can_have_children(&self) -> bool {
        self.is_file()
    }

    /// Whether the next children request should (re)parse the file
    pub fn needs_load(&self) -> bool {
        self.is_file() && (!self.loaded || self.stale)
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            label: self.label.clone(),
            location: self.location.clone(),
            busy: self.busy,
            error: self.error.clone(),
        }
    }
}

/// The facts a presentation layer needs to display a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub kind: NodeKind,
    pub label: String,
    pub location: Location,
    pub busy: bool,
    pub error: Option<String>,
}

/// Counts over the whole tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TreeStats {
    pub files: usize,
    pub cases: usize,
    pub unloaded_files: usize,
    pub errored_files: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
}

impl TreeStats {
    pub fn from_nodes<'a>(nodes: impl Iterator<Item = &'a Node>) -> Self {
        let mut stats = Self::default();
        for node in nodes {
            match node.kind {
                NodeKind::File => {
                    stats.files += 1;
                    if !node.loaded {
                        stats.unloaded_files += 1;
                    }
                    if node.error.is_some() {
                        stats.errored_files += 1;
                    }
                }
                NodeKind::Case => stats.cases += 1,
            }
            match node.last_outcome.as_ref().map(|o| o.outcome) {
                Some(Outcome::Passed) => stats.passed += 1,
                Some(Outcome::Failed) => stats.failed += 1,
                Some(Outcome::Errored) => stats.errored += 1,
                None => {}
            }
        }
        stats
    }
}
