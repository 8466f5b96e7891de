//! Error taxonomy for the tree and run layers
//!
//! Per-file and per-node failures are values attached to nodes, not aborts.
//! Only `ExecutionError::Unavailable` stops a run early.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error for tree operations
#[derive(Debug, Error)]
pub enum TreeError {
    /// File content could not be parsed into test cases
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },

    /// A single node's execution failed
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// A node id that does not decode; always a caller bug
    #[error("invalid node identifier {id:?}: {reason}")]
    InvalidIdentifier { id: String, reason: &'static str },

    /// File unreadable or watcher failure
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Discovery glob is not a valid pattern
    #[error("invalid test file pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    /// The node referenced by an operation is not in the tree
    #[error("unknown node {0}")]
    UnknownNode(String),
}

impl TreeError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TreeError::Io {
            path: path.into(),
            source,
        }
    }

    /// Message suitable for attaching to a node's `error` field
    pub fn node_message(&self) -> String {
        match self {
            TreeError::Parse { source, .. } => source.to_string(),
            TreeError::Io { source, .. } => source.to_string(),
            other => other.to_string(),
        }
    }
}

/// Failure reported by a [`crate::parser::Parser`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: u32,
    pub message: String,
}

impl ParseError {
    pub fn new(line: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// Failure reported by an [`crate::executor::Executor`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// Scoped to one node; the run continues
    #[error("{0}")]
    Failed(String),
    /// The executor itself cannot be reached; the run is aborted
    #[error("executor unavailable: {0}")]
    Unavailable(String),
}

impl ExecutionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecutionError::Unavailable(_))
    }
}

pub type TreeResult<T> = std::result::Result<T, TreeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_message_strips_path() {
        let err = TreeError::Parse {
            path: PathBuf::from("tests/test-a.R"),
            source: ParseError::new(3, "unterminated string"),
        };
        assert_eq!(err.node_message(), "line 3: unterminated string");
        assert!(err.to_string().contains("tests/test-a.R"));
    }

    #[test]
    fn test_unavailable_is_fatal() {
        assert!(ExecutionError::Unavailable("gone".into()).is_fatal());
        assert!(!ExecutionError::Failed("boom".into()).is_fatal());
    }
}
