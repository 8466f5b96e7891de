//! suitetree - test tree engine
//!
//! A library for keeping a file-based test suite mapped onto a tree and
//! running arbitrary parts of it:
//! - Discovery of test files by glob, incremental sync from a file watcher
//! - Lazy parsing of files into named test cases with stable ids
//! - Include/exclude selection resolved into a minimal execution plan
//! - Cooperative, cancellable runs with per-node outcomes and timing

pub mod config;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod id;
pub mod loader;
pub mod parser;
pub mod run;
pub mod selection;
pub mod session;
pub mod test_model;
pub mod tree;
pub mod watcher;

pub use discovery::{is_test_project, Discoverer, TestFilePattern};
pub use error::{ExecutionError, ParseError, TreeError};
pub use executor::{CommandExecutor, Executor, NodeReport, NodeTarget, SuiteReport};
pub use id::{decode, encode, NodeId};
pub use loader::Loader;
pub use parser::{MarkerParser, Parser};
pub use run::{CancelHandle, CancelToken, RunCoordinator, RunEvent, RunState, RunSummary};
pub use selection::{resolve, Plan};
pub use session::{Session, SessionOptions};
pub use test_model::{CaseSpan, Node, NodeKind, Outcome};
pub use tree::{SharedTree, TreeEvent, TreeStore};
pub use watcher::{FsEvent, TestWatcher};
