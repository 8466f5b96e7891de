//! Executors
//!
//! The run coordinator hands nodes to an [`Executor`]. [`CommandExecutor`]
//! runs configured shell commands; tests use scripted in-memory executors.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;

use crate::error::ExecutionError;
use crate::id::NodeId;
use crate::test_model::{Node, NodeKind, Outcome};

const MESSAGE_TAIL_LINES: usize = 20;

/// What an executor needs to know about a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTarget {
    pub id: NodeId,
    pub kind: NodeKind,
    pub label: String,
    pub file: PathBuf,
    pub case: Option<String>,
    pub line: Option<u32>,
}

impl NodeTarget {
    pub fn from_node(node: &Node) -> Self {
        Self {
            id: node.id.clone(),
            kind: node.kind,
            label: node.label.clone(),
            file: node.location.path.clone(),
            case: node.is_case().then(|| node.label.clone()),
            line: node.location.line,
        }
    }
}

/// Result of running one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeReport {
    pub outcome: Outcome,
    pub message: Option<String>,
    pub raw_output: String,
}

/// Result of running the whole suite
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuiteReport {
    pub success: bool,
    pub raw_output: String,
}

/// Runs tests on behalf of the run coordinator
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a single file or case
    async fn run_one(&self, target: &NodeTarget) -> Result<NodeReport, ExecutionError>;

    /// Run the entire suite as one operation
    async fn run_all(&self) -> Result<SuiteReport, ExecutionError>;
}

/// Shell command templates for each kind of run
///
/// Templates may use `{file}`, `{case}` and `{line}`; values are substituted
/// shell-quoted, after environment variables in the template are expanded.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    file_cmd: String,
    case_cmd: Option<String>,
    suite_cmd: String,
    shell: String,
    cwd: PathBuf,
}

impl CommandExecutor {
    pub fn new(file_cmd: &str, suite_cmd: &str, cwd: &Path) -> Self {
        Self {
            file_cmd: file_cmd.to_string(),
            case_cmd: None,
            suite_cmd: suite_cmd.to_string(),
            shell: "sh".to_string(),
            cwd: cwd.to_path_buf(),
        }
    }

    pub fn with_case_cmd(mut self, case_cmd: Option<String>) -> Self {
        self.case_cmd = case_cmd;
        self
    }

    pub fn with_shell(mut self, shell: &str) -> Self {
        self.shell = shell.to_string();
        self
    }

    /// Build the command line for a node
    pub fn command_for(&self, target: &NodeTarget) -> Result<String, ExecutionError> {
        let template = match target.kind {
            NodeKind::File => self.file_cmd.as_str(),
            NodeKind::Case => self.case_cmd.as_deref().ok_or_else(|| {
                ExecutionError::Failed(format!(
                    "no case command configured, cannot run \"{}\" on its own",
                    target.label
                ))
            })?,
        };

        let expanded = expand_env(template)?;
        let file = target.file.to_string_lossy();
        Ok(substitute(
            &expanded,
            &[
                ("{file}", shell_quote(&file)),
                ("{case}", shell_quote(target.case.as_deref().unwrap_or_default())),
                ("{line}", target.line.unwrap_or(0).to_string()),
            ],
        ))
    }

    async fn spawn(&self, command_line: &str) -> Result<Output, ExecutionError> {
        tracing::debug!(cmd = %command_line, "spawning");
        Command::new(&self.shell)
            .arg("-c")
            .arg(command_line)
            .current_dir(&self.cwd)
            .output()
            .await
            .map_err(|e| ExecutionError::Unavailable(format!("failed to spawn {}: {}", self.shell, e)))
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn run_one(&self, target: &NodeTarget) -> Result<NodeReport, ExecutionError> {
        let command_line = self.command_for(target)?;
        let output = self.spawn(&command_line).await?;
        let raw_output = combined_output(&output);

        if output.status.success() {
            Ok(NodeReport {
                outcome: Outcome::Passed,
                message: None,
                raw_output,
            })
        } else {
            let message = match output.status.code() {
                Some(code) => format!("exited with status {}\n{}", code, tail(&raw_output)),
                None => format!("terminated by signal\n{}", tail(&raw_output)),
            };
            Ok(NodeReport {
                outcome: Outcome::Failed,
                message: Some(message.trim_end().to_string()),
                raw_output,
            })
        }
    }

    async fn run_all(&self) -> Result<SuiteReport, ExecutionError> {
        let command_line = expand_env(&self.suite_cmd)?;
        let output = self.spawn(&command_line).await?;
        Ok(SuiteReport {
            success: output.status.success(),
            raw_output: combined_output(&output),
        })
    }
}

fn expand_env(template: &str) -> Result<String, ExecutionError> {
    shellexpand::env(template)
        .map(|s| s.into_owned())
        .map_err(|e| ExecutionError::Failed(format!("cannot expand command: {}", e)))
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&stderr);
    }
    strip_ansi(&text)
}

fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(MESSAGE_TAIL_LINES);
    lines[start..].join("\n")
}

/// Quote a value for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Remove ANSI colour escapes (`ESC [ ... m`)
/// Replace placeholders in one left-to-right pass, so inserted values are
/// never scanned again
fn substitute(template: &str, values: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while !rest.is_empty() {
        match values.iter().find(|(key, _)| rest.starts_with(key)) {
            Some((key, value)) => {
                out.push_str(value);
                rest = &rest[key.len()..];
            }
            None => {
                let mut chars = rest.chars();
                if let Some(c) = chars.next() {
                    out.push(c);
                }
                rest = chars.as_str();
            }
        }
    }

    out
}

pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        if c == '\x1b' {
            let rest = &text[idx + 1..];
            if let Some(body) = rest.strip_prefix('[') {
                let params = body
                    .chars()
                    .take_while(|c| c.is_ascii_digit() || *c == ';')
                    .count();
                if body[params..].starts_with('m') {
                    // ESC + '[' + params + 'm', all single-byte
                    for _ in 0..params + 2 {
                        chars.next();
                    }
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::encode;
    use tempfile::tempdir;

    fn file_target(path: &str) -> NodeTarget {
        NodeTarget {
            id: encode(path, None),
            kind: NodeKind::File,
            label: path.to_string(),
            file: PathBuf::from(path),
            case: None,
            line: None,
        }
    }

    fn case_target(path: &str, name: &str) -> NodeTarget {
        NodeTarget {
            id: encode(path, Some(name)),
            kind: NodeKind::Case,
            label: name.to_string(),
            file: PathBuf::from(path),
            case: Some(name.to_string()),
            line: Some(7),
        }
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m plain"), "red plain");
        assert_eq!(strip_ansi("\x1b[1;32mok\x1b[m"), "ok");
        assert_eq!(strip_ansi("no escapes ✓"), "no escapes ✓");
        assert_eq!(strip_ansi("\x1b[2Kkeep"), "\x1b[2Kkeep");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_command_for_substitutes_placeholders() {
        let executor = CommandExecutor::new("run {file}", "run-all", Path::new("."))
            .with_case_cmd(Some("run {file} --case {case} --line {line}".into()));

        assert_eq!(
            executor.command_for(&file_target("t/a.R")).unwrap(),
            "run 't/a.R'"
        );
        assert_eq!(
            executor.command_for(&case_target("t/a.R", "adds 'one'")).unwrap(),
            "run 't/a.R' --case 'adds '\\''one'\\''' --line 7"
        );
    }

    #[test]
    fn test_command_for_does_not_rescan_inserted_values() {
        let executor = CommandExecutor::new("run {file}", "run-all", Path::new("."))
            .with_case_cmd(Some("run {file} --case {case} --line {line}".into()));

        assert_eq!(
            executor.command_for(&case_target("a.R", "uses {line} token")).unwrap(),
            "run 'a.R' --case 'uses {line} token' --line 7"
        );
        assert_eq!(
            executor.command_for(&case_target("t/{case}.R", "x")).unwrap(),
            "run 't/{case}.R' --case 'x' --line 7"
        );
    }

    #[test]
    fn test_case_without_case_cmd_is_node_error() {
        let executor = CommandExecutor::new("run {file}", "run-all", Path::new("."));
        let err = executor.command_for(&case_target("a.R", "x")).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_run_one_reports_exit_status() {
        let dir = tempdir().unwrap();
        let executor = CommandExecutor::new("echo ran {file}", "exit 3", dir.path());
        let report = executor.run_one(&file_target("a.R")).await.unwrap();
        assert_eq!(report.outcome, Outcome::Passed);
        assert_eq!(report.raw_output.trim(), "ran a.R");

        let failing = CommandExecutor::new("printf '\\033[31mboom\\033[0m' >&2; exit 2", "true", dir.path());
        let report = failing.run_one(&file_target("a.R")).await.unwrap();
        assert_eq!(report.outcome, Outcome::Failed);
        let message = report.message.unwrap();
        assert!(message.contains("status 2"));
        assert!(message.contains("boom"));
        assert!(!message.contains('\x1b'));

        let suite = executor.run_all().await.unwrap();
        assert!(!suite.success);
    }

    #[tokio::test]
    async fn test_missing_shell_is_unavailable() {
        let dir = tempdir().unwrap();
        let executor = CommandExecutor::new("true", "true", dir.path()).with_shell("/nonexistent/shell");
        let err = executor.run_all().await.unwrap_err();
        assert!(err.is_fatal());
    }
}
