use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub project: Project,
    #[serde(default)]
    pub parser: ParserConfig,
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    pub name: String,
    /// Test root, relative to the config file
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Glob matched against paths relative to `root`
    #[serde(default = "default_pattern")]
    pub pattern: String,
    /// Reload a changed file right away instead of on next access
    #[serde(default)]
    pub refresh_on_save: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParserConfig {
    /// Call prefixes that open a test case, e.g. `test_that(`
    #[serde(default = "default_markers")]
    pub markers: Vec<String>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            markers: default_markers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Runs one test file; `{file}` is substituted
    pub file_cmd: String,
    /// Runs one case; `{file}`, `{case}` and `{line}` are substituted
    #[serde(default)]
    pub case_cmd: Option<String>,
    /// Runs the entire suite
    pub suite_cmd: String,
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_root() -> PathBuf {
    PathBuf::from("tests")
}

fn default_pattern() -> String {
    "**/test-*.R".to_string()
}

fn default_markers() -> Vec<String> {
    vec!["test_that(".to_string()]
}

fn default_shell() -> String {
    "sh".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        glob::Pattern::new(&self.project.pattern)
            .with_context(|| format!("Invalid test file pattern '{}'", self.project.pattern))?;

        if self.parser.markers.is_empty() || self.parser.markers.iter().any(|m| m.trim().is_empty()) {
            anyhow::bail!("parser.markers must list at least one non-empty call prefix");
        }

        for (name, cmd) in [
            ("runner.file_cmd", Some(&self.runner.file_cmd)),
            ("runner.suite_cmd", Some(&self.runner.suite_cmd)),
            ("runner.case_cmd", self.runner.case_cmd.as_ref()),
        ] {
            if cmd.is_some_and(|c| c.trim().is_empty()) {
                anyhow::bail!("{} must not be empty", name);
            }
        }

        Ok(())
    }

    /// Absolute test root for a config file located in `base_dir`
    pub fn root_dir(&self, base_dir: &Path) -> PathBuf {
        let root = base_dir.join(&self.project.root);
        fs::canonicalize(&root).unwrap_or(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[project]
name = "demo"
root = "tests/testthat"
refresh_on_save = true

[parser]
markers = ["test_that(", "it("]

[runner]
file_cmd = "Rscript -e \"testthat::test_file({file})\""
suite_cmd = "Rscript -e \"devtools::test()\""
"#;

        let config = Config::parse(toml_content).unwrap();
        assert_eq!(config.project.name, "demo");
        assert_eq!(config.project.root, PathBuf::from("tests/testthat"));
        assert_eq!(config.project.pattern, "**/test-*.R");
        assert!(config.project.refresh_on_save);
        assert_eq!(config.parser.markers.len(), 2);
        assert!(config.runner.case_cmd.is_none());
        assert_eq!(config.runner.shell, "sh");
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse(
            r#"
[project]
name = "demo"

[runner]
file_cmd = "run {file}"
suite_cmd = "run-all"
"#,
        )
        .unwrap();
        assert_eq!(config.project.root, PathBuf::from("tests"));
        assert_eq!(config.parser.markers, vec!["test_that("]);
        assert!(!config.project.refresh_on_save);
    }

    #[test]
    fn test_rejects_bad_pattern() {
        let err = Config::parse(
            r#"
[project]
name = "demo"
pattern = "[unclosed"

[runner]
file_cmd = "run {file}"
suite_cmd = "run-all"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("pattern"));
    }

    #[test]
    fn test_rejects_empty_command() {
        let result = Config::parse(
            r#"
[project]
name = "demo"

[runner]
file_cmd = "  "
suite_cmd = "run-all"
"#,
        );
        assert!(result.is_err());
    }
}
