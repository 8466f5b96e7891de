//! Test case parsers
//!
//! A parser turns file contents into an ordered list of named case spans.
//! [`MarkerParser`] is the built-in implementation: it recognises lines that
//! open with a configured call prefix followed by a quoted case name, e.g.
//!
//! ```text
//! test_that("adds numbers", {
//! it('handles empty input', {
//! ```

use std::collections::HashSet;

use crate::error::ParseError;
use crate::test_model::CaseSpan;

/// Turns file contents into test case spans
pub trait Parser: Send + Sync {
    fn parse(&self, contents: &str) -> Result<Vec<CaseSpan>, ParseError>;
}

/// Line-oriented parser keyed on call prefixes
#[derive(Debug, Clone)]
pub struct MarkerParser {
    markers: Vec<String>,
}

impl MarkerParser {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for MarkerParser {
    fn default() -> Self {
        Self::new(["test_that("])
    }
}

impl Parser for MarkerParser {
    fn parse(&self, contents: &str) -> Result<Vec<CaseSpan>, ParseError> {
        let mut found = Vec::new();

        for (idx, line) in contents.lines().enumerate() {
            let line_no = idx as u32 + 1;
            let trimmed = line.trim_start();

            let Some(rest) = self
                .markers
                .iter()
                .find_map(|marker| trimmed.strip_prefix(marker.as_str()))
            else {
                continue;
            };

            // Names that aren't literals (variables, calls) are not discoverable
            let Some(name) = read_string_literal(rest.trim_start(), line_no)? else {
                continue;
            };

            found.push((name, line_no));
        }

        Ok(unique_names(found))
    }
}

/// Suffix repeated names with ` (2)`, ` (3)`, ... skipping any suffixed name
/// that the file already uses literally
fn unique_names(found: Vec<(String, u32)>) -> Vec<CaseSpan> {
    let literal: HashSet<String> = found.iter().map(|(name, _)| name.clone()).collect();
    let mut used = HashSet::with_capacity(found.len());

    found
        .into_iter()
        .map(|(name, line)| {
            if used.insert(name.clone()) {
                return CaseSpan::new(name, line);
            }
            let mut n = 2;
            loop {
                let candidate = format!("{} ({})", name, n);
                if !literal.contains(&candidate) && used.insert(candidate.clone()) {
                    return CaseSpan::new(candidate, line);
                }
                n += 1;
            }
        })
        .collect()
}

/// Read a quoted literal at the start of `input`
///
/// Returns `Ok(None)` if `input` does not start with a quote.
fn read_string_literal(input: &str, line: u32) -> Result<Option<String>, ParseError> {
    let mut chars = input.chars();
    let quote = match chars.next() {
        Some(q @ ('"' | '\'')) => q,
        _ => return Ok(None),
    };

    let mut name = String::new();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('n') => name.push('\n'),
                Some('t') => name.push('\t'),
                Some(other) => name.push(other),
                None => break,
            },
            c if c == quote => return Ok(Some(name)),
            c => name.push(c),
        }
    }

    Err(ParseError::new(line, "unterminated string literal in test name"))
}
