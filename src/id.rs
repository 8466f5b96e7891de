//! Node identity codec
//!
//! Maps `(file path, optional case name)` to an opaque id and back.
//! Ids look like `file:<path>` or `case:<path>#<name>`; `%` and `#` inside
//! either component are percent-escaped so the `#` separator is unambiguous.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{TreeError, TreeResult};

const FILE_PREFIX: &str = "file:";
const CASE_PREFIX: &str = "case:";
const SEPARATOR: char = '#';

/// Opaque, stable identifier of a tree node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse an externally supplied id, validating that it decodes
    pub fn parse(raw: &str) -> TreeResult<Self> {
        decode(raw)?;
        Ok(NodeId(raw.to_string()))
    }

    pub fn is_case(&self) -> bool {
        self.0.starts_with(CASE_PREFIX)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decoded form of a [`NodeId`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub file: String,
    pub case: Option<String>,
}

/// Encode a file path and optional case name into a node id
pub fn encode(file: &str, case: Option<&str>) -> NodeId {
    let mut id = String::with_capacity(file.len() + 8);
    match case {
        None => {
            id.push_str(FILE_PREFIX);
            escape_into(file, &mut id);
        }
        Some(name) => {
            id.push_str(CASE_PREFIX);
            escape_into(file, &mut id);
            id.push(SEPARATOR);
            escape_into(name, &mut id);
        }
    }
    NodeId(id)
}

/// Inverse of [`encode`]
pub fn decode(id: &str) -> TreeResult<Identity> {
    let invalid = |reason| TreeError::InvalidIdentifier {
        id: id.to_string(),
        reason,
    };

    if let Some(rest) = id.strip_prefix(FILE_PREFIX) {
        if rest.contains(SEPARATOR) {
            return Err(invalid("file id contains a case separator"));
        }
        let file = unescape(rest).ok_or_else(|| invalid("bad escape sequence"))?;
        return Ok(Identity { file, case: None });
    }

    if let Some(rest) = id.strip_prefix(CASE_PREFIX) {
        let (file, name) = rest
            .split_once(SEPARATOR)
            .ok_or_else(|| invalid("case id is missing its separator"))?;
        if name.contains(SEPARATOR) {
            return Err(invalid("case id contains more than one separator"));
        }
        let file = unescape(file).ok_or_else(|| invalid("bad escape sequence"))?;
        let name = unescape(name).ok_or_else(|| invalid("bad escape sequence"))?;
        return Ok(Identity {
            file,
            case: Some(name),
        });
    }

    Err(invalid("unknown prefix"))
}

fn escape_into(raw: &str, out: &mut String) {
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            SEPARATOR => out.push_str("%23"),
            other => out.push(other),
        }
    }
}

fn unescape(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(idx) = rest.find('%') {
        out.push_str(&rest[..idx]);
        let code = rest.get(idx + 1..idx + 3)?;
        match code {
            "25" => out.push('%'),
            "23" => out.push(SEPARATOR),
            _ => return None,
        }
        rest = &rest[idx + 3..];
    }
    out.push_str(rest);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let cases: &[(&str, Option<&str>)] = &[
            ("tests/test-math.R", None),
            ("tests/test-math.R", Some("adds numbers")),
            ("dir#1/100%.R", Some("name with # and %23 inside")),
            ("", Some("")),
            ("a/b.R", Some("%%##")),
        ];

        for (file, case) in cases {
            let id = encode(file, *case);
            let decoded = decode(id.as_str()).unwrap();
            assert_eq!(decoded.file, *file);
            assert_eq!(decoded.case.as_deref(), *case);
        }
    }

    #[test]
    fn test_file_and_case_ids_differ() {
        assert_ne!(encode("a.R", None), encode("a.R", Some("")));
        assert_ne!(encode("a#b", None), encode("a", Some("b")));
        assert_ne!(encode("a", Some("b#c")), encode("a#b", Some("c")));
    }

    #[test]
    fn test_escaped_ids_contain_single_separator() {
        let id = encode("x#y", Some("p#q"));
        assert_eq!(id.as_str().matches('#').count(), 1);
        assert!(id.is_case());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        for bad in [
            "",
            "nope:a.R",
            "case:a.R",
            "case:a.R#b#c",
            "file:a#b",
            "file:100%",
            "file:%zz",
            "case:a.R#%4",
        ] {
            let err = decode(bad).unwrap_err();
            assert!(
                matches!(err, TreeError::InvalidIdentifier { .. }),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_validates() {
        assert!(NodeId::parse("file:tests/test-a.R").is_ok());
        assert!(NodeId::parse("garbage").is_err());
    }
}
