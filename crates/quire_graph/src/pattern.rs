//! Parsing of entry keys (`pattern|filter|filter`) and file-name matching.

use globset::{GlobBuilder, GlobMatcher};
use regex::Regex;

use crate::error::GraphError;

/// A parsed entry key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPattern {
    /// File-name pattern with any `@` marker removed.
    pub token: String,
    /// Filter aliases named in the key.
    pub filters: Vec<String>,
    /// The key started with `@`.
    pub is_virtual: bool,
}

/// Splits an entry key into its file pattern and filter aliases.
///
/// Patterns are relative to the configuring directory and may not contain
/// `/`. Every alias must be non-empty.
pub fn parse_pattern(directive: &str) -> Result<EntryPattern, GraphError> {
    let mut tokens = directive.split('|');
    let head = tokens.next().unwrap_or_default();
    let filters: Vec<String> = tokens.map(str::to_string).collect();

    let invalid = |reason: &str| GraphError::InvalidPattern {
        pattern: directive.to_string(),
        reason: reason.to_string(),
    };
    if head.contains('/') {
        return Err(invalid("paths are not allowed in patterns"));
    }
    if filters.iter().any(String::is_empty) {
        return Err(invalid("empty filter alias"));
    }

    let (token, is_virtual) = match head.strip_prefix('@') {
        Some(rest) => (rest, true),
        None => (head, false),
    };
    if token.is_empty() {
        return Err(invalid("empty file pattern"));
    }
    Ok(EntryPattern {
        token: token.to_string(),
        filters,
        is_virtual,
    })
}

/// Joins a directory (as stored in the config tree) and a file name.
pub fn join_dir(dir: &str, file_name: &str) -> String {
    if dir == "." || dir.is_empty() {
        file_name.to_string()
    } else {
        format!("{dir}/{file_name}")
    }
}

/// Matches file names against a glob token and extracts the text matched by
/// its first `*`, which `%` placeholders in conditional rules refer to.
#[derive(Debug, Clone)]
pub struct FileMatcher {
    glob: GlobMatcher,
    capture: Regex,
    match_hidden: bool,
}

impl FileMatcher {
    /// Compiles a token such as `*.md` or `chapter-?.txt`.
    pub fn new(token: &str) -> Result<Self, GraphError> {
        let invalid = |reason: String| GraphError::InvalidPattern {
            pattern: token.to_string(),
            reason,
        };
        let glob = GlobBuilder::new(token)
            .literal_separator(true)
            .build()
            .map_err(|e| invalid(e.to_string()))?
            .compile_matcher();
        let capture =
            Regex::new(&capture_regex(token)).map_err(|e| invalid(e.to_string()))?;
        Ok(Self {
            glob,
            capture,
            match_hidden: token.starts_with('.'),
        })
    }

    /// Returns `true` if `file_name` matches. Names starting with `.` only
    /// match tokens that also start with `.`.
    pub fn is_match(&self, file_name: &str) -> bool {
        if file_name.starts_with('.') && !self.match_hidden {
            return false;
        }
        self.glob.is_match(file_name)
    }

    /// Text matched by the first wildcard, falling back to the file stem when
    /// the token has none.
    pub fn rootname(&self, file_name: &str) -> String {
        self.capture
            .captures(file_name)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| stem(file_name).to_string())
    }
}

fn stem(file_name: &str) -> &str {
    match file_name.rfind('.') {
        Some(i) if i > 0 => &file_name[..i],
        _ => file_name,
    }
}

/// Translates a glob token into an anchored regex where every `*` is a
/// capture group.
fn capture_regex(token: &str) -> String {
    let mut out = String::from("^");
    let mut chars = token.chars().peekable();
    let mut in_braces = false;
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                while chars.peek() == Some(&'*') {
                    chars.next();
                }
                out.push_str("(.*)");
            }
            '?' => out.push('.'),
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    out.push('^');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    if inner == '\\' || inner == '[' {
                        out.push('\\');
                    }
                    out.push(inner);
                }
                out.push(']');
            }
            '{' => {
                in_braces = true;
                out.push_str("(?:");
            }
            '}' if in_braces => {
                in_braces = false;
                out.push(')');
            }
            ',' if in_braces => out.push('|'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}
