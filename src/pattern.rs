//! User supplied regular expressions and apply conditions
//!
//! Patterns registered through the admin surface may use lookaround, so they
//! are compiled with `fancy-regex`.

use fancy_regex::Regex;
use tracing::debug;

use crate::model::RecordEntry;
use crate::{ProxyError, Result};

/// Compile a user supplied pattern
///
/// # Errors
///
/// Returns `ProxyError::BadRequest` naming the pattern if it does not compile
pub fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| {
        ProxyError::BadRequest(format!(
            "Expression of value {pattern} does not successfully compile. Failure Details: {e}"
        ))
    })
}

/// Pattern matching a literal string
///
/// # Errors
///
/// Returns error if the escaped literal fails to compile
pub fn literal(target: &str) -> Result<Regex> {
    compile(&fancy_regex::escape(target))
}

/// Whether `regex` matches anywhere in `text`. Engine failures count as no match.
#[must_use]
pub fn is_match(regex: &Regex, text: &str) -> bool {
    regex.is_match(text).unwrap_or_else(|e| {
        debug!("Pattern {} failed on input: {e}", regex.as_str());
        false
    })
}

/// Replace every match of `regex` in `input` with `value`.
///
/// With `group`, only that named group of each match is replaced and matches
/// where the group did not participate are left alone.
#[must_use]
pub fn replace_matches(input: &str, regex: &Regex, value: &str, group: Option<&str>) -> String {
    let mut output = String::with_capacity(input.len());
    let mut last = 0;

    for captures in regex.captures_iter(input) {
        let captures = match captures {
            Ok(captures) => captures,
            Err(e) => {
                debug!("Pattern {} stopped matching: {e}", regex.as_str());
                break;
            }
        };

        let target = match group {
            Some(name) => captures.name(name),
            None => captures.get(0),
        };
        let Some(target) = target else {
            continue;
        };
        if target.start() < last {
            continue;
        }

        output.push_str(&input[last..target.start()]);
        output.push_str(value);
        last = target.end();
    }

    output.push_str(&input[last..]);
    output
}

/// Replace within `input`, or replace all of it when no pattern is given
#[must_use]
pub fn replace_value(input: &str, regex: Option<&Regex>, value: &str, group: Option<&str>) -> String {
    match regex {
        Some(regex) => replace_matches(input, regex, value, group),
        None => value.to_string(),
    }
}

/// Gate restricting a sanitizer or transform to matching request URIs
#[derive(Debug, Clone)]
pub struct ApplyCondition {
    uri_regex: Regex,
}

impl ApplyCondition {
    /// Build a condition from a URI pattern
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` if the pattern is empty or invalid
    pub fn new(uri_regex: &str) -> Result<Self> {
        if uri_regex.trim().is_empty() {
            return Err(ProxyError::BadRequest(
                "When providing a condition, it must have a non-empty UriRegex populated."
                    .to_string(),
            ));
        }
        Ok(Self {
            uri_regex: compile(uri_regex)?,
        })
    }

    /// The URI pattern
    #[must_use]
    pub fn uri_regex(&self) -> &str {
        self.uri_regex.as_str()
    }

    /// Whether the condition holds for a URI
    #[must_use]
    pub fn matches_uri(&self, uri: &str) -> bool {
        is_match(&self.uri_regex, uri)
    }

    /// Whether the condition holds for an entry
    #[must_use]
    pub fn is_met(&self, entry: &RecordEntry) -> bool {
        self.matches_uri(&entry.request_uri)
    }
}
