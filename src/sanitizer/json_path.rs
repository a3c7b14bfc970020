//! JSONPath subset used to target body values
//!
//! Supported: `$`, `.name`, `['name']`, `["name"]`, `[index]`, `.*`, `[*]`
//! and recursive descent `..name`.

use serde_json::Value;

use crate::{ProxyError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Child(String),
    Index(usize),
    Wildcard,
    Descendant(String),
}

/// Compiled JSONPath expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    source: String,
    steps: Vec<Step>,
}

impl JsonPath {
    /// Parse an expression
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` if the expression is not supported
    pub fn parse(source: &str) -> Result<Self> {
        let bad = |detail: &str| {
            ProxyError::BadRequest(format!("Invalid jsonPath \"{source}\": {detail}"))
        };

        let rest = source
            .trim()
            .strip_prefix('$')
            .ok_or_else(|| bad("expression must start with '$'"))?;
        let chars: Vec<char> = rest.chars().collect();
        let mut steps = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            match chars[i] {
                '.' if chars.get(i + 1) == Some(&'.') => {
                    i += 2;
                    let name = read_name(&chars, &mut i);
                    if name.is_empty() {
                        return Err(bad("'..' must be followed by a property name"));
                    }
                    steps.push(Step::Descendant(name));
                }
                '.' => {
                    i += 1;
                    let name = read_name(&chars, &mut i);
                    match name.as_str() {
                        "" => return Err(bad("empty property name")),
                        "*" => steps.push(Step::Wildcard),
                        _ => steps.push(Step::Child(name)),
                    }
                }
                '[' => {
                    let close = chars[i..]
                        .iter()
                        .position(|c| *c == ']')
                        .map(|offset| i + offset)
                        .ok_or_else(|| bad("unclosed '['"))?;
                    let inner: String = chars[i + 1..close].iter().collect();
                    let inner = inner.trim();
                    let step = if inner == "*" {
                        Step::Wildcard
                    } else if let Some(name) = quoted(inner) {
                        Step::Child(name.to_string())
                    } else {
                        inner
                            .parse::<usize>()
                            .map(Step::Index)
                            .map_err(|_| bad("bracket must hold an index, '*' or a quoted name"))?
                    };
                    steps.push(step);
                    i = close + 1;
                }
                other => return Err(bad(&format!("unexpected character '{other}'"))),
            }
        }

        Ok(Self {
            source: source.to_string(),
            steps,
        })
    }

    /// The original expression
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Call `update` on every node selected by the path.
    ///
    /// `update` returns whether it changed the node; the result is true when
    /// any node changed.
    pub fn update(&self, root: &mut Value, update: &mut dyn FnMut(&mut Value) -> bool) -> bool {
        visit(root, &self.steps, update)
    }
}

fn read_name(chars: &[char], i: &mut usize) -> String {
    let start = *i;
    while *i < chars.len() && chars[*i] != '.' && chars[*i] != '[' {
        *i += 1;
    }
    chars[start..*i].iter().collect()
}

fn quoted(inner: &str) -> Option<&str> {
    inner
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
}

fn visit(value: &mut Value, steps: &[Step], update: &mut dyn FnMut(&mut Value) -> bool) -> bool {
    let Some((step, rest)) = steps.split_first() else {
        return update(value);
    };

    match step {
        Step::Child(name) => value
            .as_object_mut()
            .and_then(|map| map.get_mut(name))
            .is_some_and(|child| visit(child, rest, update)),
        Step::Index(index) => value
            .as_array_mut()
            .and_then(|items| items.get_mut(*index))
            .is_some_and(|child| visit(child, rest, update)),
        Step::Wildcard => {
            let mut changed = false;
            for child in children(value) {
                changed |= visit(child, rest, update);
            }
            changed
        }
        Step::Descendant(name) => {
            let mut changed = false;
            if let Some(child) = value.as_object_mut().and_then(|map| map.get_mut(name)) {
                changed |= visit(child, rest, update);
            }
            for child in children(value) {
                changed |= visit(child, steps, update);
            }
            changed
        }
    }
}

fn children(value: &mut Value) -> Vec<&mut Value> {
    match value {
        Value::Object(map) => map.values_mut().collect(),
        Value::Array(items) => items.iter_mut().collect(),
        _ => Vec::new(),
    }
}
