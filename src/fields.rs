use std::collections::HashSet;
use std::fmt;

use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(k) => write!(f, ".{k}"),
            Self::Index(i) => write!(f, "[{i}]"),
        }
    }
}

pub type JsonPath = Vec<PathSegment>;

pub fn render_path(path: &[PathSegment]) -> String {
    path.iter().map(ToString::to_string).collect()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("empty path")]
    EmptyPath,
    #[error("non-container at {at} while walking {path}")]
    NotAContainer { path: String, at: String },
    #[error("missing key {key:?} at {path}")]
    MissingKey { path: String, key: String },
    #[error("index {index} out of range at {path}")]
    IndexOutOfRange { path: String, index: usize },
}

/// Lazy depth-first walk yielding `(path, text)` for every translatable string.
///
/// Keys in `blacklist` prune their subtree. With an allow-list, only string values sitting
/// directly under an allowed key are yielded; without one, every string leaf is.
pub struct FieldWalker<'a> {
    blacklist: &'a HashSet<String>,
    allow: Option<&'a [String]>,
    stack: Vec<(JsonPath, &'a Value)>,
}

impl<'a> FieldWalker<'a> {
    pub fn new(
        value: &'a Value,
        blacklist: &'a HashSet<String>,
        prefix: JsonPath,
        allow: Option<&'a [String]>,
    ) -> Self {
        Self {
            blacklist,
            allow: allow.filter(|a| !a.is_empty()),
            stack: vec![(prefix, value)],
        }
    }

    fn allowed(&self, key: &str) -> bool {
        self.allow.is_some_and(|a| a.iter().any(|f| f == key))
    }
}

impl<'a> Iterator for FieldWalker<'a> {
    type Item = (JsonPath, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((path, value)) = self.stack.pop() {
            match value {
                Value::Object(map) => {
                    // Reverse push keeps document order on pop.
                    for (key, child) in map.iter().rev() {
                        if self.blacklist.contains(key) {
                            continue;
                        }
                        let mut child_path = path.clone();
                        child_path.push(PathSegment::Key(key.clone()));
                        self.stack.push((child_path, child));
                    }
                }
                Value::Array(items) => {
                    for (idx, child) in items.iter().enumerate().rev() {
                        let mut child_path = path.clone();
                        child_path.push(PathSegment::Index(idx));
                        self.stack.push((child_path, child));
                    }
                }
                // Under an allow-list a string counts only when its own key is allowed.
                Value::String(s) => {
                    if self.allow.is_none() {
                        return Some((path, s.as_str()));
                    }
                    if let Some(PathSegment::Key(k)) = path.last() {
                        if self.allowed(k) {
                            return Some((path, s.as_str()));
                        }
                    }
                }
                _ => {}
            }
        }
        None
    }
}

pub fn extract<'a>(
    value: &'a Value,
    blacklist: &'a HashSet<String>,
    prefix: JsonPath,
    allow: Option<&'a [String]>,
) -> FieldWalker<'a> {
    FieldWalker::new(value, blacklist, prefix, allow)
}

/// Writes `value` at `path` inside `root`, in place.
pub fn inject(root: &mut Value, path: &[PathSegment], value: Value) -> Result<(), FieldError> {
    let (last, parents) = path.split_last().ok_or(FieldError::EmptyPath)?;
    let mut current = root;
    for (depth, seg) in parents.iter().enumerate() {
        let here = &path[..depth];
        current = match (current, seg) {
            (Value::Object(map), PathSegment::Key(k)) => {
                map.get_mut(k).ok_or_else(|| FieldError::MissingKey {
                    path: render_path(here),
                    key: k.clone(),
                })?
            }
            (Value::Array(items), PathSegment::Index(i)) => {
                items.get_mut(*i).ok_or(FieldError::IndexOutOfRange {
                    path: render_path(here),
                    index: *i,
                })?
            }
            _ => {
                return Err(FieldError::NotAContainer {
                    path: render_path(path),
                    at: render_path(&path[..=depth]),
                })
            }
        };
    }

    match (current, last) {
        (Value::Object(map), PathSegment::Key(k)) => {
            map.insert(k.clone(), value);
            Ok(())
        }
        (Value::Array(items), PathSegment::Index(i)) => match items.get_mut(*i) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(FieldError::IndexOutOfRange {
                path: render_path(parents),
                index: *i,
            }),
        },
        _ => Err(FieldError::NotAContainer {
            path: render_path(path),
            at: render_path(path),
        }),
    }
}
