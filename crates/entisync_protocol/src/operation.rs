//! Declarative patch operations over entity documents.

use crate::error::{PatchError, PatchResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// A validated path into an entity document.
///
/// Paths are dot-separated segments. A segment addresses an object key,
/// or a list index when every character is a digit. The root `id` field
/// is never addressable: entity identity is immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PatchPath {
    segments: Vec<String>,
}

impl PatchPath {
    /// Parses and validates a path string.
    pub fn parse(raw: &str) -> PatchResult<Self> {
        if raw.is_empty() {
            return Err(PatchError::InvalidPath("empty path".into()));
        }

        let segments: Vec<String> = raw.split('.').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(PatchError::InvalidPath(format!("empty segment in {raw}")));
        }
        if segments[0] == "id" {
            return Err(PatchError::IdImmutable);
        }

        Ok(Self { segments })
    }

    /// Returns the path segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Splits into the parent segments and the final segment.
    fn split_last(&self) -> (&[String], &str) {
        match self.segments.split_last() {
            Some((last, parents)) => (parents, last),
            // Parsing guarantees at least one segment.
            None => (&[], ""),
        }
    }
}

impl fmt::Display for PatchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

impl FromStr for PatchPath {
    type Err = PatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PatchPath {
    type Error = PatchError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<PatchPath> for String {
    fn from(path: PatchPath) -> Self {
        path.to_string()
    }
}

/// A declarative description of a single mutation to an entity.
///
/// Patch operations are pure: applying one is a function of the target
/// document and the operation alone, so an operation can be replayed
/// against a newer snapshot during reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    /// Sets the value at `path`, creating intermediate objects as needed.
    Set {
        /// Target path.
        path: PatchPath,
        /// Value to store.
        value: Value,
    },
    /// Appends `value` to the list at `path`.
    ///
    /// The path must resolve to an existing JSON array.
    Push {
        /// Target path.
        path: PatchPath,
        /// Value to append.
        value: Value,
    },
    /// Removes the field or list element at `path`.
    ///
    /// Removing an absent field is a no-op, so replaying an `Unset`
    /// is always safe.
    Unset {
        /// Target path.
        path: PatchPath,
    },
}

impl PatchOp {
    /// Builds a `Set` operation.
    pub fn set(path: &str, value: Value) -> PatchResult<Self> {
        Ok(Self::Set {
            path: PatchPath::parse(path)?,
            value,
        })
    }

    /// Builds a `Push` operation.
    pub fn push(path: &str, value: Value) -> PatchResult<Self> {
        Ok(Self::Push {
            path: PatchPath::parse(path)?,
            value,
        })
    }

    /// Builds an `Unset` operation.
    pub fn unset(path: &str) -> PatchResult<Self> {
        Ok(Self::Unset {
            path: PatchPath::parse(path)?,
        })
    }

    /// Returns the path this operation addresses.
    pub fn path(&self) -> &PatchPath {
        match self {
            PatchOp::Set { path, .. } | PatchOp::Push { path, .. } | PatchOp::Unset { path } => {
                path
            }
        }
    }

    /// Applies this operation to an entity document in place.
    ///
    /// On error the document is left unchanged: every variant validates
    /// the full traversal before mutating.
    pub fn apply(&self, target: &mut Value) -> PatchResult<()> {
        if !target.is_object() {
            return Err(PatchError::NotAnObject);
        }

        match self {
            PatchOp::Set { path, value } => {
                let (parents, last) = path.split_last();
                let parent = descend_or_create(target, parents, path)?;
                set_in(parent, last, value.clone(), path)
            }
            PatchOp::Push { path, value } => {
                let slot = descend(target, path.segments(), path)?;
                match slot {
                    Value::Array(items) => {
                        items.push(value.clone());
                        Ok(())
                    }
                    _ => Err(PatchError::TypeMismatch {
                        path: path.to_string(),
                        expected: "array",
                    }),
                }
            }
            PatchOp::Unset { path } => {
                let (parents, last) = path.split_last();
                let parent = match descend_mut(target, parents) {
                    Some(v) => v,
                    // Absent parent means absent field: nothing to remove.
                    None => return Ok(()),
                };
                unset_in(parent, last, path)
            }
        }
    }
}

/// Applies a sequence of operations, stopping at the first failure.
///
/// Callers that need atomicity should apply against a clone and swap.
pub fn apply_all(ops: &[PatchOp], target: &mut Value) -> PatchResult<()> {
    for op in ops {
        op.apply(target)?;
    }
    Ok(())
}

fn as_index(segment: &str) -> Option<usize> {
    if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
        segment.parse().ok()
    } else {
        None
    }
}

/// Follows `segments` down the document, erroring on a dead end.
fn descend<'a>(
    target: &'a mut Value,
    segments: &[String],
    path: &PatchPath,
) -> PatchResult<&'a mut Value> {
    let mut current = target;
    for segment in segments {
        current = step(current, segment).ok_or_else(|| PatchError::Unresolvable(path.to_string()))?;
    }
    Ok(current)
}

/// Like `descend`, but returns `None` instead of an error on a dead end.
fn descend_mut<'a>(target: &'a mut Value, segments: &[String]) -> Option<&'a mut Value> {
    let mut current = target;
    for segment in segments {
        current = step(current, segment)?;
    }
    Some(current)
}

/// Follows `segments`, creating intermediate objects for missing keys.
fn descend_or_create<'a>(
    target: &'a mut Value,
    segments: &[String],
    path: &PatchPath,
) -> PatchResult<&'a mut Value> {
    let mut current = target;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.entry(segment.clone()).or_insert_with(|| {
                Value::Object(serde_json::Map::new())
            }),
            Value::Array(items) => {
                let idx = as_index(segment)
                    .filter(|i| *i < items.len())
                    .ok_or_else(|| PatchError::Unresolvable(path.to_string()))?;
                &mut items[idx]
            }
            _ => {
                return Err(PatchError::TypeMismatch {
                    path: path.to_string(),
                    expected: "object or array",
                })
            }
        };
    }
    Ok(current)
}

fn step<'a>(current: &'a mut Value, segment: &str) -> Option<&'a mut Value> {
    match current {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => {
            let idx = as_index(segment)?;
            items.get_mut(idx)
        }
        _ => None,
    }
}

fn set_in(parent: &mut Value, last: &str, value: Value, path: &PatchPath) -> PatchResult<()> {
    match parent {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let idx = as_index(last)
                .filter(|i| *i < items.len())
                .ok_or_else(|| PatchError::Unresolvable(path.to_string()))?;
            items[idx] = value;
            Ok(())
        }
        _ => Err(PatchError::TypeMismatch {
            path: path.to_string(),
            expected: "object or array",
        }),
    }
}

fn unset_in(parent: &mut Value, last: &str, path: &PatchPath) -> PatchResult<()> {
    match parent {
        Value::Object(map) => {
            map.remove(last);
            Ok(())
        }
        Value::Array(items) => {
            match as_index(last) {
                Some(idx) if idx < items.len() => {
                    items.remove(idx);
                }
                // Out-of-range removal is a no-op, matching object keys.
                Some(_) => {}
                None => return Err(PatchError::Unresolvable(path.to_string())),
            }
            Ok(())
        }
        _ => Err(PatchError::TypeMismatch {
            path: path.to_string(),
            expected: "object or array",
        }),
    }
}
