//! Structural Patches
//!
//! A patch batch plus the value it was computed against fully determines the
//! next value. Replicated signals only ever ship patches; a replace at the root
//! path is the universal fallback meaning "here is the whole new value".

use crate::error::PatchError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One step of a patch path: an object key or an array index
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathKey {
    Index(usize),
    Key(String),
}

impl From<&str> for PathKey {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

impl From<String> for PathKey {
    fn from(key: String) -> Self {
        Self::Key(key)
    }
}

impl From<usize> for PathKey {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl PathKey {
    /// Position this key addresses inside an array
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Index(index) => Some(*index),
            Self::Key(key) => key.parse().ok(),
        }
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "[{}]", index),
            Self::Key(key) => write!(f, ".{}", key),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Replace,
    Add,
    Remove,
}

/// A single structural edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub op: PatchOp,
    pub path: Vec<PathKey>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub value: Option<Value>,
}

// An explicit `null` is a value, an absent field is not.
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Patch {
    pub fn replace(path: Vec<PathKey>, value: Value) -> Self {
        Self {
            op: PatchOp::Replace,
            path,
            value: Some(value),
        }
    }

    pub fn add(path: Vec<PathKey>, value: Value) -> Self {
        Self {
            op: PatchOp::Add,
            path,
            value: Some(value),
        }
    }

    pub fn remove(path: Vec<PathKey>) -> Self {
        Self {
            op: PatchOp::Remove,
            path,
            value: None,
        }
    }

    /// Replace the whole value
    pub fn replace_root(value: Value) -> Self {
        Self::replace(Vec::new(), value)
    }

    pub fn is_root_replace(&self) -> bool {
        self.path.is_empty() && matches!(self.op, PatchOp::Replace | PatchOp::Add)
    }

    /// The same edit expressed relative to a parent value that holds this
    /// patch's target at `prefix`.
    pub fn prefixed(&self, prefix: &[PathKey]) -> Self {
        let mut path = prefix.to_vec();
        path.extend(self.path.iter().cloned());
        Self {
            op: self.op,
            path,
            value: self.value.clone(),
        }
    }
}

fn render_path(path: &[PathKey]) -> String {
    if path.is_empty() {
        return "<root>".to_string();
    }
    path.iter().map(|key| key.to_string()).collect()
}

/// Apply a patch batch to a value, returning the next value
pub fn apply_patches(value: &Value, patches: &[Patch]) -> Result<Value, PatchError> {
    let mut next = value.clone();
    for patch in patches {
        apply_patch(&mut next, patch)?;
    }
    Ok(next)
}

fn apply_patch(target: &mut Value, patch: &Patch) -> Result<(), PatchError> {
    let Some((last, parents)) = patch.path.split_last() else {
        return match patch.op {
            PatchOp::Replace | PatchOp::Add => {
                *target = patch.value.clone().unwrap_or(Value::Null);
                Ok(())
            }
            PatchOp::Remove => Err(PatchError::RemoveRoot),
        };
    };

    let mut container = target;
    for (depth, key) in parents.iter().enumerate() {
        container = child_mut(container, key).ok_or_else(|| PatchError::PathNotFound {
            path: render_path(&patch.path[..=depth]),
        })?;
    }

    let value = patch.value.clone().unwrap_or(Value::Null);
    match container {
        Value::Object(map) => {
            let key = match last {
                PathKey::Key(key) => key.clone(),
                PathKey::Index(index) => index.to_string(),
            };
            match patch.op {
                PatchOp::Replace | PatchOp::Add => {
                    map.insert(key, value);
                }
                PatchOp::Remove => {
                    if map.remove(&key).is_none() {
                        return Err(PatchError::PathNotFound {
                            path: render_path(&patch.path),
                        });
                    }
                }
            }
            Ok(())
        }
        Value::Array(items) => {
            let index = last.index().ok_or_else(|| PatchError::PathNotFound {
                path: render_path(&patch.path),
            })?;
            let len = items.len();
            let out_of_bounds = || PatchError::IndexOutOfBounds {
                path: render_path(&patch.path),
                index,
                len,
            };
            match patch.op {
                PatchOp::Replace if index < len => items[index] = value,
                PatchOp::Replace if index == len => items.push(value),
                PatchOp::Add if index <= len => items.insert(index, value),
                PatchOp::Remove if index < len => {
                    items.remove(index);
                }
                _ => return Err(out_of_bounds()),
            }
            Ok(())
        }
        _ => Err(PatchError::NotAContainer {
            path: render_path(parents),
        }),
    }
}

fn child_mut<'a>(value: &'a mut Value, key: &PathKey) -> Option<&'a mut Value> {
    match value {
        Value::Object(map) => match key {
            PathKey::Key(key) => map.get_mut(key),
            PathKey::Index(index) => map.get_mut(&index.to_string()),
        },
        Value::Array(items) => items.get_mut(key.index()?),
        _ => None,
    }
}

fn child<'a>(value: &'a Value, key: &PathKey) -> Option<&'a Value> {
    match value {
        Value::Object(map) => match key {
            PathKey::Key(key) => map.get(key),
            PathKey::Index(index) => map.get(&index.to_string()),
        },
        Value::Array(items) => items.get(key.index()?),
        _ => None,
    }
}

/// Drill into `value` along `path`
pub fn value_at_path<'a>(value: &'a Value, path: &[PathKey]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| child(current, key))
}

/// Fold `next` into `acc`: the last root replace wins, otherwise concatenate.
pub fn merge_patches(acc: &mut Vec<Patch>, next: Vec<Patch>) {
    match next.iter().rposition(Patch::is_root_replace) {
        Some(position) => {
            acc.clear();
            acc.extend(next.into_iter().skip(position));
        }
        None => acc.extend(next),
    }
}

/// Compute a patch batch turning `old` into `new`
///
/// Objects are diffed key by key. Arrays of equal length are diffed index by
/// index; arrays that changed length are replaced whole.
pub fn diff_values(old: &Value, new: &Value) -> Vec<Patch> {
    let mut patches = Vec::new();
    diff_into(&mut Vec::new(), old, new, &mut patches);
    patches
}

fn diff_into(path: &mut Vec<PathKey>, old: &Value, new: &Value, patches: &mut Vec<Patch>) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for key in old_map.keys() {
                if !new_map.contains_key(key) {
                    path.push(PathKey::Key(key.clone()));
                    patches.push(Patch::remove(path.clone()));
                    path.pop();
                }
            }
            for (key, new_child) in new_map {
                path.push(PathKey::Key(key.clone()));
                match old_map.get(key) {
                    Some(old_child) => diff_into(path, old_child, new_child, patches),
                    None => patches.push(Patch::add(path.clone(), new_child.clone())),
                }
                path.pop();
            }
        }
        (Value::Array(old_items), Value::Array(new_items)) if old_items.len() == new_items.len() => {
            for (index, (old_child, new_child)) in old_items.iter().zip(new_items).enumerate() {
                path.push(PathKey::Index(index));
                diff_into(path, old_child, new_child, patches);
                path.pop();
            }
        }
        _ => patches.push(Patch::replace(path.clone(), new.clone())),
    }
}
