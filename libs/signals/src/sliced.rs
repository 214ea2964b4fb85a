//! Sliced Signals
//!
//! A slice exposes one nested field of a JSON-valued parent as if it were a
//! root value of its own.
//!
//! Parent patches are re-expressed relative to the slice path:
//!
//! | parent patch path            | slice sees                              |
//! |------------------------------|-----------------------------------------|
//! | strict ancestor of the slice | one root replace with the new sub-value |
//! | array add/remove at or before the slice index | one root replace   |
//! | the slice path or below it   | the patch with the shared prefix removed |
//! | anywhere else                | nothing                                  |
//!
//! Path keys compare by their rendered form, so `Index(1)` and `Key("1")`
//! address the same child.
//!
//! Writes go the other way: slice patches get the slice path prepended before
//! they reach the parent. Write tags are namespaced with the key of the
//! [`SliceBuilder`] that made the slice, so slices from different builders
//! never see each other's tags.

use crate::signal::{SharedUpdater, Subscribable, Subscriber, Subscription, Writable};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;
use wire::{apply_patches, generate_write_tag, value_at_path, Patch, PatchOp, PathKey, WriteTag};

/// Creates slices that share one tag namespace
#[derive(Debug, Clone)]
pub struct SliceBuilder {
    tag_prefix: String,
}

impl Default for SliceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SliceBuilder {
    pub fn new() -> Self {
        let key = generate_write_tag();
        Self {
            tag_prefix: format!("{}:", &key[..8]),
        }
    }

    /// Prefix applied to every tag written through this builder's slices
    pub fn tag_prefix(&self) -> &str {
        &self.tag_prefix
    }

    pub fn slice(&self, parent: Arc<dyn Subscribable<Value>>, path: Vec<PathKey>) -> SlicedSignal {
        SlicedSignal {
            parent,
            path,
            tag_prefix: self.tag_prefix.clone(),
        }
    }

    pub fn slice_writable<P>(&self, parent: Arc<P>, path: Vec<PathKey>) -> SlicedWritableSignal
    where
        P: Writable<Value> + 'static,
    {
        let writer: Arc<dyn Writable<Value>> = parent.clone();
        SlicedWritableSignal {
            sliced: self.slice(parent, path),
            writer,
        }
    }
}

/// Read-only projection of a parent's nested field
#[derive(Clone)]
pub struct SlicedSignal {
    parent: Arc<dyn Subscribable<Value>>,
    path: Vec<PathKey>,
    tag_prefix: String,
}

impl SlicedSignal {
    pub fn path(&self) -> &[PathKey] {
        &self.path
    }

    /// Current sub-value; `null` if the path does not exist
    pub fn get(&self) -> Value {
        drill(&self.parent.current(), &self.path)
    }

    /// A slice of this slice
    pub fn slice(&self, path: Vec<PathKey>) -> SlicedSignal {
        let mut full = self.path.clone();
        full.extend(path);
        SlicedSignal {
            parent: Arc::clone(&self.parent),
            path: full,
            tag_prefix: self.tag_prefix.clone(),
        }
    }

    pub fn subscribe(&self, subscriber: impl Fn(&Value) + Send + Sync + 'static) -> Subscription {
        self.subscribe_full(move |value, _, _| subscriber(value))
    }

    /// Subscribe to the slice; parent changes that do not touch it are skipped
    pub fn subscribe_full(
        &self,
        subscriber: impl Fn(&Value, &[Patch], &[WriteTag]) + Send + Sync + 'static,
    ) -> Subscription {
        self.parent.observe(self.translating(subscriber))
    }

    fn translating(
        &self,
        subscriber: impl Fn(&Value, &[Patch], &[WriteTag]) + Send + Sync + 'static,
    ) -> Subscriber<Value> {
        let path = self.path.clone();
        let prefix = self.tag_prefix.clone();
        Arc::new(move |value: &Value, patches: &[Patch], tags: &[WriteTag]| {
            let translated = translate_patches(&path, value, patches);
            let own_tags = strip_tags(&prefix, tags);
            if translated.is_empty() && own_tags.is_empty() {
                return;
            }
            subscriber(&drill(value, &path), &translated, &own_tags);
        })
    }
}

impl Subscribable<Value> for SlicedSignal {
    fn current(&self) -> Value {
        self.get()
    }

    fn observe(&self, subscriber: Subscriber<Value>) -> Subscription {
        self.subscribe_full(move |value, patches, tags| subscriber(value, patches, tags))
    }

    fn observe_with_snapshot(
        &self,
        snapshot: Box<dyn FnOnce(&Value) + '_>,
        subscriber: Subscriber<Value>,
    ) -> Subscription {
        let path = self.path.clone();
        self.parent.observe_with_snapshot(
            Box::new(move |parent: &Value| snapshot(&drill(parent, &path))),
            self.translating(move |value, patches, tags| subscriber(value, patches, tags)),
        )
    }
}

/// Read/write projection of a parent's nested field
#[derive(Clone)]
pub struct SlicedWritableSignal {
    sliced: SlicedSignal,
    writer: Arc<dyn Writable<Value>>,
}

impl SlicedWritableSignal {
    pub fn path(&self) -> &[PathKey] {
        self.sliced.path()
    }

    pub fn get(&self) -> Value {
        self.sliced.get()
    }

    pub fn slice(&self, path: Vec<PathKey>) -> SlicedWritableSignal {
        SlicedWritableSignal {
            sliced: self.sliced.slice(path),
            writer: Arc::clone(&self.writer),
        }
    }

    pub fn subscribe(&self, subscriber: impl Fn(&Value) + Send + Sync + 'static) -> Subscription {
        self.sliced.subscribe(subscriber)
    }

    pub fn subscribe_full(
        &self,
        subscriber: impl Fn(&Value, &[Patch], &[WriteTag]) + Send + Sync + 'static,
    ) -> Subscription {
        self.sliced.subscribe_full(subscriber)
    }

    /// Write the sub-value through the parent
    pub fn update(
        &self,
        updater: impl Fn(&Value) -> (Value, Vec<Patch>) + Send + Sync + 'static,
        tags: Vec<WriteTag>,
    ) {
        self.update_shared(Arc::new(updater), tags);
    }

    /// Replace the whole sub-value
    pub fn set(&self, value: Value, tags: Vec<WriteTag>) {
        self.update(
            move |_| (value.clone(), vec![Patch::replace_root(value.clone())]),
            tags,
        );
    }

    fn update_shared(&self, updater: SharedUpdater<Value>, tags: Vec<WriteTag>) {
        let path = self.sliced.path.clone();
        let parent_updater: SharedUpdater<Value> = Arc::new(move |parent: &Value| {
            let (next, patches) = updater(&drill(parent, &path));
            let prefixed: Vec<Patch> = patches.iter().map(|patch| patch.prefixed(&path)).collect();
            match apply_patches(parent, &prefixed) {
                Ok(updated) => (updated, prefixed),
                Err(error) => {
                    debug!(%error, "Slice patches do not apply to parent; replacing the slice");
                    let updated = with_value_at_path(parent, &path, next.clone());
                    (updated, vec![Patch::replace(path.clone(), next)])
                }
            }
        });
        let tags = tags
            .into_iter()
            .map(|tag| format!("{}{}", self.sliced.tag_prefix, tag))
            .collect();
        self.writer.write(parent_updater, tags);
    }
}

impl Subscribable<Value> for SlicedWritableSignal {
    fn current(&self) -> Value {
        self.get()
    }

    fn observe(&self, subscriber: Subscriber<Value>) -> Subscription {
        self.sliced.observe(subscriber)
    }

    fn observe_with_snapshot(
        &self,
        snapshot: Box<dyn FnOnce(&Value) + '_>,
        subscriber: Subscriber<Value>,
    ) -> Subscription {
        self.sliced.observe_with_snapshot(snapshot, subscriber)
    }
}

impl Writable<Value> for SlicedWritableSignal {
    fn write(&self, updater: SharedUpdater<Value>, tags: Vec<WriteTag>) {
        self.update_shared(updater, tags);
    }
}

/// Re-express parent patches relative to `slice_path`
///
/// `parent_value` is the parent after the patches were applied; it supplies
/// the replacement when an ancestor of the slice changed.
pub fn translate_patches(slice_path: &[PathKey], parent_value: &Value, patches: &[Patch]) -> Vec<Patch> {
    let mut translated = Vec::new();
    for patch in patches {
        let ancestor = patch.path.len() < slice_path.len() && has_prefix(slice_path, &patch.path);
        if ancestor || shifts_slice(slice_path, patch) {
            // Finer patches are meaningless once an ancestor was rewritten
            return vec![Patch::replace_root(drill(parent_value, slice_path))];
        }
        if !has_prefix(&patch.path, slice_path) {
            continue;
        }
        let rest = patch.path[slice_path.len()..].to_vec();
        if rest.is_empty() {
            let value = match patch.op {
                PatchOp::Remove => Value::Null,
                PatchOp::Replace | PatchOp::Add => patch.value.clone().unwrap_or(Value::Null),
            };
            translated.push(Patch::replace_root(value));
        } else {
            translated.push(Patch {
                op: patch.op,
                path: rest,
                value: patch.value.clone(),
            });
        }
    }
    translated
}

fn same_key(a: &PathKey, b: &PathKey) -> bool {
    match (a, b) {
        (PathKey::Key(a), PathKey::Key(b)) => a == b,
        (PathKey::Index(a), PathKey::Index(b)) => a == b,
        (PathKey::Index(index), PathKey::Key(key)) | (PathKey::Key(key), PathKey::Index(index)) => {
            *key == index.to_string()
        }
    }
}

fn has_prefix(path: &[PathKey], prefix: &[PathKey]) -> bool {
    path.len() >= prefix.len() && path.iter().zip(prefix).all(|(a, b)| same_key(a, b))
}

/// An insert or removal in an array that holds the slice, at or before its
/// position, moves a different element under the slice path
fn shifts_slice(slice_path: &[PathKey], patch: &Patch) -> bool {
    if !matches!(patch.op, PatchOp::Add | PatchOp::Remove) {
        return false;
    }
    let Some((last, parent)) = patch.path.split_last() else {
        return false;
    };
    if parent.len() >= slice_path.len() || !has_prefix(slice_path, parent) {
        return false;
    }
    match (last.index(), slice_path[parent.len()].index()) {
        (Some(at), Some(slice_at)) => at <= slice_at,
        _ => false,
    }
}

fn strip_tags(prefix: &str, tags: &[WriteTag]) -> Vec<WriteTag> {
    tags.iter()
        .filter_map(|tag| tag.strip_prefix(prefix))
        .map(str::to_string)
        .collect()
}

fn drill(value: &Value, path: &[PathKey]) -> Value {
    value_at_path(value, path).cloned().unwrap_or(Value::Null)
}

/// `value` with `path` set to `leaf`, creating objects along the way
fn with_value_at_path(value: &Value, path: &[PathKey], leaf: Value) -> Value {
    let Some((key, rest)) = path.split_first() else {
        return leaf;
    };
    match (value, key) {
        (Value::Array(items), PathKey::Index(index)) if *index < items.len() => {
            let mut items = items.clone();
            items[*index] = with_value_at_path(&items[*index], rest, leaf);
            Value::Array(items)
        }
        _ => {
            let mut map = value.as_object().cloned().unwrap_or_else(Map::new);
            let name = match key {
                PathKey::Key(name) => name.clone(),
                PathKey::Index(index) => index.to_string(),
            };
            let child = with_value_at_path(map.get(&name).unwrap_or(&Value::Null), rest, leaf);
            map.insert(name, child);
            Value::Object(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Signal;
    use parking_lot::Mutex;
    use serde_json::json;

    fn path(keys: &[&str]) -> Vec<PathKey> {
        keys.iter().map(|key| PathKey::from(*key)).collect()
    }

    type Seen = Arc<Mutex<Vec<(Value, Vec<Patch>, Vec<WriteTag>)>>>;

    fn record(slice: &SlicedWritableSignal) -> (Seen, Subscription) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = slice.subscribe_full(move |value, patches, tags| {
            sink.lock().push((value.clone(), patches.to_vec(), tags.to_vec()))
        });
        (seen, subscription)
    }

    #[test]
    fn test_translate_by_relationship() {
        let slice = path(&["a", "b"]);
        let parent = json!({"a": {"b": {"c": 2}}, "z": 1});

        let ancestor = vec![Patch::replace(path(&["a"]), json!({"b": {"c": 2}}))];
        assert_eq!(
            translate_patches(&slice, &parent, &ancestor),
            vec![Patch::replace_root(json!({"c": 2}))]
        );

        let exact = vec![Patch::replace(path(&["a", "b"]), json!({"c": 2}))];
        assert_eq!(
            translate_patches(&slice, &parent, &exact),
            vec![Patch::replace_root(json!({"c": 2}))]
        );

        let descendant = vec![Patch::replace(path(&["a", "b", "c"]), json!(2))];
        assert_eq!(
            translate_patches(&slice, &parent, &descendant),
            vec![Patch::replace(path(&["c"]), json!(2))]
        );

        let unrelated = vec![Patch::replace(path(&["z"]), json!(1))];
        assert!(translate_patches(&slice, &parent, &unrelated).is_empty());

        let removed = vec![Patch::remove(path(&["a", "b"]))];
        assert_eq!(
            translate_patches(&slice, &json!({"a": {}}), &removed),
            vec![Patch::replace_root(Value::Null)]
        );
    }

    #[test]
    fn test_unrelated_parent_changes_are_not_announced() {
        let parent = Signal::new(json!({"a": {"b": 1}, "z": 0}));
        let slice = SliceBuilder::new().slice_writable(Arc::new(parent.clone()), path(&["a", "b"]));
        let (seen, _subscription) = record(&slice);

        parent.set_with_patches(
            json!({"a": {"b": 1}, "z": 5}),
            vec![Patch::replace(path(&["z"]), json!(5))],
            Vec::new(),
        );
        assert!(seen.lock().is_empty());

        parent.set_with_patches(
            json!({"a": {"b": 7}, "z": 5}),
            vec![Patch::replace(path(&["a", "b"]), json!(7))],
            Vec::new(),
        );
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, json!(7));
        assert_eq!(seen[0].1, vec![Patch::replace_root(json!(7))]);
    }

    #[test]
    fn test_writes_are_prefixed_and_tags_namespaced() {
        let parent = Signal::new(json!({"settings": {"theme": "light", "size": 12}}));
        let builder = SliceBuilder::new();
        let settings = builder.slice_writable(Arc::new(parent.clone()), path(&["settings"]));
        let other = SliceBuilder::new().slice_writable(Arc::new(parent.clone()), path(&["settings"]));

        let parent_seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&parent_seen);
        let _parent_subscription = parent.subscribe_full(move |_, patches, tags| {
            sink.lock().push((patches.to_vec(), tags.to_vec()))
        });
        let (own, _own_subscription) = record(&settings);
        let (foreign, _foreign_subscription) = record(&other);

        settings.update(
            crate::produce::producer(|draft| draft["theme"] = json!("dark")),
            vec!["w1".into()],
        );

        assert_eq!(parent.get(), json!({"settings": {"theme": "dark", "size": 12}}));
        let parent_seen = parent_seen.lock();
        assert_eq!(
            parent_seen[0].0,
            vec![Patch::replace(path(&["settings", "theme"]), json!("dark"))]
        );
        assert_eq!(parent_seen[0].1, vec![format!("{}w1", builder.tag_prefix())]);

        assert_eq!(own.lock()[0].2, vec!["w1".to_string()]);
        assert!(foreign.lock()[0].2.is_empty());
        assert_eq!(foreign.lock()[0].0, json!({"theme": "dark", "size": 12}));
    }

    #[test]
    fn test_write_creates_missing_path() {
        let parent = Signal::new(json!({}));
        let slice = SliceBuilder::new().slice_writable(Arc::new(parent.clone()), path(&["a", "b"]));
        slice.set(json!(3), Vec::new());
        assert_eq!(parent.get(), json!({"a": {"b": 3}}));
        assert_eq!(slice.get(), json!(3));
    }

    #[test]
    fn test_nested_slices_compose_paths() {
        let parent = Signal::new(json!({"a": {"b": {"c": [1, 2]}}}));
        let outer = SliceBuilder::new().slice_writable(Arc::new(parent.clone()), path(&["a"]));
        let inner = outer.slice(vec![PathKey::from("b"), PathKey::from("c"), PathKey::Index(1)]);
        assert_eq!(inner.get(), json!(2));

        inner.set(json!(20), Vec::new());
        assert_eq!(parent.get(), json!({"a": {"b": {"c": [1, 20]}}}));
    }
}
