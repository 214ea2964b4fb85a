//! Patch-Producing Mutations
//!
//! Write a change as an in-place edit of a draft and get back both the new
//! value and the patches describing it.

use serde_json::Value;
use wire::{diff_values, Patch};

/// Run `recipe` against a draft copy of `base`
pub fn produce(base: &Value, recipe: impl FnOnce(&mut Value)) -> (Value, Vec<Patch>) {
    let mut draft = base.clone();
    recipe(&mut draft);
    let patches = diff_values(base, &draft);
    (draft, patches)
}

/// Turn a draft recipe into a replayable updater for signal writes
pub fn producer(
    recipe: impl Fn(&mut Value) + Send + Sync + 'static,
) -> impl Fn(&Value) -> (Value, Vec<Patch>) + Send + Sync + 'static {
    move |base| produce(base, |draft| recipe(draft))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wire::{apply_patches, PathKey};

    #[test]
    fn test_produce_reports_nested_edit() {
        let base = json!({"user": {"name": "ada", "age": 36}});
        let (next, patches) = produce(&base, |draft| draft["user"]["age"] = json!(37));

        assert_eq!(next, json!({"user": {"name": "ada", "age": 37}}));
        assert_eq!(
            patches,
            vec![Patch::replace(
                vec![PathKey::from("user"), PathKey::from("age")],
                json!(37)
            )]
        );
        assert_eq!(apply_patches(&base, &patches).unwrap(), next);
    }

    #[test]
    fn test_untouched_draft_produces_nothing() {
        let base = json!([1, 2, 3]);
        let (next, patches) = produce(&base, |_| {});
        assert_eq!(next, base);
        assert!(patches.is_empty());
    }

    #[test]
    fn test_producer_replays_against_new_bases() {
        let push = producer(|draft| {
            if let Some(items) = draft.as_array_mut() {
                items.push(json!(0));
            }
        });
        let (once, _) = push(&json!([]));
        let (twice, patches) = push(&once);
        assert_eq!(twice, json!([0, 0]));
        assert_eq!(apply_patches(&once, &patches).unwrap(), twice);
    }
}
