//! Field-level comparison between two config documents.
//!
//! Listeners use this to react only to the parts of a `SetConfig` that
//! actually changed.

use serde_json::Value;
use std::mem::discriminant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldChange {
    Added,
    Removed,
    Updated,
    Unchanged,
}

/// Classify field `name` between `old` and `new`.
///
/// A field counts as updated when its JSON type differs or its value is not
/// structurally equal. Non-object documents have no fields.
pub fn compare_field(old: &Value, new: &Value, name: &str) -> FieldChange {
    match (old.get(name), new.get(name)) {
        (None, None) => FieldChange::Unchanged,
        (None, Some(_)) => FieldChange::Added,
        (Some(_), None) => FieldChange::Removed,
        (Some(a), Some(b)) => {
            if discriminant(a) == discriminant(b) && a == b {
                FieldChange::Unchanged
            } else {
                FieldChange::Updated
            }
        }
    }
}

/// Every top-level field that differs, old fields first in document order,
/// then fields only present in `new`.
pub fn changed_fields(old: &Value, new: &Value) -> Vec<(String, FieldChange)> {
    let mut names: Vec<&String> = Vec::new();
    for doc in [old, new] {
        if let Some(map) = doc.as_object() {
            for key in map.keys() {
                if !names.contains(&key) {
                    names.push(key);
                }
            }
        }
    }

    names
        .into_iter()
        .filter_map(|name| match compare_field(old, new, name) {
            FieldChange::Unchanged => None,
            change => Some((name.clone(), change)),
        })
        .collect()
}
