// crates/envelope-core/src/runtime/pointer.rs
// ============================================================================
// Module: Payload Pointer Walker
// Description: JSON-pointer field lookups and recursive merge-patch.
// Purpose: Answer checklist pointer checks and apply payload patches.
// Dependencies: serde_json
// ============================================================================

//! ## Overview
//! Checklist items of kind `payload_field` reference payload locations with
//! JSON-pointer paths (`/payee/name`). The walker answers presence and value
//! queries; [`merge_patch`] applies payload patches with recursive object
//! merge. Payload writes perform no schema enforcement; the checklist and
//! gates judge the payload after the fact.
//! Invariants:
//! - A field "exists" only when it resolves to a non-null value.
//! - `~0` and `~1` unescape to `~` and `/` per the JSON pointer rules.
//! - Merge-patch recurses into objects; any other patch value wins at its
//!   leaf, including explicit null.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde_json::Map;
use serde_json::Value;

// ============================================================================
// SECTION: Lookup
// ============================================================================

/// Resolves a JSON-pointer path against a payload document.
///
/// An empty pointer resolves to the whole document. Array steps must parse
/// as unsigned indices; anything else is a miss.
#[must_use]
pub fn field_value<'a>(payload: &'a Map<String, Value>, pointer: &str) -> Option<&'a Value> {
    if pointer.is_empty() {
        return None;
    }
    let mut current: Option<&Value> = None;
    for raw in pointer.trim_start_matches('/').split('/') {
        let step = unescape(raw);
        current = match current {
            None => payload.get(step.as_ref()),
            Some(Value::Object(map)) => map.get(step.as_ref()),
            Some(Value::Array(items)) => {
                step.parse::<usize>().ok().and_then(|index| items.get(index))
            }
            Some(_) => None,
        };
        current?;
    }
    current
}

/// Returns true when the pointer resolves to a non-null value.
#[must_use]
pub fn field_exists(payload: &Map<String, Value>, pointer: &str) -> bool {
    matches!(field_value(payload, pointer), Some(value) if !value.is_null())
}

/// Reverses JSON pointer escaping: `~1` to `/`, then `~0` to `~`.
fn unescape(step: &str) -> std::borrow::Cow<'_, str> {
    if step.contains('~') {
        std::borrow::Cow::Owned(step.replace("~1", "/").replace("~0", "~"))
    } else {
        std::borrow::Cow::Borrowed(step)
    }
}

// ============================================================================
// SECTION: Merge Patch
// ============================================================================

/// Applies a patch onto an existing payload with recursive object merge.
///
/// Objects merge key by key; every other value replaces the existing one at
/// its position. Returns the top-level keys the patch touched, in the
/// patch map's key order.
pub fn merge_patch(existing: &mut Map<String, Value>, patch: Map<String, Value>) -> Vec<String> {
    let mut touched = Vec::with_capacity(patch.len());
    for (key, incoming) in patch {
        touched.push(key.clone());
        match (existing.get_mut(&key), incoming) {
            (Some(Value::Object(current)), Value::Object(nested)) => {
                merge_object(current, nested);
            }
            (_, incoming) => {
                existing.insert(key, incoming);
            }
        }
    }
    touched
}

/// Recursively merges `patch` into `current` per merge-patch semantics.
fn merge_object(current: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, incoming) in patch {
        match (current.get_mut(&key), incoming) {
            (Some(Value::Object(inner)), Value::Object(nested)) => {
                merge_object(inner, nested);
            }
            (_, incoming) => {
                current.insert(key, incoming);
            }
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
