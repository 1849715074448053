//! Formatting attribute maps and their transform algebra.
//!
//! Attributes ride on `retain` and `insert` ops as a string-keyed map of
//! JSON values (`{"bold": true, "link": "https://…"}`). A `null` value is
//! the removal marker: composing `{"bold": null}` over `{"bold": true}`
//! clears the key. The three functions here mirror the delta algebra on
//! whole ops: compose, transform, invert.

use serde_json::Value;
use std::collections::BTreeMap;

/// Attribute map attached to a retain or insert op.
///
/// `BTreeMap` keeps key order deterministic so normalized deltas compare
/// structurally.
pub type AttrMap = BTreeMap<String, Value>;

/// Merge `b` over `a` for sequential application.
///
/// `keep_null` controls whether removal markers survive: they must on
/// retains (the removal still has to reach the underlying text) and must
/// not on inserts (removing a key from freshly inserted text just leaves
/// the key out).
pub fn compose(a: Option<&AttrMap>, b: Option<&AttrMap>, keep_null: bool) -> Option<AttrMap> {
    let mut merged: AttrMap = a.cloned().unwrap_or_default();
    if let Some(b) = b {
        for (key, value) in b {
            merged.insert(key.clone(), value.clone());
        }
    }
    if !keep_null {
        merged.retain(|_, v| !v.is_null());
    }
    if merged.is_empty() {
        None
    } else {
        Some(merged)
    }
}

/// Transform `b` against a concurrent `a`.
///
/// When `a_wins`, keys already set by `a` are dropped from `b`; otherwise
/// `b` passes through untouched.
pub fn transform(a: Option<&AttrMap>, b: Option<&AttrMap>, a_wins: bool) -> Option<AttrMap> {
    let (Some(a), Some(b)) = (a, b) else {
        return b.cloned();
    };
    if !a_wins {
        return Some(b.clone());
    }
    let surviving: AttrMap = b
        .iter()
        .filter(|(key, _)| !a.contains_key(*key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if surviving.is_empty() {
        None
    } else {
        Some(surviving)
    }
}

/// Compute the attribute change that undoes `attrs` on text that carried
/// `base` before the change. Keys whose value did not actually change are
/// skipped; keys absent from `base` invert to `null` (removal).
pub fn invert(attrs: Option<&AttrMap>, base: Option<&AttrMap>) -> Option<AttrMap> {
    let attrs = attrs?;
    let mut inverted = AttrMap::new();
    for (key, value) in attrs {
        let before = base.and_then(|b| b.get(key));
        if before != Some(value) {
            inverted.insert(key.clone(), before.cloned().unwrap_or(Value::Null));
        }
    }
    if inverted.is_empty() {
        None
    } else {
        Some(inverted)
    }
}
