//! Partial-update merge
//!
//! Stored relationship arrays hold reference objects, while payloads carry
//! ids. Before an update payload is overlaid on the prior version, the prior
//! relationship arrays are projected back to the payload form so that omitted
//! fields round-trip unchanged.

use serde_json::Value;

use crate::models::{Payload, RawReference, Reference};
use crate::rules::EntityRules;

/// Rewrites every relationship array with `f`, leaving other fields alone
fn map_relationships(
    rules: &dyn EntityRules,
    mut content: Payload,
    f: impl Fn(Reference) -> Value,
) -> Payload {
    for rule in rules.relationships() {
        match content.get(rule.field) {
            Some(Value::Array(values)) => {
                let mapped = values
                    .iter()
                    .filter_map(RawReference::from_value)
                    .filter_map(|r| r.resolve())
                    .map(&f)
                    .collect();
                content.insert(rule.field.to_string(), Value::Array(mapped));
            }
            Some(Value::Null) => {
                content.remove(rule.field);
            }
            _ => {}
        }
    }
    content
}

/// Stored content → payload form
pub fn project_to_input(rules: &dyn EntityRules, content: &Payload) -> Payload {
    map_relationships(rules, content.clone(), |r| r.to_input())
}

/// Validated payload → stored content
pub fn normalize(rules: &dyn EntityRules, payload: Payload) -> Payload {
    let payload = map_relationships(rules, payload, |r| r.to_stored());
    payload.into_iter().filter(|(_, v)| !v.is_null()).collect()
}

/// Overlays `incoming` on the prior content.
///
/// Omitted fields keep their prior value; an explicit `null` clears the field.
pub fn merge(rules: &dyn EntityRules, prior: &Payload, incoming: Payload) -> Payload {
    let mut merged = project_to_input(rules, prior);
    for (field, value) in incoming {
        if value.is_null() {
            merged.remove(&field);
        } else {
            merged.insert(field, value);
        }
    }
    merged
}
