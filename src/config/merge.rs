//! Inheritance overlay of service documents.
//!
//! # Rules
//! - Scalars: child overwrites base
//! - Maps: merged key-wise, recursively
//! - Arrays whose elements are all objects with a string `name`: merged by
//!   name (matched entries overlay, unmatched child entries append)
//! - Other arrays: concatenated, parents first, duplicates dropped

use serde_json::Value;

/// Overlay `child` onto `base` in place.
pub fn overlay(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Object(base_map), Value::Object(child_map)) => {
            for (key, value) in child_map {
                match base_map.get_mut(&key) {
                    Some(existing) => overlay(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(base_items), Value::Array(child_items))
            if is_named(base_items) && is_named(&child_items) =>
        {
            for item in child_items {
                let name = item.get("name").cloned();
                match base_items.iter_mut().find(|b| b.get("name") == name.as_ref()) {
                    Some(existing) => overlay(existing, item),
                    None => base_items.push(item),
                }
            }
        }
        (Value::Array(base_items), Value::Array(child_items)) => {
            for item in child_items {
                if !base_items.contains(&item) {
                    base_items.push(item);
                }
            }
        }
        (base, child) => *base = child,
    }
}

fn is_named(items: &[Value]) -> bool {
    items
        .iter()
        .all(|item| item.get("name").map(Value::is_string).unwrap_or(false))
}
