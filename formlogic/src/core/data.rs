//! Segment-addressed reads and writes into submission JSON.
//!
//! Segments are keys for objects and decimal indices for arrays. Writes never
//! create intermediate objects: a missing parent means the slot does not exist
//! for this submission and the write is dropped.

use serde_json::Value;

pub fn get<'v, S: AsRef<str>>(root: &'v Value, segments: &[S]) -> Option<&'v Value> {
    segments
        .iter()
        .try_fold(root, |current, segment| step(current, segment.as_ref()))
}

pub fn get_mut<'v, S: AsRef<str>>(root: &'v mut Value, segments: &[S]) -> Option<&'v mut Value> {
    segments
        .iter()
        .try_fold(root, |current, segment| step_mut(current, segment.as_ref()))
}

/// Write `value` at `segments`. Returns false when the parent slot is missing.
pub fn set<S: AsRef<str>>(root: &mut Value, segments: &[S], value: Value) -> bool {
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return true;
    };
    let Some(parent) = get_mut(root, parents) else {
        return false;
    };
    match parent {
        Value::Object(map) => {
            map.insert(last.as_ref().to_string(), value);
            true
        }
        Value::Array(items) => match last.as_ref().parse::<usize>() {
            Ok(index) if index < items.len() => {
                items[index] = value;
                true
            }
            _ => false,
        },
        _ => false,
    }
}

/// Remove the value at `segments` from its parent object.
pub fn remove<S: AsRef<str>>(root: &mut Value, segments: &[S]) -> Option<Value> {
    let (last, parents) = segments.split_last()?;
    match get_mut(root, parents)? {
        Value::Object(map) => map.remove(last.as_ref()),
        _ => None,
    }
}

fn step<'v>(current: &'v Value, segment: &str) -> Option<&'v Value> {
    match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

fn step_mut<'v>(current: &'v mut Value, segment: &str) -> Option<&'v mut Value> {
    match current {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(move |i| items.get_mut(i)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_walks_objects_and_arrays() {
        let data = json!({ "rows": [{ "val": "a" }, { "val": "b" }] });
        assert_eq!(get(&data, &["rows", "1", "val"]), Some(&json!("b")));
        assert_eq!(get(&data, &["rows", "7", "val"]), None);
        assert_eq!(get(&data, &["rows", "x"]), None);
    }

    #[test]
    fn set_requires_existing_parent() {
        let mut data = json!({ "rows": [{ "val": "a" }] });
        assert!(set(&mut data, &["rows", "0", "val"], json!("z")));
        assert!(!set(&mut data, &["missing", "val"], json!(1)));
        assert_eq!(data, json!({ "rows": [{ "val": "z" }] }));
    }

    #[test]
    fn remove_drops_object_keys_only() {
        let mut data = json!({ "a": 1, "list": [1, 2] });
        assert_eq!(remove(&mut data, &["a"]), Some(json!(1)));
        assert_eq!(remove(&mut data, &["list", "0"]), None);
        assert_eq!(data, json!({ "list": [1, 2] }));
    }
}
