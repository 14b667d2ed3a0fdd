//! Deep merge of partial shadow-state documents.
//!
//! Devices report state as `{"state": {"reported": {...}}}` fragments. The
//! cached snapshot is kept flat (the contents of `reported`), so each update is
//! merged against the snapshot wrapped in the same envelope and unwrapped
//! again afterwards.

use serde_json::{Map, Value};

const STATE_KEY: &str = "state";
const REPORTED_KEY: &str = "reported";

/// Merges `incoming` into `target`.
///
/// Keys present in both where both values are objects merge recursively.
/// Everything else (scalars, arrays, type changes) replaces the target value.
pub fn deep_merge(target: &mut Value, incoming: &Value) {
    if let (Value::Object(existing), Value::Object(update)) = (&mut *target, incoming) {
        merge_objects(existing, update);
        return;
    }
    *target = incoming.clone();
}

fn merge_objects(target: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (key, value) in incoming {
        let both_objects = value.is_object() && target.get(key).is_some_and(Value::is_object);
        if !both_objects {
            target.insert(key.clone(), value.clone());
        } else if let Some(existing) = target.get_mut(key) {
            deep_merge(existing, value);
        }
    }
}

/// Wraps a flat snapshot as `{"state": {"reported": snapshot}}`.
pub fn wrap_reported(snapshot: &Value) -> Value {
    let mut reported = Map::new();
    reported.insert(REPORTED_KEY.to_string(), snapshot.clone());
    let mut state = Map::new();
    state.insert(STATE_KEY.to_string(), Value::Object(reported));
    Value::Object(state)
}

/// Extracts `state.reported` from an envelope.
pub fn unwrap_reported(envelope: Value) -> Option<Value> {
    let Value::Object(mut root) = envelope else {
        return None;
    };
    let Value::Object(mut state) = root.remove(STATE_KEY)? else {
        return None;
    };
    match state.remove(REPORTED_KEY)? {
        reported @ Value::Object(_) => Some(reported),
        _ => None,
    }
}

/// Applies one inbound payload to a flat snapshot and returns the new snapshot.
///
/// Returns `None` when the merged document no longer carries an object under
/// `state.reported`, leaving the caller's snapshot untouched.
pub fn apply_update(snapshot: &Value, payload: &Value) -> Option<Value> {
    let mut envelope = wrap_reported(snapshot);
    deep_merge(&mut envelope, payload);
    unwrap_reported(envelope)
}
