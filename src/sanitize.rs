use serde_json::{Map, Value};

/// Keys dropped at every depth of an upstream payload.
pub const DENYLIST: [&str; 4] = ["owner", "credit", "channel", "developer_credits"];

pub const ATTRIBUTION_KEY: &str = "api_by";

/// Removes denylisted keys from every object, however deeply nested,
/// leaving order and everything else as is.
#[must_use]
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !DENYLIST.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), sanitize(value)))
                .collect(),
        ),
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            value.clone()
        }
    }
}

/// Objects get `api_by` as their last key. Anything else is wrapped as
/// `{"data": value, "api_by": by}`.
#[must_use]
pub fn attribute(value: Value, by: &str) -> Value {
    let mut map = match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    // Re-inserting an existing key would keep its old position.
    map.shift_remove(ATTRIBUTION_KEY);
    map.insert(ATTRIBUTION_KEY.to_string(), Value::String(by.to_string()));
    Value::Object(map)
}
