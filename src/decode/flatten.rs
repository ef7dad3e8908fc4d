use serde_json::Value;
use std::collections::BTreeMap;

/// Flatten a decoded value into dotted keys for tabular export.
///
/// `{"a": {"b": 1}, "c": [true, null]}` becomes `a.b = 1`, `c.0 = true`,
/// `c.1 = null`. A bare scalar lands under `value`; a bare `null` yields
/// nothing.
pub fn flatten(value: &Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    match value {
        Value::Null => {}
        Value::Object(_) | Value::Array(_) => walk("", value, &mut out),
        scalar => {
            out.insert("value".to_string(), scalar.clone());
        }
    }
    out
}

fn walk(prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                walk(&join(prefix, key), child, out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                walk(&join(prefix, &i.to_string()), child, out);
            }
        }
        scalar => {
            out.insert(prefix.to_string(), scalar.clone());
        }
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}
