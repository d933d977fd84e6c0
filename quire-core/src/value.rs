//! Conversions between JSON property values and the merge primitive's `Any`.

use serde_json::{Map as JsonMap, Number, Value};
use std::collections::HashMap;
use std::sync::Arc;
use yrs::Any;

pub fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Any::Number(i as f64),
            None => n.as_f64().map(Any::Number).unwrap_or(Any::Null),
        },
        Value::String(s) => Any::String(s.as_str().into()),
        Value::Array(items) => {
            let items: Vec<Any> = items.iter().map(json_to_any).collect();
            Any::Array(items.into())
        }
        Value::Object(map) => {
            let entries: HashMap<String, Any> = map
                .iter()
                .map(|(k, v)| (k.clone(), json_to_any(v)))
                .collect();
            Any::Map(Arc::new(entries))
        }
    }
}

pub fn any_to_json(value: &Any) -> Value {
    match value {
        Any::Null => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => number_to_json(*n),
        Any::BigInt(i) => Value::from(*i),
        Any::String(s) => Value::String(s.to_string()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(entries) => {
            let object: JsonMap<String, Value> = entries
                .iter()
                .map(|(k, v)| (k.clone(), any_to_json(v)))
                .collect();
            Value::Object(object)
        }
        _ => Value::Null,
    }
}

/// Integral floats come back as JSON integers so `json!(1)` survives a round trip.
fn number_to_json(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalars() {
        assert_eq!(any_to_json(&json_to_any(&json!(null))), json!(null));
        assert_eq!(any_to_json(&json_to_any(&json!(true))), json!(true));
        assert_eq!(any_to_json(&json_to_any(&json!(3))), json!(3));
        assert_eq!(any_to_json(&json_to_any(&json!(2.5))), json!(2.5));
        assert_eq!(any_to_json(&json_to_any(&json!("dark"))), json!("dark"));
    }

    #[test]
    fn test_nested_values() {
        let value = json!({"flags": [true, false], "size": {"w": 10, "h": 4.5}});
        assert_eq!(any_to_json(&json_to_any(&value)), value);
    }

    #[test]
    fn test_non_finite_number_becomes_null() {
        assert_eq!(any_to_json(&Any::Number(f64::NAN)), Value::Null);
    }
}
