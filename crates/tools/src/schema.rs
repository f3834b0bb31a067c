//! Parameter validation against the subset of JSON Schema that tool schemas
//! use: type, required, properties, additionalProperties, enum, items,
//! minimum/maximum, minLength/maxLength, minItems/maxItems.

use serde_json::{Map, Value};

/// Validate `value` against `schema`. The error names the offending path.
pub fn validate(schema: &Value, value: &Value) -> Result<(), String> {
    validate_at(schema, value, "$")
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn validate_at(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected) = schema.get("type") {
        let ok = match expected {
            Value::String(t) => type_matches(t, value),
            Value::Array(ts) => ts.iter().filter_map(Value::as_str).any(|t| type_matches(t, value)),
            _ => true,
        };
        if !ok {
            return Err(format!("{}: expected {}, got {}", path, expected, type_name(value)));
        }
    }

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(value) {
            return Err(format!("{}: {} is not one of {}", path, value, Value::Array(allowed.clone())));
        }
    }

    match value {
        Value::Object(obj) => validate_object(schema, obj, path)?,
        Value::Array(items) => {
            check_len(schema, "minItems", "maxItems", items.len(), path, "items")?;
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    validate_at(item_schema, item, &format!("{}[{}]", path, i))?;
                }
            }
        }
        Value::String(s) => {
            check_len(schema, "minLength", "maxLength", s.chars().count(), path, "characters")?
        }
        Value::Number(n) => {
            if let Some(x) = n.as_f64() {
                if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
                    if x < min {
                        return Err(format!("{}: {} is below minimum {}", path, x, min));
                    }
                }
                if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
                    if x > max {
                        return Err(format!("{}: {} is above maximum {}", path, x, max));
                    }
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn check_len(
    schema: &Map<String, Value>,
    min_key: &str,
    max_key: &str,
    len: usize,
    path: &str,
    unit: &str,
) -> Result<(), String> {
    if let Some(min) = schema.get(min_key).and_then(Value::as_u64) {
        if (len as u64) < min {
            return Err(format!("{}: needs at least {} {}", path, min, unit));
        }
    }
    if let Some(max) = schema.get(max_key).and_then(Value::as_u64) {
        if (len as u64) > max {
            return Err(format!("{}: allows at most {} {}", path, max, unit));
        }
    }
    Ok(())
}

fn validate_object(schema: &Map<String, Value>, obj: &Map<String, Value>, path: &str) -> Result<(), String> {
    if let Some(Value::Array(required)) = schema.get("required") {
        for key in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(key) {
                return Err(format!("{}: missing required parameter '{}'", path, key));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    for (key, val) in obj {
        let child = format!("{}.{}", path, key);
        match properties.and_then(|p| p.get(key)) {
            Some(prop_schema) => validate_at(prop_schema, val, &child)?,
            None => match schema.get("additionalProperties") {
                Some(Value::Bool(false)) => {
                    return Err(format!("{}: unexpected parameter '{}'", path, key));
                }
                Some(extra @ Value::Object(_)) => validate_at(extra, val, &child)?,
                _ => {}
            },
        }
    }
    Ok(())
}
