//! Lightweight argument validation for meta-tools
//!
//! Validates the subset of JSON Schema the meta-tool definitions actually
//! use: object shape, required properties, primitive property types, and
//! `additionalProperties: false`. Failures surface before any handler runs.

use serde_json::Value;

use crate::{Error, Result};

/// Validate arguments against a meta-tool input schema.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<()> {
    let Some(object) = arguments.as_object() else {
        return Err(Error::Validation("arguments must be an object".to_string()));
    };

    let properties = schema.get("properties").and_then(Value::as_object);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(name) {
                return Err(Error::Validation(format!(
                    "missing required property '{name}'"
                )));
            }
        }
    }

    let additional_allowed = schema
        .get("additionalProperties")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    for (name, value) in object {
        let Some(property_schema) = properties.and_then(|p| p.get(name)) else {
            if additional_allowed {
                continue;
            }
            return Err(Error::Validation(format!("unknown property '{name}'")));
        };
        if let Some(expected) = property_schema.get("type").and_then(Value::as_str) {
            if !type_matches(expected, value) {
                return Err(Error::Validation(format!(
                    "property '{name}' must be of type {expected}"
                )));
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}
