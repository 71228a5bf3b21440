//! Field-by-field argument validation against a tool's parameter schema.
//!
//! Covers the JSON-Schema subset tool servers actually advertise: `type`
//! (single or list), `required`, `properties`, `items`, and `enum`. Unknown
//! keywords are ignored, and full validation is left to the server.

use serde_json::{Map, Value};
use thiserror::Error;

/// Why an argument object does not fit a schema.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaViolation {
    /// Arguments must be a JSON object.
    #[error("arguments must be a JSON object, got {found}")]
    NotAnObject { found: &'static str },

    /// A field listed in `required` is absent.
    #[error("missing required field '{field}'")]
    MissingRequired { field: String },

    /// A field's value does not match its declared `type`.
    #[error("field '{field}' should be {expected}, got {found}")]
    WrongType {
        field: String,
        expected: String,
        found: &'static str,
    },

    /// A field's value is not one of the `enum` options.
    #[error("field '{field}' must be one of {allowed}")]
    NotInEnum { field: String, allowed: String },
}

/// Validate an argument object against a parameter schema.
///
/// An empty or non-object schema accepts any object.
pub fn validate_arguments(schema: &Value, args: &Value) -> Result<(), SchemaViolation> {
    let Some(obj) = args.as_object() else {
        return Err(SchemaViolation::NotAnObject {
            found: json_type_name(args),
        });
    };
    validate_object(schema, obj, "")
}

/// Whether the schema declares any parameters at all.
pub fn has_parameters(schema: &Value) -> bool {
    let has_properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .is_some_and(|p| !p.is_empty());
    let has_required = schema
        .get("required")
        .and_then(Value::as_array)
        .is_some_and(|r| !r.is_empty());
    has_properties || has_required
}

fn validate_object(schema: &Value, obj: &Map<String, Value>, path: &str) -> Result<(), SchemaViolation> {
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(field) {
                return Err(SchemaViolation::MissingRequired {
                    field: join_path(path, field),
                });
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };

    for (name, value) in obj {
        if let Some(prop_schema) = properties.get(name) {
            validate_value(prop_schema, value, &join_path(path, name))?;
        }
    }
    Ok(())
}

fn validate_value(schema: &Value, value: &Value, path: &str) -> Result<(), SchemaViolation> {
    let declared = declared_types(schema);
    if !declared.is_empty() && !declared.iter().any(|t| matches_type(t, value)) {
        return Err(SchemaViolation::WrongType {
            field: path.to_string(),
            expected: declared.join(" or "),
            found: json_type_name(value),
        });
    }

    if let Some(options) = schema.get("enum").and_then(Value::as_array) {
        if !options.contains(value) {
            let allowed = options.iter().map(Value::to_string).collect::<Vec<_>>().join(", ");
            return Err(SchemaViolation::NotInEnum {
                field: path.to_string(),
                allowed: format!("[{allowed}]"),
            });
        }
    }

    match value {
        Value::Object(obj) => validate_object(schema, obj, path),
        Value::Array(items) => match schema.get("items") {
            Some(item_schema) => {
                for (i, item) in items.iter().enumerate() {
                    validate_value(item_schema, item, &format!("{path}[{i}]"))?;
                }
                Ok(())
            }
            None => Ok(()),
        },
        _ => Ok(()),
    }
}

fn declared_types(schema: &Value) -> Vec<String> {
    match schema.get("type") {
        Some(Value::String(t)) => vec![t.clone()],
        Some(Value::Array(ts)) => ts.iter().filter_map(Value::as_str).map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        // Unknown type keywords are the server's business.
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn join_path(parent: &str, field: &str) -> String {
    if parent.is_empty() {
        field.to_string()
    } else {
        format!("{parent}.{field}")
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
