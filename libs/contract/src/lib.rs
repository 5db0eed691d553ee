//! # vplc-contract
//!
//! Message contract schemas and validation for the vPLC orchestrator agent.
//!
//! Every inbound cloud message is validated against a named schema before it
//! reaches a topic handler. A schema is an ordered mapping of field name to
//! type specifier; validation walks the payload and reports the *first*
//! mismatch with a dotted field path.
//!
//! ## Design Principles
//!
//! - Validation is pure: no I/O, no side effects, no clock access beyond
//!   parsing date strings.
//! - Unknown fields are preserved and passed through to handlers; a schema
//!   constrains only the fields it names.
//! - `Date` fields are actually parsed as ISO-8601, not merely string-checked.

use chrono::DateTime;
use serde_json::Value;
use thiserror::Error;

// =============================================================================
// Type Specifiers
// =============================================================================

/// The closed set of type specifiers a schema field can carry.
#[derive(Debug, Clone)]
pub enum TypeSpec {
    /// Any JSON string.
    String,
    /// Any JSON number (integer or float).
    Number,
    /// A JSON boolean.
    Boolean,
    /// An ISO-8601 datetime string. A trailing `Z` offset is accepted.
    Date,
    /// A homogeneous list of the inner specifier.
    List(Box<TypeSpec>),
    /// A field that may be absent or `null`; present values must match the
    /// inner specifier.
    Optional(Box<TypeSpec>),
    /// A nested object validated against its own schema.
    Object(Schema),
}

impl TypeSpec {
    /// Human-readable name used in error messages.
    fn expected_name(&self) -> String {
        match self {
            TypeSpec::String => "string".to_string(),
            TypeSpec::Number => "number".to_string(),
            TypeSpec::Boolean => "boolean".to_string(),
            TypeSpec::Date => "ISO-8601 datetime string".to_string(),
            TypeSpec::List(inner) => format!("list of {}", inner.expected_name()),
            TypeSpec::Optional(inner) => inner.expected_name(),
            TypeSpec::Object(_) => "object".to_string(),
        }
    }
}

/// Name of the JSON type actually found, for error messages.
fn actual_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Schema
// =============================================================================

/// An ordered mapping of field name to type specifier.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<(String, TypeSpec)>,
}

impl Schema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Add a field, builder style.
    pub fn field(mut self, name: &str, spec: TypeSpec) -> Self {
        self.fields.push((name.to_string(), spec));
        self
    }

    /// Merge another schema's fields after this one's. Later definitions of
    /// the same field name shadow earlier ones at validation time only in
    /// the sense that both are checked; schemas composed here are expected
    /// to be disjoint.
    pub fn extend(mut self, other: Schema) -> Self {
        self.fields.extend(other.fields);
        self
    }

    /// Iterate over the fields in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &TypeSpec)> {
        self.fields.iter().map(|(n, s)| (n.as_str(), s))
    }
}

/// Base schema shared by every cloud command:
/// `{correlation_id: Optional(Number), action: Optional(String),
/// requested_at: Optional(Date)}`.
pub fn base_message() -> Schema {
    Schema::new()
        .field("correlation_id", TypeSpec::Optional(Box::new(TypeSpec::Number)))
        .field("action", TypeSpec::Optional(Box::new(TypeSpec::String)))
        .field("requested_at", TypeSpec::Optional(Box::new(TypeSpec::Date)))
}

/// Base schema for device-addressed commands: base message plus a required
/// `device_id: String`.
pub fn base_device() -> Schema {
    base_message().field("device_id", TypeSpec::String)
}

// =============================================================================
// Validation
// =============================================================================

/// First validation failure, with a dotted path to the offending field.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field `{path}`")]
    MissingField { path: String },

    #[error("invalid field `{path}`: expected {expected}, got {actual}")]
    TypeMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("payload must be an object, got {actual}")]
    NotAnObject { actual: String },
}

impl ValidationError {
    /// The dotted path of the offending field, or empty for a non-object
    /// payload.
    pub fn path(&self) -> &str {
        match self {
            ValidationError::MissingField { path } => path,
            ValidationError::TypeMismatch { path, .. } => path,
            ValidationError::NotAnObject { .. } => "",
        }
    }
}

/// Validate `payload` against `schema`.
///
/// On success the payload passes through unchanged: unknown fields are
/// preserved for the handler. On failure the first error is returned.
pub fn validate(schema: &Schema, payload: &Value) -> Result<(), ValidationError> {
    let object = payload.as_object().ok_or_else(|| ValidationError::NotAnObject {
        actual: actual_name(payload).to_string(),
    })?;

    for (name, spec) in schema.fields() {
        match object.get(name) {
            None => {
                if !matches!(spec, TypeSpec::Optional(_)) {
                    return Err(ValidationError::MissingField {
                        path: name.to_string(),
                    });
                }
            }
            Some(value) => validate_value(spec, value, name)?,
        }
    }

    Ok(())
}

fn validate_value(spec: &TypeSpec, value: &Value, path: &str) -> Result<(), ValidationError> {
    let mismatch = || ValidationError::TypeMismatch {
        path: path.to_string(),
        expected: spec.expected_name(),
        actual: actual_name(value).to_string(),
    };

    match spec {
        TypeSpec::String => value.is_string().then_some(()).ok_or_else(mismatch),
        TypeSpec::Number => value.is_number().then_some(()).ok_or_else(mismatch),
        TypeSpec::Boolean => value.is_boolean().then_some(()).ok_or_else(mismatch),
        TypeSpec::Date => {
            let text = value.as_str().ok_or_else(mismatch)?;
            parse_iso8601(text).then_some(()).ok_or_else(mismatch)
        }
        TypeSpec::List(inner) => {
            let items = value.as_array().ok_or_else(mismatch)?;
            for (index, item) in items.iter().enumerate() {
                validate_value(inner, item, &format!("{path}[{index}]"))?;
            }
            Ok(())
        }
        TypeSpec::Optional(inner) => {
            if value.is_null() {
                Ok(())
            } else {
                validate_value(inner, value, path)
            }
        }
        TypeSpec::Object(schema) => {
            let object = value.as_object().ok_or_else(mismatch)?;
            for (name, field_spec) in schema.fields() {
                let child_path = format!("{path}.{name}");
                match object.get(name) {
                    None => {
                        if !matches!(field_spec, TypeSpec::Optional(_)) {
                            return Err(ValidationError::MissingField { path: child_path });
                        }
                    }
                    Some(child) => validate_value(field_spec, child, &child_path)?,
                }
            }
            Ok(())
        }
    }
}

/// Accept RFC 3339 directly, plus offset-free ISO-8601 local datetimes.
fn parse_iso8601(text: &str) -> bool {
    if DateTime::parse_from_rfc3339(text).is_ok() {
        return true;
    }
    chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S").is_ok()
        || chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_specifiers() {
        let schema = Schema::new()
            .field("s", TypeSpec::String)
            .field("n", TypeSpec::Number)
            .field("b", TypeSpec::Boolean);

        let ok = json!({"s": "x", "n": 1.5, "b": true});
        assert!(validate(&schema, &ok).is_ok());

        let bad = json!({"s": "x", "n": "not a number", "b": true});
        let err = validate(&schema, &bad).unwrap_err();
        assert_eq!(err.path(), "n");
        assert!(matches!(err, ValidationError::TypeMismatch { .. }));
    }

    #[test]
    fn test_missing_required_field() {
        let schema = Schema::new().field("device_id", TypeSpec::String);
        let err = validate(&schema, &json!({})).unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingField {
                path: "device_id".to_string()
            }
        );
    }

    #[test]
    fn test_optional_fields() {
        let schema = Schema::new().field("note", TypeSpec::Optional(Box::new(TypeSpec::String)));

        assert!(validate(&schema, &json!({})).is_ok());
        assert!(validate(&schema, &json!({"note": null})).is_ok());
        assert!(validate(&schema, &json!({"note": "hi"})).is_ok());
        assert!(validate(&schema, &json!({"note": 3})).is_err());
    }

    #[test]
    fn test_date_is_parsed_not_string_checked() {
        let schema = Schema::new().field("requested_at", TypeSpec::Date);

        assert!(validate(&schema, &json!({"requested_at": "2025-10-10T17:00:00Z"})).is_ok());
        assert!(validate(&schema, &json!({"requested_at": "2025-10-10T17:00:00+02:00"})).is_ok());
        assert!(validate(&schema, &json!({"requested_at": "2025-10-10T17:00:00.123"})).is_ok());
        assert!(validate(&schema, &json!({"requested_at": "yesterday"})).is_err());
        assert!(validate(&schema, &json!({"requested_at": 1728576000})).is_err());
    }

    #[test]
    fn test_list_reports_indexed_path() {
        let schema = Schema::new().field("dns", TypeSpec::List(Box::new(TypeSpec::String)));

        assert!(validate(&schema, &json!({"dns": ["8.8.8.8", "1.1.1.1"]})).is_ok());

        let err = validate(&schema, &json!({"dns": ["8.8.8.8", 53]})).unwrap_err();
        assert_eq!(err.path(), "dns[1]");
    }

    #[test]
    fn test_nested_object_reports_dotted_path() {
        let inner = Schema::new()
            .field("name", TypeSpec::String)
            .field("parent_interface", TypeSpec::String);
        let schema = Schema::new().field(
            "vnic_configs",
            TypeSpec::List(Box::new(TypeSpec::Object(inner))),
        );

        let ok = json!({"vnic_configs": [{"name": "eth0", "parent_interface": "ens37"}]});
        assert!(validate(&schema, &ok).is_ok());

        let bad = json!({"vnic_configs": [{"name": "eth0"}]});
        let err = validate(&schema, &bad).unwrap_err();
        assert_eq!(err.path(), "vnic_configs[0].parent_interface");

        let bad_type = json!({"vnic_configs": [{"name": "eth0", "parent_interface": 7}]});
        let err = validate(&schema, &bad_type).unwrap_err();
        assert_eq!(err.path(), "vnic_configs[0].parent_interface");
    }

    #[test]
    fn test_unknown_fields_pass_through() {
        let schema = Schema::new().field("device_id", TypeSpec::String);
        let payload = json!({"device_id": "plc-001", "extra": {"anything": [1, 2, 3]}});

        assert!(validate(&schema, &payload).is_ok());
        // The payload is untouched: handlers see the extra field.
        assert!(payload.get("extra").is_some());
    }

    #[test]
    fn test_first_error_wins() {
        let schema = Schema::new()
            .field("a", TypeSpec::Number)
            .field("b", TypeSpec::Number);
        let err = validate(&schema, &json!({"a": "x", "b": "y"})).unwrap_err();
        assert_eq!(err.path(), "a");
    }

    #[test]
    fn test_payload_must_be_object() {
        let schema = base_message();
        let err = validate(&schema, &json!([1, 2])).unwrap_err();
        assert!(matches!(err, ValidationError::NotAnObject { .. }));
    }

    #[test]
    fn test_base_message_all_optional() {
        let schema = base_message();
        assert!(validate(&schema, &json!({})).is_ok());
        assert!(validate(
            &schema,
            &json!({"correlation_id": 12345, "action": "delete_device",
                    "requested_at": "2025-10-10T17:00:00Z"})
        )
        .is_ok());
        assert!(validate(&schema, &json!({"correlation_id": "12345"})).is_err());
    }

    #[test]
    fn test_base_device_requires_device_id() {
        let schema = base_device();
        assert!(validate(&schema, &json!({"device_id": "plc-001"})).is_ok());

        let err = validate(&schema, &json!({"correlation_id": 1})).unwrap_err();
        assert_eq!(err.path(), "device_id");
    }

    #[test]
    fn test_schema_extend_keeps_order() {
        let extra = Schema::new().field("cpuPeriod", TypeSpec::String);
        let schema = base_device().extend(extra);
        let names: Vec<&str> = schema.fields().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["correlation_id", "action", "requested_at", "device_id", "cpuPeriod"]
        );
    }
}
