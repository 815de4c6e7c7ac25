//! Record validation and serialization.
//!
//! A [`RecordCodec`] turns raw client input into validated fields, or into
//! field-level error messages, and renders stored records back into the
//! mapping clients see.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Validated record fields.
pub type Fields = Map<String, Value>;

/// Key used for errors that do not belong to a single field.
pub const NON_FIELD_ERRORS: &str = "non_field_errors";

/// A stored record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Record key.
    pub pk: Value,
    /// Stored fields, without the key.
    pub fields: Fields,
}

impl Record {
    /// Create a record.
    #[must_use]
    pub fn new(pk: impl Into<Value>, fields: Fields) -> Self {
        Self {
            pk: pk.into(),
            fields,
        }
    }
}

/// Field name to ordered error messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<String, Vec<String>>);

impl FieldErrors {
    /// Create an empty error set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Error set with a single non-field message.
    #[must_use]
    pub fn non_field(message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(NON_FIELD_ERRORS, message);
        errors
    }

    /// Append a message for a field.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_default().push(message.into());
    }

    /// Messages recorded for a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    /// Number of fields with errors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if no errors were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Render as a JSON object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let map = self
            .0
            .iter()
            .map(|(field, messages)| {
                let messages = messages.iter().cloned().map(Value::String).collect();
                (field.clone(), Value::Array(messages))
            })
            .collect();
        Value::Object(map)
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            write!(f, "{field}: {}", messages.join(", "))?;
        }
        Ok(())
    }
}

/// Validates input and serializes records for one resource type.
pub trait RecordCodec: Send + Sync {
    /// Validate raw action data.
    ///
    /// With `partial`, only the supplied fields are checked; required fields
    /// may be omitted.
    ///
    /// # Errors
    ///
    /// Returns the field errors when validation fails.
    fn validate(&self, raw: Option<&Value>, partial: bool) -> Result<Fields, FieldErrors>;

    /// Render a record as the mapping sent to clients.
    fn serialize(&self, record: &Record) -> Map<String, Value>;
}

/// Type of a schema field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    String,
    Integer,
    Float,
    Boolean,
    Any,
}

/// One declared field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name.
    pub name: String,
    /// Field type.
    #[serde(default)]
    pub kind: FieldKind,
    /// Whether the field must be present on create and full update.
    #[serde(default = "default_required")]
    pub required: bool,
    /// Upper bound on string length, in characters.
    #[serde(default)]
    pub max_length: Option<usize>,
}

fn default_required() -> bool {
    true
}

impl FieldSpec {
    /// A required field of the given kind.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            max_length: None,
        }
    }

    /// Make the field optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Limit string length.
    #[must_use]
    pub fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    fn coerce(&self, value: &Value) -> Result<Value, String> {
        match self.kind {
            FieldKind::Any => Ok(value.clone()),
            FieldKind::String => {
                let Value::String(s) = value else {
                    return Err("A valid string is required.".to_string());
                };
                if let Some(max) = self.max_length {
                    if s.chars().count() > max {
                        return Err(format!(
                            "Ensure this field has no more than {max} characters."
                        ));
                    }
                }
                Ok(value.clone())
            }
            FieldKind::Integer => {
                let invalid = || "A valid integer is required.".to_string();
                match value {
                    Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
                    Value::String(s) => s
                        .trim()
                        .parse::<i64>()
                        .map(Value::from)
                        .map_err(|_| invalid()),
                    _ => Err(invalid()),
                }
            }
            FieldKind::Float => {
                let invalid = || "A valid number is required.".to_string();
                match value {
                    Value::Number(_) => Ok(value.clone()),
                    Value::String(s) => s
                        .trim()
                        .parse::<f64>()
                        .ok()
                        .and_then(Number::from_f64)
                        .map(Value::Number)
                        .ok_or_else(invalid),
                    _ => Err(invalid()),
                }
            }
            FieldKind::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
                Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
                _ => Err("Must be a valid boolean.".to_string()),
            },
        }
    }
}

/// Codec driven by a declared list of fields.
///
/// Serialized records contain the key under `key_field` followed by the
/// declared fields. Undeclared input fields are dropped.
#[derive(Debug, Clone)]
pub struct SchemaCodec {
    fields: Vec<FieldSpec>,
    key_field: String,
}

impl SchemaCodec {
    /// Create a codec for the given fields, keyed by `id`.
    #[must_use]
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self {
            fields,
            key_field: "id".to_string(),
        }
    }

    /// Use a different name for the key in serialized records.
    #[must_use]
    pub fn with_key_field(mut self, key_field: impl Into<String>) -> Self {
        self.key_field = key_field.into();
        self
    }

    /// Declared fields.
    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }
}

impl RecordCodec for SchemaCodec {
    fn validate(&self, raw: Option<&Value>, partial: bool) -> Result<Fields, FieldErrors> {
        let input = match raw {
            None => return Err(FieldErrors::non_field("No data provided")),
            Some(Value::Object(input)) => input,
            Some(_) => {
                return Err(FieldErrors::non_field(
                    "Invalid data. Expected a dictionary.",
                ))
            }
        };

        let mut fields = Fields::new();
        let mut errors = FieldErrors::new();

        for spec in &self.fields {
            match input.get(&spec.name) {
                None => {
                    if spec.required && !partial {
                        errors.add(&spec.name, "This field is required.");
                    }
                }
                Some(Value::Null) => {
                    if spec.required {
                        errors.add(&spec.name, "This field may not be null.");
                    } else {
                        fields.insert(spec.name.clone(), Value::Null);
                    }
                }
                Some(value) => match spec.coerce(value) {
                    Ok(value) => {
                        fields.insert(spec.name.clone(), value);
                    }
                    Err(message) => errors.add(&spec.name, message),
                },
            }
        }

        if errors.is_empty() {
            Ok(fields)
        } else {
            Err(errors)
        }
    }

    fn serialize(&self, record: &Record) -> Map<String, Value> {
        let mut out = Map::new();
        out.insert(self.key_field.clone(), record.pk.clone());
        for spec in &self.fields {
            let value = record.fields.get(&spec.name).cloned().unwrap_or(Value::Null);
            out.insert(spec.name.clone(), value);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn widget_codec() -> SchemaCodec {
        SchemaCodec::new(vec![
            FieldSpec::new("name", FieldKind::String).max_length(8),
            FieldSpec::new("quantity", FieldKind::Integer).optional(),
        ])
    }

    #[test]
    fn test_validate_required_fields() {
        let errors = widget_codec().validate(Some(&json!({})), false).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors.to_value(),
            json!({"name": ["This field is required."]})
        );
    }

    #[test]
    fn test_validate_partial_skips_missing() {
        let fields = widget_codec()
            .validate(Some(&json!({"quantity": "4"})), true)
            .unwrap();
        assert_eq!(Value::Object(fields), json!({"quantity": 4}));
    }

    #[test]
    fn test_validate_types_and_lengths() {
        let errors = widget_codec()
            .validate(Some(&json!({"name": "far-too-long", "quantity": 1.5})), false)
            .unwrap_err();

        assert_eq!(
            errors.get("name").unwrap(),
            ["Ensure this field has no more than 8 characters."]
        );
        assert_eq!(
            errors.get("quantity").unwrap(),
            ["A valid integer is required."]
        );
    }

    #[test]
    fn test_validate_rejects_non_objects() {
        let codec = widget_codec();
        let errors = codec.validate(Some(&json!([1, 2])), false).unwrap_err();
        assert!(errors.get(NON_FIELD_ERRORS).is_some());

        let errors = codec.validate(None, false).unwrap_err();
        assert_eq!(errors.get(NON_FIELD_ERRORS).unwrap(), ["No data provided"]);
    }

    #[test]
    fn test_validate_nulls() {
        let codec = widget_codec();
        let errors = codec
            .validate(Some(&json!({"name": null})), false)
            .unwrap_err();
        assert_eq!(errors.get("name").unwrap(), ["This field may not be null."]);

        let fields = codec
            .validate(Some(&json!({"name": "ok", "quantity": null})), false)
            .unwrap();
        assert_eq!(fields.get("quantity"), Some(&Value::Null));
    }

    #[test]
    fn test_unknown_fields_are_dropped() {
        let fields = widget_codec()
            .validate(Some(&json!({"name": "A", "colour": "red"})), false)
            .unwrap();
        assert!(!fields.contains_key("colour"));
    }

    #[test]
    fn test_serialize_emits_key_then_declared_fields() {
        let mut fields = Fields::new();
        fields.insert("name".into(), json!("A"));
        fields.insert("internal".into(), json!(true));
        let record = Record::new(3, fields);

        assert_eq!(
            Value::Object(widget_codec().serialize(&record)),
            json!({"id": 3, "name": "A", "quantity": null})
        );
    }

    #[test]
    fn test_field_spec_from_config() {
        let spec: FieldSpec =
            serde_json::from_value(json!({"name": "active", "kind": "boolean", "required": false}))
                .unwrap();
        assert_eq!(spec.kind, FieldKind::Boolean);
        assert!(!spec.required);

        let spec: FieldSpec = serde_json::from_value(json!({"name": "title"})).unwrap();
        assert_eq!(spec.kind, FieldKind::String);
        assert!(spec.required);
    }
}
