//! Payload constraints and validation.
//!
//! A [`RecordSchema`] mirrors the constraints the server enforces on an
//! outbound payload so the UI can fail fast. It is not a security boundary:
//! the server validates again. Validation reports every violation at once.

use crate::{
    error::{Result, ValidationErrors, Violation},
    Error,
};
use serde::{Deserialize, Serialize};

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in an outbound payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
    /// Maximum string length in characters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Inclusive lower bound for numeric fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Inclusive upper bound for numeric fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl FieldDef {
    fn with(name: impl Into<String>, field_type: FieldType, required: bool) -> Self {
        Self {
            name: name.into(),
            field_type,
            required,
            max_length: None,
            min: None,
            max: None,
        }
    }

    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self::with(name, field_type, true)
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self::with(name, field_type, false)
    }

    /// Cap the length of a string field.
    pub fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Restrict a numeric field to `min..=max`.
    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Restrict a numeric field to values `>= min`.
    pub fn at_least(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    /// Restrict a numeric field to values `<= max`.
    pub fn at_most(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    /// Check a JSON value against this field, appending any violations.
    pub fn check(&self, value: Option<&serde_json::Value>, out: &mut Vec<Violation>) {
        let value = match value {
            None | Some(serde_json::Value::Null) => {
                if self.required {
                    out.push(Violation::Missing {
                        field: self.name.clone(),
                    });
                }
                return;
            }
            Some(v) => v,
        };

        if !self.type_matches(value) {
            out.push(Violation::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            });
            return;
        }

        if let (Some(max), Some(s)) = (self.max_length, value.as_str()) {
            let actual = s.chars().count();
            if actual > max {
                out.push(Violation::TooLong {
                    field: self.name.clone(),
                    max,
                    actual,
                });
            }
        }

        if let Some(n) = value.as_f64() {
            let below = self.min.is_some_and(|min| n < min);
            let above = self.max.is_some_and(|max| n > max);
            if below || above {
                out.push(Violation::OutOfRange {
                    field: self.name.clone(),
                    min: self.min,
                    max: self.max,
                    value: n,
                });
            }
        }
    }

    fn type_matches(&self, value: &serde_json::Value) -> bool {
        match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64(),
            FieldType::Json => true, // Any JSON is valid
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Constraints for one kind of outbound payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSchema {
    /// Field definitions, checked in order
    pub fields: Vec<FieldDef>,
}

impl RecordSchema {
    /// Create a new record schema.
    pub fn new(fields: Vec<FieldDef>) -> Self {
        Self { fields }
    }

    /// Builder-style method to add a field.
    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Get a field definition by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Collect every violation in a payload. Empty means valid.
    pub fn violations(&self, payload: &serde_json::Value) -> ValidationErrors {
        let Some(obj) = payload.as_object() else {
            return ValidationErrors(vec![Violation::NotAnObject]);
        };

        let mut out = Vec::new();
        for field in &self.fields {
            field.check(obj.get(&field.name), &mut out);
        }
        ValidationErrors(out)
    }

    /// Validate a payload, failing with the full list of violations.
    pub fn validate_payload(&self, payload: &serde_json::Value) -> Result<()> {
        let errors = self.violations(payload);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(errors))
        }
    }
}
