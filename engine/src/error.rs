//! Error types for the Tally engine.

use crate::SchemaVersion;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A single constraint a payload failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Violation {
    /// The payload was not a JSON object at all.
    NotAnObject,
    /// A required field is absent or null.
    Missing { field: String },
    /// The field holds a value of the wrong JSON type.
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },
    /// A string field is longer than its cap (counted in characters).
    TooLong {
        field: String,
        max: usize,
        actual: usize,
    },
    /// A numeric field is outside its allowed range.
    OutOfRange {
        field: String,
        min: Option<f64>,
        max: Option<f64>,
        value: f64,
    },
}

impl Violation {
    /// The field this violation refers to, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            Violation::NotAnObject => None,
            Violation::Missing { field }
            | Violation::TypeMismatch { field, .. }
            | Violation::TooLong { field, .. }
            | Violation::OutOfRange { field, .. } => Some(field),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::NotAnObject => write!(f, "payload must be an object"),
            Violation::Missing { field } => write!(f, "missing required field: {field}"),
            Violation::TypeMismatch {
                field,
                expected,
                got,
            } => write!(
                f,
                "type mismatch for field '{field}': expected {expected}, got {got}"
            ),
            Violation::TooLong { field, max, actual } => write!(
                f,
                "field '{field}' is too long: {actual} characters (max {max})"
            ),
            Violation::OutOfRange {
                field,
                min,
                max,
                value,
            } => {
                write!(f, "field '{field}' is out of range: {value}")?;
                match (min, max) {
                    (Some(min), Some(max)) => write!(f, " (allowed {min}..={max})"),
                    (Some(min), None) => write!(f, " (minimum {min})"),
                    (None, Some(max)) => write!(f, " (maximum {max})"),
                    (None, None) => Ok(()),
                }
            }
        }
    }
}

/// Every violation found in one payload, in field order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationErrors(pub Vec<Violation>);

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Violation> {
        self.0.iter()
    }

    /// Violations for one field, for showing next to the matching input.
    pub fn for_field<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a Violation> {
        self.0.iter().filter(move |v| v.field() == Some(field))
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, violation) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{violation}")?;
        }
        Ok(())
    }
}

/// All possible errors from the Tally engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Validation errors
    #[error("invalid payload: {0}")]
    Validation(ValidationErrors),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch {
        expected: SchemaVersion,
        actual: SchemaVersion,
    },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
