//! Record decoding: delimited text values into typed feature and label fields.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

pub mod delimited;
pub mod preprocess;
pub mod schema;

pub use delimited::{DelimitedDecoder, RecordDecoder};
pub use preprocess::{IdentityPreprocessor, Preprocessor};
pub use schema::{DecodeSchema, FieldSpec};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("expected {expected} columns, found {found}")]
    ColumnCount { expected: usize, found: usize },

    #[error("field {field} value {value:?} is not a valid {field_type}")]
    InvalidField {
        field: String,
        field_type: FieldType,
        value: String,
    },

    #[error("record value is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed offset metadata token {0:?}")]
    MalformedOffsetToken(String),

    #[error("label field {field} has no value")]
    MissingLabel { field: String },
}

impl DecodeError {
    /// Row-scoped errors drop the row; a missing label stops the run.
    pub fn is_row_scoped(&self) -> bool {
        !matches!(self, DecodeError::MissingLabel { .. })
    }

    /// Returns the error type tag for metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            DecodeError::ColumnCount { .. } => "column_count",
            DecodeError::InvalidField { .. } => "invalid_field",
            DecodeError::InvalidUtf8 => "invalid_utf8",
            DecodeError::MalformedOffsetToken(_) => "malformed_offset_token",
            DecodeError::MissingLabel { .. } => "missing_label",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int32,
    Int64,
    Float,
    Double,
    String,
    Bool,
}

impl FieldType {
    /// Value used for empty text when the field has no configured default.
    pub fn zero(&self) -> FieldValue {
        match self {
            FieldType::Int32 => FieldValue::Int32(0),
            FieldType::Int64 => FieldValue::Int64(0),
            FieldType::Float => FieldValue::Float(0.0),
            FieldType::Double => FieldValue::Double(0.0),
            FieldType::String => FieldValue::String(String::new()),
            FieldType::Bool => FieldValue::Bool(false),
        }
    }

    /// Cast non-empty field text. Returns `None` when the text is not a valid value.
    pub fn cast(&self, text: &str) -> Option<FieldValue> {
        let trimmed = text.trim();
        match self {
            FieldType::Int32 => trimmed.parse().ok().map(FieldValue::Int32),
            FieldType::Int64 => trimmed.parse().ok().map(FieldValue::Int64),
            FieldType::Float => trimmed.parse().ok().map(FieldValue::Float),
            FieldType::Double => trimmed.parse().ok().map(FieldValue::Double),
            FieldType::String => Some(FieldValue::String(text.to_string())),
            FieldType::Bool => match trimmed.to_ascii_lowercase().as_str() {
                "true" | "1" => Some(FieldValue::Bool(true)),
                "false" | "0" => Some(FieldValue::Bool(false)),
                _ => None,
            },
        }
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int32" | "int" => Ok(FieldType::Int32),
            "int64" | "bigint" => Ok(FieldType::Int64),
            "float" => Ok(FieldType::Float),
            "double" => Ok(FieldType::Double),
            "string" | "str" => Ok(FieldType::String),
            "bool" | "boolean" => Ok(FieldType::Bool),
            other => Err(format!("unknown field type: {other}")),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Int32 => "int32",
            FieldType::Int64 => "int64",
            FieldType::Float => "float",
            FieldType::Double => "double",
            FieldType::String => "string",
            FieldType::Bool => "bool",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bool(bool),
}

/// Field name to value, for features or labels of one row.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// One decoded row. `labels` is `None` when the pipeline runs in predict mode.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodedRow {
    pub features: FieldMap,
    pub labels: Option<FieldMap>,
}
