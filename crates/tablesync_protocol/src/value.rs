//! Column values and element data types.

use serde::{Deserialize, Serialize};

/// The declared type of a column.
///
/// `RowPath` and `ConfigPath` columns hold file names relative to the row's
/// attachment set and are the only attachment-bearing types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementDataType {
    /// Signed 64-bit integer.
    Integer,
    /// Floating point number.
    Number,
    /// Boolean.
    Boolean,
    /// Free text.
    String,
    /// File attached to the row.
    RowPath,
    /// File attached to the application configuration.
    ConfigPath,
    /// JSON array serialized as text.
    Array,
    /// JSON object serialized as text.
    Object,
}

impl ElementDataType {
    /// Returns true if values of this type reference attachment files.
    pub fn is_attachment(&self) -> bool {
        matches!(self, ElementDataType::RowPath | ElementDataType::ConfigPath)
    }

    /// Returns true if `value` may be stored in a column of this type.
    pub fn accepts(&self, value: &ScalarValue) -> bool {
        match (self, value) {
            (_, ScalarValue::Null) => true,
            (ElementDataType::Integer, ScalarValue::Integer(_)) => true,
            (ElementDataType::Number, ScalarValue::Integer(_) | ScalarValue::Number(_)) => true,
            (ElementDataType::Boolean, ScalarValue::Bool(_)) => true,
            (
                ElementDataType::String
                | ElementDataType::RowPath
                | ElementDataType::ConfigPath
                | ElementDataType::Array
                | ElementDataType::Object,
                ScalarValue::Text(_),
            ) => true,
            _ => false,
        }
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum ScalarValue {
    /// Absent value.
    #[default]
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Integer(i64),
    /// Floating point value.
    Number(f64),
    /// Text value.
    Text(String),
}

impl ScalarValue {
    /// Returns true for `Null` and for empty text.
    pub fn is_empty(&self) -> bool {
        match self {
            ScalarValue::Null => true,
            ScalarValue::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    /// Returns the text content, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ScalarValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ScalarValue::Null => "null",
            ScalarValue::Bool(_) => "bool",
            ScalarValue::Integer(_) => "integer",
            ScalarValue::Number(_) => "number",
            ScalarValue::Text(_) => "text",
        }
    }
}

impl From<&str> for ScalarValue {
    fn from(s: &str) -> Self {
        ScalarValue::Text(s.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(s: String) -> Self {
        ScalarValue::Text(s)
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Integer(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Number(v)
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        ScalarValue::Bool(v)
    }
}
