//! Typed literal values.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// A typed SQL value.
///
/// Row payloads arrive as JSON; key values are lifted into `Value` before
/// they are embedded in a lookup query, either inline as literals or as
/// bindings for `$N` placeholders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// SQL NULL.
    #[default]
    Null,
    /// Boolean value.
    Boolean(bool),
    /// 64-bit signed integer.
    BigInt(i64),
    /// 64-bit floating point.
    Real(f64),
    /// UTF-8 text string.
    Text(String),
    /// Structured value (arrays and objects) kept as JSON.
    Json(serde_json::Value),

    /// Parameter placeholder ($1, $2, etc.) - 1-indexed.
    /// Must be bound before the query is executed in literal form.
    #[serde(skip)]
    Placeholder(usize),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            // Total ordering for floats: NaN == NaN
            (Value::Real(a), Value::Real(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Json(a), Value::Json(b)) => a == b,
            (Value::Placeholder(a), Value::Placeholder(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Value {
    /// Lifts a JSON value into a typed value without a target type.
    ///
    /// Integers that fit in `i64` become `BigInt`, other numbers `Real`.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(*b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Value::BigInt)
                .or_else(|| n.as_f64().map(Value::Real))
                .unwrap_or_else(|| Value::Text(n.to_string())),
            serde_json::Value::String(s) => Value::Text(s.clone()),
            other => Value::Json(other.clone()),
        }
    }

    /// Converts this value back to JSON.
    ///
    /// Placeholders have no JSON form and map to `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null | Value::Placeholder(_) => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::BigInt(v) => serde_json::Value::Number((*v).into()),
            Value::Real(v) => serde_json::Number::from_f64(*v)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Json(j) => j.clone(),
        }
    }

    /// Returns true if this is an unbound placeholder.
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Value::Placeholder(_))
    }
}

/// Renders the value as a SQL literal.
///
/// Text is single-quoted with embedded quotes doubled; JSON is rendered as a
/// quoted string of its compact serialization.
impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Value::BigInt(v) => write!(f, "{v}"),
            Value::Real(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Value::Json(j) => write!(f, "'{}'", j.to_string().replace('\'', "''")),
            Value::Placeholder(idx) => write!(f, "${idx}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&serde_json::Value> for Value {
    fn from(v: &serde_json::Value) -> Self {
        Value::from_json(v)
    }
}
