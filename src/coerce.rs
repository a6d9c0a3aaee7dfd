/// Typed coercion of captured text.
///
/// Every capture is converted according to the metric's declared
/// [`ValueType`]. A failed numeric parse never aborts extraction: the raw
/// text is kept as a [`Value::Text`] and the outcome is reported as
/// [`Coercion::Degraded`], so mixed-type series surface later at
/// table-build time instead of being silently dropped.
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Declared type of a metric's captured value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Int,
    Float,
    String,
}

impl ValueType {
    /// Resolve a type name as written in config files.
    ///
    /// Accepts `int`, `float`, `str` and `string` (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "int" => Some(ValueType::Int),
            "float" => Some(ValueType::Float),
            "str" | "string" => Some(ValueType::String),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::String => "string",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single extracted value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// The type this value actually holds.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::Text(_) => ValueType::String,
        }
    }

    /// Numeric view for plotting. Text values have none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(x) => Some(*x),
            Value::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => write!(f, "{s:?}"),
        }
    }
}

/// Outcome of coercing one capture.
#[derive(Debug, Clone, PartialEq)]
pub enum Coercion {
    /// Parsed as the declared type.
    Ok(Value),
    /// Parse failed; carries the raw text unchanged.
    Degraded(Value),
}

impl Coercion {
    pub fn ok(&self) -> bool {
        matches!(self, Coercion::Ok(_))
    }

    pub fn into_value(self) -> Value {
        match self {
            Coercion::Ok(v) | Coercion::Degraded(v) => v,
        }
    }
}

/// Convert `raw` to `value_type` with the standard parser for that type.
///
/// Numeric parses are strict (no trimming); on failure a warning is logged
/// and the original string comes back as [`Coercion::Degraded`].
pub fn coerce(raw: &str, value_type: ValueType) -> Coercion {
    match value_type {
        ValueType::Int => match raw.parse::<i64>() {
            Ok(i) => Coercion::Ok(Value::Int(i)),
            Err(e) => {
                warn!(value = raw, error = %e, "could not convert value to int");
                Coercion::Degraded(Value::Text(raw.to_string()))
            }
        },
        ValueType::Float => match raw.parse::<f64>() {
            Ok(x) => Coercion::Ok(Value::Float(x)),
            Err(e) => {
                warn!(value = raw, error = %e, "could not convert value to float");
                Coercion::Degraded(Value::Text(raw.to_string()))
            }
        },
        ValueType::String => Coercion::Ok(Value::Text(raw.to_string())),
    }
}
