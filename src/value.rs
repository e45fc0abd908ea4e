use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone};
use derive_more::From;
use serde::Serialize;

/// Live value extracted from a subject for a single field.
///
/// Conveniently implements `From` conversions for strings, integers, floats, booleans, and chrono
/// dates.
///
/// Examples:
/// ```
/// # use switchyard::Value;
/// let string_value: Value = "example".into();
/// let integer_value: Value = 42.into();
/// let number_value: Value = 1.5.into();
/// let bool_value: Value = true.into();
/// ```
#[derive(Debug, Serialize, PartialEq, PartialOrd, From, Clone)]
#[serde(untagged)]
pub enum Value {
    /// A string value.
    String(String),
    /// An integral value (primary keys, folded addresses).
    Integer(i64),
    /// A floating-point value.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A calendar date.
    Date(NaiveDate),
    /// A naive timestamp. Date comparisons truncate it to its date.
    DateTime(NaiveDateTime),
    /// A null value or absence of value.
    Null,
}

impl Value {
    /// Short name of the value kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Integer(_) => "integer",
            Value::Number(_) => "number",
            Value::Boolean(_) => "boolean",
            Value::Date(_) => "date",
            Value::DateTime(_) => "datetime",
            Value::Null => "null",
        }
    }

    /// The string, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        if let Value::String(s) = self {
            Some(s.as_str())
        } else {
            None
        }
    }

    /// Numeric view of the value. Strings are never numeric, even when they look like numbers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Integral view of the value. Floats qualify only when they have no fractional part.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(*n as i64),
            _ => None,
        }
    }

    /// Date view of the value, truncating timestamps.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            Value::DateTime(dt) => Some(dt.date()),
            _ => None,
        }
    }

    /// Loose truthiness: empty strings, zero, `false` and null are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::String(s) => !s.is_empty(),
            Value::Integer(i) => *i != 0,
            Value::Number(n) => *n != 0.0,
            Value::Boolean(b) => *b,
            Value::Date(_) | Value::DateTime(_) => true,
            Value::Null => false,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Integer(value.into())
    }
}

impl<Tz: TimeZone> From<DateTime<Tz>> for Value {
    fn from(value: DateTime<Tz>) -> Self {
        Self::DateTime(value.naive_local())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}
