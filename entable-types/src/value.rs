//! Typed property values.
//!
//! A table row is a flat map of named scalars. `PropertyValue` covers the
//! scalar types a schemaless table store can hold natively.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{Error, Result};

/// The kind of a [`PropertyValue`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    Int,
    Double,
    Bool,
    DateTime,
    Binary,
    Guid,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::String => "string",
            ValueKind::Int => "int",
            ValueKind::Double => "double",
            ValueKind::Bool => "bool",
            ValueKind::DateTime => "datetime",
            ValueKind::Binary => "binary",
            ValueKind::Guid => "guid",
        };
        f.write_str(name)
    }
}

/// A single typed value stored under a property name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    String(String),
    Int(i64),
    Double(f64),
    Bool(bool),
    DateTime(DateTime<Utc>),
    Binary(Vec<u8>),
    Guid(Uuid),
}

impl PropertyValue {
    /// Returns the kind of this value.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            PropertyValue::String(_) => ValueKind::String,
            PropertyValue::Int(_) => ValueKind::Int,
            PropertyValue::Double(_) => ValueKind::Double,
            PropertyValue::Bool(_) => ValueKind::Bool,
            PropertyValue::DateTime(_) => ValueKind::DateTime,
            PropertyValue::Binary(_) => ValueKind::Binary,
            PropertyValue::Guid(_) => ValueKind::Guid,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view; integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Double(d) => Some(*d),
            PropertyValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            PropertyValue::DateTime(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            PropertyValue::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_guid(&self) -> Option<Uuid> {
        match self {
            PropertyValue::Guid(g) => Some(*g),
            _ => None,
        }
    }

    /// Checks the value's kind, naming `property` in the error.
    pub fn expect_kind(&self, property: &str, expected: ValueKind) -> Result<&Self> {
        if self.kind() == expected {
            Ok(self)
        } else {
            Err(Error::TypeMismatch {
                property: property.to_string(),
                expected,
                found: self.kind(),
            })
        }
    }

    /// Approximate number of bytes this value occupies on the wire.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        match self {
            PropertyValue::String(s) => s.len(),
            PropertyValue::Int(_) | PropertyValue::Double(_) | PropertyValue::DateTime(_) => 8,
            PropertyValue::Bool(_) => 1,
            PropertyValue::Binary(b) => b.len(),
            PropertyValue::Guid(_) => 16,
        }
    }

    /// Canonical text form, used when a value becomes part of a key.
    ///
    /// Deterministic for every kind: timestamps render as RFC 3339 with a
    /// fixed nine fractional digits so keys stay distinct and sort in time
    /// order, binary as lowercase hex.
    #[must_use]
    pub fn to_key_string(&self) -> String {
        match self {
            PropertyValue::String(s) => s.clone(),
            PropertyValue::Int(i) => i.to_string(),
            PropertyValue::Double(d) => d.to_string(),
            PropertyValue::Bool(b) => b.to_string(),
            PropertyValue::DateTime(t) => t.to_rfc3339_opts(SecondsFormat::Nanos, true),
            PropertyValue::Binary(b) => b.iter().map(|byte| format!("{byte:02x}")).collect(),
            PropertyValue::Guid(g) => g.hyphenated().to_string(),
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_key_string())
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int(i64::from(value))
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Double(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(value: DateTime<Utc>) -> Self {
        PropertyValue::DateTime(value)
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(value: Vec<u8>) -> Self {
        PropertyValue::Binary(value)
    }
}

impl From<Uuid> for PropertyValue {
    fn from(value: Uuid) -> Self {
        PropertyValue::Guid(value)
    }
}
