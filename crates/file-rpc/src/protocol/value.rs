//! Untyped argument and result values.

use crate::error::CodecError;

use bytes::Bytes;
use std::collections::BTreeMap;

/// Deepest nesting of arrays and maps a [`Value`] may have on the wire.
///
/// A scalar has depth 1; every enclosing array or map adds one.
pub const MAX_VALUE_DEPTH: usize = 32;

/// A JSON-like value carried as a call argument, call result or event
/// argument.
///
/// Arrays and maps nest up to [`MAX_VALUE_DEPTH`] levels. Map keys are unique and kept sorted so
/// that two equal maps always encode to the same bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// UTF-8 string.
    String(String),
    /// 32-bit signed integer.
    Int(i32),
    /// Boolean.
    Bool(bool),
    /// Ordered sequence of values.
    Array(Vec<Value>),
    /// String-keyed mapping.
    Map(BTreeMap<String, Value>),
    /// Raw bytes.
    Bytes(Bytes),
}

impl Value {
    /// Name of the populated variant, for diagnostics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Int(_) => "int",
            Self::Bool(_) => "bool",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
            Self::Bytes(_) => "bytes",
        }
    }

    /// Nesting depth: 1 for scalars and empty containers, one more than the
    /// deepest child otherwise.
    #[must_use]
    pub fn depth(&self) -> usize {
        let children = match self {
            Self::Array(values) => values.iter().map(Self::depth).max(),
            Self::Map(entries) => entries.values().map(Self::depth).max(),
            _ => None,
        };
        1 + children.unwrap_or(0)
    }

    /// Whether `depth() <= limit`, without walking past `limit` levels.
    #[must_use]
    pub fn fits_depth(&self, limit: usize) -> bool {
        if limit == 0 {
            return false;
        }
        match self {
            Self::Array(values) => values.iter().all(|v| v.fits_depth(limit - 1)),
            Self::Map(entries) => entries.values().all(|v| v.fits_depth(limit - 1)),
            _ => true,
        }
    }

    /// Returns the string if this is a [`Value::String`].
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer if this is a [`Value::Int`].
    #[must_use]
    pub const fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the boolean if this is a [`Value::Bool`].
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the elements if this is a [`Value::Array`].
    #[must_use]
    pub fn as_array(&self) -> Option<&[Self]> {
        match self {
            Self::Array(values) => Some(values),
            _ => None,
        }
    }

    /// Returns the entries if this is a [`Value::Map`].
    #[must_use]
    pub const fn as_map(&self) -> Option<&BTreeMap<String, Self>> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Returns the buffer if this is a [`Value::Bytes`].
    #[must_use]
    pub const fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Vec<Self>> for Value {
    fn from(values: Vec<Self>) -> Self {
        Self::Array(values)
    }
}

impl From<BTreeMap<String, Self>> for Value {
    fn from(entries: BTreeMap<String, Self>) -> Self {
        Self::Map(entries)
    }
}

impl From<Bytes> for Value {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => Self::String(s),
            Value::Int(i) => Self::from(i),
            Value::Bool(b) => Self::Bool(b),
            Value::Array(values) => Self::Array(values.into_iter().map(Into::into).collect()),
            Value::Map(entries) => {
                Self::Object(entries.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
            Value::Bytes(bytes) => Self::Array(bytes.iter().map(|b| Self::from(*b)).collect()),
        }
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = CodecError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        match value {
            serde_json::Value::Null => Err(CodecError::MalformedMessage(
                "null has no value representation".to_string(),
            )),
            serde_json::Value::Bool(b) => Ok(Self::Bool(b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .and_then(|i| i32::try_from(i).ok())
                .map(Self::Int)
                .ok_or_else(|| CodecError::MalformedMessage(format!("number {n} is not an i32"))),
            serde_json::Value::String(s) => Ok(Self::String(s)),
            serde_json::Value::Array(values) => values
                .into_iter()
                .map(Self::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Array),
            serde_json::Value::Object(entries) => entries
                .into_iter()
                .map(|(k, v)| Self::try_from(v).map(|v| (k, v)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Self::Map),
        }
    }
}
