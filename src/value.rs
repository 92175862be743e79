//! Dynamic values exchanged between properties and instruments.
//!
//! Instruments answer with text, drivers work with numbers and flags. [`Value`]
//! carries either through the read/write pipelines so stages can convert
//! between the two without the pipeline being generic over a value type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A value flowing through a property pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    /// No value (empty answer, write without payload)
    #[default]
    Null,
    /// Boolean flag
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// Raw or formatted text
    Str(String),
}

impl Value {
    /// Convert to f64 for numeric operations
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Convert to i64 for integer operations
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    /// Boolean content, if any.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// String content, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub(crate) fn to_expr(&self) -> evalexpr::Value {
        match self {
            Value::Null => evalexpr::Value::Empty,
            Value::Bool(b) => evalexpr::Value::Boolean(*b),
            Value::Int(i) => evalexpr::Value::Int(*i),
            Value::Float(f) => evalexpr::Value::Float(*f),
            Value::Str(s) => evalexpr::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<ChannelId> for Value {
    fn from(id: ChannelId) -> Self {
        match id {
            ChannelId::Index(i) => Value::Int(i),
            ChannelId::Name(s) => Value::Str(s),
        }
    }
}

/// Target type for the `cast` post-read stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// Kept as text
    Str,
    /// Signed integer
    Int,
    /// Floating point
    Float,
    /// Boolean, accepting common device spellings
    Bool,
}

impl ValueKind {
    /// Convert a device answer into this kind.
    ///
    /// Text is trimmed before parsing. Booleans accept `1/0`, `on/off` and
    /// `true/false` in any case.
    pub fn cast(self, value: &Value) -> Result<Value, String> {
        match (self, value) {
            (ValueKind::Str, v) => Ok(Value::Str(v.to_string())),
            (ValueKind::Int, Value::Int(i)) => Ok(Value::Int(*i)),
            (ValueKind::Int, Value::Float(f)) if f.fract() == 0.0 => Ok(Value::Int(*f as i64)),
            (ValueKind::Int, Value::Str(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|e| format!("cannot parse '{}' as int: {}", s, e)),
            (ValueKind::Float, Value::Float(f)) => Ok(Value::Float(*f)),
            (ValueKind::Float, Value::Int(i)) => Ok(Value::Float(*i as f64)),
            (ValueKind::Float, Value::Str(s)) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|e| format!("cannot parse '{}' as float: {}", s, e)),
            (ValueKind::Bool, Value::Bool(b)) => Ok(Value::Bool(*b)),
            (ValueKind::Bool, Value::Int(i)) => Ok(Value::Bool(*i != 0)),
            (ValueKind::Bool, Value::Str(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "on" | "true" => Ok(Value::Bool(true)),
                "0" | "off" | "false" => Ok(Value::Bool(false)),
                other => Err(format!("cannot parse '{}' as bool", other)),
            },
            (kind, v) => Err(format!("cannot convert {:?} to {:?}", v, kind)),
        }
    }
}

/// Identifier of a channel inside a [`ChannelContainer`](crate::channel::ChannelContainer).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelId {
    /// Numeric id
    Index(i64),
    /// Named id
    Name(String),
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Index(i) => write!(f, "{}", i),
            ChannelId::Name(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for ChannelId {
    fn from(v: i64) -> Self {
        ChannelId::Index(v)
    }
}

impl From<i32> for ChannelId {
    fn from(v: i32) -> Self {
        ChannelId::Index(v as i64)
    }
}

impl From<u32> for ChannelId {
    fn from(v: u32) -> Self {
        ChannelId::Index(v as i64)
    }
}

impl From<&str> for ChannelId {
    fn from(v: &str) -> Self {
        ChannelId::Name(v.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(v: String) -> Self {
        ChannelId::Name(v)
    }
}
