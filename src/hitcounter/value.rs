//! Tracked values and the kinds a direction can be configured with.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The type of value a direction tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    String,
    Int32,
}

impl ValueKind {
    /// The name used for this kind in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::String => "string",
            ValueKind::Int32 => "int32",
        }
    }
}

impl FromStr for ValueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(ValueKind::String),
            "int32" => Ok(ValueKind::Int32),
            other => Err(format!(
                "unsupported type \"{}\" (expected \"string\" or \"int32\")",
                other
            )),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value whose hit rate is being measured.
///
/// On the wire this is either a JSON string or a JSON integer that fits in
/// 32 bits. Anything else fails to decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrackedValue {
    String(String),
    Int32(i32),
}

impl TrackedValue {
    /// The kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            TrackedValue::String(_) => ValueKind::String,
            TrackedValue::Int32(_) => ValueKind::Int32,
        }
    }
}

impl fmt::Display for TrackedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackedValue::String(s) => f.write_str(s),
            TrackedValue::Int32(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for TrackedValue {
    fn from(s: &str) -> Self {
        TrackedValue::String(s.to_string())
    }
}

impl From<String> for TrackedValue {
    fn from(s: String) -> Self {
        TrackedValue::String(s)
    }
}

impl From<i32> for TrackedValue {
    fn from(n: i32) -> Self {
        TrackedValue::Int32(n)
    }
}
