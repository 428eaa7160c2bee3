use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::schedule::Period;

/// Stable zone identifier. Older documents store integers; they are read
/// as their decimal string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ZoneId(String);

impl ZoneId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compares against a raw `system_id` JSON value without full decoding.
    pub fn matches_json(&self, value: &serde_json::Value) -> bool {
        match value {
            serde_json::Value::String(text) => text == &self.0,
            serde_json::Value::Number(number) => number.to_string() == self.0,
            _ => false,
        }
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ZoneId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<'de> Deserialize<'de> for ZoneId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Integer(i64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(text) if text.trim().is_empty() => {
                Err(serde::de::Error::custom("system_id must not be empty"))
            }
            Raw::Text(text) => Ok(Self(text)),
            Raw::Integer(value) => Ok(Self(value.to_string())),
        }
    }
}

/// Operator-facing snapshot of a zone.
#[derive(Debug, Clone, Serialize)]
pub struct ZoneStatus {
    pub system_id: ZoneId,
    pub program: bool,
    pub temperature: Option<f64>,
    pub target: f64,
    pub is_within_period: bool,
    pub advance: Option<f64>,
    pub boost: Option<f64>,
    pub disabled: bool,
    pub error_count: u32,
    pub periods: Vec<Period>,
}
