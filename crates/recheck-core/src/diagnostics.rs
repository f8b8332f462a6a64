//! Opaque payloads carried between callers and the checking capability.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Key in `Parameters` signalling that the executing side should stream log lines.
pub const LOGGER_KEY: &str = "logger";

/// Result of a check, as produced by the checking capability.
///
/// The dispatch core only transports this value. The one shape it creates
/// itself is the cancellation marker, see [`Diagnostics::cancelled`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Diagnostics(Value);

impl Diagnostics {
    /// Diagnostics for a task that was cancelled before producing a verdict.
    pub fn cancelled(source: &str, flags: &str) -> Self {
        Self(json!({
            "source": source,
            "flags": flags,
            "status": "unknown",
            "error": { "kind": "cancel" },
        }))
    }

    /// The `status` field, if present.
    pub fn status(&self) -> Option<&str> {
        self.0.get("status").and_then(Value::as_str)
    }

    /// Whether this is the cancellation marker.
    pub fn is_cancelled(&self) -> bool {
        self.status() == Some("unknown")
            && self
                .0
                .get("error")
                .and_then(|e| e.get("kind"))
                .and_then(Value::as_str)
                == Some("cancel")
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for Diagnostics {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Options forwarded to the checking capability.
///
/// Apart from the logging marker these are never interpreted here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(Map<String, Value>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an option, returning the updated parameters.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Whether the caller asked for log lines to be streamed back.
    pub fn requests_logging(&self) -> bool {
        self.0.contains_key(LOGGER_KEY)
    }

    /// Mark (or unmark) these parameters as requesting log lines.
    ///
    /// The marker is an empty object; loggers themselves never cross the wire.
    pub fn set_logging(&mut self, enabled: bool) {
        if enabled {
            self.0.insert(LOGGER_KEY.to_string(), Value::Object(Map::new()));
        } else {
            self.0.remove(LOGGER_KEY);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for Parameters {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Parameters {
    type Error = serde_json::Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        serde_json::from_value(value)
    }
}
