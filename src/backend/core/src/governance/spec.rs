//! Effective spec resolution.
//!
//! The event payload is never edited; an approver's changes live on the
//! ticket and are layered on top here. Top-level keys of the modified spec
//! replace the matching keys of the original, a `null` keeps the original
//! value, and nested objects are replaced as a whole.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{GovernanceError, Result};

/// The parameter set a job executes with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResolvedSpec(Map<String, Value>);

impl ResolvedSpec {
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl From<Map<String, Value>> for ResolvedSpec {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// Decode a request payload into a JSON object.
pub fn decode_payload(payload: &[u8]) -> Result<Map<String, Value>> {
    match serde_json::from_slice::<Value>(payload)? {
        Value::Object(map) => Ok(map),
        other => Err(GovernanceError::validation(format!(
            "request payload must be a JSON object, got {}",
            kind(&other)
        ))),
    }
}

/// Apply `modified` to the original payload, field by field.
pub fn get_effective_spec(payload: &[u8], modified: Option<&Value>) -> Result<ResolvedSpec> {
    let mut fields = decode_payload(payload)?;

    match modified {
        None | Some(Value::Null) => {}
        Some(Value::Object(overrides)) => {
            for (key, value) in overrides {
                if !value.is_null() {
                    fields.insert(key.clone(), value.clone());
                }
            }
        }
        Some(other) => {
            return Err(GovernanceError::validation(format!(
                "modified spec must be a JSON object, got {}",
                kind(other)
            )))
        }
    }

    Ok(ResolvedSpec(fields))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
