//! App manifest handling
//!
//! A manifest is a small free-form JSON map; only `name`, `main` and `spa`
//! are recognized. Unknown keys are preserved so the control plane can round
//! trip whatever tooling put there.

use serde_json::{Map, Value};

use crate::types::{FaztError, Result};

/// Default handler entry point when the manifest omits `main`
pub const DEFAULT_MAIN: &str = "api/main.rhai";

/// Parsed view over an app manifest
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Human name, required
    pub name: String,
    /// Script entry point for the handler
    pub main: String,
    /// Enables SPA fallback in the VFS serving policy
    pub spa: bool,
    /// Full manifest including unrecognized keys
    pub raw: Map<String, Value>,
}

impl Manifest {
    /// Parse and validate a manifest value
    pub fn parse(value: &Value) -> Result<Self> {
        let raw = value
            .as_object()
            .ok_or_else(|| FaztError::Validation("manifest: got non-object, expected object".into()))?
            .clone();

        let name = match raw.get("name") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(other) => {
                return Err(FaztError::Validation(format!(
                    "manifest.name: got {}, expected string",
                    json_type(other)
                )))
            }
            None => return Err(FaztError::Validation("manifest.name is required".into())),
        };

        let main = match raw.get("main") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(other) => {
                return Err(FaztError::Validation(format!(
                    "manifest.main: got {}, expected string",
                    json_type(other)
                )))
            }
            None => DEFAULT_MAIN.to_string(),
        };

        let spa = match raw.get("spa") {
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                return Err(FaztError::Validation(format!(
                    "manifest.spa: got {}, expected boolean",
                    json_type(other)
                )))
            }
            None => false,
        };

        Ok(Self { name, main, spa, raw })
    }

    /// Serialize back to the stored JSON form
    pub fn to_value(&self) -> Value {
        Value::Object(self.raw.clone())
    }
}

/// JSON type name for validation messages ("got object, expected string")
pub fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_apply() {
        let m = Manifest::parse(&json!({"name": "my-spa"})).unwrap();
        assert_eq!(m.main, DEFAULT_MAIN);
        assert!(!m.spa);
    }

    #[test]
    fn name_required() {
        let err = Manifest::parse(&json!({"spa": true})).unwrap_err();
        assert!(err.to_string().contains("name is required"));
    }

    #[test]
    fn type_mismatch_is_descriptive() {
        let err = Manifest::parse(&json!({"name": "x", "spa": "yes"})).unwrap_err();
        assert!(err.to_string().contains("got string, expected boolean"));
    }

    #[test]
    fn unknown_keys_survive_round_trip() {
        let m = Manifest::parse(&json!({"name": "x", "theme": "dark"})).unwrap();
        assert_eq!(m.to_value()["theme"], "dark");
    }
}
