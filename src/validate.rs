use anyhow::{anyhow, Result};
use jsonschema::{Draft, JSONSchema};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;


#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("schema error at {path}: {message}")]
pub struct SchemaViolation {
pub path: String,
pub message: String,
}


pub struct Validator {
compiled: JSONSchema,
}


impl Validator {
pub fn new(schema: &Value) -> Result<Self> {
let compiled = JSONSchema::options()
.with_draft(Draft::Draft202012)
.compile(schema)
.map_err(|e| anyhow!("compile schema: {e}"))?;
Ok(Self { compiled })
}


/// Validator for `POST /generate` bodies.
pub fn generate_request() -> Result<Self> {
let schema: Value = serde_json::from_str(include_str!("../schema/generate_request.schema.json"))?;
Self::new(&schema)
}


pub fn check(&self, v: &Value) -> Result<(), SchemaViolation> {
if let Err(mut errors) = self.compiled.validate(v) {
if let Some(first) = errors.next() {
let path = first.instance_path.to_string();
return Err(SchemaViolation {
path: if path.is_empty() { "/".to_string() } else { path },
message: first.to_string(),
});
}
}
Ok(())
}


/// Validate, then decode into the typed request.
pub fn parse<T: DeserializeOwned>(&self, v: Value) -> Result<T, SchemaViolation> {
self.check(&v)?;
serde_json::from_value(v).map_err(|e| SchemaViolation { path: "/".to_string(), message: e.to_string() })
}
}


#[cfg(test)]
mod tests {
use super::*;
use serde_json::json;

#[test]
fn prompt_bounds_are_enforced() {
let v = Validator::generate_request().unwrap();
assert!(v.check(&json!({"prompt": "hi"})).is_ok());
assert!(v.check(&json!({"prompt": ""})).is_err());
assert!(v.check(&json!({"prompt": "x".repeat(10_001)})).is_err());
assert!(v.check(&json!({"prompt": "é".repeat(10_000)})).is_ok());
}

#[test]
fn optional_fields_accept_null() {
let v = Validator::generate_request().unwrap();
assert!(v.check(&json!({"prompt": "hi", "model": null, "stream": null})).is_ok());
let err = v.check(&json!({"prompt": "hi", "stream": "yes"})).unwrap_err();
assert_eq!(err.path, "/stream");
}

#[test]
fn missing_prompt_is_reported_at_root() {
let v = Validator::generate_request().unwrap();
let err = v.check(&json!({"model": "llama2"})).unwrap_err();
assert_eq!(err.path, "/");
assert!(err.message.contains("prompt"));
}
}
