//! Output schema collaborator.
//!
//! Validation is advisory. A broken schema yields `ValidationStatus::Error`
//! for that output and never fails an upload.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use stategraph_storage::ValidationStatus;

/// Outcome of validating one output against its schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub key: String,
    pub status: ValidationStatus,
    pub error: Option<String>,
}

pub trait SchemaValidator: Send + Sync {
    /// Validate every output in `outputs` that has an entry in `schemas`
    /// (key → schema JSON text). Outputs without a schema produce no result.
    fn validate_outputs(
        &self,
        schemas: &BTreeMap<String, String>,
        outputs: &BTreeMap<String, Value>,
    ) -> Vec<ValidationResult>;
}

/// Error messages kept per output.
const MAX_REPORTED_ERRORS: usize = 5;

/// [`SchemaValidator`] backed by the `jsonschema` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSchemaValidator;

impl SchemaValidator for JsonSchemaValidator {
    fn validate_outputs(
        &self,
        schemas: &BTreeMap<String, String>,
        outputs: &BTreeMap<String, Value>,
    ) -> Vec<ValidationResult> {
        outputs
            .iter()
            .filter_map(|(key, value)| {
                let schema = schemas.get(key)?;
                let (status, error) = match validate_value(schema, value) {
                    Ok(errors) if errors.is_empty() => (ValidationStatus::Valid, None),
                    Ok(errors) => (ValidationStatus::Invalid, Some(errors.join("; "))),
                    Err(e) => (ValidationStatus::Error, Some(e)),
                };
                Some(ValidationResult {
                    key: key.clone(),
                    status,
                    error,
                })
            })
            .collect()
    }
}

/// `Ok(errors)` with an empty list means valid; `Err` means the schema itself
/// is unusable.
fn validate_value(schema_json: &str, value: &Value) -> Result<Vec<String>, String> {
    let schema: Value =
        serde_json::from_str(schema_json).map_err(|e| format!("schema is not JSON: {e}"))?;
    let validator =
        jsonschema::validator_for(&schema).map_err(|e| format!("schema does not compile: {e}"))?;
    Ok(validator
        .iter_errors(value)
        .take(MAX_REPORTED_ERRORS)
        .map(|e| format!("{e}"))
        .collect())
}

/// Check that `schema_json` is JSON and compiles as a JSON Schema.
pub fn check_schema(schema_json: &str) -> Result<(), String> {
    validate_value(schema_json, &Value::Null).map(|_| ())
}

/// Derive a structural schema from an observed value: types only, objects
/// list their properties as required.
///
/// Array elements are not assumed to share a shape. Elements with one
/// schema give `items` that schema; object elements merge, requiring only
/// the keys every element has; anything else becomes `anyOf`.
pub fn infer_schema(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "type": "null" }),
        Value::Bool(_) => json!({ "type": "boolean" }),
        Value::Number(n) if n.is_i64() || n.is_u64() => json!({ "type": "integer" }),
        Value::Number(_) => json!({ "type": "number" }),
        Value::String(_) => json!({ "type": "string" }),
        Value::Array(items) if items.is_empty() => json!({ "type": "array" }),
        Value::Array(items) => {
            let objects: Vec<&Map<String, Value>> =
                items.iter().filter_map(Value::as_object).collect();
            let element = if objects.len() == items.len() {
                merge_objects(&objects)
            } else {
                any_of(items.iter().map(infer_schema).collect())
            };
            json!({ "type": "array", "items": element })
        }
        Value::Object(map) => merge_objects(&[map]),
    }
}

fn merge_objects(objects: &[&Map<String, Value>]) -> Value {
    let mut seen: BTreeMap<&String, Vec<Value>> = BTreeMap::new();
    for object in objects {
        for (k, v) in object.iter() {
            seen.entry(k).or_default().push(infer_schema(v));
        }
    }
    let required: Vec<&String> = seen
        .keys()
        .copied()
        .filter(|k| objects.iter().all(|o| o.contains_key(k.as_str())))
        .collect();
    let properties: Map<String, Value> = seen
        .into_iter()
        .map(|(k, schemas)| (k.clone(), any_of(schemas)))
        .collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// One schema if all agree, otherwise `anyOf` over the distinct ones.
fn any_of(schemas: Vec<Value>) -> Value {
    let mut distinct: Vec<Value> = Vec::with_capacity(schemas.len());
    for schema in schemas {
        if !distinct.contains(&schema) {
            distinct.push(schema);
        }
    }
    if distinct.len() == 1 {
        distinct.remove(0)
    } else {
        json!({ "anyOf": distinct })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(key: &str, schema: &str, value: Value) -> ValidationResult {
        let schemas = BTreeMap::from([(key.to_string(), schema.to_string())]);
        let outputs = BTreeMap::from([(key.to_string(), value)]);
        let mut results = JsonSchemaValidator.validate_outputs(&schemas, &outputs);
        assert_eq!(results.len(), 1);
        results.remove(0)
    }

    #[test]
    fn valid_and_invalid_values() {
        let ok = one("vpc_id", r#"{"type":"string"}"#, json!("vpc-123"));
        assert_eq!(ok.status, ValidationStatus::Valid);
        assert!(ok.error.is_none());

        let bad = one("vpc_id", r#"{"type":"string"}"#, json!(42));
        assert_eq!(bad.status, ValidationStatus::Invalid);
        assert!(bad.error.is_some());
    }

    #[test]
    fn broken_schema_is_error_not_invalid() {
        let r = one("vpc_id", "not json", json!("x"));
        assert_eq!(r.status, ValidationStatus::Error);
        let r = one("vpc_id", r#"{"type": 12}"#, json!("x"));
        assert_eq!(r.status, ValidationStatus::Error);
    }

    #[test]
    fn outputs_without_schema_are_skipped() {
        let outputs = BTreeMap::from([("a".to_string(), json!(1))]);
        assert!(JsonSchemaValidator
            .validate_outputs(&BTreeMap::new(), &outputs)
            .is_empty());
    }

    #[test]
    fn inferred_schema_accepts_source_and_rejects_type_drift() {
        let value = json!({"id": "vpc-1", "cidrs": ["10.0.0.0/16"], "count": 2});
        let schema = infer_schema(&value).to_string();
        assert!(validate_value(&schema, &value).unwrap().is_empty());
        let drifted = json!({"id": 7, "cidrs": ["10.0.0.0/16"], "count": 2});
        assert!(!validate_value(&schema, &drifted).unwrap().is_empty());
        assert_eq!(infer_schema(&json!(1.5)), json!({"type": "number"}));
    }

    #[test]
    fn inferred_schema_accepts_mixed_arrays() {
        for value in [
            json!(["a", 1]),
            json!([1, 1.5, null]),
            json!([{"a": 1}, {"b": 2}]),
            json!([{"a": 1}, "x"]),
            json!({"rules": [{"port": 80, "cidr": "0.0.0.0/0"}, {"port": 443}]}),
        ] {
            let schema = infer_schema(&value).to_string();
            let errors = validate_value(&schema, &value).unwrap();
            assert!(errors.is_empty(), "{value} against {schema}: {errors:?}");
        }
    }

    #[test]
    fn object_elements_require_only_shared_keys() {
        let schema = infer_schema(&json!([{"port": 80, "cidr": "0.0.0.0/0"}, {"port": 443}]));
        assert_eq!(schema["items"]["required"], json!(["port"]));
        assert_eq!(schema["items"]["properties"]["cidr"], json!({"type": "string"}));
        let uniform = infer_schema(&json!(["a", "b"]));
        assert_eq!(uniform["items"], json!({"type": "string"}));
        let mixed = infer_schema(&json!(["a", 1]));
        assert_eq!(
            mixed["items"],
            json!({"anyOf": [{"type": "string"}, {"type": "integer"}]})
        );
    }

    #[test]
    fn check_schema_rejects_garbage() {
        assert!(check_schema(r#"{"type":"object"}"#).is_ok());
        assert!(check_schema("{").is_err());
    }
}
