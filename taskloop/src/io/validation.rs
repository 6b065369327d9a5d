//! Tool argument validation against JSON Schema.
//!
//! Validation runs before any tool side effect. Besides the schema's own
//! messages it attributes failures to argument names so the planner can see
//! which fields to fix.

use std::collections::BTreeMap;
use std::fmt;

use jsonschema::{Validator, validator_for};
use serde_json::{Map, Value};

/// Compiled input schema of one tool.
pub struct ArgumentValidator {
    schema: Value,
    whole: Validator,
    properties: BTreeMap<String, Validator>,
    required: Vec<String>,
    closed: bool,
}

/// Offending argument names plus the schema's messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    pub fields: Vec<String>,
    pub messages: Vec<String>,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fields.is_empty() {
            write!(f, "{}", self.messages.join("; "))
        } else {
            write!(
                f,
                "invalid fields [{}]: {}",
                self.fields.join(", "),
                self.messages.join("; ")
            )
        }
    }
}

impl ArgumentValidator {
    /// Compile `schema`. The root must describe an object (`type` absent or `"object"`).
    pub fn compile(schema: &Value) -> Result<Self, String> {
        let Value::Object(root) = schema else {
            return Err("schema must be a JSON object".to_string());
        };
        match root.get("type") {
            None => {}
            Some(Value::String(kind)) if kind == "object" => {}
            Some(other) => return Err(format!("schema root type must be \"object\", got {other}")),
        }
        let whole = validator_for(schema).map_err(|err| format!("invalid schema: {err}"))?;

        // Per-property validators only serve attribution; a property schema that
        // cannot compile alone (e.g. a `$ref` into the root) is left to the whole-schema check.
        let properties = root
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .filter_map(|(name, sub)| {
                        validator_for(sub).ok().map(|v| (name.clone(), v))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let required = root
            .get("required")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let closed = matches!(root.get("additionalProperties"), Some(Value::Bool(false)));

        Ok(Self {
            schema: schema.clone(),
            whole,
            properties,
            required,
            closed,
        })
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    pub fn validate(&self, arguments: &Map<String, Value>) -> Result<(), ValidationFailure> {
        let instance = Value::Object(arguments.clone());
        if self.whole.is_valid(&instance) {
            return Ok(());
        }
        let messages = self
            .whole
            .iter_errors(&instance)
            .map(|err| err.to_string())
            .collect();
        Err(ValidationFailure {
            fields: self.offending_fields(arguments),
            messages,
        })
    }

    fn offending_fields(&self, arguments: &Map<String, Value>) -> Vec<String> {
        let mut fields: Vec<String> = self
            .required
            .iter()
            .filter(|name| !arguments.contains_key(name.as_str()))
            .cloned()
            .collect();

        for (name, value) in arguments {
            let bad = match self.properties.get(name) {
                Some(validator) => !validator.is_valid(value),
                None => self.closed && !self.declares(name),
            };
            if bad {
                fields.push(name.clone());
            }
        }

        fields.sort();
        fields.dedup();
        fields
    }

    fn declares(&self, name: &str) -> bool {
        self.schema
            .get("properties")
            .and_then(Value::as_object)
            .is_some_and(|props| props.contains_key(name))
    }
}

impl fmt::Debug for ArgumentValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArgumentValidator")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn list_dir_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "recursive": {"type": "boolean"}
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    #[test]
    fn accepts_valid_arguments() {
        let v = ArgumentValidator::compile(&list_dir_schema()).expect("compile");
        v.validate(&args(json!({"path": "/tmp", "recursive": true})))
            .expect("valid");
    }

    #[test]
    fn names_missing_wrong_and_unexpected_fields() {
        let v = ArgumentValidator::compile(&list_dir_schema()).expect("compile");
        let err = v
            .validate(&args(json!({"recursive": "yes", "depth": 2})))
            .unwrap_err();
        assert_eq!(err.fields, vec!["depth", "path", "recursive"]);
        assert!(!err.messages.is_empty());
        assert!(err.to_string().starts_with("invalid fields [depth, path, recursive]"));
    }

    #[test]
    fn open_schema_allows_extra_fields() {
        let v = ArgumentValidator::compile(&json!({
            "type": "object",
            "properties": {"n": {"type": "integer"}}
        }))
        .expect("compile");
        v.validate(&args(json!({"n": 1, "other": "x"}))).expect("valid");
    }

    #[test]
    fn empty_schema_accepts_anything_object_shaped() {
        let v = ArgumentValidator::compile(&json!({})).expect("compile");
        v.validate(&Map::new()).expect("valid");
    }

    #[test]
    fn rejects_non_object_schemas() {
        assert!(ArgumentValidator::compile(&json!({"type": "string"})).is_err());
        assert!(ArgumentValidator::compile(&json!(true)).is_err());
        assert!(ArgumentValidator::compile(&json!({"type": "object", "properties": 5})).is_err());
    }
}
