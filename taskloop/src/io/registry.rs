//! Tool registry: named, schema-validated, policy-bound tool entries.
//!
//! The registry is a concurrent read-mostly map passed around as
//! `Arc<ToolRegistry>`. Registration and discovery are expected to finish
//! before tasks start; lookups may then run from any number of tasks.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::types::{FINISH_TOOL, UPDATE_GOALS_TOOL};
use crate::io::tool::Tool;
use crate::io::validation::ArgumentValidator;

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("tool '{name}' not found")]
    NotFound { name: String },
    #[error("tool '{name}' is blocked by policy (not marked safe, safe mode on)")]
    Blocked { name: String },
    #[error("invalid tool name '{name}': must be non-empty [A-Za-z0-9._-]")]
    InvalidName { name: String },
    #[error("tool '{name}' has an invalid input schema: {reason}")]
    InvalidSchema { name: String, reason: String },
}

/// Declared metadata of a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub schema: Value,
    /// Permitted while safe mode is on.
    pub safe: bool,
    pub timeout: Duration,
    /// Extra attempts after the first failure.
    pub retries: u32,
    pub tags: Vec<String>,
}

impl ToolSpec {
    /// Unsafe by default, 30s timeout, no retries.
    pub fn new(name: impl Into<String>, description: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            safe: false,
            timeout: DEFAULT_TOOL_TIMEOUT,
            retries: 0,
            tags: Vec::new(),
        }
    }

    pub fn safe(mut self, safe: bool) -> Self {
        self.safe = safe;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Human-readable signature rendered from the schema,
    /// e.g. `list_dir(path: string, recursive?: boolean)`.
    pub fn signature(&self) -> String {
        let required: Vec<&str> = self
            .schema
            .get("required")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let params: Vec<String> = self
            .schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                let mut props: Vec<(&String, &Value)> = props.iter().collect();
                props.sort_by(|a, b| a.0.cmp(b.0));
                props
                    .into_iter()
                    .map(|(name, sub)| {
                        let optional = if required.contains(&name.as_str()) {
                            ""
                        } else {
                            "?"
                        };
                        format!("{name}{optional}: {}", type_label(sub))
                    })
                    .collect()
            })
            .unwrap_or_default();
        format!("{}({})", self.name, params.join(", "))
    }
}

fn type_label(schema: &Value) -> String {
    if let Some(values) = schema.get("enum").and_then(Value::as_array) {
        return values
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join("|");
    }
    match schema.get("type") {
        Some(Value::String(kind)) if kind == "array" => {
            let item = schema.get("items").map(type_label);
            format!("{}[]", item.unwrap_or_else(|| "any".to_string()))
        }
        Some(Value::String(kind)) => kind.clone(),
        Some(Value::Array(kinds)) => kinds
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("|"),
        _ => "any".to_string(),
    }
}

/// How a resolved entry is executed.
#[derive(Clone)]
pub enum ToolKind {
    Callable(Arc<dyn Tool>),
    /// Applied by the engine to the task state (`finish`, `update_goals`).
    Intrinsic,
}

impl std::fmt::Debug for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolKind::Callable(_) => f.write_str("Callable"),
            ToolKind::Intrinsic => f.write_str("Intrinsic"),
        }
    }
}

/// A registered tool: spec, compiled validator and executor.
#[derive(Debug)]
pub struct ToolEntry {
    spec: ToolSpec,
    validator: ArgumentValidator,
    kind: ToolKind,
}

impl ToolEntry {
    pub fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn validator(&self) -> &ArgumentValidator {
        &self.validator
    }

    pub fn kind(&self) -> &ToolKind {
        &self.kind
    }

    pub fn is_intrinsic(&self) -> bool {
        matches!(self.kind, ToolKind::Intrinsic)
    }
}

#[derive(Debug, Default)]
pub struct ToolRegistry {
    entries: DashMap<String, Arc<ToolEntry>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with `finish` and `update_goals`.
    pub fn with_intrinsics() -> Self {
        let registry = Self::new();
        for spec in [finish_spec(), update_goals_spec()] {
            // Built-in schemas are static; failing here is a programming error surfaced in tests.
            if let Err(err) = registry.insert(spec, ToolKind::Intrinsic) {
                warn!(err = %err, "failed to register intrinsic tool");
            }
        }
        registry
    }

    /// Register a callable tool. A name already present is overwritten (last
    /// registration wins) with a warning.
    pub fn register(&self, spec: ToolSpec, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        self.insert(spec, ToolKind::Callable(tool))
    }

    fn insert(&self, spec: ToolSpec, kind: ToolKind) -> Result<(), RegistryError> {
        validate_tool_name(&spec.name)?;
        let validator =
            ArgumentValidator::compile(&spec.schema).map_err(|reason| {
                RegistryError::InvalidSchema {
                    name: spec.name.clone(),
                    reason,
                }
            })?;
        let name = spec.name.clone();
        let entry = Arc::new(ToolEntry {
            spec,
            validator,
            kind,
        });
        if self.entries.insert(name.clone(), entry).is_some() {
            warn!(tool = %name, "tool already registered; overwriting previous entry");
        } else {
            debug!(tool = %name, "registered tool");
        }
        Ok(())
    }

    /// Resolve `name`, honoring the safe-mode policy.
    pub fn lookup(&self, name: &str, safe_mode: bool) -> Result<Arc<ToolEntry>, RegistryError> {
        let entry = self
            .entries
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_string(),
            })?;
        if safe_mode && !entry.spec.safe {
            return Err(RegistryError::Blocked {
                name: name.to_string(),
            });
        }
        Ok(entry)
    }

    /// Names permitted under `safe_mode`, sorted.
    pub fn list(&self, safe_mode: bool) -> Vec<String> {
        self.describe(safe_mode)
            .iter()
            .map(|entry| entry.name().to_string())
            .collect()
    }

    /// Entries permitted under `safe_mode`, sorted by name.
    pub fn describe(&self, safe_mode: bool) -> Vec<Arc<ToolEntry>> {
        let mut entries: Vec<Arc<ToolEntry>> = self
            .entries
            .iter()
            .filter(|entry| !safe_mode || entry.spec.safe)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        entries.sort_by(|a, b| a.name().cmp(b.name()));
        entries
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn validate_tool_name(name: &str) -> Result<(), RegistryError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidName {
            name: name.to_string(),
        })
    }
}

fn finish_spec() -> ToolSpec {
    ToolSpec::new(
        FINISH_TOOL,
        "End the task with a final status and a short reason.",
        json!({
            "type": "object",
            "properties": {
                "status": {"enum": ["success", "failure", "partial"]},
                "reason": {"type": "string"}
            },
            "required": ["status"],
            "additionalProperties": false
        }),
    )
    .safe(true)
}

fn update_goals_spec() -> ToolSpec {
    let index_list = json!({"type": "array", "items": {"type": "integer", "minimum": 0}});
    ToolSpec::new(
        UPDATE_GOALS_TOOL,
        "Edit the sub-goal list: insert items, remove indices, reorder by permutation, or focus an index.",
        json!({
            "type": "object",
            "properties": {
                "op": {"enum": ["insert", "remove", "reorder", "focus"]},
                "items": {"type": "array", "items": {"type": "string"}},
                "index": {"type": "integer", "minimum": 0},
                "indices": index_list,
                "permutation": index_list
            },
            "required": ["op"],
            "additionalProperties": false
        }),
    )
    .safe(true)
}
