//! Shared deterministic types for pass inputs and outputs.
//!
//! These types are the stable contract between the shim, the orchestrator and
//! the task protocol. They carry no I/O and serialize to stable JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One filled-in instance of a form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    #[serde(default = "empty_object")]
    pub data: Value,
    /// Everything else on the submission (owner, state, metadata, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Default for Submission {
    fn default() -> Self {
        Self::from_data(empty_object())
    }
}

impl Submission {
    pub fn from_data(data: Value) -> Self {
        Self {
            data,
            extra: Map::new(),
        }
    }

    /// Accept either `{"data": {...}}` or a bare data object; `null` is empty.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(mut map) if map.get("data").is_some_and(Value::is_object) => {
                let data = map.remove("data").unwrap_or_else(empty_object);
                Self { data, extra: map }
            }
            Value::Null => Self::default(),
            other => Self::from_data(other),
        }
    }
}

/// Visibility outcome for one component path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalRecord {
    pub path: String,
    pub hidden: bool,
}

/// Why a component failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Required,
    Pattern,
    MinLength,
    MaxLength,
    Custom,
    /// The component's own expression failed to evaluate.
    Evaluation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentError {
    pub path: String,
    pub key: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Per-path conditional and validation results of a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scope {
    pub conditionals: Vec<ConditionalRecord>,
    pub errors: Vec<ComponentError>,
}

impl Scope {
    pub fn errors_for<'s>(&'s self, path: &'s str) -> impl Iterator<Item = &'s ComponentError> {
        self.errors.iter().filter(move |error| error.path == path)
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Result of one evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassOutput {
    pub scope: Scope,
    /// Submission data with defaults, clear-on-hide and calculations applied.
    pub data: Value,
}
