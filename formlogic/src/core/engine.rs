//! The seam to the expression interpreter.
//!
//! This crate never interprets component expressions itself. It assembles an
//! [`EvalContext`] and hands it to a [`LogicEngine`]. [`MinijinjaEngine`] is the
//! bundled adapter; tests plug in scripted engines.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use minijinja::value::Value as JinjaValue;

use crate::core::environment::Environment;
use crate::core::environment::utilities;
use crate::core::shim::{InstanceRef, RootInstance, ScriptGraph};
use crate::core::types::Submission;
use crate::form::{Component, FormDefinition};

/// Which step of a pass an expression is evaluated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Module,
    DefaultValue,
    Conditions,
    Calculations,
    Validations,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid expression: {0}")]
    Syntax(String),
    #[error("evaluation failed: {0}")]
    Evaluation(String),
}

/// Plain-data summary of an instance, for engines that only take JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    pub path: String,
    pub key: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub row_index: Option<usize>,
    pub visible: bool,
}

/// Everything one expression evaluation is given.
#[derive(Debug)]
pub struct EvalContext<'a> {
    pub phase: Phase,
    pub form: &'a FormDefinition,
    pub submission: &'a Submission,
    /// Root submission data.
    pub data: &'a Value,
    /// Row-scoped slice for components inside repeating rows; root data otherwise.
    pub row: &'a Value,
    pub component: Option<&'a Component>,
    /// Instance graph of the running pass, for `getComponent`.
    pub root: Option<&'a RootInstance<'a>>,
    /// The instance this expression belongs to.
    pub instance: Option<InstanceRef<'a, 'a>>,
    pub value: Value,
    pub env: &'a Environment,
    /// Bindings contributed by the form's module expression.
    pub extension: &'a Map<String, Value>,
}

impl<'a> EvalContext<'a> {
    /// Flatten into the JSON object expressions are evaluated against.
    ///
    /// Extension bindings come first so they can never shadow the standard names.
    pub fn bindings(&self) -> Value {
        let mut bindings = self.extension.clone();
        bindings.insert("form".to_string(), to_json(self.form));
        bindings.insert("submission".to_string(), to_json(self.submission));
        bindings.insert("data".to_string(), self.data.clone());
        bindings.insert("row".to_string(), self.row.clone());
        bindings.insert(
            "component".to_string(),
            self.component.map(to_json).unwrap_or(Value::Null),
        );
        bindings.insert(
            "instance".to_string(),
            self.instance
                .map(|instance| to_json(&instance.snapshot()))
                .unwrap_or(Value::Null),
        );
        bindings.insert("value".to_string(), self.value.clone());
        bindings.insert("phase".to_string(), to_json(&self.phase));
        Value::Object(bindings)
    }

    /// Owned graph handle for sandboxed engines, if a graph is attached.
    pub fn script_graph(&self) -> Option<ScriptGraph> {
        self.instance
            .map(|instance| instance.root())
            .or(self.root)
            .map(RootInstance::script_graph)
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// External interpreter for component expressions.
pub trait LogicEngine {
    fn evaluate(&self, expression: &str, ctx: &EvalContext<'_>) -> Result<Value, EngineError>;

    /// Component-type-aware emptiness, used by `required` and `isEmpty()`.
    fn is_empty(&self, component: &Component, value: &Value) -> bool {
        is_empty_value(component, value)
    }
}

/// Default emptiness rules: null, blank strings, empty collections, a
/// one-element array holding an empty value, an all-false boolean map, and an
/// unparseable date on date components.
pub fn is_empty_value(component: &Component, value: &Value) -> bool {
    is_empty_kind(&component.kind, value)
}

/// [`is_empty_value`] keyed by component type alone.
pub fn is_empty_kind(kind: &str, value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => {
            text.trim().is_empty() || (kind == "datetime" && !utilities::is_valid_date(text))
        }
        Value::Array(items) => match items.as_slice() {
            [] => true,
            [only] => is_empty_kind(kind, only),
            _ => false,
        },
        Value::Object(map) => {
            map.is_empty()
                || (map.values().all(Value::is_boolean)
                    && map.values().all(|v| v == &Value::Bool(false)))
        }
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// JavaScript-flavoured truthiness for condition and validation results.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Engine over the minijinja expression language.
///
/// Historical expressions assign their result (`show = ...`, `value = ...`,
/// `valid = ...`); the assignment target is dropped and the right-hand side is
/// evaluated.
///
/// When the context carries a pass graph, `getComponent(path)` is installed
/// and `instance` is the live handle instead of its JSON summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinijinjaEngine;

impl LogicEngine for MinijinjaEngine {
    fn evaluate(&self, expression: &str, ctx: &EvalContext<'_>) -> Result<Value, EngineError> {
        let source = strip_assignment(expression);
        let mut sandbox = ctx.env.sandbox();
        let mut bindings = ctx.bindings();
        let mut instance = JinjaValue::from(());
        if let Some(graph) = ctx.script_graph() {
            if let Some(current) = ctx.instance {
                instance = graph.instance(current.id());
            }
            sandbox.add_global("getComponent", JinjaValue::from_object(graph));
        }
        if let Value::Object(map) = &mut bindings {
            map.remove("instance");
        }
        let locals = minijinja::context! {
            instance => instance,
            ..JinjaValue::from_serialize(&bindings)
        };

        let compiled = sandbox
            .compile_expression(source)
            .map_err(|err| EngineError::Syntax(err.to_string()))?;
        let result = compiled
            .eval(locals)
            .map_err(|err| EngineError::Evaluation(err.to_string()))?;
        serde_json::to_value(&result).map_err(|err| EngineError::Evaluation(err.to_string()))
    }
}

const ASSIGNMENT_TARGETS: &[&str] = &["show", "value", "valid"];

fn strip_assignment(expression: &str) -> &str {
    let trimmed = expression.trim().trim_end_matches(';').trim_end();
    for target in ASSIGNMENT_TARGETS {
        let Some(rest) = trimmed.strip_prefix(target) else {
            continue;
        };
        let rest = rest.trim_start();
        if let Some(rhs) = rest.strip_prefix('=')
            && !rhs.starts_with('=')
        {
            return rhs.trim();
        }
    }
    trimmed
}
