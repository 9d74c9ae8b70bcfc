//! Worker side of the task protocol (`formlogic worker`).
//!
//! Reads exactly one request line, dispatches it to a named handler and
//! writes exactly one response line. stdout carries nothing else.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument};

use crate::core::engine::MinijinjaEngine;
use crate::core::environment::Environment;
use crate::core::orchestrator::{PassOptions, run_pass};
use crate::core::shim::LookupPolicy;
use crate::core::types::{Scope, Submission};
use crate::io::form_store::form_from_value;
use crate::io::task_runner::{TaskRequest, TaskResponse};

pub type TaskHandler = Box<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// Named task handlers.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: BTreeMap<String, TaskHandler>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `render-template` and `evaluate`.
    pub fn with_builtin_tasks() -> Self {
        let mut registry = Self::new();
        registry.register("render-template", render_template);
        registry.register("evaluate", evaluate);
        registry
    }

    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), Box::new(handler));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Unknown tasks and handler failures become `{"reject": {"message": ...}}`.
    pub fn dispatch(&self, request: &TaskRequest) -> TaskResponse {
        let Some(handler) = self.handlers.get(&request.task) else {
            return reject(format!("unknown task '{}'", request.task));
        };
        match handler(request.payload.clone()) {
            Ok(value) => TaskResponse::Resolve(value),
            Err(err) => {
                debug!(task = %request.task, err = %format!("{err:#}"), "task failed");
                reject(format!("{err:#}"))
            }
        }
    }
}

fn reject(message: String) -> TaskResponse {
    TaskResponse::Reject(json!({ "message": message }))
}

/// Serve one request from `input`, answering on `output`.
#[instrument(skip_all)]
pub fn serve_one<R: BufRead, W: Write>(registry: &TaskRegistry, mut input: R, mut output: W) -> Result<()> {
    let mut line = String::new();
    input.read_line(&mut line).context("read task request")?;
    let response = match serde_json::from_str::<TaskRequest>(line.trim()) {
        Ok(request) => {
            info!(task = %request.task, "serving task");
            registry.dispatch(&request)
        }
        Err(err) => reject(format!("malformed task request: {err}")),
    };
    let mut buf = serde_json::to_vec(&response).context("serialize task response")?;
    buf.push(b'\n');
    output.write_all(&buf).context("write task response")?;
    output.flush().context("flush task response")
}

/// Serve one request over the process's stdin/stdout.
pub fn run_worker(registry: &TaskRegistry) -> Result<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    serve_one(registry, stdin.lock(), stdout.lock())
}

#[derive(Debug, Deserialize)]
struct RenderTemplatePayload {
    template: String,
    #[serde(default)]
    data: Map<String, Value>,
}

fn render_template(payload: Value) -> Result<Value> {
    let payload: RenderTemplatePayload =
        serde_json::from_value(payload).context("parse render-template payload")?;
    let env = Environment::build();
    let rendered = env
        .render_template(&payload.template, &Value::Object(payload.data))
        .context("render template")?;
    Ok(Value::String(rendered))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluatePayload {
    form: Value,
    #[serde(default)]
    submission: Value,
    #[serde(default)]
    scope: Option<Scope>,
    #[serde(default)]
    lookup_policy: LookupPolicy,
}

fn evaluate(payload: Value) -> Result<Value> {
    let payload: EvaluatePayload =
        serde_json::from_value(payload).context("parse evaluate payload")?;
    let loaded = form_from_value(payload.form)?;
    let options = PassOptions {
        lookup_policy: payload.lookup_policy,
    };
    let output = run_pass(
        &MinijinjaEngine,
        &loaded.form,
        Submission::from_json(payload.submission),
        payload.scope,
        options,
    );
    serde_json::to_value(output).context("serialize pass output")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serve(registry: &TaskRegistry, input: &str) -> Value {
        let mut output = Vec::new();
        serve_one(registry, input.as_bytes(), &mut output).expect("serve");
        let text = String::from_utf8(output).expect("utf8");
        assert_eq!(text.matches('\n').count(), 1, "exactly one response line");
        serde_json::from_str(&text).expect("response json")
    }

    #[test]
    fn render_template_resolves() {
        let registry = TaskRegistry::with_builtin_tasks();
        let response = serve(
            &registry,
            r#"{"task":"render-template","payload":{"template":"Hello {{ name }}","data":{"name":"Ada"}}}"#,
        );
        assert_eq!(response, json!({ "resolve": "Hello Ada" }));
    }

    #[test]
    fn evaluate_returns_pass_output() {
        let registry = TaskRegistry::with_builtin_tasks();
        let request = json!({
            "task": "evaluate",
            "payload": {
                "form": { "components": [
                    { "key": "a", "type": "number" },
                    { "key": "twice", "type": "number", "calculateValue": "value = data.a * 2" }
                ]},
                "submission": { "data": { "a": 21 } }
            }
        });
        let response = serve(&registry, &request.to_string());
        assert_eq!(response["resolve"]["data"], json!({ "a": 21, "twice": 42 }));
        assert_eq!(response["resolve"]["scope"]["errors"], json!([]));
    }

    #[test]
    fn unknown_task_and_failures_reject() {
        let mut registry = TaskRegistry::new();
        registry.register("fail", |_| Err(anyhow::anyhow!("handler broke")));
        assert_eq!(
            serve(&registry, r#"{"task":"missing"}"#),
            json!({ "reject": { "message": "unknown task 'missing'" } })
        );
        assert_eq!(
            serve(&registry, r#"{"task":"fail","payload":null}"#),
            json!({ "reject": { "message": "handler broke" } })
        );
        let malformed = serve(&registry, "not json");
        assert!(malformed["reject"]["message"]
            .as_str()
            .is_some_and(|message| message.starts_with("malformed task request")));
    }

    #[test]
    fn builtin_task_names() {
        let registry = TaskRegistry::with_builtin_tasks();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["evaluate", "render-template"]);
    }
}
