//! Test-only helpers: form builders, a scripted Logic Engine and scripted workers.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use serde_json::Value;

use crate::core::engine::{EngineError, EvalContext, LogicEngine, Phase};
use crate::form::{Component, FormDefinition};
use crate::io::task_runner::{TaskRequest, Worker, WorkerEvent, WorkerSpawner};

/// Create a component of `kind` with no children.
pub fn component(key: &str, kind: &str) -> Component {
    Component {
        key: key.to_string(),
        kind: kind.to_string(),
        ..Component::default()
    }
}

pub fn textfield(key: &str) -> Component {
    component(key, "textfield")
}

pub fn number(key: &str) -> Component {
    component(key, "number")
}

fn with_children(key: &str, kind: &str, children: Vec<Component>) -> Component {
    Component {
        components: children,
        ..component(key, kind)
    }
}

pub fn panel(key: &str, children: Vec<Component>) -> Component {
    with_children(key, "panel", children)
}

pub fn container(key: &str, children: Vec<Component>) -> Component {
    with_children(key, "container", children)
}

pub fn editgrid(key: &str, children: Vec<Component>) -> Component {
    with_children(key, "editgrid", children)
}

pub fn datagrid(key: &str, children: Vec<Component>) -> Component {
    with_children(key, "datagrid", children)
}

pub fn form_of(components: Vec<Component>) -> FormDefinition {
    FormDefinition {
        components,
        ..FormDefinition::default()
    }
}

type Script = Box<dyn Fn(&EvalContext<'_>) -> Result<Value, EngineError>>;

/// Logic Engine that answers known expressions from closures and records
/// every call. Unknown expressions fail with an evaluation error.
#[derive(Default)]
pub struct ScriptedEngine {
    scripts: HashMap<String, Script>,
    calls: RefCell<Vec<(Phase, String)>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, expression: &str, script: F) -> Self
    where
        F: Fn(&EvalContext<'_>) -> Result<Value, EngineError> + 'static,
    {
        self.scripts.insert(expression.to_string(), Box::new(script));
        self
    }

    pub fn returning(self, expression: &str, value: Value) -> Self {
        self.on(expression, move |_| Ok(value.clone()))
    }

    pub fn failing(self, expression: &str, message: &str) -> Self {
        let message = message.to_string();
        self.on(expression, move |_| Err(EngineError::Syntax(message.clone())))
    }

    /// `(phase, expression)` for every evaluation so far, in call order.
    pub fn calls(&self) -> Vec<(Phase, String)> {
        self.calls.borrow().clone()
    }
}

impl LogicEngine for ScriptedEngine {
    fn evaluate(&self, expression: &str, ctx: &EvalContext<'_>) -> Result<Value, EngineError> {
        self.calls
            .borrow_mut()
            .push((ctx.phase, expression.to_string()));
        match self.scripts.get(expression) {
            Some(script) => script(ctx),
            None => Err(EngineError::Evaluation(format!(
                "unscripted expression: {expression}"
            ))),
        }
    }
}

/// Spawns [`ScriptedWorker`]s that replay a fixed event list and count kills.
///
/// Clones share the kill counter and request log.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSpawner {
    events: Vec<WorkerEvent>,
    spawn_error: Option<String>,
    kills: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<TaskRequest>>>,
}

impl ScriptedSpawner {
    /// Workers emit `events` in order, then never answer again.
    pub fn replying(events: Vec<WorkerEvent>) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    /// Workers that never answer.
    pub fn hanging() -> Self {
        Self::default()
    }

    pub fn failing_spawn(message: &str) -> Self {
        Self {
            spawn_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<TaskRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

impl WorkerSpawner for ScriptedSpawner {
    type Worker = ScriptedWorker;

    fn spawn(&self) -> Result<ScriptedWorker> {
        if let Some(message) = &self.spawn_error {
            return Err(anyhow!("{message}"));
        }
        Ok(ScriptedWorker {
            events: self.events.iter().cloned().collect(),
            kills: Arc::clone(&self.kills),
            requests: Arc::clone(&self.requests),
        })
    }
}

#[derive(Debug)]
pub struct ScriptedWorker {
    events: VecDeque<WorkerEvent>,
    kills: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<TaskRequest>>>,
}

impl Worker for ScriptedWorker {
    async fn send(&mut self, request: &TaskRequest) -> Result<()> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("request log poisoned"))?
            .push(request.clone());
        Ok(())
    }

    async fn recv(&mut self) -> WorkerEvent {
        match self.events.pop_front() {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }

    fn kill(&mut self) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
