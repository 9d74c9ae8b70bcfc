//! Expression-facing handles onto the instance graph.
//!
//! Sandbox values must own what they point at, so a [`ScriptGraph`] shares
//! the immutable [`Graph`] and carries a copy of the data and conditional
//! scope taken when the expression starts.

use std::sync::Arc;

use minijinja::value::{Enumerator, Object, ObjectRepr, Value as JinjaValue, from_args};
use minijinja::{Error as JinjaError, ErrorKind as JinjaErrorKind, State};
use serde_json::Value;
use tracing::warn;

use super::{Graph, InstanceId, LiveComponent, LookupPolicy, NULL};
use crate::core::engine::is_empty_kind;
use crate::core::path;
use crate::core::types::ConditionalRecord;

#[derive(Debug)]
struct PassView {
    graph: Arc<Graph>,
    data: Value,
    conditionals: Vec<ConditionalRecord>,
    policy: LookupPolicy,
}

impl PassView {
    /// Same resolution as `RootInstance::get_component`, minus the memo.
    fn resolve(&self, raw: &str) -> Option<InstanceId> {
        let normalized = path::normalize(raw);
        let key: &str = &normalized;
        if key.is_empty() {
            return None;
        }
        if let Some(id) = self.graph.exact(key) {
            return Some(id);
        }
        match self.graph.by_suffix(key, self.policy) {
            Ok(found) => found,
            Err(err) => {
                warn!(%err, "component lookup failed");
                None
            }
        }
    }
}

/// Owned view of one pass's instance graph.
///
/// Installed in the sandbox as the callable `getComponent(path)`.
#[derive(Debug, Clone)]
pub struct ScriptGraph {
    view: Arc<PassView>,
}

impl ScriptGraph {
    pub(super) fn new(
        graph: Arc<Graph>,
        data: Value,
        conditionals: Vec<ConditionalRecord>,
        policy: LookupPolicy,
    ) -> Self {
        Self {
            view: Arc::new(PassView {
                graph,
                data,
                conditionals,
                policy,
            }),
        }
    }

    /// The instance at `path` as a sandbox value, or `none`.
    pub fn get_component(&self, path: &str) -> JinjaValue {
        handle(&self.view, self.view.resolve(path))
    }

    /// Sandbox value for `id`; `none` if the id is not from this graph.
    pub fn instance(&self, id: InstanceId) -> JinjaValue {
        handle(&self.view, Some(id))
    }
}

impl Object for ScriptGraph {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Plain
    }

    fn call(
        self: &Arc<Self>,
        _state: &State<'_, '_>,
        args: &[JinjaValue],
    ) -> Result<JinjaValue, JinjaError> {
        let (path,): (&str,) = from_args(args)?;
        Ok(self.get_component(path))
    }
}

fn handle(view: &Arc<PassView>, id: Option<InstanceId>) -> JinjaValue {
    match id.filter(|id| view.graph.node(*id).is_some()) {
        Some(id) => JinjaValue::from_object(InstanceHandle {
            view: Arc::clone(view),
            id,
        }),
        None => JinjaValue::from(()),
    }
}

const ATTRIBUTES: &[&str] = &[
    "key", "type", "path", "dataPath", "rowIndex", "visible", "data", "dataValue", "parent",
];

/// One instance as expressions see it: navigable attributes plus the inert
/// live-UI methods.
#[derive(Debug)]
struct InstanceHandle {
    view: Arc<PassView>,
    id: InstanceId,
}

impl LiveComponent for InstanceHandle {}

impl InstanceHandle {
    fn value(&self) -> &Value {
        self.view.graph.value(self.id, &self.view.data).unwrap_or(&NULL)
    }

    fn parent(&self) -> JinjaValue {
        let parent = self
            .view
            .graph
            .node(self.id)
            .and_then(|node| path::strip_last(&node.path))
            .and_then(|parent| self.view.resolve(parent))
            .filter(|id| *id != self.id);
        handle(&self.view, parent)
    }

    /// Own row or container first, then the whole form.
    fn get_component(&self, target: &str) -> JinjaValue {
        let found = self
            .view
            .graph
            .local(self.id, target)
            .or_else(|| self.view.resolve(target));
        handle(&self.view, found)
    }
}

impl Object for InstanceHandle {
    fn get_value(self: &Arc<Self>, key: &JinjaValue) -> Option<JinjaValue> {
        let node = self.view.graph.node(self.id)?;
        let value = match key.as_str()? {
            "key" => JinjaValue::from(node.key.as_str()),
            "type" => JinjaValue::from(node.kind.as_str()),
            "path" => JinjaValue::from(node.path.as_str()),
            "dataPath" => JinjaValue::from(node.data_path.as_str()),
            "rowIndex" => node
                .row_index
                .map_or_else(|| JinjaValue::from(()), JinjaValue::from),
            "visible" => JinjaValue::from(!self.view.graph.is_hidden(self.id, &self.view.conditionals)),
            "data" => JinjaValue::from_serialize(self.view.graph.row_data(self.id, &self.view.data)),
            "dataValue" => JinjaValue::from_serialize(self.value()),
            "parent" => self.parent(),
            _ => return None,
        };
        Some(value)
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Str(ATTRIBUTES)
    }

    fn call_method(
        self: &Arc<Self>,
        _state: &State<'_, '_>,
        method: &str,
        args: &[JinjaValue],
    ) -> Result<JinjaValue, JinjaError> {
        let first_text = || args.first().and_then(JinjaValue::as_str).unwrap_or_default();
        // `Object` has its own `render`; go through the plain reference.
        let live: &InstanceHandle = self;
        match method {
            "getComponent" => {
                let (target,): (&str,) = from_args(args)?;
                Ok(self.get_component(target))
            }
            "isEmpty" => {
                let kind = self
                    .view
                    .graph
                    .node(self.id)
                    .map(|node| node.kind.as_str())
                    .unwrap_or_default();
                Ok(JinjaValue::from(is_empty_kind(kind, self.value())))
            }
            "getValue" => Ok(JinjaValue::from_serialize(self.value())),
            "render" => Ok(JinjaValue::from(live.render())),
            "renderString" => Ok(JinjaValue::from(live.render_string(first_text()))),
            "redraw" => {
                live.redraw();
                Ok(JinjaValue::from(()))
            }
            "ready" => Ok(JinjaValue::from(live.ready())),
            "t" => Ok(JinjaValue::from(live.t(first_text()))),
            "sanitize" => Ok(JinjaValue::from(live.sanitize(first_text()))),
            "on" => {
                live.on(first_text());
                Ok(JinjaValue::from(()))
            }
            "off" => {
                live.off(first_text());
                Ok(JinjaValue::from(()))
            }
            _ => Err(JinjaError::new(
                JinjaErrorKind::UnknownMethod,
                format!("component has no method named {method}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shim::RootInstance;
    use crate::core::types::Submission;
    use crate::form::FormDefinition;
    use serde_json::json;

    fn form() -> FormDefinition {
        serde_json::from_value(json!({
            "components": [
                { "key": "page", "type": "panel", "components": [
                    { "key": "name", "type": "textfield" },
                    { "key": "rows", "type": "editgrid", "components": [
                        { "key": "val", "type": "textfield" },
                        { "key": "note", "type": "textfield" }
                    ]}
                ]}
            ]
        }))
        .expect("form")
    }

    fn eval(graph: &ScriptGraph, instance: JinjaValue, source: &str) -> Value {
        let mut env = minijinja::Environment::new();
        env.add_global("getComponent", JinjaValue::from_object(graph.clone()));
        let result = env
            .compile_expression(source)
            .expect("compile")
            .eval(minijinja::context! { instance => instance })
            .expect("eval");
        serde_json::to_value(&result).expect("json")
    }

    #[test]
    fn expressions_navigate_the_graph() {
        let form = form();
        let submission = Submission::from_data(json!({
            "name": "ada",
            "rows": [{ "val": "a" }, { "val": "b", "note": "" }]
        }));
        let root = RootInstance::build(&form, submission, Vec::new(), LookupPolicy::Lenient);
        let graph = root.script_graph();
        let note = graph.instance(root.get_component("rows.1.note").expect("note").id());

        assert_eq!(eval(&graph, note.clone(), "instance.getComponent('val').dataValue"), json!("b"));
        assert_eq!(eval(&graph, note.clone(), "instance.parent.path"), json!("page.rows"));
        assert_eq!(eval(&graph, note.clone(), "instance.data"), json!({ "val": "b", "note": "" }));
        assert_eq!(eval(&graph, note.clone(), "instance.isEmpty()"), json!(true));
        assert_eq!(eval(&graph, note.clone(), "instance.rowIndex"), json!(1));
        assert_eq!(eval(&graph, note, "getComponent('name').dataValue"), json!("ada"));
        assert_eq!(eval(&graph, JinjaValue::from(()), "getComponent('missing') is none"), json!(true));

        let page = graph.get_component("page");
        assert_eq!(eval(&graph, page, "instance.parent is none"), json!(true));
    }

    #[test]
    fn lifecycle_calls_are_inert_in_expressions() {
        let form = form();
        let root = RootInstance::build(
            &form,
            Submission::from_data(json!({ "name": "ada" })),
            Vec::new(),
            LookupPolicy::Lenient,
        );
        let graph = root.script_graph();
        let name = graph.get_component("name");
        let source = "[instance.redraw(), instance.on('change'), instance.off('change'), \
                      instance.render(), instance.renderString('x'), instance.ready(), \
                      instance.t('Submit'), instance.sanitize('<b>x</b>')]";
        assert_eq!(
            eval(&graph, name, source),
            json!([null, null, null, "", "", true, "Submit", "<b>x</b>"])
        );
    }

    #[test]
    fn visibility_reflects_scope_at_snapshot_time() {
        let form = form();
        let mut root = RootInstance::build(
            &form,
            Submission::from_data(json!({ "name": "ada" })),
            Vec::new(),
            LookupPolicy::Lenient,
        );
        let before = root.script_graph();
        root.set_conditional(ConditionalRecord {
            path: "page".to_string(),
            hidden: true,
        });
        let after = root.script_graph();
        let name = |graph: &ScriptGraph| graph.get_component("name");
        assert_eq!(eval(&before, name(&before), "instance.visible"), json!(true));
        assert_eq!(eval(&after, name(&after), "instance.visible"), json!(false));
    }
}
