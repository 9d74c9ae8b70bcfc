use serde_json::{Map, Value};
use tracing::debug;

use super::{InstanceId, NULL, Node, RootInstance};
use crate::core::engine::{EvalContext, InstanceSnapshot, LogicEngine, Phase};
use crate::core::environment::Environment;
use crate::core::path;
use crate::form::Component;

/// Live-UI calls that legacy expressions make defensively.
///
/// Nothing is rendered server-side, so every method is a no-op; they exist so
/// such expressions keep working.
pub trait LiveComponent {
    fn render(&self) -> String {
        String::new()
    }

    fn redraw(&self) {}

    fn ready(&self) -> bool {
        true
    }

    /// Translation hook; returns the text untouched.
    fn t(&self, text: &str) -> String {
        text.to_string()
    }

    fn sanitize(&self, html: &str) -> String {
        html.to_string()
    }

    fn render_string(&self, _template: &str) -> String {
        String::new()
    }

    fn on(&self, _event: &str) {}

    fn off(&self, _event: &str) {}
}

/// Borrowed view of one component instance.
#[derive(Debug, Clone, Copy)]
pub struct InstanceRef<'r, 'f> {
    root: &'r RootInstance<'f>,
    id: InstanceId,
}

impl LiveComponent for InstanceRef<'_, '_> {}

impl<'r, 'f> InstanceRef<'r, 'f> {
    pub(super) fn new(root: &'r RootInstance<'f>, id: InstanceId) -> Self {
        Self { root, id }
    }

    fn inner(&self) -> &'r Node {
        // Only built for ids the root handed out.
        &self.root.graph.nodes[self.id.0]
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn root(&self) -> &'r RootInstance<'f> {
        self.root
    }

    pub fn component(&self) -> &'f Component {
        self.root.components[self.id.0]
    }

    pub fn key(&self) -> &'f str {
        &self.component().key
    }

    /// Fully-qualified path: layout keys and row indices included.
    pub fn path(&self) -> &'r str {
        &self.inner().path
    }

    /// Path through data-bearing keys only, with row indices.
    pub fn data_path(&self) -> &'r str {
        &self.inner().data_path
    }

    pub fn row_index(&self) -> Option<usize> {
        self.inner().row_index
    }

    /// Every path this instance is reachable by.
    pub fn variants(&self) -> &'r [String] {
        &self.inner().variants
    }

    /// Row-scoped data: the enclosing row or container object, else root data.
    pub fn data(&self) -> &'r Value {
        self.root.graph.row_data(self.id, &self.root.submission.data)
    }

    /// This instance's own value; `None` for layout components and unset slots.
    pub fn value(&self) -> Option<&'r Value> {
        self.root.graph.value(self.id, &self.root.submission.data)
    }

    /// Strip the last path segment and look the result up again.
    pub fn parent(&self) -> Option<InstanceRef<'r, 'f>> {
        let parent = path::strip_last(self.path())?;
        self.root
            .get_component(parent)
            .filter(|found| found.id != self.id)
    }

    /// False when this path or any ancestor path is recorded hidden.
    pub fn visible(&self) -> bool {
        !self.root.is_hidden(self.id)
    }

    /// Resolve `target` inside this instance's row or container first, then
    /// from the root.
    pub fn get_component(&self, target: &str) -> Option<InstanceRef<'r, 'f>> {
        match self.root.graph.local(self.id, target) {
            Some(id) => Some(InstanceRef::new(self.root, id)),
            None => self.root.get_component(target),
        }
    }

    pub fn is_empty<E: LogicEngine + ?Sized>(&self, engine: &E) -> bool {
        engine.is_empty(self.component(), self.value().unwrap_or(&NULL))
    }

    /// Evaluate the declared default-value expression, if any.
    pub fn get_custom_default_value<E: LogicEngine + ?Sized>(
        &self,
        engine: &E,
        env: &Environment,
    ) -> Option<Value> {
        self.custom_default_value_with(engine, env, &Map::new())
    }

    pub(crate) fn custom_default_value_with<E: LogicEngine + ?Sized>(
        &self,
        engine: &E,
        env: &Environment,
        extension: &Map<String, Value>,
    ) -> Option<Value> {
        let expression = self.component().custom_default_value.as_deref()?;
        let ctx = self.eval_context(Phase::DefaultValue, Value::Null, env, extension);
        match engine.evaluate(expression, &ctx) {
            Ok(Value::Null) => None,
            Ok(value) => Some(value),
            Err(err) => {
                debug!(path = self.path(), %err, "default value expression failed");
                None
            }
        }
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            path: self.path().to_string(),
            key: self.key().to_string(),
            kind: self.component().kind.clone(),
            row_index: self.row_index(),
            visible: self.visible(),
        }
    }

    /// Context for evaluating one of this instance's expressions.
    pub fn eval_context<'a>(
        &self,
        phase: Phase,
        value: Value,
        env: &'a Environment,
        extension: &'a Map<String, Value>,
    ) -> EvalContext<'a>
    where
        'r: 'a,
        'f: 'a,
    {
        let submission = &self.root.submission;
        EvalContext {
            phase,
            form: self.root.form,
            submission,
            data: &submission.data,
            row: self.data(),
            component: Some(self.component()),
            root: Some(self.root),
            instance: Some(*self),
            value,
            env,
            extension,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::{EngineError, MinijinjaEngine};
    use crate::core::shim::LookupPolicy;
    use crate::core::types::{ConditionalRecord, Submission};
    use crate::form::FormDefinition;
    use serde_json::json;

    fn form() -> FormDefinition {
        serde_json::from_value(json!({
            "components": [
                { "key": "a", "type": "container", "components": [
                    { "key": "b", "type": "panel", "components": [
                        { "key": "c", "type": "textfield" }
                    ]}
                ]},
                { "key": "rows", "type": "datagrid", "components": [
                    { "key": "qty", "type": "number" },
                    { "key": "note", "type": "textfield", "customDefaultValue": "value = row.qty * 2" }
                ]}
            ]
        }))
        .expect("form")
    }

    fn data() -> Submission {
        Submission::from_data(json!({
            "a": { "c": "deep" },
            "rows": [{ "qty": 1 }, { "qty": 5 }]
        }))
    }

    #[test]
    fn hidden_ancestor_hides_descendants() {
        let form = form();
        let hidden = vec![ConditionalRecord {
            path: "a.b".to_string(),
            hidden: true,
        }];
        let root = RootInstance::build(&form, data(), hidden, LookupPolicy::Lenient);
        assert!(!root.get_component("a.b.c").expect("c").visible());
        assert!(!root.get_component("a.b").expect("b").visible());
        assert!(root.get_component("a").expect("a").visible());
        assert!(root.get_component("rows.0.qty").expect("qty").visible());
    }

    #[test]
    fn parent_walks_through_rows_and_layouts() {
        let form = form();
        let root = RootInstance::build(&form, data(), Vec::new(), LookupPolicy::Lenient);
        let qty = root.get_component("rows.1.qty").expect("qty");
        assert_eq!(qty.parent().expect("grid").path(), "rows");
        let c = root.get_component("a.b.c").expect("c");
        let panel = c.parent().expect("panel");
        assert_eq!(panel.key(), "b");
        assert_eq!(panel.parent().expect("container").key(), "a");
        assert!(root.get_component("a").expect("a").parent().is_none());
    }

    #[test]
    fn data_is_row_scoped() {
        let form = form();
        let root = RootInstance::build(&form, data(), Vec::new(), LookupPolicy::Lenient);
        let second = root.get_component("rows.1.qty").expect("qty");
        assert_eq!(second.data(), &json!({ "qty": 5 }));
        assert_eq!(second.row_index(), Some(1));
        let c = root.get_component("c").expect("c");
        assert_eq!(c.data(), &json!({ "c": "deep" }));
        assert_eq!(root.get_component("a").expect("a").data(), &root.submission().data);
    }

    #[test]
    fn local_lookup_prefers_own_row() {
        let form = form();
        let root = RootInstance::build(&form, data(), Vec::new(), LookupPolicy::Lenient);
        let note = root.get_component("rows.1.note").expect("note");
        let sibling = note.get_component("qty").expect("sibling");
        assert_eq!(sibling.path(), "rows.1.qty");
        assert_eq!(sibling.value(), Some(&json!(5)));
    }

    #[test]
    fn custom_default_value_uses_row_context() {
        let form = form();
        let root = RootInstance::build(&form, data(), Vec::new(), LookupPolicy::Lenient);
        let env = Environment::build();
        let note = root.get_component("rows.1.note").expect("note");
        assert_eq!(
            note.get_custom_default_value(&MinijinjaEngine, &env),
            Some(json!(10))
        );
        let qty = root.get_component("rows.1.qty").expect("qty");
        assert_eq!(qty.get_custom_default_value(&MinijinjaEngine, &env), None);
    }

    #[test]
    fn custom_default_value_swallows_engine_errors() {
        struct Failing;
        impl LogicEngine for Failing {
            fn evaluate(&self, _: &str, _: &EvalContext<'_>) -> Result<Value, EngineError> {
                Err(EngineError::Evaluation("boom".to_string()))
            }
        }
        let form = form();
        let root = RootInstance::build(&form, data(), Vec::new(), LookupPolicy::Lenient);
        let env = Environment::build();
        let note = root.get_component("rows.0.note").expect("note");
        assert_eq!(note.get_custom_default_value(&Failing, &env), None);
    }

    #[test]
    fn lifecycle_methods_are_inert() {
        let form = form();
        let root = RootInstance::build(&form, data(), Vec::new(), LookupPolicy::Lenient);
        let c = root.get_component("c").expect("c");
        c.redraw();
        c.on("change");
        c.off("change");
        assert_eq!(c.render(), "");
        assert_eq!(c.render_string("{{ x }}"), "");
        assert!(c.ready());
        assert_eq!(c.t("Submit"), "Submit");
        assert_eq!(c.sanitize("<b>x</b>"), "<b>x</b>");
        assert_eq!(c.value(), Some(&json!("deep")));
    }

    #[test]
    fn is_empty_delegates_to_engine() {
        let form = form();
        let root = RootInstance::build(&form, data(), Vec::new(), LookupPolicy::Lenient);
        assert!(root.get_component("rows.0.note").expect("note").is_empty(&MinijinjaEngine));
        assert!(!root.get_component("rows.0.qty").expect("qty").is_empty(&MinijinjaEngine));
    }
}
