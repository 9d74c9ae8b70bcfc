//! Component instance graph rebuilt from a form definition plus submission data.
//!
//! [`RootInstance::build`] walks the definition depth-first over the data, so
//! every repeating row present in the submission yields its own instances. The
//! path index is complete before the constructor returns; lookups and parent
//! navigation only ever read it.
//!
//! Every instance is indexed under each path it can legitimately be addressed
//! by, because historical expressions are inconsistent about layout keys and
//! row indices:
//!
//! | variant          | `p1` panel > `rows` grid > `val`, row 0 |
//! |------------------|------------------------------------------|
//! | full             | `p1.rows.0.val`                          |
//! | data             | `rows.0.val`                             |
//! | structural       | `p1.rows.val`                            |
//! | data structural  | `rows.val`                               |
//!
//! When two instances share a variant (the structural ones, across rows), the
//! first one indexed keeps it.

mod instance;
mod script;

pub use instance::{InstanceRef, LiveComponent};
pub use script::ScriptGraph;

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::types::{ConditionalRecord, Submission};
use crate::core::{data, path};
use crate::form::{Component, ComponentKind, FormDefinition};

static NULL: Value = Value::Null;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(usize);

/// What `get_component` does when only the suffix fallback matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupPolicy {
    /// First match in index order wins.
    #[default]
    Lenient,
    /// More than one distinct match is an error.
    Strict,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShimError {
    #[error("path '{path}' is ambiguous; candidates: {}", candidates.join(", "))]
    AmbiguousPath {
        path: String,
        candidates: Vec<String>,
    },
}

/// Owned, immutable facts about one instance. Shared with expression
/// handles, so it borrows nothing from the form.
#[derive(Debug)]
struct Node {
    key: String,
    kind: String,
    path: String,
    data_path: String,
    row_index: Option<usize>,
    /// Location of the row-scoped slice (`data`) in submission data.
    row_segments: Vec<String>,
    /// Location of this instance's own value; `None` for layout components.
    value_segments: Option<Vec<String>>,
    /// Data path of the enclosing row or container, for local lookups.
    scope_path: String,
    variants: Vec<String>,
}

/// Instance arena plus path index. Fixed once [`RootInstance::build`] returns.
#[derive(Debug, Default)]
struct Graph {
    nodes: Vec<Node>,
    index: IndexMap<String, InstanceId>,
}

impl Graph {
    fn node(&self, id: InstanceId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    fn exact(&self, key: &str) -> Option<InstanceId> {
        self.index.get(key).copied()
    }

    /// Trailing-segment fallback over every indexed key, in index order.
    fn by_suffix(&self, key: &str, policy: LookupPolicy) -> Result<Option<InstanceId>, ShimError> {
        let mut matches = self
            .index
            .iter()
            .filter(|(indexed, _)| path::ends_with_segments(indexed, key))
            .map(|(_, id)| *id);
        let first = matches.next();
        if policy == LookupPolicy::Strict
            && let Some(first) = first
        {
            let mut candidates = vec![first];
            for id in matches {
                if !candidates.contains(&id) {
                    candidates.push(id);
                }
            }
            if candidates.len() > 1 {
                return Err(ShimError::AmbiguousPath {
                    path: key.to_string(),
                    candidates: candidates
                        .into_iter()
                        .filter_map(|id| self.node(id).map(|node| node.path.clone()))
                        .collect(),
                });
            }
        }
        debug!(path = key, found = first.is_some(), "resolved by suffix");
        Ok(first)
    }

    /// `target` joined onto the instance's own row or container scope.
    fn local(&self, id: InstanceId, target: &str) -> Option<InstanceId> {
        let scope = &self.node(id)?.scope_path;
        if scope.is_empty() {
            return None;
        }
        let normalized = path::normalize(target);
        self.exact(&path::join(scope, &normalized))
    }

    fn is_hidden(&self, id: InstanceId, conditionals: &[ConditionalRecord]) -> bool {
        let Some(node) = self.node(id) else {
            return false;
        };
        conditionals.iter().any(|record| {
            record.hidden
                && node
                    .variants
                    .iter()
                    .any(|variant| path::covers(&record.path, variant))
        })
    }

    fn row_data<'v>(&self, id: InstanceId, data: &'v Value) -> &'v Value {
        self.node(id)
            .and_then(|node| data::get(data, node.row_segments.as_slice()))
            .unwrap_or(&NULL)
    }

    fn value<'v>(&self, id: InstanceId, data: &'v Value) -> Option<&'v Value> {
        let segments = self.node(id)?.value_segments.as_ref()?;
        data::get(data, segments.as_slice())
    }
}

/// Conditional record paths compare segment-wise, so `rows[0]` must read `rows.0`.
fn normalized(mut record: ConditionalRecord) -> ConditionalRecord {
    record.path = path::normalize(&record.path).into_owned();
    record
}

/// Owns the instance arena, the path index, the submission and the
/// conditional scope for one pass.
#[derive(Debug)]
pub struct RootInstance<'f> {
    form: &'f FormDefinition,
    submission: Submission,
    conditionals: Vec<ConditionalRecord>,
    components: Vec<&'f Component>,
    graph: Arc<Graph>,
    resolved: RefCell<HashMap<String, Option<InstanceId>>>,
    policy: LookupPolicy,
}

impl<'f> RootInstance<'f> {
    pub fn build(
        form: &'f FormDefinition,
        submission: Submission,
        conditionals: Vec<ConditionalRecord>,
        policy: LookupPolicy,
    ) -> Self {
        let mut builder = Builder {
            data: &submission.data,
            components: Vec::new(),
            graph: Graph::default(),
        };
        builder.visit(form.components.iter(), &Cursor::default());
        let Builder {
            components, graph, ..
        } = builder;
        debug!(
            instances = graph.nodes.len(),
            paths = graph.index.len(),
            "built instance graph"
        );
        Self {
            form,
            submission,
            conditionals: conditionals.into_iter().map(normalized).collect(),
            components,
            graph: Arc::new(graph),
            resolved: RefCell::new(HashMap::new()),
            policy,
        }
    }

    pub fn form(&self) -> &'f FormDefinition {
        self.form
    }

    pub fn submission(&self) -> &Submission {
        &self.submission
    }

    pub fn into_submission(self) -> Submission {
        self.submission
    }

    pub fn policy(&self) -> LookupPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.graph.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.nodes.is_empty()
    }

    /// Instance ids in traversal order (parents before children).
    pub fn ids(&self) -> impl Iterator<Item = InstanceId> + use<> {
        (0..self.graph.nodes.len()).map(InstanceId)
    }

    pub fn instances(&self) -> impl Iterator<Item = InstanceRef<'_, 'f>> {
        self.ids().map(|id| InstanceRef::new(self, id))
    }

    /// `None` for an id that did not come from this graph.
    pub fn instance(&self, id: InstanceId) -> Option<InstanceRef<'_, 'f>> {
        (id.0 < self.graph.nodes.len()).then(|| InstanceRef::new(self, id))
    }

    /// Every indexed path, in index order.
    pub fn indexed_paths(&self) -> impl Iterator<Item = &str> {
        self.graph.index.keys().map(String::as_str)
    }

    /// Owned handle for expressions, reflecting the data and conditional
    /// scope as they are right now.
    pub fn script_graph(&self) -> ScriptGraph {
        ScriptGraph::new(
            Arc::clone(&self.graph),
            self.submission.data.clone(),
            self.conditionals.clone(),
            self.policy,
        )
    }

    /// Resolve `path` under the configured policy, logging and hiding ambiguity.
    pub fn get_component(&self, path: &str) -> Option<InstanceRef<'_, 'f>> {
        match self.try_get_component(path) {
            Ok(found) => found,
            Err(err) => {
                warn!(%err, "component lookup failed");
                None
            }
        }
    }

    /// Exact match first, then the memoized trailing-segment fallback.
    pub fn try_get_component(&self, path: &str) -> Result<Option<InstanceRef<'_, 'f>>, ShimError> {
        Ok(self
            .resolve(path)?
            .map(|id| InstanceRef::new(self, id)))
    }

    fn resolve(&self, raw: &str) -> Result<Option<InstanceId>, ShimError> {
        let normalized = path::normalize(raw);
        let key: &str = &normalized;
        if key.is_empty() {
            return Ok(None);
        }
        if let Some(id) = self.graph.exact(key) {
            return Ok(Some(id));
        }
        if let Some(cached) = self.resolved.borrow().get(key) {
            return Ok(*cached);
        }
        let first = self.graph.by_suffix(key, self.policy)?;
        self.resolved.borrow_mut().insert(key.to_string(), first);
        Ok(first)
    }

    pub fn conditionals(&self) -> &[ConditionalRecord] {
        &self.conditionals
    }

    /// Record visibility for a path, replacing any earlier record for it.
    pub fn set_conditional(&mut self, record: ConditionalRecord) {
        let record = normalized(record);
        self.conditionals
            .retain(|existing| existing.path != record.path);
        self.conditionals.push(record);
    }

    pub fn into_parts(self) -> (Submission, Vec<ConditionalRecord>) {
        (self.submission, self.conditionals)
    }

    /// Write `value` into the instance's own data slot.
    ///
    /// Returns false for layout components, for slots whose parent object is
    /// missing from the submission, and for ids from another graph.
    pub fn set_value(&mut self, id: InstanceId, value: Value) -> bool {
        let Some(segments) = self
            .graph
            .node(id)
            .and_then(|node| node.value_segments.as_ref())
        else {
            return false;
        };
        data::set(&mut self.submission.data, segments.as_slice(), value)
    }

    pub fn clear_value(&mut self, id: InstanceId) -> Option<Value> {
        let segments = self.graph.node(id)?.value_segments.as_ref()?;
        data::remove(&mut self.submission.data, segments.as_slice())
    }

    fn is_hidden(&self, id: InstanceId) -> bool {
        self.graph.is_hidden(id, &self.conditionals)
    }
}

/// Position of the traversal in both the definition and the data.
#[derive(Debug, Clone, Default)]
struct Cursor {
    path: String,
    structural: String,
    data_path: String,
    data_structural: String,
    data_segments: Vec<String>,
    row_index: Option<usize>,
}

impl Cursor {
    fn layout_child(&self, key: &str) -> Self {
        Self {
            path: path::join(&self.path, key),
            structural: path::join(&self.structural, key),
            ..self.clone()
        }
    }

    fn data_child(&self, key: &str) -> Self {
        let mut data_segments = self.data_segments.clone();
        data_segments.push(key.to_string());
        Self {
            path: path::join(&self.path, key),
            structural: path::join(&self.structural, key),
            data_path: path::join(&self.data_path, key),
            data_structural: path::join(&self.data_structural, key),
            data_segments,
            row_index: self.row_index,
        }
    }

    fn row(&self, index: usize) -> Self {
        let position = index.to_string();
        let mut data_segments = self.data_segments.clone();
        data_segments.push(position.clone());
        Self {
            path: path::join(&self.path, &position),
            structural: self.structural.clone(),
            data_path: path::join(&self.data_path, &position),
            data_structural: self.data_structural.clone(),
            data_segments,
            row_index: Some(index),
        }
    }
}

struct Builder<'f, 'd> {
    data: &'d Value,
    components: Vec<&'f Component>,
    graph: Graph,
}

impl<'f> Builder<'f, '_> {
    fn visit(&mut self, components: impl Iterator<Item = &'f Component>, cursor: &Cursor) {
        for component in components {
            match component.kind() {
                ComponentKind::Layout => {
                    let child = cursor.layout_child(&component.key);
                    self.push(component, cursor, &child, None);
                    self.visit(component.children(), &child);
                }
                ComponentKind::Field => {
                    if component.key.is_empty() {
                        debug!(kind = %component.kind, "skipping field without key");
                        continue;
                    }
                    let child = cursor.data_child(&component.key);
                    let slot = component.holds_value().then(|| child.data_segments.clone());
                    self.push(component, cursor, &child, slot);
                }
                ComponentKind::Container => {
                    let child = cursor.data_child(&component.key);
                    let id = self.push(component, cursor, &child, Some(child.data_segments.clone()));
                    match data::get(self.data, child.data_segments.as_slice()) {
                        Some(Value::Object(_)) => self.visit(component.children(), &child),
                        _ => debug!(path = %child.path, id = id.0, "container has no data object"),
                    }
                }
                ComponentKind::Grid => {
                    let child = cursor.data_child(&component.key);
                    let id = self.push(component, cursor, &child, Some(child.data_segments.clone()));
                    let rows: Vec<usize> = match data::get(self.data, child.data_segments.as_slice()) {
                        Some(Value::Array(rows)) => rows
                            .iter()
                            .enumerate()
                            .filter(|(_, row)| row.is_object())
                            .map(|(index, _)| index)
                            .collect(),
                        _ => Vec::new(),
                    };
                    for index in rows {
                        let row = child.row(index);
                        // `parent` from inside a row strips to `grid.<index>`.
                        self.alias(&row.path, id);
                        self.alias(&row.data_path, id);
                        self.visit(component.children(), &row);
                    }
                }
            }
        }
    }

    fn push(
        &mut self,
        component: &'f Component,
        parent: &Cursor,
        own: &Cursor,
        value_segments: Option<Vec<String>>,
    ) -> InstanceId {
        let id = InstanceId(self.graph.nodes.len());
        let mut variants = vec![own.path.clone(), own.structural.clone()];
        if value_segments.is_some() {
            variants.push(own.data_path.clone());
            variants.push(own.data_structural.clone());
        }
        variants.retain(|variant| !variant.is_empty());
        let mut unique: Vec<String> = Vec::with_capacity(variants.len());
        for variant in variants {
            if !unique.contains(&variant) {
                unique.push(variant);
            }
        }
        for variant in &unique {
            self.alias(variant, id);
        }
        self.components.push(component);
        self.graph.nodes.push(Node {
            key: component.key.clone(),
            kind: component.kind.clone(),
            path: own.path.clone(),
            data_path: own.data_path.clone(),
            row_index: own.row_index,
            row_segments: parent.data_segments.clone(),
            value_segments,
            scope_path: parent.data_path.clone(),
            variants: unique,
        });
        id
    }

    fn alias(&mut self, key: &str, id: InstanceId) {
        if key.is_empty() {
            return;
        }
        self.graph.index.entry(key.to_string()).or_insert(id);
    }
}
