//! Semantic invariants not expressible via JSON Schema.

use std::collections::HashSet;

use indexmap::IndexMap;

use crate::core::path;
use crate::form::{Component, ComponentKind, FormDefinition};

/// Check semantic invariants not expressible in JSON Schema:
/// - Every value-holding component has a key
/// - Keys are unique within one data scope (the form root, a container
///   object, or a grid row); layout components share their parent's scope
pub fn validate_invariants(form: &FormDefinition) -> Vec<String> {
    let mut errors = Vec::new();
    check_scope(form.components.iter(), "", "", &mut errors);
    errors
}

fn check_scope<'f>(
    components: impl Iterator<Item = &'f Component>,
    scope: &str,
    location: &str,
    errors: &mut Vec<String>,
) {
    let mut seen = HashSet::new();
    visit_scope(components, scope, location, &mut seen, errors);
}

fn visit_scope<'f>(
    components: impl Iterator<Item = &'f Component>,
    scope: &str,
    location: &str,
    seen: &mut HashSet<&'f str>,
    errors: &mut Vec<String>,
) {
    for (position, component) in components.enumerate() {
        let key = component.key.trim();
        let label = if key.is_empty() {
            format!("#{position}")
        } else {
            key.to_string()
        };
        let here = path::join(location, &label);

        if component.kind() == ComponentKind::Layout {
            visit_scope(component.children(), scope, &here, seen, errors);
            continue;
        }
        if !component.holds_value() {
            continue;
        }
        if key.is_empty() {
            errors.push(format!("{here}: '{}' component has no key", component.kind));
            continue;
        }
        if !seen.insert(key) {
            let scope_name = if scope.is_empty() {
                "form root".to_string()
            } else {
                format!("'{scope}'")
            };
            errors.push(format!("{here}: duplicate key '{key}' in {scope_name}"));
        }
        if matches!(component.kind(), ComponentKind::Container | ComponentKind::Grid) {
            check_scope(component.children(), &path::join(scope, key), &here, errors);
        }
    }
}

/// Leaf keys that occur in more than one data scope.
///
/// Short-path lookups for these keys resolve to the first occurrence only.
pub fn ambiguous_leaf_keys(form: &FormDefinition) -> Vec<String> {
    let mut occurrences: IndexMap<&str, Vec<String>> = IndexMap::new();
    collect_leaves(form.components.iter(), "", &mut occurrences);
    occurrences
        .into_iter()
        .filter(|(_, paths)| paths.len() > 1)
        .map(|(key, paths)| {
            format!(
                "leaf key '{key}' appears at {}; short lookups resolve to the first",
                paths.join(", ")
            )
        })
        .collect()
}

fn collect_leaves<'f>(
    components: impl Iterator<Item = &'f Component>,
    scope: &str,
    occurrences: &mut IndexMap<&'f str, Vec<String>>,
) {
    for component in components {
        let key = component.key.trim();
        match component.kind() {
            ComponentKind::Layout => collect_leaves(component.children(), scope, occurrences),
            ComponentKind::Container | ComponentKind::Grid => {
                collect_leaves(component.children(), &path::join(scope, key), occurrences);
            }
            ComponentKind::Field => {
                if key.is_empty() || !component.holds_value() {
                    continue;
                }
                occurrences
                    .entry(key)
                    .or_default()
                    .push(path::join(scope, key));
            }
        }
    }
}
