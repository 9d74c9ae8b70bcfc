//! Form, submission and scope loading with schema + invariant validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::invariants::{ambiguous_leaf_keys, validate_invariants};
use crate::core::types::{Scope, Submission};
use crate::form::FormDefinition;

pub const FORM_SCHEMA: &str = include_str!("../../schemas/form.schema.json");

/// A form that passed schema and invariant checks.
#[derive(Debug, Clone)]
pub struct LoadedForm {
    pub form: FormDefinition,
    /// Non-fatal findings, such as leaf keys repeated across data scopes.
    pub warnings: Vec<String>,
}

/// Load and validate a form definition from disk.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_form(path: &Path) -> Result<LoadedForm> {
    let raw = fs::read_to_string(path).with_context(|| format!("read form {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&raw).with_context(|| format!("parse form {}", path.display()))?;
    form_from_value(value).with_context(|| format!("load form {}", path.display()))
}

/// Validate an already-parsed form definition (schema, then invariants).
pub fn form_from_value(value: Value) -> Result<LoadedForm> {
    validate_schema(&value)?;
    let form: FormDefinition = serde_json::from_value(value).context("deserialize form")?;
    let errors = validate_invariants(&form);
    if !errors.is_empty() {
        bail!("invariant violations:\n- {}", errors.join("\n- "));
    }
    let warnings = ambiguous_leaf_keys(&form);
    for warning in &warnings {
        warn!(%warning, "ambiguous form key");
    }
    debug!(components = form.components.len(), "form loaded");
    Ok(LoadedForm { form, warnings })
}

/// Load a submission; a bare data object is wrapped as `{"data": ...}`.
pub fn load_submission(path: &Path) -> Result<Submission> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read submission {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("parse submission {}", path.display()))?;
    Ok(Submission::from_json(value))
}

pub fn load_scope(path: &Path) -> Result<Scope> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("read scope {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse scope {}", path.display()))
}

/// Validate JSON instance against the embedded form schema (Draft 2020-12).
fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(FORM_SCHEMA).context("parse form schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile form schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(dir: &Path, name: &str, value: &Value) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, serde_json::to_string_pretty(value).expect("json")).expect("write");
        path
    }

    #[test]
    fn load_form_accepts_valid_definition() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(
            temp.path(),
            "form.json",
            &json!({
                "title": "Order",
                "components": [
                    { "key": "qty", "type": "number", "validate": { "required": true } },
                    { "key": "rows", "type": "editgrid", "components": [
                        { "key": "qty", "type": "number" }
                    ]}
                ]
            }),
        );
        let loaded = load_form(&path).expect("load");
        assert_eq!(loaded.form.title, "Order");
        assert_eq!(loaded.warnings.len(), 1, "{:?}", loaded.warnings);
    }

    #[test]
    fn builder_export_loads() {
        let loaded = form_from_value(json!({
            "display": "form",
            "components": [
                {
                    "label": "Notes", "key": "notes", "type": "textarea", "input": true,
                    "rows": 3, "tableView": true,
                    "validate": { "required": false, "minLength": "", "maxLength": "", "pattern": "", "custom": "" },
                    "conditional": { "show": "", "when": "", "eq": "" }
                },
                {
                    "label": "Layout", "key": "layout", "type": "table", "numRows": 1, "numCols": 1,
                    "rows": [[{ "components": [
                        { "label": "Name", "key": "name", "type": "textfield", "validate": { "maxLength": "20" } }
                    ]}]]
                },
                { "label": "Submit", "key": "submit", "type": "button", "input": true, "action": "submit" }
            ]
        }))
        .expect("builder export");
        let form = &loaded.form;
        assert!(form.components[0].rows.is_empty());
        assert_eq!(form.components[0].validate.max_length, None);
        let name = form.components[1].children().next().expect("table cell");
        assert_eq!(name.key, "name");
        assert_eq!(name.validate.max_length, Some(20));
    }

    #[test]
    fn schema_violations_are_reported() {
        let err = form_from_value(json!({ "components": [{ "key": 5 }] })).unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
        let err = form_from_value(json!({ "title": "no components" })).unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn invariant_violations_are_reported() {
        let err = form_from_value(json!({
            "components": [
                { "key": "a", "type": "textfield" },
                { "key": "a", "type": "textfield" }
            ]
        }))
        .unwrap_err();
        assert!(format!("{err:#}").contains("duplicate key 'a'"));
    }

    #[test]
    fn submission_and_scope_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let bare = write(temp.path(), "bare.json", &json!({ "a": 1 }));
        assert_eq!(load_submission(&bare).expect("bare").data, json!({ "a": 1 }));
        let wrapped = write(
            temp.path(),
            "wrapped.json",
            &json!({ "data": { "a": 2 }, "state": "submitted" }),
        );
        let submission = load_submission(&wrapped).expect("wrapped");
        assert_eq!(submission.data, json!({ "a": 2 }));
        assert_eq!(submission.extra.get("state"), Some(&json!("submitted")));

        let scope = write(
            temp.path(),
            "scope.json",
            &json!({ "conditionals": [{ "path": "a", "hidden": true }] }),
        );
        let scope = load_scope(&scope).expect("scope");
        assert!(scope.conditionals[0].hidden);
        assert!(scope.errors.is_empty());
    }

    #[test]
    fn missing_file_names_the_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_form(&temp.path().join("nope.json")).unwrap_err();
        assert!(format!("{err:#}").contains("nope.json"));
    }
}
