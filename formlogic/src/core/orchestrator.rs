//! One evaluation pass: module, defaults, conditions, calculations, validations.
//!
//! A pass is synchronous and self-contained. It builds its own
//! [`Environment`] and [`RootInstance`], drives the Logic Engine phase by
//! phase, and returns the resulting scope plus the updated submission data.
//! Expression failures stay attached to the component they came from.

use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::core::engine::{EvalContext, LogicEngine, Phase, is_truthy};
use crate::core::environment::Environment;
use crate::core::shim::{InstanceId, InstanceRef, LookupPolicy, RootInstance};
use crate::core::types::{
    ComponentError, ConditionalRecord, ErrorKind, PassOutput, Scope, Submission,
};
use crate::form::{Component, FormDefinition, SimpleConditional};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassOptions {
    pub lookup_policy: LookupPolicy,
}

/// Runs passes with one engine and one set of options.
#[derive(Debug, Clone, Default)]
pub struct Orchestrator<E> {
    engine: E,
    options: PassOptions,
}

impl<E: LogicEngine> Orchestrator<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            options: PassOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PassOptions) -> Self {
        self.options = options;
        self
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn run(
        &self,
        form: &FormDefinition,
        submission: Submission,
        seed: Option<Scope>,
    ) -> PassOutput {
        run_pass(&self.engine, form, submission, seed, self.options)
    }
}

/// Evaluate every component of `form` against `submission`.
///
/// `seed` primes the conditional scope; records computed by this pass replace
/// seeded records for the same path. Seeded errors are discarded.
pub fn run_pass<E: LogicEngine + ?Sized>(
    engine: &E,
    form: &FormDefinition,
    submission: Submission,
    seed: Option<Scope>,
    options: PassOptions,
) -> PassOutput {
    let env = Environment::build();
    let seeded = seed.map(|scope| scope.conditionals).unwrap_or_default();
    let mut root = RootInstance::build(form, submission, seeded, options.lookup_policy);
    let mut errors = Vec::new();

    let extension = evaluate_module(engine, &root, &env);
    apply_defaults(engine, &mut root, &env, &extension);
    evaluate_conditions(engine, &mut root, &env, &extension, &mut errors);
    clear_hidden(&mut root);
    run_calculations(engine, &mut root, &env, &extension, &mut errors);
    run_validations(engine, &root, &env, &extension, &mut errors);

    let (submission, conditionals) = root.into_parts();
    debug!(
        conditionals = conditionals.len(),
        errors = errors.len(),
        "pass complete"
    );
    PassOutput {
        scope: Scope {
            conditionals,
            errors,
        },
        data: submission.data,
    }
}

fn evaluate_module<E: LogicEngine + ?Sized>(
    engine: &E,
    root: &RootInstance<'_>,
    env: &Environment,
) -> Map<String, Value> {
    let Some(expression) = root.form().module.as_deref() else {
        return Map::new();
    };
    let empty = Map::new();
    let submission = root.submission();
    let ctx = EvalContext {
        phase: Phase::Module,
        form: root.form(),
        submission,
        data: &submission.data,
        row: &submission.data,
        component: None,
        root: Some(root),
        instance: None,
        value: Value::Null,
        env,
        extension: &empty,
    };
    match engine.evaluate(expression, &ctx) {
        Ok(Value::Object(bindings)) => {
            debug!(bindings = bindings.len(), "module extension loaded");
            bindings
        }
        Ok(_) => {
            debug!("module expression did not yield a map; ignored");
            Map::new()
        }
        Err(err) => {
            debug!(%err, "module expression failed; ignored");
            Map::new()
        }
    }
}

fn apply_defaults<E: LogicEngine + ?Sized>(
    engine: &E,
    root: &mut RootInstance<'_>,
    env: &Environment,
    extension: &Map<String, Value>,
) {
    for id in root.ids() {
        let default = {
            let Some(instance) = root.instance(id) else {
                continue;
            };
            let component = instance.component();
            if !component.holds_value() || instance.value().is_some_and(|value| !value.is_null()) {
                continue;
            }
            instance
                .custom_default_value_with(engine, env, extension)
                .or_else(|| component.default_value.clone())
        };
        if let Some(value) = default {
            root.set_value(id, value);
        }
    }
}

fn evaluate_conditions<E: LogicEngine + ?Sized>(
    engine: &E,
    root: &mut RootInstance<'_>,
    env: &Environment,
    extension: &Map<String, Value>,
    errors: &mut Vec<ComponentError>,
) {
    for id in root.ids() {
        let Some(instance) = root.instance(id) else {
            continue;
        };
        let path = instance.path().to_string();
        let outcome = if instance.parent().is_some_and(|parent| !parent.visible()) {
            Ok(false)
        } else {
            should_show(engine, instance, env, extension)
        };
        let hidden = match outcome {
            Ok(show) => !show,
            Err(message) => {
                errors.push(component_error(instance, ErrorKind::Evaluation, message));
                false
            }
        };
        root.set_conditional(ConditionalRecord { path, hidden });
    }
}

/// Custom conditionals win over simple ones; no condition means shown.
fn should_show<E: LogicEngine + ?Sized>(
    engine: &E,
    instance: InstanceRef<'_, '_>,
    env: &Environment,
    extension: &Map<String, Value>,
) -> Result<bool, String> {
    let component = instance.component();
    if let Some(expression) = non_blank(component.custom_conditional.as_deref()) {
        let ctx = instance.eval_context(Phase::Conditions, current_value(instance), env, extension);
        return engine
            .evaluate(expression, &ctx)
            .map(|shown| shown.is_null() || is_truthy(&shown))
            .map_err(|err| err.to_string());
    }
    match &component.conditional {
        Some(SimpleConditional {
            show: Some(show),
            when: Some(when),
            eq,
        }) if !when.trim().is_empty() => {
            let actual = instance
                .get_component(when)
                .and_then(|target| target.value())
                .map(stringify)
                .unwrap_or_default();
            let matched = actual == stringify(eq);
            Ok(if matched { *show } else { !*show })
        }
        _ => Ok(true),
    }
}

fn clear_hidden(root: &mut RootInstance<'_>) {
    let hidden: Vec<(InstanceId, String)> = root
        .instances()
        .filter(|instance| {
            let component = instance.component();
            component.holds_value() && component.clears_on_hide() && !instance.visible()
        })
        .map(|instance| (instance.id(), instance.path().to_string()))
        .collect();
    for (id, path) in hidden {
        if root.clear_value(id).is_some() {
            debug!(path, "cleared hidden value");
        }
    }
}

fn run_calculations<E: LogicEngine + ?Sized>(
    engine: &E,
    root: &mut RootInstance<'_>,
    env: &Environment,
    extension: &Map<String, Value>,
    errors: &mut Vec<ComponentError>,
) {
    let targets: Vec<InstanceId> = root
        .instances()
        .filter(|instance| {
            let component = instance.component();
            component.holds_value()
                && instance.visible()
                && non_blank(component.calculate_value.as_deref()).is_some()
        })
        .map(|instance| instance.id())
        .collect();

    for id in targets {
        let (path, result) = {
            let Some(instance) = root.instance(id) else {
                continue;
            };
            let expression = instance.component().calculate_value.as_deref().unwrap_or_default();
            let ctx =
                instance.eval_context(Phase::Calculations, current_value(instance), env, extension);
            let result = engine
                .evaluate(expression, &ctx)
                .map_err(|err| component_error(instance, ErrorKind::Evaluation, err.to_string()));
            (instance.path().to_string(), result)
        };
        match result {
            Ok(value) => {
                if !root.set_value(id, value) {
                    debug!(path, "calculated value has no data slot");
                }
            }
            Err(error) => errors.push(error),
        }
    }
}

fn run_validations<E: LogicEngine + ?Sized>(
    engine: &E,
    root: &RootInstance<'_>,
    env: &Environment,
    extension: &Map<String, Value>,
    errors: &mut Vec<ComponentError>,
) {
    for instance in root.instances() {
        if instance.visible() && instance.component().holds_value() {
            validate_instance(engine, instance, env, extension, errors);
        }
    }
}

fn validate_instance<E: LogicEngine + ?Sized>(
    engine: &E,
    instance: InstanceRef<'_, '_>,
    env: &Environment,
    extension: &Map<String, Value>,
    errors: &mut Vec<ComponentError>,
) {
    let component = instance.component();
    let rules = &component.validate;
    let label = component.display_name();
    let empty = instance.is_empty(engine);

    if rules.required && empty {
        errors.push(component_error(
            instance,
            ErrorKind::Required,
            format!("{label} is required"),
        ));
        return;
    }

    if !empty && let Some(Value::String(text)) = instance.value() {
        if let Some(pattern) = non_blank(rules.pattern.as_deref()) {
            match Regex::new(&format!("^(?:{pattern})$")) {
                Ok(regex) if !regex.is_match(text) => errors.push(component_error(
                    instance,
                    ErrorKind::Pattern,
                    format!("{label} does not match the pattern {pattern}"),
                )),
                Ok(_) => {}
                Err(err) => errors.push(component_error(
                    instance,
                    ErrorKind::Evaluation,
                    format!("invalid pattern {pattern}: {err}"),
                )),
            }
        }
        let length = text.chars().count();
        if let Some(min) = rules.min_length
            && length < min
        {
            errors.push(component_error(
                instance,
                ErrorKind::MinLength,
                format!("{label} must have at least {min} characters"),
            ));
        }
        if let Some(max) = rules.max_length
            && length > max
        {
            errors.push(component_error(
                instance,
                ErrorKind::MaxLength,
                format!("{label} must have no more than {max} characters"),
            ));
        }
    }

    let Some(expression) = non_blank(rules.custom.as_deref()) else {
        return;
    };
    let ctx = instance.eval_context(Phase::Validations, current_value(instance), env, extension);
    let failure = match engine.evaluate(expression, &ctx) {
        Ok(Value::Null | Value::Bool(true)) => None,
        Ok(Value::String(message)) if message.is_empty() => None,
        Ok(Value::String(message)) => Some((ErrorKind::Custom, message)),
        Ok(other) if is_truthy(&other) => None,
        Ok(_) => Some((ErrorKind::Custom, custom_message(component))),
        Err(err) => Some((ErrorKind::Evaluation, err.to_string())),
    };
    if let Some((kind, message)) = failure {
        errors.push(component_error(instance, kind, message));
    }
}

fn custom_message(component: &Component) -> String {
    match non_blank(component.validate.custom_message.as_deref()) {
        Some(message) => message.to_string(),
        None => format!("{} is invalid", component.display_name()),
    }
}

fn component_error(instance: InstanceRef<'_, '_>, kind: ErrorKind, message: String) -> ComponentError {
    ComponentError {
        path: instance.path().to_string(),
        key: instance.key().to_string(),
        kind,
        message,
    }
}

fn current_value(instance: InstanceRef<'_, '_>) -> Value {
    instance.value().cloned().unwrap_or(Value::Null)
}

fn non_blank(text: Option<&str>) -> Option<&str> {
    text.filter(|text| !text.trim().is_empty())
}

/// String form used when comparing simple conditionals.
fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
