//! Per-pass execution environment for form expressions.
//!
//! An [`Environment`] holds inert browser stand-ins, a synchronous timer and
//! the pinned utility-library table. It is built fresh for every pass and
//! handed to each evaluation explicitly, so no two passes ever share one.

pub mod browser;
pub mod timer;
pub mod utilities;

use std::sync::Arc;

use minijinja::value::Value as JinjaValue;
use minijinja::{Error as JinjaError, ErrorKind as JinjaErrorKind, State};
use serde_json::Value;

use self::browser::{Canvas, Document, Element, Event, EventInit, Window};
use self::timer::{ClearTimeout, SetTimeout, SyncTimer};

/// A utility library pinned into every environment and the expression
/// functions it contributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibraryBinding {
    pub name: &'static str,
    pub concern: &'static str,
    pub functions: &'static [&'static str],
}

pub const LIBRARIES: &[LibraryBinding] = &[
    LibraryBinding {
        name: "utils",
        concern: "object and collection utilities",
        functions: &["get", "has"],
    },
    LibraryBinding {
        name: "moment",
        concern: "date and time handling",
        functions: &["date_format", "date_valid"],
    },
    LibraryBinding {
        name: "nunjucks",
        concern: "templating",
        functions: &["render"],
    },
    LibraryBinding {
        name: "inputmask",
        concern: "input masking",
        functions: &["mask", "mask_valid"],
    },
];

#[derive(Debug)]
pub struct Environment {
    document: Document,
    window: Window,
    timer: Arc<SyncTimer>,
}

impl Environment {
    /// Assemble a fresh environment. Pure data assembly; cannot fail.
    pub fn build() -> Self {
        Self {
            document: Document::inert(),
            window: Window::inert(),
            timer: Arc::default(),
        }
    }

    pub fn libraries(&self) -> &'static [LibraryBinding] {
        LIBRARIES
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn timer(&self) -> &SyncTimer {
        &self.timer
    }

    pub fn create_element(&self, tag: &str) -> Element {
        self.document.create_element(tag)
    }

    pub fn create_canvas(&self, width: u32, height: u32) -> Canvas {
        Canvas::new(width, height)
    }

    pub fn event(&self, kind: &str, init: EventInit) -> Event {
        Event::new(kind, init)
    }

    pub fn btoa(&self, input: &str) -> String {
        utilities::btoa(input)
    }

    /// Expression sandbox with the library functions and inert globals installed.
    ///
    /// The returned environment borrows nothing from `self`, so callers may
    /// compile expressions of any lifetime against it. Timer callbacks still
    /// count against this environment's timer.
    pub fn sandbox<'source>(&self) -> minijinja::Environment<'source> {
        let mut sandbox = minijinja::Environment::new();
        sandbox.add_global("document", JinjaValue::from_object(self.document.clone()));
        sandbox.add_global("window", JinjaValue::from_object(self.window.clone()));
        sandbox.add_global(
            "setTimeout",
            JinjaValue::from_object(SetTimeout(Arc::clone(&self.timer))),
        );
        sandbox.add_global(
            "clearTimeout",
            JinjaValue::from_object(ClearTimeout(Arc::clone(&self.timer))),
        );
        sandbox.add_function("Event", browser::jinja_event);
        sandbox.add_function("Canvas", browser::jinja_canvas);
        sandbox.add_function("get", jinja_get);
        sandbox.add_function("has", jinja_has);
        sandbox.add_function("date_format", jinja_date_format);
        sandbox.add_function("date_valid", jinja_date_valid);
        sandbox.add_function("render", jinja_render);
        sandbox.add_function("mask", jinja_mask);
        sandbox.add_function("mask_valid", jinja_mask_valid);
        sandbox.add_function("btoa", jinja_btoa);
        sandbox
    }

    /// Render a template string against `data` through the sandbox.
    pub fn render_template(&self, template: &str, data: &Value) -> Result<String, JinjaError> {
        self.sandbox().render_str(template, data)
    }
}

fn to_json(value: &JinjaValue) -> Result<Value, JinjaError> {
    serde_json::to_value(value)
        .map_err(|err| JinjaError::new(JinjaErrorKind::InvalidOperation, err.to_string()))
}

fn jinja_get(value: JinjaValue, object_path: &str) -> Result<JinjaValue, JinjaError> {
    let json = to_json(&value)?;
    Ok(utilities::get(&json, object_path)
        .map(JinjaValue::from_serialize)
        .unwrap_or(JinjaValue::UNDEFINED))
}

fn jinja_has(value: JinjaValue, object_path: &str) -> Result<bool, JinjaError> {
    Ok(utilities::has(&to_json(&value)?, object_path))
}

fn jinja_date_format(input: &str, format: &str) -> JinjaValue {
    utilities::format_date(input, format)
        .map(JinjaValue::from)
        .unwrap_or(JinjaValue::UNDEFINED)
}

fn jinja_date_valid(input: &str) -> bool {
    utilities::is_valid_date(input)
}

fn jinja_render(state: &State, template: &str, ctx: JinjaValue) -> Result<String, JinjaError> {
    state.env().render_str(template, ctx)
}

fn jinja_mask(value: &str, mask: &str) -> String {
    utilities::apply_mask(value, mask)
}

fn jinja_mask_valid(value: &str, mask: &str) -> bool {
    utilities::matches_mask(value, mask)
}

fn jinja_btoa(input: &str) -> String {
    utilities::btoa(input)
}
