//! Inert stand-ins for browser globals.
//!
//! Expressions written for a live page touch `document`, `window`, elements and
//! events defensively. These types accept those calls and report nothing.
//! Each one is also a sandbox object, so the same calls work from expressions.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use minijinja::value::{Enumerator, Object, Value as JinjaValue, from_args};
use minijinja::{Error as JinjaError, ErrorKind as JinjaErrorKind, State};
use serde::Serialize;

fn none() -> JinjaValue {
    JinjaValue::from(())
}

fn unknown_method(owner: &str, method: &str) -> JinjaError {
    JinjaError::new(
        JinjaErrorKind::UnknownMethod,
        format!("{owner} has no method named {method}"),
    )
}

/// Listener registration is accepted everywhere and remembered nowhere.
fn is_listener_call(method: &str) -> bool {
    matches!(method, "addEventListener" | "removeEventListener" | "dispatchEvent")
}

#[derive(Debug, Clone, Default)]
pub struct Document {
    pub ready_state: &'static str,
    pub title: String,
}

impl Document {
    pub(crate) fn inert() -> Self {
        Self {
            ready_state: "complete",
            title: String::new(),
        }
    }

    pub fn create_element(&self, tag: &str) -> Element {
        Element::new(tag)
    }

    pub fn get_element_by_id(&self, _id: &str) -> Option<Element> {
        None
    }

    pub fn query_selector(&self, _selector: &str) -> Option<Element> {
        None
    }
}

impl Object for Document {
    fn get_value(self: &Arc<Self>, key: &JinjaValue) -> Option<JinjaValue> {
        match key.as_str()? {
            "readyState" => Some(JinjaValue::from(self.ready_state)),
            "title" => Some(JinjaValue::from(self.title.as_str())),
            _ => None,
        }
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Str(&["readyState", "title"])
    }

    fn call_method(
        self: &Arc<Self>,
        _state: &State<'_, '_>,
        method: &str,
        args: &[JinjaValue],
    ) -> Result<JinjaValue, JinjaError> {
        match method {
            "createElement" => {
                let (tag,): (&str,) = from_args(args)?;
                if tag.eq_ignore_ascii_case("canvas") {
                    Ok(JinjaValue::from_object(Canvas::default()))
                } else {
                    Ok(JinjaValue::from_object(self.create_element(tag)))
                }
            }
            "getElementById" | "querySelector" => Ok(none()),
            "querySelectorAll" | "getElementsByTagName" | "getElementsByClassName" => {
                Ok(JinjaValue::from(Vec::<JinjaValue>::new()))
            }
            method if is_listener_call(method) => Ok(none()),
            _ => Err(unknown_method("document", method)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Window {
    pub location: Location,
    pub navigator: Navigator,
    pub inner_width: u32,
    pub inner_height: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Location {
    pub href: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Navigator {
    pub user_agent: &'static str,
}

impl Window {
    pub(crate) fn inert() -> Self {
        Self {
            location: Location::default(),
            navigator: Navigator {
                user_agent: concat!("formlogic/", env!("CARGO_PKG_VERSION")),
            },
            inner_width: 0,
            inner_height: 0,
        }
    }
}

impl Object for Window {
    fn get_value(self: &Arc<Self>, key: &JinjaValue) -> Option<JinjaValue> {
        let value = match key.as_str()? {
            "location" => JinjaValue::from_serialize(&self.location),
            "navigator" => JinjaValue::from_serialize(&self.navigator),
            "innerWidth" => JinjaValue::from(self.inner_width),
            "innerHeight" => JinjaValue::from(self.inner_height),
            _ => return None,
        };
        Some(value)
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Str(&["location", "navigator", "innerWidth", "innerHeight"])
    }

    fn call_method(
        self: &Arc<Self>,
        _state: &State<'_, '_>,
        method: &str,
        _args: &[JinjaValue],
    ) -> Result<JinjaValue, JinjaError> {
        match method {
            "alert" | "scrollTo" => Ok(none()),
            method if is_listener_call(method) => Ok(none()),
            _ => Err(unknown_method("window", method)),
        }
    }
}

/// Detached element: attributes are stored, nothing is attached anywhere.
#[derive(Debug, Default)]
pub struct Element {
    pub tag: String,
    attributes: Mutex<BTreeMap<String, String>>,
}

impl Element {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attributes: Mutex::default(),
        }
    }

    pub fn set_attribute(&self, name: &str, value: &str) {
        self.attributes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), value.to_string());
    }

    pub fn get_attribute(&self, name: &str) -> Option<String> {
        self.attributes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn append_child(&self, _child: &Element) {}
}

impl Object for Element {
    fn get_value(self: &Arc<Self>, key: &JinjaValue) -> Option<JinjaValue> {
        match key.as_str()? {
            "tagName" => Some(JinjaValue::from(self.tag.to_ascii_uppercase())),
            _ => None,
        }
    }

    fn call_method(
        self: &Arc<Self>,
        _state: &State<'_, '_>,
        method: &str,
        args: &[JinjaValue],
    ) -> Result<JinjaValue, JinjaError> {
        match method {
            "setAttribute" => {
                let (name, value): (&str, JinjaValue) = from_args(args)?;
                self.set_attribute(name, &value.to_string());
                Ok(none())
            }
            "getAttribute" => {
                let (name,): (&str,) = from_args(args)?;
                Ok(self.get_attribute(name).map_or_else(none, JinjaValue::from))
            }
            // Returns the child, as the DOM does.
            "appendChild" => Ok(args.first().cloned().unwrap_or_else(none)),
            method if is_listener_call(method) => Ok(none()),
            _ => Err(unknown_method("element", method)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Object for Canvas {
    fn get_value(self: &Arc<Self>, key: &JinjaValue) -> Option<JinjaValue> {
        match key.as_str()? {
            "width" => Some(JinjaValue::from(self.width)),
            "height" => Some(JinjaValue::from(self.height)),
            "tagName" => Some(JinjaValue::from("CANVAS")),
            _ => None,
        }
    }

    fn call_method(
        self: &Arc<Self>,
        _state: &State<'_, '_>,
        method: &str,
        args: &[JinjaValue],
    ) -> Result<JinjaValue, JinjaError> {
        match method {
            // There is no drawing surface.
            "getContext" => {
                let (_kind,): (&str,) = from_args(args)?;
                Ok(none())
            }
            method if is_listener_call(method) => Ok(none()),
            _ => Err(unknown_method("canvas", method)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EventInit {
    pub bubbles: bool,
    pub cancelable: bool,
}

#[derive(Debug)]
pub struct Event {
    pub kind: String,
    pub bubbles: bool,
    pub cancelable: bool,
    default_prevented: AtomicBool,
}

impl Event {
    pub fn new(kind: &str, init: EventInit) -> Self {
        Self {
            kind: kind.to_string(),
            bubbles: init.bubbles,
            cancelable: init.cancelable,
            default_prevented: AtomicBool::new(false),
        }
    }

    /// Only cancelable events record the request.
    pub fn prevent_default(&self) {
        if self.cancelable {
            self.default_prevented.store(true, Ordering::Relaxed);
        }
    }

    pub fn default_prevented(&self) -> bool {
        self.default_prevented.load(Ordering::Relaxed)
    }
}

impl Object for Event {
    fn get_value(self: &Arc<Self>, key: &JinjaValue) -> Option<JinjaValue> {
        let value = match key.as_str()? {
            "type" => JinjaValue::from(self.kind.as_str()),
            "bubbles" => JinjaValue::from(self.bubbles),
            "cancelable" => JinjaValue::from(self.cancelable),
            "defaultPrevented" => JinjaValue::from(self.default_prevented()),
            _ => return None,
        };
        Some(value)
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Str(&["type", "bubbles", "cancelable", "defaultPrevented"])
    }

    fn call_method(
        self: &Arc<Self>,
        _state: &State<'_, '_>,
        method: &str,
        _args: &[JinjaValue],
    ) -> Result<JinjaValue, JinjaError> {
        match method {
            "preventDefault" => {
                self.prevent_default();
                Ok(none())
            }
            "stopPropagation" | "stopImmediatePropagation" => Ok(none()),
            _ => Err(unknown_method("event", method)),
        }
    }
}

/// `Event(type, init)` in the sandbox.
pub(super) fn jinja_event(kind: &str, init: Option<JinjaValue>) -> JinjaValue {
    let flag = |name: &str| {
        init.as_ref()
            .and_then(|init| init.get_attr(name).ok())
            .is_some_and(|value| value.is_true())
    };
    let init = EventInit {
        bubbles: flag("bubbles"),
        cancelable: flag("cancelable"),
    };
    JinjaValue::from_object(Event::new(kind, init))
}

/// `Canvas(width, height)` in the sandbox.
pub(super) fn jinja_canvas(width: Option<u32>, height: Option<u32>) -> JinjaValue {
    JinjaValue::from_object(Canvas::new(width.unwrap_or_default(), height.unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lookups_find_nothing() {
        let document = Document::inert();
        assert!(document.get_element_by_id("app").is_none());
        assert!(document.query_selector("#app").is_none());
        let element = document.create_element("DIV");
        element.set_attribute("class", "x");
        element.append_child(&Element::new("span"));
        assert_eq!(element.tag, "div");
        assert_eq!(element.get_attribute("class").as_deref(), Some("x"));
    }

    #[test]
    fn prevent_default_respects_cancelable() {
        let fixed = Event::new("change", EventInit::default());
        fixed.prevent_default();
        assert!(!fixed.default_prevented());

        let cancelable = Event::new(
            "submit",
            EventInit {
                bubbles: true,
                cancelable: true,
            },
        );
        cancelable.prevent_default();
        assert!(cancelable.default_prevented());
        assert!(cancelable.bubbles);
    }

    fn sandbox() -> minijinja::Environment<'static> {
        let mut env = minijinja::Environment::new();
        env.add_global("document", JinjaValue::from_object(Document::inert()));
        env.add_global("window", JinjaValue::from_object(Window::inert()));
        env.add_function("Event", jinja_event);
        env.add_function("Canvas", jinja_canvas);
        env
    }

    #[test]
    fn dom_calls_work_from_templates() {
        let env = sandbox();
        let source = "{% set el = document.createElement('DIV') %}\
                      {{ el.setAttribute('id', 'app') is none }}|{{ el.getAttribute('id') }}|\
                      {{ el.tagName }}|{{ document.getElementById('app') is none }}|\
                      {{ document.querySelectorAll('p') | length }}|\
                      {{ document.createElement('canvas').getContext('2d') is none }}|\
                      {{ window.addEventListener('resize', none) is none }}|{{ Canvas(3, 4).height }}";
        let rendered = env.render_str(source, ()).expect("render");
        assert_eq!(rendered, "true|app|DIV|true|0|true|true|4");
    }

    #[test]
    fn events_record_prevent_default_across_calls() {
        let env = sandbox();
        let source = "{% set ev = Event('submit', {'cancelable': true}) %}\
                      {% set plain = Event('change') %}\
                      {{ ev.preventDefault() is none }}{{ plain.preventDefault() is none }}|\
                      {{ ev.type }}|{{ ev.defaultPrevented }}|{{ plain.defaultPrevented }}";
        let rendered = env.render_str(source, ()).expect("render");
        assert_eq!(rendered, "truetrue|submit|true|false");

        let err = env.render_str("{{ Event('x').explode() }}", ()).unwrap_err();
        assert_eq!(err.kind(), JinjaErrorKind::UnknownMethod);
    }
}
