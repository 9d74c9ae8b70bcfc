use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A form definition: an ordered tree of components plus an optional
/// form-level module expression.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct FormDefinition {
    pub title: String,
    pub components: Vec<Component>,
    /// Evaluated once per pass; a map result contributes extra bindings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Component {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<Component>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<Cell>,
    /// Table cells, row-major. Other components reuse `rows` for unrelated
    /// settings (a textarea's height), which are dropped.
    #[serde(skip_serializing_if = "Vec::is_empty", deserialize_with = "table_rows")]
    pub rows: Vec<Vec<Cell>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditional: Option<SimpleConditional>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_conditional: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calculate_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_default_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    pub validate: Validate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clear_on_hide: Option<bool>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Cell {
    pub components: Vec<Component>,
}

/// Declarative `show when <path> equals <eq>` rule.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimpleConditional {
    /// Exported forms also write `"true"`, `"false"` or `""` here.
    #[serde(deserialize_with = "lenient_bool")]
    pub show: Option<bool>,
    pub when: Option<String>,
    pub eq: Value,
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(flag) => Some(flag),
        Value::String(text) => match text.trim() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

fn table_rows<'de, D>(deserializer: D) -> Result<Vec<Vec<Cell>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Array(rows) if rows.iter().all(Value::is_array) => {
            serde_json::from_value(Value::Array(rows)).map_err(D::Error::custom)
        }
        _ => Ok(Vec::new()),
    }
}

/// Builder exports write `""` for an unset limit, and some write digits as text.
fn lenient_limit<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::Number(number) => match number.as_u64() {
            Some(limit) => usize::try_from(limit).map(Some).map_err(D::Error::custom),
            None => Err(D::Error::custom(format!(
                "length limit must be a non-negative integer, got {number}"
            ))),
        },
        Value::String(text) if text.trim().is_empty() => Ok(None),
        Value::String(text) => text
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("length limit is not a number: '{text}'"))),
        other => Err(D::Error::custom(format!(
            "length limit must be a number, got {other}"
        ))),
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Validate {
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "lenient_limit")]
    pub min_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "lenient_limit")]
    pub max_length: Option<usize>,
}

/// How a component participates in the data tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentKind {
    /// Groups children visually; adds no data key.
    Layout,
    /// Children live in an object under the component's key.
    Container,
    /// Children live in an array of row objects under the component's key.
    Grid,
    Field,
}

const LAYOUT_TYPES: &[&str] = &["panel", "fieldset", "well", "columns", "table", "tabs"];
const GRID_TYPES: &[&str] = &["datagrid", "editgrid", "datatable", "tagpad"];
const CONTAINER_TYPES: &[&str] = &["container"];
const NON_INPUT_FIELDS: &[&str] = &["content", "htmlelement", "button"];

impl Component {
    pub fn kind(&self) -> ComponentKind {
        let kind = self.kind.as_str();
        if GRID_TYPES.contains(&kind) {
            ComponentKind::Grid
        } else if CONTAINER_TYPES.contains(&kind) {
            ComponentKind::Container
        } else if LAYOUT_TYPES.contains(&kind) || (kind.is_empty() && self.has_children()) {
            ComponentKind::Layout
        } else {
            ComponentKind::Field
        }
    }

    /// True if the component owns a slot in submission data.
    pub fn holds_value(&self) -> bool {
        match self.kind() {
            ComponentKind::Layout => false,
            ComponentKind::Container | ComponentKind::Grid => true,
            ComponentKind::Field => self
                .input
                .unwrap_or_else(|| !NON_INPUT_FIELDS.contains(&self.kind.as_str())),
        }
    }

    pub fn clears_on_hide(&self) -> bool {
        self.clear_on_hide.unwrap_or(true)
    }

    /// Label for messages, falling back to the key.
    pub fn display_name(&self) -> &str {
        if self.label.trim().is_empty() {
            &self.key
        } else {
            &self.label
        }
    }

    pub fn has_children(&self) -> bool {
        self.children().next().is_some()
    }

    /// All direct children across `components`, `columns` and table `rows`.
    pub fn children(&self) -> impl Iterator<Item = &Component> {
        self.components
            .iter()
            .chain(self.columns.iter().flat_map(|cell| cell.components.iter()))
            .chain(
                self.rows
                    .iter()
                    .flatten()
                    .flat_map(|cell| cell.components.iter()),
            )
    }
}
