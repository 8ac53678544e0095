//! Control-tree parsing
//!
//! A form arrives as a recursive tree of controls. [`walk_controls`] visits it
//! depth-first in a fixed order and computes each control's structural
//! address, which is exactly the control path the server expects when that
//! control is targeted later. The address of the root is `<prefix>:`, its
//! i-th child is `<prefix>:c[i]` and deeper levels append `/c[j]`.
//!
//! Repeater children are per-row templates, not page fields, so the walk does
//! not descend into them. A repeater's fields come from its `Columns`.

use super::changes::{FieldValue, ValueSlots};
use serde::Serialize;
use serde_json::{Map, Value};

/// Default root prefix for control paths
pub const DEFAULT_PATH_PREFIX: &str = "server";

/// Data type of a field control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    /// Free text
    Text,
    /// Decimal number
    Decimal,
    /// Integer number
    Integer,
    /// Yes/no
    Boolean,
    /// Enumerated option
    Option,
    /// Date and/or time
    DateTime,
    /// Percentage
    Percent,
}

/// Kind of a control node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlKind {
    /// Editable or display field
    Field(FieldType),
    /// Repeater (list / subform grid)
    Repeater,
    /// Action (button, menu item)
    Action,
    /// Grouping container
    Container,
    /// Unrecognized; walked like a container
    Other,
}

/// Control type discriminators (`t`) and the kind they denote.
pub const CONTROL_KINDS: &[(&str, ControlKind)] = &[
    ("sc", ControlKind::Field(FieldType::Text)),
    ("dc", ControlKind::Field(FieldType::Decimal)),
    ("i32c", ControlKind::Field(FieldType::Integer)),
    ("bc", ControlKind::Field(FieldType::Boolean)),
    ("sec", ControlKind::Field(FieldType::Option)),
    ("dtc", ControlKind::Field(FieldType::DateTime)),
    ("pc", ControlKind::Field(FieldType::Percent)),
    ("rc", ControlKind::Repeater),
    ("lrc", ControlKind::Repeater),
    ("ac", ControlKind::Action),
    ("arc", ControlKind::Action),
    ("fc", ControlKind::Container),
    ("lf", ControlKind::Container),
    ("gc", ControlKind::Container),
    ("stackc", ControlKind::Container),
    ("ssc", ControlKind::Container),
];

/// Kind denoted by a `t` discriminator
pub fn control_kind(tag: &str) -> ControlKind {
    CONTROL_KINDS
        .iter()
        .find(|(t, _)| *t == tag)
        .map(|(_, kind)| *kind)
        .unwrap_or(ControlKind::Other)
}

fn kind_of(node: &Value) -> ControlKind {
    node.get("t")
        .and_then(Value::as_str)
        .map(control_kind)
        .unwrap_or(ControlKind::Other)
}

/// One visited control and its address
#[derive(Debug, Clone)]
pub struct WalkedControl<'a> {
    /// The control node
    pub control: &'a Value,
    /// Structural control path
    pub address: String,
    /// Discriminated kind
    pub kind: ControlKind,
    /// Depth below the root (root is 0)
    pub depth: usize,
}

/// Walk with the default prefix
pub fn walk_controls(root: &Value) -> Vec<WalkedControl<'_>> {
    walk_controls_with(root, DEFAULT_PATH_PREFIX)
}

/// Depth-first pre-order walk. Non-object roots yield nothing.
pub fn walk_controls_with<'a>(root: &'a Value, prefix: &str) -> Vec<WalkedControl<'a>> {
    let mut out = Vec::new();
    if !root.is_object() {
        return out;
    }

    let mut stack = vec![(root, format!("{prefix}:"), 0usize)];
    while let Some((node, address, depth)) = stack.pop() {
        let kind = kind_of(node);

        // push in reverse so children come off the stack in order
        if kind != ControlKind::Repeater {
            if let Some(children) = node.get("Children").and_then(Value::as_array) {
                for (index, child) in children.iter().enumerate().rev() {
                    if child.is_object() {
                        stack.push((child, child_path(&address, "c", index), depth + 1));
                    }
                }
            }
        }

        out.push(WalkedControl {
            control: node,
            address,
            kind,
            depth,
        });
    }
    out
}

/// Address of the `index`-th member of `segment` under `parent`
pub fn child_path(parent: &str, segment: &str, index: usize) -> String {
    if parent.ends_with(':') {
        format!("{parent}{segment}[{index}]")
    } else {
        format!("{parent}/{segment}[{index}]")
    }
}

/// Outcome of inspecting a tree, separate from the (possibly empty) walk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "camelCase")]
pub enum TreeStatus {
    /// The tree is well-formed
    Parsed,
    /// No tree was available
    Missing,
    /// A tree was present but not usable
    Malformed(String),
}

/// Tell "no fields" apart from "parse failure"
pub fn diagnose(root: Option<&Value>) -> TreeStatus {
    let Some(root) = root else {
        return TreeStatus::Missing;
    };
    match root {
        Value::Null => TreeStatus::Missing,
        Value::Object(map) => match map.get("Children") {
            None | Some(Value::Array(_)) | Some(Value::Null) => TreeStatus::Parsed,
            Some(other) => TreeStatus::Malformed(format!(
                "Children must be an array, found {}",
                json_type(other)
            )),
        },
        other => TreeStatus::Malformed(format!("root is {}, not an object", json_type(other))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Metadata for a page-level field
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMeta {
    /// Control path
    pub path: String,
    /// Design-time name
    pub name: Option<String>,
    /// Display caption
    pub caption: Option<String>,
    /// Data type
    pub field_type: FieldType,
    /// Whether the control is enabled
    pub enabled: bool,
    /// Whether the control is visible
    pub visible: bool,
    /// Whether the control rejects edits
    pub readonly: bool,
    /// Option captions for enumerated fields
    pub options: Vec<String>,
    /// Value delivered with the tree
    pub value: Option<FieldValue>,
}

impl FieldMeta {
    /// Caller-facing label: caption, else name, else path
    pub fn label(&self) -> &str {
        self.caption
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or(&self.path)
    }

    /// Whether `ident` names this field by path, caption or name
    pub fn answers_to(&self, ident: &str) -> bool {
        self.path == ident || text_matches(&self.caption, ident) || text_matches(&self.name, ident)
    }
}

/// Metadata for one repeater column
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMeta {
    /// Column address (`<repeater>/co[k]`)
    pub path: String,
    /// Design-time name
    pub name: Option<String>,
    /// Display caption
    pub caption: Option<String>,
    /// Composite table/field id used by the filter protocol
    pub column_id: Option<String>,
    /// Data type
    pub field_type: FieldType,
    /// Whether the column is visible
    pub visible: bool,
    /// Whether the column rejects edits
    pub readonly: bool,
}

impl ColumnMeta {
    /// Caller-facing label: caption, else name, else path
    pub fn label(&self) -> &str {
        self.caption
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or(&self.path)
    }

    /// Whether `ident` names this column by path, caption or name
    pub fn answers_to(&self, ident: &str) -> bool {
        self.path == ident || text_matches(&self.caption, ident) || text_matches(&self.name, ident)
    }
}

/// Metadata for a repeater
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeaterMeta {
    /// Control path
    pub path: String,
    /// Design-time name
    pub name: Option<String>,
    /// Display caption
    pub caption: Option<String>,
    /// Column metadata
    pub columns: Vec<ColumnMeta>,
}

impl RepeaterMeta {
    /// Column answering to `ident`
    pub fn column(&self, ident: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|column| column.answers_to(ident))
    }
}

/// Metadata for an action
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionMeta {
    /// Control path
    pub path: String,
    /// Design-time name
    pub name: Option<String>,
    /// Display caption
    pub caption: Option<String>,
    /// Whether the action can be invoked
    pub enabled: bool,
    /// Numeric system action code
    pub system_action: Option<u32>,
}

impl ActionMeta {
    /// Whether `ident` names this action by path, caption or name
    pub fn answers_to(&self, ident: &str) -> bool {
        self.path == ident || text_matches(&self.caption, ident) || text_matches(&self.name, ident)
    }
}

fn text_matches(candidate: &Option<String>, ident: &str) -> bool {
    candidate.as_deref().is_some_and(|text| {
        text.eq_ignore_ascii_case(ident) || strip_accelerator(text).eq_ignore_ascii_case(ident)
    })
}

// captions mark keyboard accelerators with '&'
fn strip_accelerator(caption: &str) -> String {
    caption.replace('&', "")
}

fn str_prop(node: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| node.get(*key).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn bool_prop(node: &Value, key: &str, default: bool) -> bool {
    node.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn is_readonly(node: &Value) -> bool {
    !bool_prop(node, "Editable", true) || bool_prop(node, "ReadOnly", false)
}

fn options(node: &Value) -> Vec<String> {
    node.get("Options")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(_) => str_prop(item, &["Caption", "Name", "Value"]),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn initial_value(node: &Value) -> Option<FieldValue> {
    const SLOT_KEYS: [&str; 5] = [
        "StringValue",
        "ObjectValue",
        "DecimalValue",
        "IntegerValue",
        "BooleanValue",
    ];
    let map = node.as_object()?;
    let slots: Map<String, Value> = SLOT_KEYS
        .iter()
        .filter_map(|key| {
            map.get(*key)
                .filter(|v| !v.is_null())
                .map(|v| (key.to_string(), v.clone()))
        })
        .collect();
    if slots.is_empty() {
        return None;
    }
    serde_json::from_value::<ValueSlots>(Value::Object(slots))
        .ok()
        .and_then(|slots| slots.value())
}

fn field_meta(walked: &WalkedControl<'_>, field_type: FieldType) -> FieldMeta {
    let node = walked.control;
    FieldMeta {
        path: walked.address.clone(),
        name: str_prop(node, &["DesignName", "Name"]),
        caption: str_prop(node, &["Caption"]),
        field_type,
        enabled: bool_prop(node, "Enabled", true),
        visible: bool_prop(node, "Visible", true),
        readonly: is_readonly(node),
        options: options(node),
        value: initial_value(node),
    }
}

fn column_meta(repeater_path: &str, index: usize, column: &Value) -> ColumnMeta {
    let field_type = match kind_of(column) {
        ControlKind::Field(field_type) => field_type,
        _ => FieldType::Text,
    };
    let column_id = column
        .get("ColumnBinder")
        .and_then(|binder| binder.get("Name"))
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| str_prop(column, &["ColumnId", "TableFieldId"]));
    ColumnMeta {
        path: child_path(repeater_path, "co", index),
        name: str_prop(column, &["DesignName", "Name"]),
        caption: str_prop(column, &["Caption"]),
        column_id,
        field_type,
        visible: bool_prop(column, "Visible", true),
        readonly: is_readonly(column),
    }
}

fn repeater_meta(walked: &WalkedControl<'_>) -> RepeaterMeta {
    let node = walked.control;
    let columns = node
        .get("Columns")
        .and_then(Value::as_array)
        .map(|columns| {
            columns
                .iter()
                .enumerate()
                .filter(|(_, column)| column.is_object())
                .map(|(index, column)| column_meta(&walked.address, index, column))
                .collect()
        })
        .unwrap_or_default();
    RepeaterMeta {
        path: walked.address.clone(),
        name: str_prop(node, &["DesignName", "Name"]),
        caption: str_prop(node, &["Caption"]),
        columns,
    }
}

fn action_meta(walked: &WalkedControl<'_>) -> ActionMeta {
    let node = walked.control;
    ActionMeta {
        path: walked.address.clone(),
        name: str_prop(node, &["DesignName", "Name"]),
        caption: str_prop(node, &["Caption"]),
        enabled: bool_prop(node, "Enabled", true),
        system_action: node
            .get("SystemAction")
            .and_then(Value::as_u64)
            .and_then(|code| u32::try_from(code).ok()),
    }
}

/// Page-level fields
pub fn extract_fields(walked: &[WalkedControl<'_>]) -> Vec<FieldMeta> {
    walked
        .iter()
        .filter_map(|w| match w.kind {
            ControlKind::Field(field_type) => Some(field_meta(w, field_type)),
            _ => None,
        })
        .collect()
}

/// Repeaters with their columns
pub fn extract_repeaters(walked: &[WalkedControl<'_>]) -> Vec<RepeaterMeta> {
    walked
        .iter()
        .filter(|w| w.kind == ControlKind::Repeater)
        .map(repeater_meta)
        .collect()
}

/// Actions
pub fn extract_actions(walked: &[WalkedControl<'_>]) -> Vec<ActionMeta> {
    walked
        .iter()
        .filter(|w| w.kind == ControlKind::Action)
        .map(action_meta)
        .collect()
}

/// Everything a caller needs to know about a form
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeSummary {
    /// Page-level fields
    pub fields: Vec<FieldMeta>,
    /// Repeaters
    pub repeaters: Vec<RepeaterMeta>,
    /// Actions
    pub actions: Vec<ActionMeta>,
}

impl TreeSummary {
    /// Walk a tree once and extract all metadata
    pub fn from_tree(root: &Value, prefix: &str) -> Self {
        let walked = walk_controls_with(root, prefix);
        Self {
            fields: extract_fields(&walked),
            repeaters: extract_repeaters(&walked),
            actions: extract_actions(&walked),
        }
    }

    /// Field answering to `ident`
    pub fn field(&self, ident: &str) -> Option<&FieldMeta> {
        self.fields.iter().find(|field| field.answers_to(ident))
    }

    /// Action answering to `ident`
    pub fn action(&self, ident: &str) -> Option<&ActionMeta> {
        self.actions.iter().find(|action| action.answers_to(ident))
    }

    /// Primary repeater (the first one), which list pages render as rows
    pub fn primary_repeater(&self) -> Option<&RepeaterMeta> {
        self.repeaters.first()
    }

    /// Whether the form renders rows rather than a single record
    pub fn is_list(&self) -> bool {
        !self.repeaters.is_empty() && self.fields.is_empty()
    }
}

/// Identity of a shown form
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormIdentity {
    /// Server-assigned form id
    pub server_id: Option<String>,
    /// Page the form renders
    pub page_id: Option<String>,
    /// Form caption
    pub caption: Option<String>,
}

/// Read the identity properties of a form root
pub fn form_identity(root: &Value) -> FormIdentity {
    let page_id = str_prop(root, &["PageId"])
        .or_else(|| {
            root.get("PageId")
                .and_then(Value::as_u64)
                .map(|id| id.to_string())
        })
        .or_else(|| {
            str_prop(root, &["CacheKey"])
                .and_then(|key| key.split(':').next().map(String::from))
                .filter(|id| !id.is_empty())
        });
    FormIdentity {
        server_id: str_prop(root, &["ServerId", "FormId"]),
        page_id,
        caption: str_prop(root, &["Caption"]),
    }
}
