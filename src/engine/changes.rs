//! Change records and their interpretation
//!
//! Change handlers carry a list of polymorphic change records. The same
//! semantic kind is spelled two ways on the wire: a legacy short tag (`prc`)
//! and a modern long tag (`PropertyChanges`). Classification goes through
//! [`ChangeTagTable`], never through ad hoc string comparisons, so both
//! dialects always land on the same [`ChangeKind`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::LazyLock;

/// Semantic kind of a change record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChangeKind {
    /// A control property (usually its value) changed
    PropertyChange,
    /// A repeater's rows were replaced wholesale
    DataRefresh,
    /// A row was inserted into a repeater
    DataRowInserted,
    /// An existing row was updated
    DataRowUpdated,
    /// A control was (re)initialized
    Initialize,
    /// A control was added to the tree
    ControlAdd,
}

impl ChangeKind {
    /// Every kind, in declaration order
    pub const ALL: [ChangeKind; 6] = [
        ChangeKind::PropertyChange,
        ChangeKind::DataRefresh,
        ChangeKind::DataRowInserted,
        ChangeKind::DataRowUpdated,
        ChangeKind::Initialize,
        ChangeKind::ControlAdd,
    ];

    /// Row-level mutations
    pub fn is_row_change(&self) -> bool {
        matches!(self, ChangeKind::DataRowInserted | ChangeKind::DataRowUpdated)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Both wire spellings of one change kind
#[derive(Debug, Clone, Copy)]
pub struct TagSpelling {
    /// Semantic kind
    pub kind: ChangeKind,
    /// Long tag used by current servers
    pub modern: &'static str,
    /// Short tag used by older servers
    pub legacy: &'static str,
}

/// Built-in legacy/modern equivalences.
pub const CHANGE_TAGS: &[TagSpelling] = &[
    TagSpelling {
        kind: ChangeKind::PropertyChange,
        modern: "PropertyChanges",
        legacy: "prc",
    },
    TagSpelling {
        kind: ChangeKind::DataRefresh,
        modern: "DataRefreshChange",
        legacy: "drch",
    },
    TagSpelling {
        kind: ChangeKind::DataRowInserted,
        modern: "DataRowInserted",
        legacy: "drich",
    },
    TagSpelling {
        kind: ChangeKind::DataRowUpdated,
        modern: "DataRowUpdated",
        legacy: "druch",
    },
    TagSpelling {
        kind: ChangeKind::Initialize,
        modern: "InitializeChange",
        legacy: "ic",
    },
    TagSpelling {
        kind: ChangeKind::ControlAdd,
        modern: "ControlAddChange",
        legacy: "cac",
    },
];

static BUILTIN_TAGS: LazyLock<ChangeTagTable> = LazyLock::new(ChangeTagTable::default);

/// Lookup table from wire tag to [`ChangeKind`]
#[derive(Debug, Clone)]
pub struct ChangeTagTable {
    by_tag: HashMap<String, ChangeKind>,
    spellings: BTreeMap<ChangeKind, Vec<String>>,
}

impl Default for ChangeTagTable {
    fn default() -> Self {
        let mut table = Self {
            by_tag: HashMap::new(),
            spellings: BTreeMap::new(),
        };
        for spelling in CHANGE_TAGS {
            // modern first: the first spelling is the one we emit
            table.insert(spelling.kind, spelling.modern);
            table.insert(spelling.kind, spelling.legacy);
        }
        table
    }
}

impl ChangeTagTable {
    /// Shared table with the built-in spellings
    pub fn builtin() -> &'static ChangeTagTable {
        &BUILTIN_TAGS
    }

    /// Register an additional spelling for a kind
    pub fn with_alias(mut self, kind: ChangeKind, tag: impl Into<String>) -> Self {
        self.insert(kind, tag);
        self
    }

    fn insert(&mut self, kind: ChangeKind, tag: impl Into<String>) {
        let tag = tag.into();
        if self.by_tag.insert(tag.clone(), kind).is_none() {
            self.spellings.entry(kind).or_default().push(tag);
        }
    }

    /// Kind denoted by a wire tag
    pub fn kind_of(&self, tag: &str) -> Option<ChangeKind> {
        self.by_tag.get(tag).copied()
    }

    /// Tag to emit when synthesizing a change of this kind
    pub fn modern_tag(&self, kind: ChangeKind) -> &str {
        self.spellings
            .get(&kind)
            .and_then(|tags| tags.first())
            .map(String::as_str)
            .unwrap_or("")
    }

    /// All known spellings of a kind
    pub fn spellings(&self, kind: ChangeKind) -> impl Iterator<Item = &str> {
        self.spellings
            .get(&kind)
            .into_iter()
            .flat_map(|tags| tags.iter().map(String::as_str))
    }

    /// Whether two tags denote the same kind
    pub fn same_kind(&self, a: &str, b: &str) -> bool {
        match (self.kind_of(a), self.kind_of(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }
}

/// Reference from a change to the control it targets.
///
/// Servers spell the path `controlPath` or `ControlPath` (and the form id
/// `formId` or `FormId`). Whichever spelling is present is kept as-is so a
/// cached change serializes back exactly as it arrived.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReference {
    /// Modern form id spelling
    #[serde(rename = "formId", default, skip_serializing_if = "Option::is_none")]
    pub form_id: Option<String>,
    /// Legacy form id spelling
    #[serde(rename = "FormId", default, skip_serializing_if = "Option::is_none")]
    pub legacy_form_id: Option<String>,
    /// Modern control path spelling
    #[serde(rename = "controlPath", default, skip_serializing_if = "Option::is_none")]
    pub control_path: Option<String>,
    /// Legacy control path spelling
    #[serde(rename = "ControlPath", default, skip_serializing_if = "Option::is_none")]
    pub legacy_control_path: Option<String>,
}

impl ControlReference {
    /// Reference using the modern spellings
    pub fn new(form_id: impl Into<String>, control_path: impl Into<String>) -> Self {
        Self {
            form_id: Some(form_id.into()),
            control_path: Some(control_path.into()),
            ..Self::default()
        }
    }

    /// Control path, whichever spelling carries it
    pub fn path(&self) -> Option<&str> {
        self.control_path
            .as_deref()
            .or(self.legacy_control_path.as_deref())
    }

    /// Form id, whichever spelling carries it
    pub fn form(&self) -> Option<&str> {
        self.form_id.as_deref().or(self.legacy_form_id.as_deref())
    }

    /// Exact match against any spelling that is present
    pub fn matches_path(&self, path: &str) -> bool {
        self.control_path.as_deref() == Some(path)
            || self.legacy_control_path.as_deref() == Some(path)
    }
}

/// A field value as the caller sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Text
    Text(String),
    /// Boolean
    Boolean(bool),
    /// Integer
    Integer(i64),
    /// Decimal, kept as a JSON number to avoid float rounding
    Decimal(Number),
    /// Structured value (options, dates with metadata, ...)
    Object(Value),
}

impl FieldValue {
    /// JSON rendering
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Boolean(b) => Value::Bool(*b),
            FieldValue::Integer(i) => Value::Number((*i).into()),
            FieldValue::Decimal(n) => Value::Number(n.clone()),
            FieldValue::Object(v) => v.clone(),
        }
    }

    /// Interpret an arbitrary JSON value
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::String(s) => FieldValue::Text(s),
            Value::Bool(b) => FieldValue::Boolean(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => FieldValue::Integer(i),
                None => FieldValue::Decimal(n),
            },
            other => FieldValue::Object(other),
        }
    }

    /// Text form sent to the server when saving the value
    pub fn as_wire_text(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Boolean(b) => b.to_string(),
            FieldValue::Integer(i) => i.to_string(),
            FieldValue::Decimal(n) => n.to_string(),
            FieldValue::Object(Value::String(s)) => s.clone(),
            FieldValue::Object(v) => v.to_string(),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

/// Mutually exclusive typed value slots plus any other changed properties.
///
/// The wire encodes "the value" as one of several typed fields. Row cells
/// use camelCase spellings of the same slots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueSlots {
    /// Text slot
    #[serde(rename = "StringValue", alias = "stringValue", default, skip_serializing_if = "Option::is_none")]
    pub string: Option<String>,
    /// Structured slot
    #[serde(rename = "ObjectValue", alias = "objectValue", default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    /// Decimal slot
    #[serde(rename = "DecimalValue", alias = "decimalValue", default, skip_serializing_if = "Option::is_none")]
    pub decimal: Option<Number>,
    /// Integer slot
    #[serde(rename = "IntegerValue", alias = "integerValue", default, skip_serializing_if = "Option::is_none")]
    pub integer: Option<i64>,
    /// Boolean slot
    #[serde(rename = "BooleanValue", alias = "booleanValue", default, skip_serializing_if = "Option::is_none")]
    pub boolean: Option<bool>,
    /// Other properties (Caption, Enabled, Editable, ...)
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl ValueSlots {
    /// Slots holding a single value
    pub fn with_value(value: FieldValue) -> Self {
        let mut slots = Self::default();
        slots.set(value);
        slots
    }

    /// First populated slot in priority order string, object, decimal, integer, boolean
    pub fn value(&self) -> Option<FieldValue> {
        if let Some(s) = &self.string {
            return Some(FieldValue::Text(s.clone()));
        }
        if let Some(o) = &self.object {
            return Some(FieldValue::Object(o.clone()));
        }
        if let Some(d) = &self.decimal {
            return Some(FieldValue::Decimal(d.clone()));
        }
        if let Some(i) = self.integer {
            return Some(FieldValue::Integer(i));
        }
        self.boolean.map(FieldValue::Boolean)
    }

    /// Store a value in its slot and clear the others. Returns whether the
    /// visible value changed.
    pub fn set(&mut self, value: FieldValue) -> bool {
        let before = self.value();
        self.clear_value();
        match &value {
            FieldValue::Text(s) => self.string = Some(s.clone()),
            FieldValue::Object(v) => self.object = Some(v.clone()),
            FieldValue::Decimal(n) => self.decimal = Some(n.clone()),
            FieldValue::Integer(i) => self.integer = Some(*i),
            FieldValue::Boolean(b) => self.boolean = Some(*b),
        }
        before.as_ref() != Some(&value)
    }

    /// Drop every typed slot
    pub fn clear_value(&mut self) {
        self.string = None;
        self.object = None;
        self.decimal = None;
        self.integer = None;
        self.boolean = None;
    }

    /// Whether any typed slot is populated
    pub fn has_value(&self) -> bool {
        self.string.is_some()
            || self.object.is_some()
            || self.decimal.is_some()
            || self.integer.is_some()
            || self.boolean.is_some()
    }

    /// Overlay another set of slots. A value in `other` replaces ours;
    /// properties merge key by key.
    pub fn merge_from(&mut self, other: &ValueSlots) {
        if let Some(value) = other.value() {
            self.set(value);
        }
        for (key, value) in &other.properties {
            self.properties.insert(key.clone(), value.clone());
        }
    }
}

/// A single change record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Kind tag in either dialect
    #[serde(rename = "t")]
    pub tag: String,
    /// Target control
    #[serde(rename = "ControlReference", default, skip_serializing_if = "Option::is_none")]
    pub control_reference: Option<ControlReference>,
    /// Changed value/properties (property changes)
    #[serde(rename = "Changes", default, skip_serializing_if = "Option::is_none")]
    pub values: Option<ValueSlots>,
    /// Nested row changes (data refreshes)
    #[serde(rename = "RowChanges", default, skip_serializing_if = "Option::is_none")]
    pub row_changes: Option<Vec<Change>>,
    /// Everything else, including row payloads keyed by tag
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Change {
    /// Synthesize a modern-dialect property change carrying one value
    pub fn property(
        form_id: impl Into<String>,
        control_path: impl Into<String>,
        value: FieldValue,
    ) -> Self {
        let table = ChangeTagTable::builtin();
        Self {
            tag: table.modern_tag(ChangeKind::PropertyChange).to_string(),
            control_reference: Some(ControlReference::new(form_id, control_path)),
            values: Some(ValueSlots::with_value(value)),
            row_changes: None,
            extra: Map::new(),
        }
    }

    /// Synthesize a modern-dialect refresh wrapping the given row changes
    pub fn refresh(
        form_id: impl Into<String>,
        control_path: impl Into<String>,
        rows: Vec<Change>,
    ) -> Self {
        let table = ChangeTagTable::builtin();
        Self {
            tag: table.modern_tag(ChangeKind::DataRefresh).to_string(),
            control_reference: Some(ControlReference::new(form_id, control_path)),
            values: None,
            row_changes: Some(rows),
            extra: Map::new(),
        }
    }

    /// Control path of the target, whichever spelling carries it
    pub fn control_path(&self) -> Option<&str> {
        self.control_reference.as_ref().and_then(ControlReference::path)
    }

    /// Exact path match against any present spelling
    pub fn targets(&self, path: &str) -> bool {
        self.control_reference
            .as_ref()
            .is_some_and(|reference| reference.matches_path(path))
    }
}

/// Classify a change with the built-in tag table
pub fn classify(change: &Change) -> Option<ChangeKind> {
    classify_with(ChangeTagTable::builtin(), change)
}

/// Classify a change with a caller-supplied tag table
pub fn classify_with(table: &ChangeTagTable, change: &Change) -> Option<ChangeKind> {
    table.kind_of(&change.tag)
}

/// Read the value a change carries, if any
pub fn extract_value(change: &Change) -> Option<FieldValue> {
    change.values.as_ref().and_then(ValueSlots::value)
}

/// One row of a repeater as carried by a row change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataRow {
    /// Position the server reported, if any
    pub index: Option<u64>,
    /// Opaque server row identifier
    pub bookmark: Option<String>,
    /// Raw cells keyed by column name
    pub cells: Map<String, Value>,
}

impl DataRow {
    /// Typed value of one cell
    pub fn cell_value(&self, name: &str) -> Option<FieldValue> {
        self.cells.get(name).map(cell_value)
    }

    /// All cells flattened to plain JSON values
    pub fn flat_cells(&self) -> BTreeMap<String, Value> {
        self.cells
            .iter()
            .map(|(name, raw)| (name.clone(), cell_value(raw).to_json()))
            .collect()
    }
}

/// Flatten one cell: scalars pass through, value-slot objects collapse to
/// their populated slot, anything else stays structured.
pub fn cell_value(raw: &Value) -> FieldValue {
    if let Value::Object(map) = raw {
        if let Ok(slots) = serde_json::from_value::<ValueSlots>(Value::Object(map.clone())) {
            if let Some(value) = slots.value() {
                return value;
            }
        }
        return FieldValue::Object(raw.clone());
    }
    FieldValue::from_json(raw.clone())
}

/// Rows carried by a change: the row itself for row changes, every nested
/// row for refreshes, nothing otherwise.
pub fn rows(change: &Change) -> Vec<DataRow> {
    rows_with(ChangeTagTable::builtin(), change)
}

/// [`rows`] with a caller-supplied tag table
pub fn rows_with(table: &ChangeTagTable, change: &Change) -> Vec<DataRow> {
    match classify_with(table, change) {
        Some(ChangeKind::DataRefresh) => change
            .row_changes
            .iter()
            .flatten()
            .filter_map(|row| row_payload(table, row))
            .collect(),
        Some(kind) if kind.is_row_change() => row_payload(table, change).into_iter().collect(),
        _ => Vec::new(),
    }
}

/// Decode the payload of a single row change.
///
/// The payload sits under the change's own tag, or under another spelling of
/// the same kind, either as `[index, row]` or as a bare row object.
pub fn row_payload(table: &ChangeTagTable, change: &Change) -> Option<DataRow> {
    let kind = classify_with(table, change)?;
    if !kind.is_row_change() {
        return None;
    }

    let payload = change
        .extra
        .get(&change.tag)
        .or_else(|| table.spellings(kind).find_map(|tag| change.extra.get(tag)))?;

    let (index, row) = match payload {
        Value::Array(items) => {
            let index = items.first().and_then(Value::as_u64);
            let row = items.get(1).or_else(|| items.first())?;
            (index, row)
        }
        other => (None, other),
    };

    let row = row.as_object()?;
    let bookmark = row
        .get("bookmark")
        .or_else(|| row.get("Bookmark"))
        .and_then(Value::as_str)
        .map(String::from);
    let cells = row
        .get("cells")
        .or_else(|| row.get("Cells"))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    Some(DataRow {
        index,
        bookmark,
        cells,
    })
}
