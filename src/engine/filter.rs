//! Column filters and the per-page filter state cache
//!
//! Applying one filter on the server takes two round trips (register the
//! filter line, then set its value) followed by an asynchronous data refresh.
//! The cache remembers which filters are believed active per
//! (session, page) so an identical request costs nothing, and so a read that
//! asks for no filters can detect that the server is still filtering.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Filter operators accepted from callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOperator {
    /// Equal
    #[serde(rename = "=")]
    Eq,
    /// Not equal
    #[serde(rename = "!=")]
    NotEq,
    /// Case-insensitive substring
    #[serde(rename = "contains")]
    Contains,
    /// Case-insensitive prefix
    #[serde(rename = "startsWith")]
    StartsWith,
    /// Greater or equal
    #[serde(rename = ">=")]
    Ge,
    /// Less or equal
    #[serde(rename = "<=")]
    Le,
    /// Greater
    #[serde(rename = ">")]
    Gt,
    /// Less
    #[serde(rename = "<")]
    Lt,
    /// Inclusive range
    #[serde(rename = "between")]
    Between,
    /// Inclusive range (alias of between)
    #[serde(rename = "range")]
    Range,
}

impl FilterOperator {
    /// Parse the caller spelling
    pub fn parse(text: &str) -> Option<Self> {
        Some(match text.trim() {
            "=" | "==" | "eq" => FilterOperator::Eq,
            "!=" | "<>" | "ne" => FilterOperator::NotEq,
            "contains" => FilterOperator::Contains,
            "startsWith" => FilterOperator::StartsWith,
            ">=" => FilterOperator::Ge,
            "<=" => FilterOperator::Le,
            ">" => FilterOperator::Gt,
            "<" => FilterOperator::Lt,
            "between" => FilterOperator::Between,
            "range" => FilterOperator::Range,
            _ => return None,
        })
    }

    /// Caller spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "=",
            FilterOperator::NotEq => "!=",
            FilterOperator::Contains => "contains",
            FilterOperator::StartsWith => "startsWith",
            FilterOperator::Ge => ">=",
            FilterOperator::Le => "<=",
            FilterOperator::Gt => ">",
            FilterOperator::Lt => "<",
            FilterOperator::Between => "between",
            FilterOperator::Range => "range",
        }
    }

    fn is_range(&self) -> bool {
        matches!(self, FilterOperator::Between | FilterOperator::Range)
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One filter as believed active on the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCondition {
    /// Operator
    pub operator: FilterOperator,
    /// Operand; ranges are normalized to `low..high`
    pub value: String,
}

impl FilterCondition {
    /// Build a condition
    pub fn new(operator: FilterOperator, value: impl Into<String>) -> Self {
        Self {
            operator,
            value: value.into(),
        }
    }

    /// Equality condition
    pub fn equals(value: impl Into<String>) -> Self {
        Self::new(FilterOperator::Eq, value)
    }

    fn range_bounds(&self) -> (&str, &str) {
        match self.value.split_once("..") {
            Some((low, high)) => (low.trim(), high.trim()),
            None => (self.value.trim(), self.value.trim()),
        }
    }

    /// Filter expression in the remote system's syntax
    pub fn expression(&self) -> String {
        let v = &self.value;
        match self.operator {
            FilterOperator::Eq => quote_if_needed(v),
            FilterOperator::NotEq => format!("<>{}", quote_if_needed(v)),
            FilterOperator::Contains => format!("@*{v}*"),
            FilterOperator::StartsWith => format!("@{v}*"),
            FilterOperator::Ge => format!(">={v}"),
            FilterOperator::Le => format!("<={v}"),
            FilterOperator::Gt => format!(">{v}"),
            FilterOperator::Lt => format!("<{v}"),
            FilterOperator::Between | FilterOperator::Range => {
                let (low, high) = self.range_bounds();
                format!("{low}..{high}")
            }
        }
    }

    /// Evaluate the condition against a flattened cell value
    pub fn matches(&self, cell: &Value) -> bool {
        let text = cell_text(cell);
        match self.operator {
            FilterOperator::Eq => compare(&text, &self.value) == Ordering::Equal,
            FilterOperator::NotEq => compare(&text, &self.value) != Ordering::Equal,
            FilterOperator::Contains => text
                .to_lowercase()
                .contains(&self.value.to_lowercase()),
            FilterOperator::StartsWith => text
                .to_lowercase()
                .starts_with(&self.value.to_lowercase()),
            FilterOperator::Ge => compare(&text, &self.value) != Ordering::Less,
            FilterOperator::Le => compare(&text, &self.value) != Ordering::Greater,
            FilterOperator::Gt => compare(&text, &self.value) == Ordering::Greater,
            FilterOperator::Lt => compare(&text, &self.value) == Ordering::Less,
            FilterOperator::Between | FilterOperator::Range => {
                let (low, high) = self.range_bounds();
                (low.is_empty() || compare(&text, low) != Ordering::Less)
                    && (high.is_empty() || compare(&text, high) != Ordering::Greater)
            }
        }
    }
}

impl fmt::Display for FilterCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.operator, self.value)
    }
}

const FILTER_SPECIALS: &[char] = &['*', '|', '&', '<', '>', '=', '@', '(', ')', '\''];

fn quote_if_needed(value: &str) -> String {
    if value.contains(FILTER_SPECIALS) || value.contains("..") {
        format!("'{}'", value.replace('\'', "''"))
    } else {
        value.to_string()
    }
}

fn cell_text(cell: &Value) -> String {
    match cell {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// numeric when both sides parse as numbers, text otherwise
fn compare(left: &str, right: &str) -> Ordering {
    match (left.trim().parse::<f64>(), right.trim().parse::<f64>()) {
        (Ok(l), Ok(r)) => l.partial_cmp(&r).unwrap_or(Ordering::Equal),
        _ => left.cmp(right),
    }
}

/// Filters believed active for one page, keyed by field name
pub type FilterState = BTreeMap<String, FilterCondition>;

/// Parse the caller's filter spec: `{field: value | {operator, value}}`
pub fn parse_filters(spec: &Value) -> Result<FilterState, String> {
    let map = match spec {
        Value::Null => return Ok(FilterState::new()),
        Value::Object(map) => map,
        other => return Err(format!("filters must be an object, got {other}")),
    };

    let mut state = FilterState::new();
    for (field, raw) in map {
        let condition = match raw {
            Value::Object(inner) => {
                let operator_text = inner
                    .get("operator")
                    .and_then(Value::as_str)
                    .unwrap_or("=");
                let operator = FilterOperator::parse(operator_text).ok_or_else(|| {
                    format!("unknown filter operator '{operator_text}' for field '{field}'")
                })?;
                let value = inner
                    .get("value")
                    .ok_or_else(|| format!("filter for field '{field}' has no value"))?;
                FilterCondition::new(operator, operand(operator, value, field)?)
            }
            Value::Array(_) => {
                return Err(format!(
                    "filter for field '{field}' must be a value or {{operator, value}}"
                ));
            }
            scalar => FilterCondition::equals(scalar_text(scalar, field)?),
        };
        state.insert(field.clone(), condition);
    }
    Ok(state)
}

fn scalar_text(value: &Value, field: &str) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(if *b { "Yes" } else { "No" }.to_string()),
        other => Err(format!("unsupported filter value {other} for field '{field}'")),
    }
}

fn operand(operator: FilterOperator, value: &Value, field: &str) -> Result<String, String> {
    if operator.is_range() {
        return match value {
            Value::Array(bounds) if bounds.len() == 2 => Ok(format!(
                "{}..{}",
                scalar_text(&bounds[0], field)?,
                scalar_text(&bounds[1], field)?
            )),
            Value::String(s) if s.contains("..") => Ok(s.clone()),
            _ => Err(format!(
                "{operator} filter for field '{field}' needs [low, high] or \"low..high\""
            )),
        };
    }
    scalar_text(value, field)
}

/// Difference between the filters believed active and the filters requested
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterPlan {
    /// Filters that must be registered and set
    pub apply: Vec<(String, FilterCondition)>,
    /// Filters that must be removed
    pub remove: Vec<String>,
    /// Filters already active exactly as requested
    pub unchanged: Vec<String>,
}

impl FilterPlan {
    /// Compute the round trips needed to move from `current` to `requested`
    pub fn between(current: &FilterState, requested: &FilterState) -> Self {
        let mut plan = FilterPlan::default();
        for (field, condition) in requested {
            if current.get(field) == Some(condition) {
                plan.unchanged.push(field.clone());
            } else {
                plan.apply.push((field.clone(), condition.clone()));
            }
        }
        plan.remove = current
            .keys()
            .filter(|field| !requested.contains_key(*field))
            .cloned()
            .collect();
        plan
    }

    /// Whether no round trip is needed
    pub fn is_noop(&self) -> bool {
        self.apply.is_empty() && self.remove.is_empty()
    }
}

/// Progress of one filter through the two-step protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterPhase {
    /// Nothing sent yet
    Unset,
    /// Filter line registered, value not yet set
    Registered,
    /// Value set; cached as active
    Active,
}

/// Filter state per (session, page)
#[derive(Debug, Default)]
pub struct FilterStateCache {
    states: RwLock<HashMap<(String, String), FilterState>>,
}

impl FilterStateCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    fn key(session_id: &str, page_id: &str) -> (String, String) {
        (session_id.to_string(), page_id.to_string())
    }

    /// Snapshot of the filters believed active
    pub fn filter_state(&self, session_id: &str, page_id: &str) -> FilterState {
        self.states
            .read()
            .get(&Self::key(session_id, page_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Mutate the state in place under the write lock
    pub fn with_filter_state<R>(
        &self,
        session_id: &str,
        page_id: &str,
        f: impl FnOnce(&mut FilterState) -> R,
    ) -> R {
        let mut states = self.states.write();
        let key = Self::key(session_id, page_id);
        let state = states.entry(key.clone()).or_default();
        let result = f(state);
        if state.is_empty() {
            states.remove(&key);
        }
        result
    }

    /// Replace the state wholesale
    pub fn set_filter_state(&self, session_id: &str, page_id: &str, state: FilterState) {
        let mut states = self.states.write();
        let key = Self::key(session_id, page_id);
        if state.is_empty() {
            states.remove(&key);
        } else {
            states.insert(key, state);
        }
    }

    /// Record one filter as active
    pub fn set_filter(&self, session_id: &str, page_id: &str, field: &str, condition: FilterCondition) {
        self.with_filter_state(session_id, page_id, |state| {
            state.insert(field.to_string(), condition);
        });
    }

    /// Forget one filter
    pub fn remove_filter(&self, session_id: &str, page_id: &str, field: &str) {
        self.with_filter_state(session_id, page_id, |state| {
            state.remove(field);
        });
    }

    /// Drop the state for a page, returning what was there
    pub fn clear_filter_state_for_page(&self, session_id: &str, page_id: &str) -> FilterState {
        self.states
            .write()
            .remove(&Self::key(session_id, page_id))
            .unwrap_or_default()
    }

    /// Drop the state for every page of a session
    pub fn clear_session(&self, session_id: &str) {
        self.states
            .write()
            .retain(|(session, _), _| session != session_id);
    }

    /// Drop all filter state
    pub fn clear(&self) {
        self.states.write().clear();
    }

    /// Number of pages with active filters
    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    /// Whether no page has active filters
    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }
}
