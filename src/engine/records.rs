//! Flattening cached handlers into caller-facing records

use super::changes::{Change, ChangeKind, classify, rows};
use super::filter::FilterState;
use super::sync::cached_value;
use super::tree::{RepeaterMeta, TreeSummary};
use super::wire::Handler;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// One flattened record: a card page yields one, a list page one per row
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Record {
    /// Server row identifier, for list rows
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bookmark: Option<String>,
    /// Values keyed by caller-facing field label
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    /// Value of a field by label, falling back to a case-insensitive match
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).or_else(|| {
            self.fields
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(field))
                .map(|(_, value)| value)
        })
    }
}

/// Flatten the cache for `form_id` into records.
///
/// A form whose primary repeater has cached rows renders one record per row;
/// page-level fields ride along on each row unless a column shares the
/// label. Repeater-only forms render rows even before any arrive. Everything
/// else is a single card.
pub fn flatten(summary: &TreeSummary, cached: &[Handler], form_id: &str) -> Vec<Record> {
    let repeater = summary.primary_repeater();
    let rows_cached = match repeater {
        Some(repeater) => cached_refresh(cached, form_id, Some(repeater)).is_some(),
        None => summary.fields.is_empty() && has_refresh(cached, form_id),
    };
    if !rows_cached && !summary.is_list() {
        return vec![card_record(summary, cached, form_id)];
    }

    let mut records = list_records(repeater, cached, form_id);
    if !summary.fields.is_empty() {
        let page = card_record(summary, cached, form_id);
        for record in &mut records {
            for (label, value) in &page.fields {
                record
                    .fields
                    .entry(label.clone())
                    .or_insert_with(|| value.clone());
            }
        }
    }
    records
}

/// Single record for a card page: tree fields overlaid with cached values
pub fn card_record(summary: &TreeSummary, cached: &[Handler], form_id: &str) -> Record {
    let mut record = Record::default();
    for field in &summary.fields {
        let value = cached_value(cached, form_id, &field.path)
            .or_else(|| field.value.clone())
            .map(|value| value.to_json())
            .unwrap_or(Value::Null);
        record.fields.insert(field.label().to_string(), value);
    }
    record
}

/// Rows of the repeater's data refresh, cells keyed by column label
pub fn list_records(repeater: Option<&RepeaterMeta>, cached: &[Handler], form_id: &str) -> Vec<Record> {
    let Some(refresh) = cached_refresh(cached, form_id, repeater) else {
        return Vec::new();
    };

    rows(refresh)
        .into_iter()
        .map(|row| Record {
            bookmark: row.bookmark.clone(),
            fields: row
                .flat_cells()
                .into_iter()
                .map(|(name, value)| (column_label(repeater, name), value))
                .collect(),
        })
        .collect()
}

fn cached_refresh<'a>(
    cached: &'a [Handler],
    form_id: &str,
    repeater: Option<&RepeaterMeta>,
) -> Option<&'a Change> {
    cached
        .iter()
        .filter_map(Handler::as_changes)
        .filter(|set| set.form_id == form_id)
        .flat_map(|set| set.changes.iter())
        .filter(|change| classify(change) == Some(ChangeKind::DataRefresh))
        .find(|change| match repeater {
            Some(repeater) => change.targets(&repeater.path),
            None => true,
        })
}

fn column_label(repeater: Option<&RepeaterMeta>, cell: String) -> String {
    repeater
        .and_then(|repeater| {
            repeater.columns.iter().find(|column| {
                column.answers_to(&cell) || column.column_id.as_deref() == Some(cell.as_str())
            })
        })
        .map(|column| column.label().to_string())
        .unwrap_or(cell)
}

fn has_refresh(cached: &[Handler], form_id: &str) -> bool {
    cached
        .iter()
        .any(|handler| handler.has_change(form_id, ChangeKind::DataRefresh))
}

/// Keep only records satisfying every condition
pub fn apply_filters(records: Vec<Record>, filters: &FilterState) -> Vec<Record> {
    if filters.is_empty() {
        return records;
    }
    records
        .into_iter()
        .filter(|record| {
            filters.iter().all(|(field, condition)| {
                record
                    .get(field)
                    .is_some_and(|value| condition.matches(value))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::filter::{FilterCondition, FilterOperator};
    use crate::engine::sync::build_cache;
    use crate::engine::wire::decode_handlers;
    use serde_json::json;

    fn list_tree() -> Value {
        json!({
            "ServerId": "F1",
            "Children": [{
                "t": "rc",
                "Name": "CustomerList",
                "Columns": [
                    { "t": "sc", "Caption": "No.", "ColumnBinder": { "Name": "Customer.No" } },
                    { "t": "sc", "Caption": "Name", "ColumnBinder": { "Name": "Customer.Name" } }
                ]
            }]
        })
    }

    fn refresh(rows: Value) -> Vec<Handler> {
        build_cache(
            &decode_handlers(json!([{
                "handlerType": "DN.LogicalClientChangeHandler",
                "parameters": ["F1", [{
                    "t": "DataRefreshChange",
                    "ControlReference": { "formId": "F1", "controlPath": "server:c[0]" },
                    "RowChanges": rows
                }]]
            }]))
            .unwrap(),
        )
    }

    #[test]
    fn list_rows_are_keyed_by_column_caption() {
        let summary = TreeSummary::from_tree(&list_tree(), "server");
        let cached = refresh(json!([
            { "t": "DataRowInserted", "DataRowInserted": [0, { "bookmark": "B1", "cells": { "Customer.No": "10000", "Customer.Name": "Adatum" } }] },
            { "t": "drich", "drich": [1, { "bookmark": "B2", "cells": { "Customer.No": "20000", "Customer.Name": "Trey" } }] }
        ]));

        let records = flatten(&summary, &cached, "F1");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].bookmark.as_deref(), Some("B1"));
        assert_eq!(records[0].get("Name"), Some(&json!("Adatum")));
        assert_eq!(records[1].get("no."), Some(&json!("20000")));
    }

    #[test]
    fn header_fields_do_not_hide_rows() {
        let mut tree = list_tree();
        tree["Children"]
            .as_array_mut()
            .unwrap()
            .push(json!({ "t": "sc", "Caption": "Search", "StringValue": "" }));
        let summary = TreeSummary::from_tree(&tree, "server");
        assert!(!summary.is_list());

        let cached = refresh(json!([
            { "t": "DataRowInserted", "DataRowInserted": [0, { "bookmark": "B1", "cells": { "Customer.No": "10000", "Customer.Name": "Adatum" } }] },
            { "t": "DataRowInserted", "DataRowInserted": [1, { "bookmark": "B2", "cells": { "Customer.No": "20000", "Customer.Name": "Trey" } }] },
            { "t": "DataRowInserted", "DataRowInserted": [2, { "bookmark": "B3", "cells": { "Customer.No": "30000", "Customer.Name": "Fabrikam" } }] }
        ]));

        let records = flatten(&summary, &cached, "F1");
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].get("Name"), Some(&json!("Fabrikam")));
        assert_eq!(records[0].get("Search"), Some(&json!("")));
    }

    #[test]
    fn header_field_without_rows_is_a_card() {
        let mut tree = list_tree();
        tree["Children"]
            .as_array_mut()
            .unwrap()
            .push(json!({ "t": "sc", "Caption": "Search" }));
        let summary = TreeSummary::from_tree(&tree, "server");

        let records = flatten(&summary, &[], "F1");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bookmark, None);
    }

    #[test]
    fn card_fields_prefer_cached_values() {
        let tree = json!({
            "ServerId": "F2",
            "Children": [
                { "t": "sc", "Caption": "Name", "StringValue": "Old" },
                { "t": "bc", "Caption": "Blocked" }
            ]
        });
        let summary = TreeSummary::from_tree(&tree, "server");
        let mut cached = Vec::new();
        crate::engine::sync::upsert(&mut cached, "F2", "server:c[0]", "Acme".into()).unwrap();

        let records = flatten(&summary, &cached, "F2");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("Name"), Some(&json!("Acme")));
        assert_eq!(records[0].get("Blocked"), Some(&Value::Null));
    }

    #[test]
    fn local_filters_narrow_rows() {
        let records = vec![
            Record {
                bookmark: None,
                fields: BTreeMap::from([("Name".to_string(), json!("Adatum"))]),
            },
            Record {
                bookmark: None,
                fields: BTreeMap::from([("Name".to_string(), json!("Trey"))]),
            },
        ];
        let filters = FilterState::from([(
            "Name".to_string(),
            FilterCondition::new(FilterOperator::StartsWith, "ad"),
        )]);
        let kept = apply_filters(records, &filters);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].get("Name"), Some(&json!("Adatum")));
    }
}
