//! Field-value cache synchronization
//!
//! A page context keeps the most recent interpreted handlers for its forms.
//! Everything that lands in that cache goes through here so that there is
//! exactly one change entry per (form, control path): values are upserted,
//! never appended twice.
//!
//! The server does not echo the value of the field the caller just wrote,
//! only recalculated neighbours. [`record_write`] therefore applies the
//! caller's own value first and merges the echo afterwards.

use super::changes::{
    Change, ChangeKind, ChangeTagTable, FieldValue, ValueSlots, classify, extract_value,
    row_payload,
};
use super::wire::{ChangeSet, Handler};
use thiserror::Error;

/// Reasons an upsert is refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Form id was empty
    #[error("cannot cache a value without a form id")]
    MissingForm,
    /// Control path was empty
    #[error("cannot cache a value for form {form_id} without a control path")]
    MissingControlPath {
        /// Form the value was meant for
        form_id: String,
    },
}

/// Counters describing one merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Existing entries updated in place
    pub updated: usize,
    /// New entries appended
    pub appended: usize,
    /// Row changes folded into an existing refresh
    pub folded_rows: usize,
}

impl MergeReport {
    /// Total number of incoming changes that touched the cache
    pub fn touched(&self) -> usize {
        self.updated + self.appended + self.folded_rows
    }

    fn absorb(&mut self, other: MergeReport) {
        self.updated += other.updated;
        self.appended += other.appended;
        self.folded_rows += other.folded_rows;
    }
}

// Run `f` on the change handler for `form_id`, appending one if missing.
fn with_change_set<R>(cached: &mut Vec<Handler>, form_id: &str, f: impl FnOnce(&mut ChangeSet) -> R) -> R {
    for handler in cached.iter_mut() {
        if let Handler::Changes(set) = handler {
            if set.form_id == form_id {
                return f(set);
            }
        }
    }
    let mut set = ChangeSet {
        form_id: form_id.to_string(),
        changes: Vec::new(),
        trailing: Vec::new(),
    };
    let out = f(&mut set);
    cached.push(Handler::Changes(set));
    out
}

/// Write `value` for (`form_id`, `control_path`) into the cache.
///
/// Overwrites the typed slot of the existing change for that path, or appends
/// a new property change. Returns whether the cached value changed.
pub fn upsert(
    cached: &mut Vec<Handler>,
    form_id: &str,
    control_path: &str,
    value: FieldValue,
) -> Result<bool, SyncError> {
    if form_id.is_empty() {
        return Err(SyncError::MissingForm);
    }
    if control_path.is_empty() {
        return Err(SyncError::MissingControlPath {
            form_id: form_id.to_string(),
        });
    }

    Ok(with_change_set(cached, form_id, |set| {
        match set.changes.iter_mut().find(|c| c.targets(control_path)) {
            Some(existing) => existing
                .values
                .get_or_insert_with(ValueSlots::default)
                .set(value),
            None => {
                set.changes
                    .push(Change::property(form_id, control_path, value));
                true
            }
        }
    }))
}

/// Current cached value for (`form_id`, `control_path`)
pub fn cached_value(cached: &[Handler], form_id: &str, control_path: &str) -> Option<FieldValue> {
    cached
        .iter()
        .filter_map(Handler::as_changes)
        .filter(|set| set.form_id == form_id)
        .flat_map(|set| set.changes.iter())
        .find(|change| change.targets(control_path))
        .and_then(extract_value)
}

/// Merge server changes for one form into the cache.
pub fn merge_changes(cached: &mut Vec<Handler>, form_id: &str, incoming: &[Change]) -> MergeReport {
    let table = ChangeTagTable::builtin();
    with_change_set(cached, form_id, |set| merge_into_set(table, set, form_id, incoming))
}

fn merge_into_set(
    table: &ChangeTagTable,
    set: &mut ChangeSet,
    form_id: &str,
    incoming: &[Change],
) -> MergeReport {
    let mut report = MergeReport::default();

    for change in incoming {
        let kind = classify(change);
        let Some(path) = change.control_path().map(String::from) else {
            if !set.changes.contains(change) {
                set.changes.push(change.clone());
                report.appended += 1;
            }
            continue;
        };

        match kind {
            Some(row_kind) if row_kind.is_row_change() => {
                let refresh = set.changes.iter_mut().find(|c| {
                    c.targets(&path) && classify(c) == Some(ChangeKind::DataRefresh)
                });
                match refresh {
                    Some(refresh) => {
                        fold_row(table, refresh, change, row_kind);
                        report.folded_rows += 1;
                    }
                    None => {
                        let wrapped = Change::refresh(form_id, path.clone(), vec![change.clone()]);
                        match set.changes.iter_mut().find(|c| c.targets(&path)) {
                            Some(existing) => {
                                overlay(existing, &wrapped);
                                report.updated += 1;
                            }
                            None => {
                                set.changes.push(wrapped);
                                report.appended += 1;
                            }
                        }
                    }
                }
            }
            _ => match set.changes.iter_mut().find(|c| c.targets(&path)) {
                Some(existing) => {
                    overlay(existing, change);
                    report.updated += 1;
                }
                None => {
                    set.changes.push(change.clone());
                    report.appended += 1;
                }
            },
        }
    }

    report
}

/// Lay `incoming` over the cached change for the same path.
///
/// Property state and row state share the entry: values merge slot by
/// slot, rows are replaced only by a change that carries rows. A property
/// or refresh entry keeps its tag unless a refresh arrives.
fn overlay(existing: &mut Change, incoming: &Change) {
    let incoming_kind = classify(incoming);
    let is_refresh = incoming_kind == Some(ChangeKind::DataRefresh);

    if let Some(values) = &incoming.values {
        existing
            .values
            .get_or_insert_with(ValueSlots::default)
            .merge_from(values);
    }
    if is_refresh {
        existing.row_changes = incoming.row_changes.clone();
    } else if let Some(rows) = &incoming.row_changes {
        existing.row_changes = Some(rows.clone());
    }
    for (key, value) in &incoming.extra {
        existing.extra.insert(key.clone(), value.clone());
    }

    let existing_kind = classify(existing);
    let takes_tag = is_refresh
        || (incoming_kind != existing_kind
            && !matches!(
                existing_kind,
                Some(ChangeKind::PropertyChange | ChangeKind::DataRefresh)
            ));
    if takes_tag {
        existing.tag = incoming.tag.clone();
    }
}

fn fold_row(table: &ChangeTagTable, refresh: &mut Change, row_change: &Change, kind: ChangeKind) {
    let incoming = row_payload(table, row_change);
    let rows = refresh.row_changes.get_or_insert_with(Vec::new);

    let matching = incoming.as_ref().and_then(|row| {
        rows.iter().position(|existing| {
            let Some(existing_row) = row_payload(table, existing) else {
                return false;
            };
            match (&row.bookmark, &existing_row.bookmark) {
                (Some(a), Some(b)) => a == b,
                (None, _) if kind == ChangeKind::DataRowUpdated => {
                    row.index.is_some() && row.index == existing_row.index
                }
                _ => false,
            }
        })
    });

    match matching {
        Some(position) => rows[position] = row_change.clone(),
        None => {
            let at = incoming
                .and_then(|row| row.index)
                .filter(|_| kind == ChangeKind::DataRowInserted)
                .and_then(|index| usize::try_from(index).ok())
                .map(|index| index.min(rows.len()))
                .unwrap_or(rows.len());
            rows.insert(at, row_change.clone());
        }
    }
}

/// Merge every change handler of a batch into the cache
pub fn apply_handlers(cached: &mut Vec<Handler>, handlers: &[Handler]) -> MergeReport {
    let mut report = MergeReport::default();
    for set in handlers.iter().filter_map(Handler::as_changes) {
        report.absorb(merge_changes(cached, &set.form_id, &set.changes));
    }
    report
}

/// Build a fresh cache from an initial handler batch
pub fn build_cache(handlers: &[Handler]) -> Vec<Handler> {
    let mut cached = Vec::new();
    apply_handlers(&mut cached, handlers);
    cached
}

/// Outcome of recording a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSync {
    /// Whether the caller's own value changed the cache
    pub own_value_changed: bool,
    /// Whether caching the caller's value was refused
    pub own_value_failed: bool,
    /// Echoed changes merged afterwards
    pub echo: MergeReport,
}

/// Apply a successful write: the caller's value first, then the echo.
pub fn record_write(
    cached: &mut Vec<Handler>,
    form_id: &str,
    control_path: &str,
    value: FieldValue,
    echo: &[Handler],
) -> WriteSync {
    let (own_value_changed, own_value_failed) = match upsert(cached, form_id, control_path, value)
    {
        Ok(changed) => (changed, false),
        Err(err) => {
            tracing::warn!(
                form_id = %form_id,
                control_path = %control_path,
                error = %err,
                "could not cache written value; serving best-available cache"
            );
            (false, true)
        }
    };
    let echo = apply_handlers(cached, echo);
    WriteSync {
        own_value_changed,
        own_value_failed,
        echo,
    }
}
