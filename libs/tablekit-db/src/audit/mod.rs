//! Field-level diffs between record snapshots and the audit records built from them.

mod message;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::model::ModelDef;
use crate::value::{Record, is_truthy, key_string};

pub use message::render_messages;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    Add,
    Edit,
    Remove,
}

/// One changed field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub kind: DiffKind,
    pub before: JsonValue,
    pub after: JsonValue,
}

/// Compare two snapshots of the same row.
///
/// Fields are visited in key order. Missing fields count as `null`; unchanged
/// fields are omitted. Truthiness decides the kind: truthy on one side only is
/// an add or a remove, and any other change (including between two falsy
/// values such as `0` and `null`) is an edit.
#[must_use]
pub fn diff(before: &Record, after: &Record) -> Vec<FieldDiff> {
    let fields = before
        .keys()
        .chain(after.keys().filter(|k| !before.contains_key(*k)));

    let mut out = Vec::new();
    for field in fields {
        let b = before.get(field).unwrap_or(&JsonValue::Null);
        let a = after.get(field).unwrap_or(&JsonValue::Null);
        if a == b {
            continue;
        }
        let kind = match (is_truthy(b), is_truthy(a)) {
            (true, false) => DiffKind::Remove,
            (false, true) => DiffKind::Add,
            (true, true) | (false, false) => DiffKind::Edit,
        };
        out.push(FieldDiff {
            field: field.clone(),
            kind,
            before: b.clone(),
            after: a.clone(),
        });
    }
    out
}

/// [`diff`] with fields in the model's column order; undeclared fields follow
/// in key order.
#[must_use]
pub fn diff_columns(model: &ModelDef, before: &Record, after: &Record) -> Vec<FieldDiff> {
    let mut out = diff(before, after);
    out.sort_by_key(|d| model.column_position(&d.field).unwrap_or(usize::MAX));
    out
}

/// Before/after snapshots of a mutation with one diff list per affected row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffReport {
    pub before: Vec<Record>,
    pub after: Vec<Record>,
    pub diffs: Vec<Vec<FieldDiff>>,
}

impl DiffReport {
    /// Pair snapshots by the model's primary key. Rows missing on one side diff
    /// against an empty record.
    #[must_use]
    pub fn build(before: Vec<Record>, after: Vec<Record>, model: &ModelDef) -> Self {
        let pk = model.primary_key();
        let empty = Record::new();
        let mut diffs = Vec::with_capacity(before.len().max(after.len()));
        for b in &before {
            let key = key_string(b, pk);
            let a = after
                .iter()
                .find(|a| key_string(a, pk) == key)
                .unwrap_or(&empty);
            diffs.push(diff_columns(model, b, a));
        }
        for a in &after {
            let key = key_string(a, pk);
            if !before
                .iter()
                .any(|b| key_string(b, pk) == key)
            {
                diffs.push(diff_columns(model, &empty, a));
            }
        }
        Self {
            before,
            after,
            diffs,
        }
    }

    /// The row each entry of `diffs` belongs to: the `before` row, or the
    /// `after` row for rows that only exist afterwards.
    #[must_use]
    pub fn rows(&self, pk: &[String]) -> Vec<&Record> {
        let mut rows: Vec<&Record> = self.before.iter().collect();
        rows.extend(self.after.iter().filter(|a| {
            let key = key_string(a, pk);
            !self.before.iter().any(|b| key_string(b, pk) == key)
        }));
        rows
    }

    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        self.diffs.iter().all(Vec::is_empty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditKind {
    Add,
    Edit,
    Remove,
    Increase,
    Decrease,
    Set,
    Move,
}

/// One audited mutation, handed to an external sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub kind: AuditKind,
    /// Service method that produced the record (`"edit"`, `"move_up"`, ...).
    pub method: String,
    pub model: String,
    pub before: Vec<Record>,
    pub after: Vec<Record>,
    pub diffs: Vec<Vec<FieldDiff>>,
    pub messages: Vec<String>,
}
