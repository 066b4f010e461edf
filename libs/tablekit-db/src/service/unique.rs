//! Uniqueness pre-check.
//!
//! Runs before any write so the caller gets a labelled `DuplicateRecord`
//! instead of the database's constraint error. Only rows visible in the
//! default scope count as existing; soft-deleted rows never collide.

use sea_orm::ConnectionTrait;
use serde_json::Value as JsonValue;

use crate::error::{ServiceError, ServiceResult};
use crate::filter::Filter;
use crate::model::{ColumnDef, ModelDef};
use crate::query::LockMode;
use crate::query::render;
use crate::scope::{Scope, apply_scope};
use crate::value::{Record, display_value, key_string};

use super::key_filter;

/// Whether `values` writes any column of a unique constraint.
pub(super) fn touches_any(model: &ModelDef, values: &Record) -> bool {
    model
        .unique_constraints()
        .iter()
        .flatten()
        .any(|c| values.contains_key(c))
}

/// Reject rows colliding with each other or with stored rows.
pub(super) async fn check_insert<C: ConnectionTrait>(
    conn: &C,
    model: &ModelDef,
    rows: &[Record],
    lock: Option<LockMode>,
) -> ServiceResult<()> {
    for constraint in model.unique_constraints() {
        let mut seen: Vec<String> = Vec::new();
        for row in rows.iter().filter(|r| covers(constraint, r)) {
            let values = key_string(row, constraint);
            if seen.contains(&values) || exists(conn, model, constraint, row, None, lock).await? {
                return Err(rejected(model, constraint, row));
            }
            seen.push(values);
        }
    }
    Ok(())
}

/// Reject an update whose values would make two rows collide.
///
/// `current` are the rows about to be updated; each is checked with `values`
/// applied, excluding the updated rows themselves from the stored side.
pub(super) async fn check_update<C: ConnectionTrait>(
    conn: &C,
    model: &ModelDef,
    values: &Record,
    current: &[Record],
    lock: Option<LockMode>,
) -> ServiceResult<()> {
    let pk = model.primary_key();
    let exclude = (!pk.is_empty() && !current.is_empty()).then(|| key_filter(pk, current));
    for constraint in model.unique_constraints() {
        if !constraint.iter().any(|c| values.contains_key(c)) {
            continue;
        }
        let mut seen: Vec<String> = Vec::new();
        for row in current {
            let mut merged = row.clone();
            merged.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
            if !covers(constraint, &merged) {
                continue;
            }
            let key = key_string(&merged, constraint);
            if seen.contains(&key)
                || exists(conn, model, constraint, &merged, exclude.clone(), lock).await?
            {
                return Err(rejected(model, constraint, &merged));
            }
            seen.push(key);
        }
    }
    Ok(())
}

/// Unique columns holding `NULL` never collide.
fn covers(constraint: &[String], record: &Record) -> bool {
    constraint
        .iter()
        .all(|c| record.get(c).is_some_and(|v| !v.is_null()))
}

async fn exists<C: ConnectionTrait>(
    conn: &C,
    model: &ModelDef,
    constraint: &[String],
    record: &Record,
    exclude: Option<Filter>,
    lock: Option<LockMode>,
) -> ServiceResult<bool> {
    let mut filter = Filter::And(
        constraint
            .iter()
            .map(|c| Filter::eq(c.as_str(), record.get(c).cloned().unwrap_or(JsonValue::Null)))
            .collect(),
    );
    if let Some(exclude) = exclude {
        filter = filter.and_with(Filter::not(exclude));
    }
    let filter = apply_scope(Scope::Default, filter, model);
    let n = render::count(conn, model, render::condition(model, &filter)?, lock).await?;
    Ok(n > 0)
}

fn rejected(model: &ModelDef, constraint: &[String], record: &Record) -> ServiceError {
    let summary = summary(model, constraint, record);
    tracing::debug!(model = model.name(), %summary, "duplicate record rejected");
    ServiceError::duplicate(summary)
}

/// `Label: value, Label: value` over the constraint columns.
fn summary(model: &ModelDef, constraint: &[String], record: &Record) -> String {
    constraint
        .iter()
        .map(|name| {
            let column = model.column(name);
            let label = column.map_or(name.as_str(), ColumnDef::display_label);
            let value = record.get(name).unwrap_or(&JsonValue::Null);
            let shown = column.map_or_else(|| display_value(value), |c| c.display(value));
            format!("{label}: {shown}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}
