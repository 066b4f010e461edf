//! Soft-delete visibility scopes.
//!
//! A scope is a pure function of the model's audit fields and their declared
//! types. It is never persisted; every operation recomputes it.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::filter::Filter;
use crate::model::{ColumnDef, ColumnKind, ModelDef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Scope {
    /// Rows that are not soft-deleted.
    #[default]
    Default,
    /// Soft-deleted rows only.
    Deleted,
    /// Soft-deleted rows that were also updated.
    Updated,
    /// No visibility predicate.
    All,
}

impl Scope {
    /// Parse a scope name; unrecognized names fall back to [`Scope::Default`].
    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name {
            "default" | "" => Self::Default,
            "deleted" => Self::Deleted,
            "updated" => Self::Updated,
            "all" => Self::All,
            other => {
                tracing::warn!(scope = other, "unknown scope, using default");
                Self::Default
            }
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Deleted => "deleted",
            Self::Updated => "updated",
            Self::All => "all",
        }
    }
}

impl From<String> for Scope {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<&str> for Scope {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

/// The value a column holds when the marker it represents is unset.
#[must_use]
pub fn absent_value(column: &ColumnDef) -> JsonValue {
    if column.is_nullable() {
        return JsonValue::Null;
    }
    match column.kind() {
        ColumnKind::Integer | ColumnKind::Float => JsonValue::from(0),
        ColumnKind::Boolean => JsonValue::Bool(false),
        ColumnKind::String => JsonValue::String(String::new()),
        ColumnKind::Uuid | ColumnKind::DateTime | ColumnKind::Date | ColumnKind::Json => {
            JsonValue::Null
        }
    }
}

/// Predicate matching rows where the marker column is unset.
#[must_use]
pub fn absent(column: &ColumnDef) -> Filter {
    Filter::eq(column.name(), absent_value(column))
}

/// Predicate matching rows where the marker column is set.
#[must_use]
pub fn present(column: &ColumnDef) -> Filter {
    let name = column.name();
    if column.is_nullable() {
        return Filter::not_null(name);
    }
    match column.kind() {
        ColumnKind::Integer | ColumnKind::Float => Filter::gt(name, 0),
        ColumnKind::Boolean => Filter::eq(name, true),
        ColumnKind::String => Filter::ne(name, ""),
        ColumnKind::Uuid | ColumnKind::DateTime | ColumnKind::Date | ColumnKind::Json => {
            Filter::not_null(name)
        }
    }
}

/// Conjuncts a scope forces onto a model's where-clause.
#[must_use]
pub fn scope_predicates(scope: Scope, model: &ModelDef) -> Vec<Filter> {
    let audit = model.audit_fields();
    let col = |name: &Option<String>| name.as_deref().and_then(|n| model.column(n));

    let mut out = Vec::new();
    match scope {
        Scope::Default => {
            if let Some(c) = col(&audit.deleted_by) {
                out.push(Filter::is_null(c.name()));
            }
            if let Some(c) = col(&audit.deleted_at) {
                out.push(absent(c));
            }
        }
        Scope::Deleted | Scope::Updated => {
            if let Some(c) = col(&audit.deleted_at) {
                out.push(present(c));
            }
            if scope == Scope::Updated
                && let Some(c) = col(&audit.updated_at)
            {
                out.push(present(c));
            }
        }
        Scope::All => {}
    }
    out
}

/// Apply `scope` to `filter`.
///
/// Forced columns replace any top-level constraint the caller put on the same
/// column, so applying a scope twice yields the same predicate as applying it once.
#[must_use]
pub fn apply_scope(scope: Scope, filter: Filter, model: &ModelDef) -> Filter {
    let forced = scope_predicates(scope, model);
    if forced.is_empty() {
        return filter;
    }
    let forced_columns: Vec<&str> = forced
        .iter()
        .filter_map(Filter::constrained_root_column)
        .collect();

    let mut conjuncts: Vec<Filter> = filter
        .into_conjuncts()
        .into_iter()
        .filter(|f| {
            f.constrained_root_column()
                .is_none_or(|c| !forced_columns.contains(&c))
        })
        .collect();
    conjuncts.extend(forced.iter().cloned());
    Filter::And(conjuncts)
}
