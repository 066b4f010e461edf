//! Query compiler: turns a request plus [`QueryOptions`] into an executable plan.

mod include;
pub(crate) mod nested;
mod pagination;
mod plan;
pub(crate) mod render;
mod search;
mod sort;

use sea_orm::sea_query::LockType;
use serde_json::Value as JsonValue;

use crate::config::ServiceConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::filter::Filter;
use crate::model::{PathCache, Schema};
use crate::scope::Scope;
use crate::value::Record;

pub(crate) use include::CompiledInclude;
pub use include::{IncludePresets, IncludeSpec};
pub use pagination::Page;
pub(crate) use plan::QueryPlan;
pub use search::{Bounds, SearchField, SearchKey, SearchMode, SearchSpec, like_escape};
pub use sort::{Direction, SortEntry};

/// Row lock applied to every `SELECT` of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Update,
    Share,
}

impl From<LockMode> for LockType {
    fn from(value: LockMode) -> Self {
        match value {
            LockMode::Update => LockType::Update,
            LockMode::Share => LockType::Share,
        }
    }
}

/// The inbound call: route params, query string and body.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Strict equality filters on root columns.
    pub params: Record,
    /// Pagination keys plus loose equality filters.
    pub query: Record,
    pub body: JsonValue,
}

impl Request {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<JsonValue>) -> Self {
        self.body = body.into();
        self
    }

    /// Body as a single record.
    ///
    /// # Errors
    /// Returns `ServiceError::InvalidOptions` unless the body is an object.
    pub fn body_record(&self) -> ServiceResult<Record> {
        match &self.body {
            JsonValue::Object(map) => Ok(map.clone()),
            other => Err(ServiceError::invalid_options(format!(
                "expected an object body, got {other}"
            ))),
        }
    }

    /// Body as a list of records; a single object counts as a one-element list.
    ///
    /// # Errors
    /// Returns `ServiceError::InvalidOptions` for any other shape.
    pub fn body_records(&self) -> ServiceResult<Vec<Record>> {
        match &self.body {
            JsonValue::Array(items) => items
                .iter()
                .map(|item| match item {
                    JsonValue::Object(map) => Ok(map.clone()),
                    other => Err(ServiceError::invalid_options(format!(
                        "expected object items in body, got {other}"
                    ))),
                })
                .collect(),
            JsonValue::Object(map) => Ok(vec![map.clone()]),
            JsonValue::Null => Ok(Vec::new()),
            other => Err(ServiceError::invalid_options(format!(
                "expected an array body, got {other}"
            ))),
        }
    }
}

/// Options of one service call. Immutable once built; see [`QueryOptions::builder`].
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct QueryOptions {
    pub(crate) count: bool,
    pub(crate) list: bool,
    pub(crate) split_sql: bool,
    pub(crate) scope: Scope,
    pub(crate) plain: bool,
    pub(crate) attributes: Vec<String>,
    pub(crate) include: Vec<IncludeSpec>,
    pub(crate) search: Vec<SearchSpec>,
    pub(crate) sort: Vec<SortEntry>,
    pub(crate) filter: Filter,
    pub(crate) ret_values: bool,
    pub(crate) ret_diffs: bool,
    pub(crate) fake: bool,
    pub(crate) fake_body: Record,
    pub(crate) max_size: Option<u64>,
    pub(crate) order_key: Option<String>,
    pub(crate) lock: Option<LockMode>,
    pub(crate) audit: Option<bool>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            count: false,
            list: true,
            split_sql: true,
            scope: Scope::Default,
            plain: false,
            attributes: Vec::new(),
            include: Vec::new(),
            search: Vec::new(),
            sort: Vec::new(),
            filter: Filter::all(),
            ret_values: false,
            ret_diffs: false,
            fake: false,
            fake_body: Record::new(),
            max_size: None,
            order_key: None,
            lock: None,
            audit: None,
        }
    }
}

impl QueryOptions {
    #[must_use]
    pub fn builder() -> QueryOptionsBuilder {
        QueryOptionsBuilder {
            inner: Self::default(),
        }
    }

    #[must_use]
    pub fn scope(&self) -> Scope {
        self.scope
    }

    #[must_use]
    pub fn lock(&self) -> Option<LockMode> {
        self.lock
    }

    #[must_use]
    pub fn split_sql(&self) -> bool {
        self.split_sql
    }
}

/// Builder for [`QueryOptions`].
#[derive(Debug, Clone)]
pub struct QueryOptionsBuilder {
    inner: QueryOptions,
}

impl QueryOptionsBuilder {
    /// Also compute the total row count.
    #[must_use]
    pub fn count(mut self, count: bool) -> Self {
        self.inner.count = count;
        self
    }

    /// Return rows (default `true`).
    #[must_use]
    pub fn list(mut self, list: bool) -> Self {
        self.inner.list = list;
        self
    }

    /// Resolve join filters with separate key queries (default) instead of subqueries.
    #[must_use]
    pub fn split_sql(mut self, split: bool) -> Self {
        self.inner.split_sql = split;
        self
    }

    #[must_use]
    pub fn scope(mut self, scope: impl Into<Scope>) -> Self {
        self.inner.scope = scope.into();
        self
    }

    /// Flatten single-valued includes into `alias.field` keys.
    #[must_use]
    pub fn plain(mut self, plain: bool) -> Self {
        self.inner.plain = plain;
        self
    }

    #[must_use]
    pub fn attributes<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.attributes = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn include(mut self, spec: IncludeSpec) -> Self {
        self.inner.include.push(spec);
        self
    }

    #[must_use]
    pub fn search(mut self, spec: SearchSpec) -> Self {
        self.inner.search.push(spec);
        self
    }

    /// Append a sort entry in string form (`"-createTime"`, `"team.name"`).
    #[must_use]
    pub fn sort(mut self, entry: &str) -> Self {
        self.inner.sort.push(SortEntry::parse(entry));
        self
    }

    #[must_use]
    pub fn sort_entry(mut self, entry: SortEntry) -> Self {
        self.inner.sort.push(entry);
        self
    }

    /// AND an extra filter onto the request filters.
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.inner.filter = std::mem::take(&mut self.inner.filter).and_with(filter);
        self
    }

    /// Return the affected rows (reloaded) instead of a count.
    #[must_use]
    pub fn ret_values(mut self, on: bool) -> Self {
        self.inner.ret_values = on;
        self
    }

    /// Return before/after snapshots and field diffs.
    #[must_use]
    pub fn ret_diffs(mut self, on: bool) -> Self {
        self.inner.ret_diffs = on;
        self
    }

    /// Soft-delete on `remove`.
    #[must_use]
    pub fn fake(mut self, on: bool) -> Self {
        self.inner.fake = on;
        self
    }

    /// Extra values written by a soft delete.
    #[must_use]
    pub fn fake_body(mut self, body: Record) -> Self {
        self.inner.fake_body = body;
        self
    }

    #[must_use]
    pub fn max_size(mut self, max: u64) -> Self {
        self.inner.max_size = Some(max);
        self
    }

    /// Rank column for the ordered-list operations.
    #[must_use]
    pub fn order_key(mut self, column: impl Into<String>) -> Self {
        self.inner.order_key = Some(column.into());
        self
    }

    #[must_use]
    pub fn lock(mut self, lock: LockMode) -> Self {
        self.inner.lock = Some(lock);
        self
    }

    /// Override the configured audit switch for this call.
    #[must_use]
    pub fn audit(mut self, on: bool) -> Self {
        self.inner.audit = Some(on);
        self
    }

    #[must_use]
    pub fn build(self) -> QueryOptions {
        self.inner
    }
}

/// Shared, read-only inputs of the compiler.
#[derive(Clone, Copy)]
pub(crate) struct QueryContext<'a> {
    pub schema: &'a Schema,
    pub paths: &'a PathCache,
    pub presets: &'a IncludePresets,
    pub config: &'a ServiceConfig,
}
