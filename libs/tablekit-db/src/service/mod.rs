//! Scoped CRUD, ordered-list and audit operations over one root model.
//!
//! A [`Service`] is built once per model and shared; every call runs on a
//! request-scoped [`Session`] that carries the caller's [`SecurityContext`]
//! and buffers the audit records of its mutations. Operations take any
//! `sea_orm::ConnectionTrait` executor: pass a `DatabaseTransaction` to run a
//! multi-statement operation (edit with diffs, set, move) atomically.

mod crud;
mod rank;
mod unique;

use std::sync::Arc;

use parking_lot::Mutex;
use sea_orm::ConnectionTrait;
use sea_orm::sea_query::{Alias, Condition, Query, SimpleExpr};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tablekit_security::SecurityContext;

use crate::audit::{AuditKind, AuditRecord, DiffReport, render_messages};
use crate::config::ServiceConfig;
use crate::error::ServiceResult;
use crate::filter::Filter;
use crate::model::{ModelDef, PathCache, Schema};
use crate::query::nested::KeyResolver;
use crate::query::render::{self, apply_lock};
use crate::query::{
    IncludePresets, IncludeSpec, LockMode, QueryContext, QueryOptions, QueryPlan, Request,
};
use crate::value::{Record, timestamp_now, to_sea_value};

pub use rank::RankChange;

/// Result of [`Session::list`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListResult {
    Rows(Vec<Record>),
    Count(u64),
    Page { count: u64, rows: Vec<Record> },
}

impl ListResult {
    /// Rows of a `Rows` or `Page` result.
    #[must_use]
    pub fn rows(&self) -> &[Record] {
        match self {
            Self::Rows(rows) | Self::Page { rows, .. } => rows,
            Self::Count(_) => &[],
        }
    }

    #[must_use]
    pub fn count(&self) -> Option<u64> {
        match self {
            Self::Count(n) | Self::Page { count: n, .. } => Some(*n),
            Self::Rows(_) => None,
        }
    }
}

/// Result of `edit`, `remove`, `increase` and `decrease`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MutationResult {
    /// Number of affected rows.
    Affected(u64),
    /// Affected rows reloaded after the write (the removed rows for `remove`).
    Values(Vec<Record>),
    Diffs(DiffReport),
}

impl MutationResult {
    #[must_use]
    pub fn affected(&self) -> u64 {
        let len = |n: usize| u64::try_from(n).unwrap_or(u64::MAX);
        match self {
            Self::Affected(n) => *n,
            Self::Values(rows) => len(rows.len()),
            Self::Diffs(report) => len(report.diffs.len()),
        }
    }
}

/// Rows written by [`Session::set`], as reloaded after the write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetOutcome {
    pub added: Vec<Record>,
    pub edited: Vec<Record>,
    pub removed: Vec<Record>,
}

struct ServiceInner {
    schema: Arc<Schema>,
    model: Arc<ModelDef>,
    presets: IncludePresets,
    config: ServiceConfig,
    paths: PathCache,
}

/// Data-access service bound to one model. Cheap to clone.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("model", &self.inner.model.name())
            .field("presets", &self.inner.presets.len())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Service {
    /// Service over `model` with default configuration and no presets.
    ///
    /// # Errors
    /// Returns `ServiceError::UnknownModel` if `schema` has no such model.
    pub fn new(schema: Arc<Schema>, model: &str) -> ServiceResult<Self> {
        Self::builder(schema, model).build()
    }

    #[must_use]
    pub fn builder(schema: Arc<Schema>, model: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            schema,
            model: model.into(),
            presets: IncludePresets::default(),
            config: ServiceConfig::default(),
        }
    }

    #[must_use]
    pub fn model(&self) -> &Arc<ModelDef> {
        &self.inner.model
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.inner.schema
    }

    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Start a request-scoped session.
    #[must_use]
    pub fn session(&self, security: SecurityContext) -> Session {
        Session {
            service: self.clone(),
            security,
            log: Mutex::new(Vec::new()),
        }
    }

    fn query_context(&self) -> QueryContext<'_> {
        QueryContext {
            schema: &self.inner.schema,
            paths: &self.inner.paths,
            presets: &self.inner.presets,
            config: &self.inner.config,
        }
    }
}

/// Builder for [`Service`].
pub struct ServiceBuilder {
    schema: Arc<Schema>,
    model: String,
    presets: IncludePresets,
    config: ServiceConfig,
}

impl ServiceBuilder {
    #[must_use]
    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a named include template, referenced by `IncludeSpec::preset(key)`.
    #[must_use]
    pub fn preset(mut self, key: impl Into<String>, spec: IncludeSpec) -> Self {
        self.presets.insert(key, spec);
        self
    }

    /// # Errors
    /// Returns `ServiceError::UnknownModel` if the schema has no such model.
    pub fn build(self) -> ServiceResult<Service> {
        let model = self.schema.model(&self.model)?;
        Ok(Service {
            inner: Arc::new(ServiceInner {
                schema: self.schema,
                model,
                presets: self.presets,
                config: self.config,
                paths: PathCache::default(),
            }),
        })
    }
}

/// Request-scoped handle: caller identity plus the audit buffer.
pub struct Session {
    service: Service,
    security: SecurityContext,
    log: Mutex<Vec<AuditRecord>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("service", &self.service)
            .field("security", &self.security)
            .field("log", &self.log.lock().len())
            .finish()
    }
}

impl Session {
    #[must_use]
    pub fn service(&self) -> &Service {
        &self.service
    }

    #[must_use]
    pub fn security(&self) -> &SecurityContext {
        &self.security
    }

    /// Audit records collected so far.
    #[must_use]
    pub fn log_infos(&self) -> Vec<AuditRecord> {
        self.log.lock().clone()
    }

    /// Rendered audit lines of every collected record, in order.
    #[must_use]
    pub fn log_messages(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .flat_map(|r| r.messages.iter().cloned())
            .collect()
    }

    /// Drain the buffer, handing ownership to the caller's sink.
    #[must_use]
    pub fn take_log_infos(&self) -> Vec<AuditRecord> {
        std::mem::take(&mut *self.log.lock())
    }

    fn model(&self) -> &Arc<ModelDef> {
        &self.service.inner.model
    }

    fn config(&self) -> &ServiceConfig {
        &self.service.inner.config
    }

    fn audit_enabled(&self, opts: &QueryOptions) -> bool {
        opts.audit.unwrap_or(self.config().audit.enabled)
    }

    fn record(&self, kind: AuditKind, method: &str, report: &DiffReport) {
        if report.is_unchanged() {
            return;
        }
        let model = self.model();
        let rows = report.rows(model.primary_key());
        let messages = render_messages(model, &self.config().audit, &rows, &report.diffs);
        tracing::debug!(
            model = model.name(),
            method,
            rows = report.diffs.len(),
            messages = messages.len(),
            "audit record"
        );
        let record = AuditRecord {
            kind,
            method: method.to_owned(),
            model: model.name().to_owned(),
            before: report.before.clone(),
            after: report.after.clone(),
            diffs: report.diffs.clone(),
            messages,
        };
        self.log.lock().push(record);
    }

    fn compile(&self, req: &Request, opts: &QueryOptions) -> ServiceResult<QueryPlan> {
        QueryPlan::compile(self.service.query_context(), self.model(), req, opts)
    }

    /// Root where-clause of `plan` with join filters folded into key sets.
    async fn root_condition<C: ConnectionTrait>(
        &self,
        conn: &C,
        plan: &QueryPlan,
        opts: &QueryOptions,
    ) -> ServiceResult<Condition> {
        KeyResolver::new(
            conn,
            self.service.query_context(),
            plan,
            opts.split_sql,
            opts.lock,
        )
        .root_condition()
        .await
    }

    /// Full rows of the root model matching `cond`, without includes.
    async fn load_where<C: ConnectionTrait>(
        &self,
        conn: &C,
        cond: Condition,
        lock: Option<LockMode>,
    ) -> ServiceResult<Vec<Record>> {
        let model = self.model();
        let mut stmt = render::select(model, &[])?;
        stmt.cond_where(cond);
        apply_lock(&mut stmt, lock);
        render::fetch(conn, model, &stmt).await
    }

    /// Reload rows by primary key, regardless of scope.
    async fn load_keys<C: ConnectionTrait>(
        &self,
        conn: &C,
        keys: &[Record],
        lock: Option<LockMode>,
    ) -> ServiceResult<Vec<Record>> {
        let model = self.model();
        let cond = render::condition(model, &key_filter(model.primary_key(), keys))?;
        self.load_where(conn, cond, lock).await
    }

    async fn execute<C: ConnectionTrait>(
        &self,
        conn: &C,
        cond: Condition,
        write: Write,
    ) -> ServiceResult<u64> {
        let model = self.model();
        let table = Alias::new(model.table());
        let backend = conn.get_database_backend();
        let stmt = match write {
            Write::Update(values) => {
                let mut stmt = Query::update();
                stmt.table(table).values(values).cond_where(cond);
                backend.build(&stmt)
            }
            Write::Delete => {
                let mut stmt = Query::delete();
                stmt.from_table(table).cond_where(cond);
                backend.build(&stmt)
            }
        };
        Ok(conn.execute(stmt).await?.rows_affected())
    }

    /// Keep only columns of the root model.
    fn writable(&self, body: Record) -> Record {
        let model = self.model();
        body.into_iter()
            .filter(|(k, _)| {
                let known = model.has_column(k);
                if !known {
                    tracing::debug!(model = model.name(), field = %k, "ignoring unknown field in body");
                }
                known
            })
            .collect()
    }

    /// Fill an actor column and a timestamp column unless the caller set them.
    fn stamp(
        &self,
        record: &mut Record,
        actor_column: Option<&str>,
        time_column: Option<&str>,
    ) -> ServiceResult<()> {
        if let Some(col) = actor_column
            && is_unset(record, col)
        {
            record.insert(col.to_owned(), self.security.actor().to_json());
        }
        if let Some(col) = time_column
            && is_unset(record, col)
        {
            let kind = self.model().resolve_column(col)?.kind();
            record.insert(
                col.to_owned(),
                timestamp_now(kind, self.config().timestamp_unit),
            );
        }
        Ok(())
    }

    fn stamp_update(&self, record: &mut Record) -> ServiceResult<()> {
        let audit = self.model().audit_fields();
        self.stamp(
            record,
            audit.updated_by.as_deref(),
            audit.updated_at.as_deref(),
        )
    }

    /// Rank column for the ordered-list operations.
    fn rank_column(&self, opts: &QueryOptions) -> ServiceResult<String> {
        let model = self.model();
        let name = opts
            .order_key
            .as_deref()
            .or(model.rank_column())
            .unwrap_or(&self.config().rank_column);
        model.resolve_column(name)?;
        Ok(name.to_owned())
    }
}

/// A statement shape applied to every row matching a condition.
enum Write {
    Update(Vec<(Alias, SimpleExpr)>),
    Delete,
}

/// `SET` assignments for `values`, coerced to the column types.
fn assignments(model: &ModelDef, values: &Record) -> ServiceResult<Vec<(Alias, SimpleExpr)>> {
    values
        .iter()
        .map(|(name, v)| {
            let column = model.resolve_column(name)?;
            Ok((
                Alias::new(column.storage()),
                SimpleExpr::from(to_sea_value(column, v)?),
            ))
        })
        .collect()
}

fn is_unset(record: &Record, column: &str) -> bool {
    record.get(column).is_none_or(JsonValue::is_null)
}

/// Primary-key part of `row`.
fn key_record(row: &Record, pk: &[String]) -> Record {
    pk.iter()
        .map(|k| (k.clone(), row.get(k).cloned().unwrap_or(JsonValue::Null)))
        .collect()
}

/// Filter matching exactly the rows whose keys appear in `rows`.
fn key_filter(pk: &[String], rows: &[Record]) -> Filter {
    match pk {
        [single] => Filter::in_list(
            single.as_str(),
            rows.iter().filter_map(|r| r.get(single).cloned()),
        ),
        _ => Filter::Or(
            rows.iter()
                .map(|r| {
                    Filter::And(
                        pk.iter()
                            .map(|k| {
                                Filter::eq(k.as_str(), r.get(k).cloned().unwrap_or(JsonValue::Null))
                            })
                            .collect(),
                    )
                })
                .collect(),
        ),
    }
}
