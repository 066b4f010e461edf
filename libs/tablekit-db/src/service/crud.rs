use std::collections::HashSet;

use sea_orm::sea_query::{Alias, Condition, Expr, Query, SimpleExpr};
use sea_orm::{ConnectionTrait, DbBackend, FromQueryResult};
use serde_json::Value as JsonValue;
use tracing::{debug, instrument};

use crate::audit::{AuditKind, DiffReport};
use crate::error::{ServiceError, ServiceResult};
use crate::loader::{flatten_plain, load_includes};
use crate::query::render::{self, apply_lock};
use crate::query::{Page, QueryOptions, QueryPlan, Request};
use crate::scope::absent_value;
use crate::value::{Record, has_key, key_string, same_key, to_sea_value};

use super::{
    ListResult, MutationResult, Session, SetOutcome, Write, assignments, is_unset, key_filter,
    key_record, unique,
};

/// A write plus what to record about it.
struct Mutation<'a> {
    cond: Condition,
    write: Write,
    /// Values written, used for the uniqueness check and to follow key changes.
    body: Option<&'a Record>,
    kind: AuditKind,
    method: &'static str,
}

impl Session {
    /// Query rows, a total count, or both.
    ///
    /// # Errors
    /// `InvalidOptions` when both `count` and `list` are off; metadata errors for
    /// unknown columns or associations; database errors unchanged.
    #[instrument(skip(self, conn, req, opts), fields(model = self.model().name()))]
    pub async fn list<C: ConnectionTrait>(
        &self,
        conn: &C,
        req: &Request,
        opts: &QueryOptions,
    ) -> ServiceResult<ListResult> {
        if !opts.count && !opts.list {
            return Err(ServiceError::invalid_options(
                "list needs at least one of `count` and `list`",
            ));
        }
        let plan = self.compile(req, opts)?;
        let cond = self.root_condition(conn, &plan, opts).await?;

        let count = if opts.count {
            Some(render::count(conn, &plan.model, cond.clone(), opts.lock).await?)
        } else {
            None
        };
        if !opts.list {
            return Ok(ListResult::Count(count.unwrap_or_default()));
        }
        let rows = self.fetch(conn, &plan, opts, cond, plan.page).await?;
        debug!(rows = rows.len(), count, "listed");
        Ok(match count {
            Some(count) => ListResult::Page { count, rows },
            None => ListResult::Rows(rows),
        })
    }

    /// First matching row with its includes, if any.
    ///
    /// # Errors
    /// Same as [`Session::list`].
    #[instrument(skip(self, conn, req, opts), fields(model = self.model().name()))]
    pub async fn info<C: ConnectionTrait>(
        &self,
        conn: &C,
        req: &Request,
        opts: &QueryOptions,
    ) -> ServiceResult<Option<Record>> {
        let plan = self.compile(req, opts)?;
        let cond = self.root_condition(conn, &plan, opts).await?;
        let page = Page {
            limit: 1,
            offset: 0,
        };
        let rows = self.fetch(conn, &plan, opts, cond, page).await?;
        Ok(rows.into_iter().next())
    }

    /// Number of matching rows.
    ///
    /// # Errors
    /// Same as [`Session::list`].
    #[instrument(skip(self, conn, req, opts), fields(model = self.model().name()))]
    pub async fn count<C: ConnectionTrait>(
        &self,
        conn: &C,
        req: &Request,
        opts: &QueryOptions,
    ) -> ServiceResult<u64> {
        let plan = self.compile(req, opts)?;
        let cond = self.root_condition(conn, &plan, opts).await?;
        render::count(conn, &plan.model, cond, opts.lock).await
    }

    /// Insert the body as one row and return it as stored.
    ///
    /// Route params fill columns the body leaves out; creation actor and
    /// timestamp columns are filled from the session unless supplied.
    ///
    /// # Errors
    /// `DuplicateRecord` when a unique constraint would be violated (nothing is
    /// written), `InvalidValue` for values that do not fit their column.
    #[instrument(skip(self, conn, req, opts), fields(model = self.model().name()))]
    pub async fn add<C: ConnectionTrait>(
        &self,
        conn: &C,
        req: &Request,
        opts: &QueryOptions,
    ) -> ServiceResult<Record> {
        let body = req.body_record()?;
        let mut rows = self
            .insert(conn, &req.params, opts, vec![body], AuditKind::Add, "add")
            .await?;
        rows.pop()
            .ok_or_else(|| ServiceError::Query("insert produced no row".to_owned()))
    }

    /// Insert every body record; the whole batch is checked for duplicates first.
    ///
    /// # Errors
    /// Same as [`Session::add`].
    #[instrument(skip(self, conn, req, opts), fields(model = self.model().name()))]
    pub async fn add_multi<C: ConnectionTrait>(
        &self,
        conn: &C,
        req: &Request,
        opts: &QueryOptions,
    ) -> ServiceResult<Vec<Record>> {
        let bodies = req.body_records()?;
        self.insert(conn, &req.params, opts, bodies, AuditKind::Add, "add_multi")
            .await
    }

    /// Write the body onto every matching row.
    ///
    /// # Errors
    /// `InvalidOptions` for a body without known columns, `DuplicateRecord`,
    /// `MissingPrimaryKey` when values or diffs are requested on a keyless model.
    #[instrument(skip(self, conn, req, opts), fields(model = self.model().name()))]
    pub async fn edit<C: ConnectionTrait>(
        &self,
        conn: &C,
        req: &Request,
        opts: &QueryOptions,
    ) -> ServiceResult<MutationResult> {
        let model = self.model();
        let mut body = self.writable(req.body_record()?);
        if body.is_empty() {
            return Err(ServiceError::invalid_options(format!(
                "edit body names no column of '{}'",
                model.name()
            )));
        }
        self.stamp_update(&mut body)?;

        let plan = self.compile(req, opts)?;
        let cond = self.root_condition(conn, &plan, opts).await?;
        let mutation = Mutation {
            cond,
            write: Write::Update(assignments(model, &body)?),
            body: Some(&body),
            kind: AuditKind::Edit,
            method: "edit",
        };
        self.mutate(conn, opts, mutation).await
    }

    /// Delete matching rows, or soft-delete them with `fake`.
    ///
    /// # Errors
    /// `InvalidOptions` for `fake` on a model without soft-delete columns.
    #[instrument(skip(self, conn, req, opts), fields(model = self.model().name(), fake = opts.fake))]
    pub async fn remove<C: ConnectionTrait>(
        &self,
        conn: &C,
        req: &Request,
        opts: &QueryOptions,
    ) -> ServiceResult<MutationResult> {
        let plan = self.compile(req, opts)?;
        let cond = self.root_condition(conn, &plan, opts).await?;
        let mutation = Mutation {
            cond,
            write: self.removal(opts)?,
            body: None,
            kind: AuditKind::Remove,
            method: "remove",
        };
        self.mutate(conn, opts, mutation).await
    }

    /// Reconcile the rows matching the request with the body list.
    ///
    /// Body records whose primary key matches a current row edit it (only the
    /// fields that differ), the others are added, and current rows missing from
    /// the body are removed (soft-deleted with `fake`).
    ///
    /// # Errors
    /// `MissingPrimaryKey` on keyless models; otherwise as the underlying
    /// add/edit/remove.
    #[instrument(skip(self, conn, req, opts), fields(model = self.model().name()))]
    pub async fn set<C: ConnectionTrait>(
        &self,
        conn: &C,
        req: &Request,
        opts: &QueryOptions,
    ) -> ServiceResult<SetOutcome> {
        let model = self.model();
        let pk = model.require_primary_key()?;

        let selector = Request {
            params: req.params.clone(),
            ..Request::default()
        };
        let plan = self.compile(&selector, opts)?;
        let cond = self.root_condition(conn, &plan, opts).await?;
        let current = self.load_where(conn, cond, opts.lock).await?;

        let targets = req
            .body_records()?
            .into_iter()
            .map(|t| self.writable(t))
            .collect();
        let Reconciled {
            adds,
            edits,
            removes,
        } = reconcile(&current, targets, pk);
        debug!(
            add = adds.len(),
            edit = edits.len(),
            remove = removes.len(),
            "set reconciliation"
        );

        let sub = QueryOptions {
            ret_values: true,
            ret_diffs: false,
            ..opts.clone()
        };
        let mut outcome = SetOutcome {
            added: self
                .insert(conn, &req.params, &sub, adds, AuditKind::Set, "set")
                .await?,
            ..SetOutcome::default()
        };

        for (key, mut changes) in edits {
            self.stamp_update(&mut changes)?;
            let cond = render::condition(model, &key_filter(pk, std::slice::from_ref(&key)))?;
            let mutation = Mutation {
                cond,
                write: Write::Update(assignments(model, &changes)?),
                body: Some(&changes),
                kind: AuditKind::Set,
                method: "set",
            };
            if let MutationResult::Values(rows) = self.mutate(conn, &sub, mutation).await? {
                outcome.edited.extend(rows);
            }
        }

        if !removes.is_empty() {
            let mutation = Mutation {
                cond: render::condition(model, &key_filter(pk, &removes))?,
                write: self.removal(opts)?,
                body: None,
                kind: AuditKind::Set,
                method: "set",
            };
            if let MutationResult::Values(rows) = self.mutate(conn, &sub, mutation).await? {
                outcome.removed = rows;
            }
        }
        Ok(outcome)
    }

    /// Add the body's amounts (`{"column": amount}`) to every matching row.
    ///
    /// # Errors
    /// `InvalidValue` for non-numeric columns or amounts.
    #[instrument(skip(self, conn, req, opts), fields(model = self.model().name()))]
    pub async fn increase<C: ConnectionTrait>(
        &self,
        conn: &C,
        req: &Request,
        opts: &QueryOptions,
    ) -> ServiceResult<MutationResult> {
        self.shift(conn, req, opts, AuditKind::Increase).await
    }

    /// Subtract the body's amounts from every matching row.
    ///
    /// # Errors
    /// Same as [`Session::increase`].
    #[instrument(skip(self, conn, req, opts), fields(model = self.model().name()))]
    pub async fn decrease<C: ConnectionTrait>(
        &self,
        conn: &C,
        req: &Request,
        opts: &QueryOptions,
    ) -> ServiceResult<MutationResult> {
        self.shift(conn, req, opts, AuditKind::Decrease).await
    }

    async fn shift<C: ConnectionTrait>(
        &self,
        conn: &C,
        req: &Request,
        opts: &QueryOptions,
        kind: AuditKind,
    ) -> ServiceResult<MutationResult> {
        let model = self.model();
        let body = req.body_record()?;
        if body.is_empty() {
            return Err(ServiceError::invalid_options(
                "increase/decrease needs at least one column amount",
            ));
        }
        let mut values: Vec<(Alias, SimpleExpr)> = Vec::with_capacity(body.len() + 2);
        for (name, amount) in &body {
            let column = model.resolve_column(name)?;
            if !column.kind().is_numeric() {
                return Err(ServiceError::invalid_value(name, "not a numeric column"));
            }
            if !amount.is_number() {
                return Err(ServiceError::invalid_value(name, "amount must be a number"));
            }
            let current = Expr::col(Alias::new(column.storage()));
            let delta = to_sea_value(column, amount)?;
            let next = if kind == AuditKind::Decrease {
                current.sub(delta)
            } else {
                current.add(delta)
            };
            values.push((Alias::new(column.storage()), next));
        }
        let mut stamps = Record::new();
        self.stamp_update(&mut stamps)?;
        values.extend(assignments(model, &stamps)?);

        let plan = self.compile(req, opts)?;
        let cond = self.root_condition(conn, &plan, opts).await?;
        let method = if kind == AuditKind::Decrease {
            "decrease"
        } else {
            "increase"
        };
        let mutation = Mutation {
            cond,
            write: Write::Update(values),
            body: None,
            kind,
            method,
        };
        self.mutate(conn, opts, mutation).await
    }

    /// Root rows of one page with their includes attached.
    async fn fetch<C: ConnectionTrait>(
        &self,
        conn: &C,
        plan: &QueryPlan,
        opts: &QueryOptions,
        cond: Condition,
        page: Page,
    ) -> ServiceResult<Vec<Record>> {
        let model = &plan.model;
        let mut stmt = render::select(model, &plan.attributes)?;
        stmt.cond_where(cond);
        let backend = conn.get_database_backend();
        for term in &plan.order {
            render::order_by(&mut stmt, model, term, backend, self.config())?;
        }
        stmt.limit(page.limit).offset(page.offset);
        apply_lock(&mut stmt, opts.lock);

        let mut rows = render::fetch(conn, model, &stmt).await?;
        load_includes(conn, self.config(), &plan.includes, &mut rows, opts.lock).await?;
        if opts.plain {
            for row in &mut rows {
                flatten_plain(row, &plan.includes);
            }
        }
        Ok(rows)
    }

    /// Write for a removal: a soft-delete update with `fake`, a delete otherwise.
    fn removal(&self, opts: &QueryOptions) -> ServiceResult<Write> {
        if !opts.fake {
            return Ok(Write::Delete);
        }
        let model = self.model();
        let audit = model.audit_fields();
        if !audit.is_paranoid() {
            return Err(ServiceError::invalid_options(format!(
                "model '{}' declares no soft-delete columns",
                model.name()
            )));
        }
        let mut body = self.writable(opts.fake_body.clone());
        self.stamp(
            &mut body,
            audit.deleted_by.as_deref(),
            audit.deleted_at.as_deref(),
        )?;
        Ok(Write::Update(assignments(model, &body)?))
    }

    /// Load, write, reload: the shared path of every update and delete.
    async fn mutate<C: ConnectionTrait>(
        &self,
        conn: &C,
        opts: &QueryOptions,
        m: Mutation<'_>,
    ) -> ServiceResult<MutationResult> {
        let model = self.model();
        let audit = self.audit_enabled(opts);
        let track = opts.ret_diffs || opts.ret_values || audit;
        let check_unique = m.body.is_some_and(|b| unique::touches_any(model, b));
        let pk = if track {
            model.require_primary_key()?
        } else {
            model.primary_key()
        };

        let before = if track || check_unique {
            self.load_where(conn, m.cond.clone(), opts.lock).await?
        } else {
            Vec::new()
        };
        if let Some(body) = m.body
            && check_unique
        {
            unique::check_update(conn, model, body, &before, opts.lock).await?;
        }

        let is_delete = matches!(m.write, Write::Delete);
        let affected = self.execute(conn, m.cond, m.write).await?;
        debug!(method = m.method, affected, "write applied");
        if !track {
            return Ok(MutationResult::Affected(affected));
        }

        // Follow primary-key changes made by the write itself.
        let keys: Vec<Record> = before
            .iter()
            .map(|row| {
                let mut key = key_record(row, pk);
                if let Some(body) = m.body {
                    for k in pk {
                        if let Some(v) = body.get(k) {
                            key.insert(k.clone(), v.clone());
                        }
                    }
                }
                key
            })
            .collect();
        let after = self.load_keys(conn, &keys, opts.lock).await?;
        let report = DiffReport::build(before, after, self.model());
        if audit {
            self.record(m.kind, m.method, &report);
        }

        Ok(if opts.ret_diffs {
            MutationResult::Diffs(report)
        } else if opts.ret_values {
            MutationResult::Values(if is_delete {
                report.before
            } else {
                report.after
            })
        } else {
            MutationResult::Affected(affected)
        })
    }

    async fn insert<C: ConnectionTrait>(
        &self,
        conn: &C,
        params: &Record,
        opts: &QueryOptions,
        bodies: Vec<Record>,
        kind: AuditKind,
        method: &'static str,
    ) -> ServiceResult<Vec<Record>> {
        if bodies.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.model();
        let rows = bodies
            .into_iter()
            .map(|body| self.prepare_insert(params, body))
            .collect::<ServiceResult<Vec<_>>>()?;
        unique::check_insert(conn, model, &rows, opts.lock).await?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in &rows {
            keys.push(self.insert_row(conn, row).await?);
        }
        let mut out = Vec::with_capacity(rows.len());
        for (row, key) in rows.into_iter().zip(keys) {
            let reloaded = match key {
                Some(key) => self
                    .load_keys(conn, std::slice::from_ref(&key), opts.lock)
                    .await?
                    .pop(),
                None => None,
            };
            out.push(reloaded.unwrap_or(row));
        }
        debug!(method, rows = out.len(), "inserted");

        if self.audit_enabled(opts) {
            let report = DiffReport::build(Vec::new(), out.clone(), model);
            self.record(kind, method, &report);
        }
        Ok(out)
    }

    fn prepare_insert(&self, params: &Record, body: Record) -> ServiceResult<Record> {
        let model = self.model();
        let mut row = self.writable(body);
        for (k, v) in params {
            if model.has_column(k) && is_unset(&row, k) {
                row.insert(k.clone(), v.clone());
            }
        }
        let audit = model.audit_fields();
        self.stamp(
            &mut row,
            audit.created_by.as_deref(),
            audit.created_at.as_deref(),
        )?;
        if let Some(col) = audit.deleted_at.as_deref()
            && !row.contains_key(col)
        {
            let column = model.resolve_column(col)?;
            row.insert(col.to_owned(), absent_value(column));
        }
        Ok(row)
    }

    /// Insert one row and return its primary key, when it can be known.
    async fn insert_row<C: ConnectionTrait>(
        &self,
        conn: &C,
        row: &Record,
    ) -> ServiceResult<Option<Record>> {
        let model = self.model();
        let mut stmt = Query::insert();
        stmt.into_table(Alias::new(model.table()));
        if row.is_empty() {
            stmt.or_default_values();
        } else {
            let mut columns = Vec::with_capacity(row.len());
            let mut values = Vec::with_capacity(row.len());
            for (name, v) in row {
                let column = model.resolve_column(name)?;
                columns.push(Alias::new(column.storage()));
                values.push(SimpleExpr::from(to_sea_value(column, v)?));
            }
            stmt.columns(columns).values(values)?;
        }

        let pk = model.primary_key();
        let backend = conn.get_database_backend();
        if pk.is_empty() || has_key(row, pk) {
            conn.execute(backend.build(&stmt)).await?;
            return Ok((!pk.is_empty()).then(|| key_record(row, pk)));
        }
        let [single] = pk else {
            conn.execute(backend.build(&stmt)).await?;
            return Ok(None);
        };

        let id = match backend {
            DbBackend::Postgres => {
                let storage = model.storage_name(single)?;
                stmt.returning_col(Alias::new(storage));
                let returned = JsonValue::find_by_statement(backend.build(&stmt))
                    .one(conn)
                    .await?;
                returned.and_then(|r| r.get(storage).cloned())
            }
            DbBackend::MySql | DbBackend::Sqlite => {
                let res = conn.execute(backend.build(&stmt)).await?;
                Some(JsonValue::from(res.last_insert_id()))
            }
        };
        Ok(id.map(|id| [(single.clone(), id)].into_iter().collect()))
    }
}

/// Set-reconciliation of current rows against target records.
struct Reconciled {
    adds: Vec<Record>,
    /// Key record of the row and the fields that differ.
    edits: Vec<(Record, Record)>,
    removes: Vec<Record>,
}

fn reconcile(current: &[Record], targets: Vec<Record>, pk: &[String]) -> Reconciled {
    let mut adds = Vec::new();
    let mut edits = Vec::new();
    let mut kept: HashSet<String> = HashSet::new();
    for target in targets {
        let key = key_string(&target, pk);
        let existing = current
            .iter()
            .find(|row| has_key(&target, pk) && key_string(row, pk) == key);
        match existing {
            Some(row) => {
                kept.insert(key);
                let changes: Record = target
                    .into_iter()
                    .filter(|(k, v)| !row.get(k).is_some_and(|cur| same_key(cur, v)))
                    .collect();
                if !changes.is_empty() {
                    edits.push((key_record(row, pk), changes));
                }
            }
            None => adds.push(target),
        }
    }
    let removes = current
        .iter()
        .filter(|row| !kept.contains(&key_string(row, pk)))
        .map(|row| key_record(row, pk))
        .collect();
    Reconciled {
        adds,
        edits,
        removes,
    }
}
