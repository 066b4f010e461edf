//! Ordered-list reordering over a rank column.
//!
//! Ranks are positive integers, ascending means earlier, and a falsy rank
//! (`NULL` or `0`) means the row is not in the sequence. Moves shift the rows
//! between the two positions by one and then place the origin; they issue
//! several writes, so concurrent reordering of one group must be serialized by
//! the caller (pass a transaction and `LockMode::Update`).

use sea_orm::ConnectionTrait;
use sea_orm::sea_query::{Alias, Condition, Expr, Order, SimpleExpr};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, instrument};

use crate::audit::{AuditKind, DiffReport};
use crate::error::{ServiceError, ServiceResult};
use crate::filter::Filter;
use crate::query::render::{self, apply_lock};
use crate::query::{QueryOptions, Request};
use crate::scope::absent_value;
use crate::value::{Record, has_key, is_truthy};

use super::{Session, Write, key_filter, key_record};

/// Outcome of a rank operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RankChange {
    /// Nothing to do: no adjacent row, equal or unset ranks.
    NoChange,
    /// The origin moved from `from` to `to`; `shifted` other rows moved by one.
    /// `from = None` inserts into the sequence, `to = None` removes from it.
    Moved {
        from: Option<i64>,
        to: Option<i64>,
        shifted: u64,
    },
    /// Two rows exchanged their ranks.
    Swapped { first: i64, second: i64 },
}

#[derive(Clone, Copy)]
enum Neighbour {
    Previous,
    Next,
}

impl Session {
    /// Move `origin` to the position of `target`, or out of the sequence when
    /// `target` is `None`.
    ///
    /// Both rows are identified by their primary key. The request and options
    /// select the group whose ranks are shifted (e.g. `params` naming the parent).
    ///
    /// # Errors
    /// `InvalidOptions` when a row is missing or the target is unranked,
    /// `UnknownColumn` for an undeclared rank column.
    #[instrument(skip_all, fields(model = self.model().name()))]
    pub async fn move_to<C: ConnectionTrait>(
        &self,
        conn: &C,
        req: &Request,
        opts: &QueryOptions,
        origin: &Record,
        target: Option<&Record>,
    ) -> ServiceResult<RankChange> {
        let origin = self.locate(conn, opts, origin, "origin").await?;
        let target = match target {
            Some(t) => Some(self.locate(conn, opts, t, "target").await?),
            None => None,
        };
        self.reorder(conn, req, opts, origin, target.as_ref(), "move_to")
            .await
    }

    /// Swap `origin` with the nearest row of lower rank in its group.
    ///
    /// # Errors
    /// Same as [`Session::move_to`].
    #[instrument(skip_all, fields(model = self.model().name()))]
    pub async fn move_up<C: ConnectionTrait>(
        &self,
        conn: &C,
        req: &Request,
        opts: &QueryOptions,
        origin: &Record,
    ) -> ServiceResult<RankChange> {
        self.step(conn, req, opts, origin, Neighbour::Previous, "move_up")
            .await
    }

    /// Swap `origin` with the nearest row of higher rank in its group.
    ///
    /// # Errors
    /// Same as [`Session::move_to`].
    #[instrument(skip_all, fields(model = self.model().name()))]
    pub async fn move_down<C: ConnectionTrait>(
        &self,
        conn: &C,
        req: &Request,
        opts: &QueryOptions,
        origin: &Record,
    ) -> ServiceResult<RankChange> {
        self.step(conn, req, opts, origin, Neighbour::Next, "move_down")
            .await
    }

    /// Exchange the ranks of two rows without touching any other row.
    ///
    /// No-op when either rank is unset or both are equal.
    ///
    /// # Errors
    /// `InvalidOptions` when a row is missing.
    #[instrument(skip_all, fields(model = self.model().name()))]
    pub async fn change<C: ConnectionTrait>(
        &self,
        conn: &C,
        opts: &QueryOptions,
        first: &Record,
        second: &Record,
    ) -> ServiceResult<RankChange> {
        let rank = self.rank_column(opts)?;
        let first = self.locate(conn, opts, first, "first").await?;
        let second = self.locate(conn, opts, second, "second").await?;
        let (Some(from), Some(to)) = (rank_of(&first, &rank), rank_of(&second, &rank)) else {
            return Ok(RankChange::NoChange);
        };
        if from == to {
            return Ok(RankChange::NoChange);
        }
        self.set_rank(conn, &first, &rank, JsonValue::from(to)).await?;
        self.set_rank(conn, &second, &rank, JsonValue::from(from)).await?;
        debug!(first = from, second = to, "ranks swapped");

        self.audit_move(conn, opts, vec![first, second], "change")
            .await?;
        Ok(RankChange::Swapped {
            first: from,
            second: to,
        })
    }

    async fn step<C: ConnectionTrait>(
        &self,
        conn: &C,
        req: &Request,
        opts: &QueryOptions,
        origin: &Record,
        towards: Neighbour,
        method: &'static str,
    ) -> ServiceResult<RankChange> {
        let model = self.model();
        let rank = self.rank_column(opts)?;
        let origin = self.locate(conn, opts, origin, "origin").await?;
        let Some(current) = rank_of(&origin, &rank) else {
            return Ok(RankChange::NoChange);
        };

        // Unranked rows (`NULL`, or `0` on a non-nullable column) are never neighbours.
        let ranked = Filter::not_null(rank.as_str()).and_with(Filter::gt(rank.as_str(), 0));
        let (bound, order) = match towards {
            Neighbour::Previous => (Filter::lt(rank.as_str(), current), Order::Desc),
            Neighbour::Next => (Filter::gt(rank.as_str(), current), Order::Asc),
        };
        let bound = ranked.and_with(bound);
        let group = self.group_condition(conn, req, opts).await?;
        let mut stmt = render::select(model, &[])?;
        stmt.cond_where(group.add(render::condition(model, &bound)?))
            .order_by_expr(render::column_ref(model, &rank)?.into(), order)
            .limit(1);
        apply_lock(&mut stmt, opts.lock);
        let Some(neighbour) = render::fetch(conn, model, &stmt).await?.pop() else {
            debug!(rank = current, "no adjacent row");
            return Ok(RankChange::NoChange);
        };
        self.reorder(conn, req, opts, origin, Some(&neighbour), method)
            .await
    }

    async fn reorder<C: ConnectionTrait>(
        &self,
        conn: &C,
        req: &Request,
        opts: &QueryOptions,
        origin: Record,
        target: Option<&Record>,
        method: &'static str,
    ) -> ServiceResult<RankChange> {
        let model = self.model();
        let rank = self.rank_column(opts)?;
        let from = rank_of(&origin, &rank);
        let to = match target {
            Some(t) => Some(rank_of(t, &rank).ok_or_else(|| {
                ServiceError::invalid_options("move target has no rank")
            })?),
            None => None,
        };

        // Rows to shift and the direction they move in.
        let (range, delta) = match (from, to) {
            (None, Some(t)) => (Filter::gte(rank.as_str(), t), 1),
            (Some(o), Some(t)) if o > t => (
                Filter::gte(rank.as_str(), t).and_with(Filter::lt(rank.as_str(), o)),
                1,
            ),
            (Some(o), Some(t)) if o < t => (
                Filter::gt(rank.as_str(), o).and_with(Filter::lte(rank.as_str(), t)),
                -1,
            ),
            (Some(o), None) => (Filter::gt(rank.as_str(), o), -1),
            (Some(_), Some(_)) | (None, None) => return Ok(RankChange::NoChange),
        };

        let group = self.group_condition(conn, req, opts).await?;
        let column = model.resolve_column(&rank)?;
        let current = Expr::col(Alias::new(column.storage()));
        let next: SimpleExpr = if delta > 0 {
            current.add(1)
        } else {
            current.sub(1)
        };
        let shifted = self
            .execute(
                conn,
                group.add(render::condition(model, &range)?),
                Write::Update(vec![(Alias::new(column.storage()), next)]),
            )
            .await?;

        let placed = to.map_or_else(|| absent_value(column), JsonValue::from);
        self.set_rank(conn, &origin, &rank, placed).await?;
        debug!(?from, ?to, shifted, "rank moved");

        self.audit_move(conn, opts, vec![origin], method).await?;
        Ok(RankChange::Moved { from, to, shifted })
    }

    /// Shift group: the request's filters and scope on the root model.
    async fn group_condition<C: ConnectionTrait>(
        &self,
        conn: &C,
        req: &Request,
        opts: &QueryOptions,
    ) -> ServiceResult<Condition> {
        let plan = self.compile(req, opts)?;
        self.root_condition(conn, &plan, opts).await
    }

    /// Load the full row for a key record.
    async fn locate<C: ConnectionTrait>(
        &self,
        conn: &C,
        opts: &QueryOptions,
        key: &Record,
        role: &str,
    ) -> ServiceResult<Record> {
        let pk = self.model().require_primary_key()?;
        if !has_key(key, pk) {
            return Err(ServiceError::invalid_options(format!(
                "{role} row needs its primary key"
            )));
        }
        self.load_keys(conn, std::slice::from_ref(key), opts.lock)
            .await?
            .pop()
            .ok_or_else(|| ServiceError::invalid_options(format!("{role} row not found")))
    }

    async fn set_rank<C: ConnectionTrait>(
        &self,
        conn: &C,
        row: &Record,
        rank: &str,
        value: JsonValue,
    ) -> ServiceResult<()> {
        let model = self.model();
        let pk = model.primary_key();
        let cond = render::condition(model, &key_filter(pk, std::slice::from_ref(row)))?;
        let values: Record = [(rank.to_owned(), value)].into_iter().collect();
        self.execute(conn, cond, Write::Update(super::assignments(model, &values)?))
            .await?;
        Ok(())
    }

    async fn audit_move<C: ConnectionTrait>(
        &self,
        conn: &C,
        opts: &QueryOptions,
        before: Vec<Record>,
        method: &str,
    ) -> ServiceResult<()> {
        if !self.audit_enabled(opts) {
            return Ok(());
        }
        let pk = self.model().primary_key();
        let keys: Vec<Record> = before.iter().map(|r| key_record(r, pk)).collect();
        let after = self.load_keys(conn, &keys, opts.lock).await?;
        self.record(AuditKind::Move, method, &DiffReport::build(before, after, self.model()));
        Ok(())
    }
}

/// Rank of a row when it is in the sequence.
fn rank_of(row: &Record, rank: &str) -> Option<i64> {
    let value = row.get(rank).filter(|v| is_truthy(v))?;
    let parsed = match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.parse().ok(),
        _ => None,
    };
    parsed.filter(|r| *r > 0)
}
