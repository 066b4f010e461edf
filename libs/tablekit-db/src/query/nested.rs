//! Nested-where rewrite.
//!
//! Root queries never join. A filter leaf on `"orders.amount"` is resolved by
//! querying the joined model on its own (with the include's where-clause and
//! scope), reducing the result to link keys and restricting the root with
//! `IN (...)` on the matching key:
//!
//! | association | root column | key set |
//! |---|---|---|
//! | belongs-to | foreign key | target key of matching targets |
//! | has-one / has-many | source key | foreign key of matching targets |
//! | belongs-to-many | source key | through back-reference of matching pairs |
//!
//! Leaves on the same path inside one AND/OR group are resolved with a single
//! key query, combined with the group's connective. In split mode every key
//! query runs first and the keys are inlined; otherwise the key query is
//! embedded as `IN (SELECT ...)`.

use sea_orm::ConnectionTrait;
use sea_orm::sea_query::{Condition, SelectStatement};

use crate::error::ServiceResult;
use crate::filter::{FieldPath, Filter};
use crate::model::{AssociationStep, Link, ModelDef};
use crate::scope::{Scope, apply_scope};

use super::render::{self, apply_lock, key_select};
use super::{CompiledInclude, LockMode, QueryContext, QueryPlan};

/// Filter tree with join-qualified groups cut out.
#[derive(Debug)]
enum Shape {
    And(Vec<Shape>),
    Or(Vec<Shape>),
    Not(Box<Shape>),
    Root(Filter),
    Joined(usize),
}

#[derive(Debug)]
struct JoinedGroup {
    path: Vec<String>,
    /// Filter on the path's final target.
    filter: Filter,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Connective {
    And,
    Or,
}

fn shape(filter: &Filter, groups: &mut Vec<JoinedGroup>) -> Shape {
    match filter {
        Filter::And(items) => Shape::And(shape_group(items, Connective::And, groups)),
        Filter::Or(items) => Shape::Or(shape_group(items, Connective::Or, groups)),
        Filter::Not(inner) => Shape::Not(Box::new(shape(inner, groups))),
        Filter::Cmp { field, .. } if field.is_joined() => {
            groups.push(JoinedGroup {
                path: field.path.clone(),
                filter: strip_path(filter),
            });
            Shape::Joined(groups.len() - 1)
        }
        leaf @ Filter::Cmp { .. } => Shape::Root(leaf.clone()),
    }
}

fn shape_group(items: &[Filter], connective: Connective, groups: &mut Vec<JoinedGroup>) -> Vec<Shape> {
    let mut out = Vec::with_capacity(items.len());
    let mut buckets: Vec<(Vec<String>, Vec<Filter>)> = Vec::new();
    for item in items {
        match item {
            Filter::Cmp { field, .. } if field.is_joined() => {
                match buckets.iter_mut().find(|(p, _)| *p == field.path) {
                    Some((_, leaves)) => leaves.push(strip_path(item)),
                    None => buckets.push((field.path.clone(), vec![strip_path(item)])),
                }
            }
            other => out.push(shape(other, groups)),
        }
    }
    for (path, leaves) in buckets {
        let filter = match connective {
            Connective::And => Filter::And(leaves),
            Connective::Or => Filter::Or(leaves),
        };
        groups.push(JoinedGroup { path, filter });
        out.push(Shape::Joined(groups.len() - 1));
    }
    out
}

fn strip_path(leaf: &Filter) -> Filter {
    match leaf {
        Filter::Cmp { field, op, value } => Filter::Cmp {
            field: FieldPath::root(field.column.clone()),
            op: *op,
            value: value.clone(),
        },
        other => other.clone(),
    }
}

fn render_shape(model: &ModelDef, shape: &Shape, resolved: &[Condition]) -> ServiceResult<Condition> {
    Ok(match shape {
        Shape::And(items) => {
            let mut cond = Condition::all();
            for item in items {
                cond = cond.add(render_shape(model, item, resolved)?);
            }
            cond
        }
        Shape::Or(items) if items.is_empty() => render::deny_all(),
        Shape::Or(items) => {
            let mut cond = Condition::any();
            for item in items {
                cond = cond.add(render_shape(model, item, resolved)?);
            }
            cond
        }
        Shape::Not(inner) => render_shape(model, inner, resolved)?.not(),
        Shape::Root(leaf) => render::condition(model, leaf)?,
        Shape::Joined(i) => resolved.get(*i).cloned().unwrap_or_else(render::deny_all),
    })
}

/// Resolves join-qualified filters of one plan into root conditions.
pub struct KeyResolver<'a, C> {
    conn: &'a C,
    ctx: QueryContext<'a>,
    plan: &'a QueryPlan,
    split_sql: bool,
    lock: Option<LockMode>,
}

impl<'a, C: ConnectionTrait> KeyResolver<'a, C> {
    pub(crate) fn new(
        conn: &'a C,
        ctx: QueryContext<'a>,
        plan: &'a QueryPlan,
        split_sql: bool,
        lock: Option<LockMode>,
    ) -> Self {
        Self {
            conn,
            ctx,
            plan,
            split_sql,
            lock,
        }
    }

    /// Full root condition: the plan filter plus required-include restrictions.
    pub(crate) async fn root_condition(&self) -> ServiceResult<Condition> {
        let mut cond = self.condition_for(&self.plan.filter).await?;
        for chain in CompiledInclude::required_chains(&self.plan.includes) {
            cond = cond.add(self.restrict(&chain, &Filter::all()).await?);
        }
        Ok(cond)
    }

    /// Render `filter` on the plan's root model, rewriting joined groups.
    pub(crate) async fn condition_for(&self, filter: &Filter) -> ServiceResult<Condition> {
        let model = &self.plan.model;
        if !filter.has_joined_leaf() {
            return render::condition(model, filter);
        }
        let mut groups = Vec::new();
        let shaped = shape(filter, &mut groups);
        let mut resolved = Vec::with_capacity(groups.len());
        for group in &groups {
            resolved.push(self.resolve_group(group).await?);
        }
        render_shape(model, &shaped, &resolved)
    }

    async fn resolve_group(&self, group: &JoinedGroup) -> ServiceResult<Condition> {
        if let Some(chain) = CompiledInclude::chain(&self.plan.includes, &group.path) {
            return self.restrict(&chain, &group.filter).await;
        }
        let dotted = group.path.join(".");
        let path = self.ctx.paths.resolve(self.ctx.schema, &self.plan.model, &dotted)?;
        tracing::warn!(
            path = %dotted,
            model = self.plan.model.name(),
            "no include matches join filter path, condition left unrewritten"
        );
        let alias = group.path.last().map_or("", String::as_str);
        render::aliased_condition(path.target(), alias, &group.filter)
    }

    /// Root condition selecting rows linked, through `chain`, to a target row
    /// matching `leaf` and every include filter along the way.
    async fn restrict(&self, chain: &[&CompiledInclude], leaf: &Filter) -> ServiceResult<Condition> {
        let mut carried: Option<Condition> = None;
        for (i, inc) in chain.iter().enumerate().rev() {
            let target = inc.target();
            let mut cond = render::condition(target, &inc.filter)?;
            if i == chain.len() - 1 {
                cond = cond.add(render::condition(target, leaf)?);
            }
            if let Some(inner) = carried.take() {
                cond = cond.add(inner);
            }
            carried = Some(self.link_condition(&inc.step, cond).await?);
        }
        Ok(carried.unwrap_or_else(Condition::all))
    }

    /// Condition on `step.source` matching rows linked to targets satisfying `target_cond`.
    async fn link_condition(
        &self,
        step: &AssociationStep,
        target_cond: Condition,
    ) -> ServiceResult<Condition> {
        match &step.link {
            Link::Direct {
                source_key,
                target_key,
            } => {
                let keys = key_select(&step.target, target_key, target_cond)?;
                self.key_restriction(&step.source, source_key, keys).await
            }
            Link::Through {
                through,
                source_key,
                through_source,
                through_target,
                target_key,
            } => {
                let target_keys = key_select(&step.target, target_key, target_cond)?;
                let through_scope = render::condition(
                    through,
                    &apply_scope(Scope::Default, Filter::all(), through),
                )?;
                let pair_cond = self
                    .key_restriction(through, through_target, target_keys)
                    .await?
                    .add(through_scope);
                let back_refs = key_select(through, through_source, pair_cond)?;
                self.key_restriction(&step.source, source_key, back_refs).await
            }
        }
    }

    async fn key_restriction(
        &self,
        model: &ModelDef,
        column: &str,
        mut keys: SelectStatement,
    ) -> ServiceResult<Condition> {
        apply_lock(&mut keys, self.lock);
        if self.split_sql {
            let values = render::fetch_keys(self.conn, &keys).await?;
            tracing::debug!(
                table = model.table(),
                column,
                keys = values.len(),
                "resolved join key set"
            );
            render::key_in(model, column, &values)
        } else {
            Ok(Condition::all().add(render::column_ref(model, column)?.in_subquery(keys)))
        }
    }
}
