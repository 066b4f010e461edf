//! Batched eager loading of the include graph.
//!
//! One query per include node: children are fetched with `IN` over the
//! parents' link keys, then attached under the include alias (object or null
//! for single-valued associations, array otherwise).

use sea_orm::ConnectionTrait;
use sea_orm::sea_query::{Alias, Condition, Query};
use serde_json::Value as JsonValue;

use crate::config::ServiceConfig;
use crate::error::ServiceResult;
use crate::filter::Filter;
use crate::model::{Link, ModelDef};
use crate::query::render::{self, apply_lock, column_ref};
use crate::query::{CompiledInclude, LockMode};
use crate::scope::{Scope, apply_scope};
use crate::value::{Record, same_key};

/// Attach every include in `includes` onto `parents`.
pub async fn load_includes<C: ConnectionTrait>(
    conn: &C,
    config: &ServiceConfig,
    includes: &[CompiledInclude],
    parents: &mut [Record],
    lock: Option<LockMode>,
) -> ServiceResult<()> {
    for inc in includes {
        load_one(conn, config, inc, parents, lock).await?;
    }
    Ok(())
}

async fn load_one<C: ConnectionTrait>(
    conn: &C,
    config: &ServiceConfig,
    inc: &CompiledInclude,
    parents: &mut [Record],
    lock: Option<LockMode>,
) -> ServiceResult<()> {
    let source_key = inc.step.link.source_key();
    let parent_keys = distinct_keys(parents.iter().filter_map(|p| p.get(source_key)));

    if parent_keys.is_empty() {
        for parent in parents.iter_mut() {
            attach(parent, inc, Vec::new());
        }
        return Ok(());
    }

    let target = inc.target();
    let target_key = inc.step.link.target_key();

    // For join tables: (source key, target key) pairs of the parents.
    let pairs = match &inc.step.link {
        Link::Direct { .. } => None,
        Link::Through {
            through,
            through_source,
            through_target,
            ..
        } => Some(
            load_pairs(
                conn,
                through,
                through_source,
                through_target,
                &parent_keys,
                lock,
            )
            .await?,
        ),
    };

    let target_keys = match &pairs {
        Some(pairs) => distinct_keys(pairs.iter().map(|(_, t)| t)),
        None => parent_keys,
    };
    let mut rows = if target_keys.is_empty() {
        Vec::new()
    } else {
        let mut stmt = render::select(target, &inc.attributes)?;
        stmt.cond_where(
            Condition::all()
                .add(render::key_in(target, target_key, &target_keys)?)
                .add(render::condition(target, &inc.filter)?),
        );
        let backend = conn.get_database_backend();
        for term in &inc.order {
            render::order_by(&mut stmt, target, term, backend, config)?;
        }
        apply_lock(&mut stmt, lock);
        render::fetch(conn, target, &stmt).await?
    };
    tracing::debug!(
        include = %inc.alias,
        table = target.table(),
        rows = rows.len(),
        "loaded include"
    );

    if !inc.children.is_empty() && !rows.is_empty() {
        Box::pin(load_includes(conn, config, &inc.children, &mut rows, lock)).await?;
    }

    for parent in parents.iter_mut() {
        let Some(key) = parent.get(source_key).cloned() else {
            attach(parent, inc, Vec::new());
            continue;
        };
        let matched: Vec<Record> = match &pairs {
            None => rows
                .iter()
                .filter(|r| r.get(target_key).is_some_and(|v| same_key(v, &key)))
                .cloned()
                .collect(),
            Some(pairs) => {
                let linked: Vec<&JsonValue> = pairs
                    .iter()
                    .filter(|(s, _)| same_key(s, &key))
                    .map(|(_, t)| t)
                    .collect();
                rows.iter()
                    .filter(|r| {
                        r.get(target_key)
                            .is_some_and(|v| linked.iter().any(|t| same_key(v, t)))
                    })
                    .cloned()
                    .collect()
            }
        };
        attach(parent, inc, matched);
    }
    Ok(())
}

async fn load_pairs<C: ConnectionTrait>(
    conn: &C,
    through: &ModelDef,
    through_source: &str,
    through_target: &str,
    parent_keys: &[JsonValue],
    lock: Option<LockMode>,
) -> ServiceResult<Vec<(JsonValue, JsonValue)>> {
    let mut stmt = Query::select();
    stmt.expr_as(column_ref(through, through_source)?, Alias::new("s"))
        .expr_as(column_ref(through, through_target)?, Alias::new("t"))
        .from(Alias::new(through.table()))
        .cond_where(
            Condition::all()
                .add(render::key_in(through, through_source, parent_keys)?)
                .add(render::condition(
                    through,
                    &apply_scope(Scope::Default, Filter::all(), through),
                )?),
        );
    apply_lock(&mut stmt, lock);
    let built = conn.get_database_backend().build(&stmt);
    let rows = <JsonValue as sea_orm::FromQueryResult>::find_by_statement(built)
        .all(conn)
        .await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let s = row.get("s").filter(|v| !v.is_null())?.clone();
            let t = row.get("t").filter(|v| !v.is_null())?.clone();
            Some((s, t))
        })
        .collect())
}

fn distinct_keys<'a>(values: impl Iterator<Item = &'a JsonValue>) -> Vec<JsonValue> {
    let mut out: Vec<JsonValue> = Vec::new();
    for v in values {
        if !v.is_null() && !out.iter().any(|o| same_key(o, v)) {
            out.push(v.clone());
        }
    }
    out
}

fn attach(parent: &mut Record, inc: &CompiledInclude, mut matched: Vec<Record>) {
    let value = if inc.is_single() {
        if matched.is_empty() {
            JsonValue::Null
        } else {
            JsonValue::Object(matched.swap_remove(0))
        }
    } else {
        JsonValue::Array(matched.into_iter().map(JsonValue::Object).collect())
    };
    parent.insert(inc.alias.clone(), value);
}

/// Flatten loaded single-valued includes into `alias.field` keys (recursively,
/// so a nested one becomes `outer.inner.field`). Multi-valued includes stay arrays.
pub fn flatten_plain(record: &mut Record, includes: &[CompiledInclude]) {
    for inc in includes.iter().filter(|i| i.is_single()) {
        let Some(JsonValue::Object(mut nested)) = record.remove(&inc.alias) else {
            continue;
        };
        flatten_plain(&mut nested, &inc.children);
        for (k, v) in nested {
            record.insert(format!("{}.{k}", inc.alias), v);
        }
    }
}
