//! Rendering of filters, projections and orderings into `sea_query` statements.
//!
//! Every identifier goes through the model metadata: logical names are mapped
//! to storage columns and qualified with the table name before they reach SQL.

use sea_orm::sea_query::{
    Alias, Condition, Expr, LikeExpr, Order, Query, SelectStatement, SimpleExpr,
    SubQueryStatement,
};
use sea_orm::{ConnectionTrait, DbBackend, FromQueryResult, JsonValue, Statement};

use crate::config::ServiceConfig;
use crate::error::ServiceResult;
use crate::filter::{FieldPath, Filter, Op};
use crate::model::{ColumnDef, ModelDef};
use crate::value::{Record, display_value, from_db, loose_value, to_sea_value};

use super::LockMode;
use super::sort::{Direction, OrderTerm};

/// Qualified reference to a column of `model`.
pub fn column_expr(model: &ModelDef, column: &ColumnDef) -> Expr {
    Expr::col((Alias::new(model.table()), Alias::new(column.storage())))
}

/// Qualified reference by logical name.
pub fn column_ref(model: &ModelDef, name: &str) -> ServiceResult<Expr> {
    let column = model.resolve_column(name)?;
    Ok(column_expr(model, column))
}

/// `WHERE false`.
pub fn deny_all() -> Condition {
    Condition::all().add(Expr::value(false))
}

/// Render a filter whose leaves are columns of `model`.
///
/// Join-qualified leaves are emitted as literal `"alias"."column"` references
/// without resolution; they only make sense inside a statement that joins that
/// alias, and otherwise fail at the database.
pub fn condition(model: &ModelDef, filter: &Filter) -> ServiceResult<Condition> {
    qualified(model, model.table(), filter)
}

/// Render a filter on columns of `model` qualified by `alias` instead of the
/// table name, with storage column names.
pub fn aliased_condition(model: &ModelDef, alias: &str, filter: &Filter) -> ServiceResult<Condition> {
    qualified(model, alias, filter)
}

fn qualified(model: &ModelDef, qualifier: &str, filter: &Filter) -> ServiceResult<Condition> {
    Ok(match filter {
        Filter::And(items) => {
            let mut cond = Condition::all();
            for item in items {
                cond = cond.add(qualified(model, qualifier, item)?);
            }
            cond
        }
        Filter::Or(items) if items.is_empty() => deny_all(),
        Filter::Or(items) => {
            let mut cond = Condition::any();
            for item in items {
                cond = cond.add(qualified(model, qualifier, item)?);
            }
            cond
        }
        Filter::Not(inner) if inner.is_empty() => deny_all(),
        Filter::Not(inner) => qualified(model, qualifier, inner)?.not(),
        Filter::Cmp { field, op, value } => leaf(model, qualifier, field, *op, value)?,
    })
}

fn leaf(
    model: &ModelDef,
    qualifier: &str,
    field: &FieldPath,
    op: Op,
    value: &JsonValue,
) -> ServiceResult<Condition> {
    if field.is_joined() {
        let alias = field.path.last().map_or("", String::as_str);
        let expr = Expr::col((Alias::new(alias), Alias::new(&field.column)));
        return try_compare(expr, op, value, &mut |v| Ok(loose_value(v)));
    }
    let column = model.resolve_column(&field.column)?;
    let expr = Expr::col((Alias::new(qualifier), Alias::new(column.storage())));
    let mut bind = |v: &JsonValue| to_sea_value(column, v);
    try_compare(expr, op, value, &mut bind)
}

fn try_compare(
    expr: Expr,
    op: Op,
    value: &JsonValue,
    bind: &mut dyn FnMut(&JsonValue) -> ServiceResult<sea_orm::Value>,
) -> ServiceResult<Condition> {
    let simple: SimpleExpr = match (op, value) {
        (Op::Eq, JsonValue::Null) => expr.is_null(),
        (Op::Eq, v) => expr.eq(bind(v)?),
        (Op::Like, v) => expr.like(LikeExpr::new(display_value(v)).escape('\\')),
        (Op::Gt, v) => expr.gt(bind(v)?),
        (Op::Gte, v) => expr.gte(bind(v)?),
        (Op::Lt, v) => expr.lt(bind(v)?),
        (Op::Lte, v) => expr.lte(bind(v)?),
        (Op::In, JsonValue::Array(items)) => return in_list(expr, items, bind),
        (Op::In, JsonValue::Null) => expr.is_null(),
        (Op::In, v) => expr.eq(bind(v)?),
    };
    Ok(Condition::all().add(simple))
}

/// `IN` over a value list. Nulls are matched with `IS NULL`; an empty list matches nothing.
fn in_list(
    expr: Expr,
    items: &[JsonValue],
    bind: &mut dyn FnMut(&JsonValue) -> ServiceResult<sea_orm::Value>,
) -> ServiceResult<Condition> {
    let has_null = items.iter().any(JsonValue::is_null);
    let values = items
        .iter()
        .filter(|v| !v.is_null())
        .map(|v| bind(v))
        .collect::<ServiceResult<Vec<_>>>()?;
    Ok(match (values.is_empty(), has_null) {
        (true, false) => deny_all(),
        (true, true) => Condition::all().add(expr.is_null()),
        (false, false) => Condition::all().add(expr.is_in(values)),
        (false, true) => Condition::any()
            .add(expr.clone().is_in(values))
            .add(expr.is_null()),
    })
}

/// Key-set restriction `column IN (values)` with values coerced to the column type.
pub fn key_in(model: &ModelDef, column: &str, keys: &[JsonValue]) -> ServiceResult<Condition> {
    let column = model.resolve_column(column)?;
    let expr = column_expr(model, column);
    in_list(expr, keys, &mut |v| to_sea_value(column, v))
}

/// `SELECT <projection> FROM <table>`; an empty projection selects every column.
pub fn select(model: &ModelDef, attributes: &[String]) -> ServiceResult<SelectStatement> {
    let mut stmt = Query::select();
    stmt.from(Alias::new(model.table()));
    if attributes.is_empty() {
        for column in model.columns() {
            stmt.expr_as(column_expr(model, column), Alias::new(column.name()));
        }
    } else {
        for name in attributes {
            let column = model.resolve_column(name)?;
            stmt.expr_as(column_expr(model, column), Alias::new(column.name()));
        }
    }
    Ok(stmt)
}

/// Single-column key query:
/// `SELECT DISTINCT <column> AS k FROM <table> WHERE <cond> AND <column> IS NOT NULL`.
///
/// Null keys never link rows, and a null inside `NOT IN (SELECT ...)` would
/// make the whole predicate unknown.
pub fn key_select(model: &ModelDef, column: &str, cond: Condition) -> ServiceResult<SelectStatement> {
    let key = column_ref(model, column)?;
    let mut stmt = Query::select();
    stmt.distinct()
        .expr_as(key.clone(), Alias::new(KEY_ALIAS))
        .from(Alias::new(model.table()))
        .cond_where(cond)
        .and_where(key.is_not_null());
    Ok(stmt)
}

pub const KEY_ALIAS: &str = "k";

pub fn apply_lock(stmt: &mut SelectStatement, lock: Option<LockMode>) {
    if let Some(lock) = lock {
        stmt.lock(lock.into());
    }
}

fn sea_order(direction: Direction) -> Order {
    match direction {
        Direction::Asc => Order::Asc,
        Direction::Desc => Order::Desc,
    }
}

fn quote(backend: DbBackend, ident: &str) -> String {
    let q = match backend {
        DbBackend::MySql => '`',
        DbBackend::Postgres | DbBackend::Sqlite => '"',
    };
    let escaped = ident.replace(q, &format!("{q}{q}"));
    format!("{q}{escaped}{q}")
}

/// Append an ordering term to `stmt`.
pub fn order_by(
    stmt: &mut SelectStatement,
    model: &ModelDef,
    term: &OrderTerm,
    backend: DbBackend,
    config: &ServiceConfig,
) -> ServiceResult<()> {
    match term {
        OrderTerm::Column { column, direction } => {
            stmt.order_by_expr(column_ref(model, column)?.into(), sea_order(*direction));
        }
        OrderTerm::Locale {
            column,
            locale,
            direction,
        } => {
            let storage = model.storage_name(column)?;
            let sql = locale_order(backend, config, model.table(), storage, locale);
            stmt.order_by_expr(Expr::cust(sql), sea_order(*direction));
        }
        OrderTerm::Path {
            steps,
            column,
            locale,
            direction,
        } => {
            let collate = locale.as_deref().map(|l| (backend, config, l));
            let expr = path_value(model, steps, column, collate)?;
            stmt.order_by_expr(expr, sea_order(*direction));
        }
    }
    Ok(())
}

/// The configured locale ordering around `qualifier.storage`.
fn locale_order(
    backend: DbBackend,
    config: &ServiceConfig,
    qualifier: &str,
    storage: &str,
    locale: &str,
) -> String {
    let qualified = format!("{}.{}", quote(backend, qualifier), quote(backend, storage));
    config
        .locale_order_template
        .replace("{column}", &qualified)
        .replace("{locale}", locale)
}

/// Correlated scalar subquery yielding `column` of the row reached from the
/// current `model` row through single-valued `steps`.
fn path_value(
    model: &ModelDef,
    steps: &[crate::model::AssociationStep],
    column: &str,
    collate: Option<(DbBackend, &ServiceConfig, &str)>,
) -> ServiceResult<SimpleExpr> {
    let first = steps
        .first()
        .ok_or_else(|| crate::error::ServiceError::invalid_options("empty sort path"))?;
    let mut link: SimpleExpr = column_ref(model, first.link.source_key())?.into();

    for (i, step) in steps.iter().enumerate() {
        let alias = Alias::new(format!("s{i}"));
        let hop = &step.target;
        let selected = match steps.get(i + 1) {
            Some(next) => next.link.source_key(),
            None => column,
        };
        let storage = hop.storage_name(selected)?;
        let projected = match collate {
            Some((backend, config, locale)) if i + 1 == steps.len() => {
                Expr::cust(locale_order(backend, config, &format!("s{i}"), storage, locale))
            }
            _ => Expr::col((alias.clone(), Alias::new(storage))).into(),
        };
        let mut sub = Query::select();
        sub.expr(projected)
            .from_as(Alias::new(hop.table()), alias.clone())
            .and_where(
                Expr::col((alias.clone(), Alias::new(hop.storage_name(step.link.target_key())?)))
                    .eq(link),
            )
            .limit(1);
        for (cond_col, value) in step.association.conditions() {
            let c = hop.resolve_column(cond_col)?;
            sub.and_where(
                Expr::col((alias.clone(), Alias::new(c.storage()))).eq(to_sea_value(c, value)?),
            );
        }
        link = SimpleExpr::SubQuery(
            None,
            Box::new(SubQueryStatement::SelectStatement(sub)),
        );
    }
    Ok(link)
}

/// Execute `stmt` and read rows keyed by the logical column aliases.
pub async fn fetch<C: ConnectionTrait>(
    conn: &C,
    model: &ModelDef,
    stmt: &SelectStatement,
) -> ServiceResult<Vec<Record>> {
    let built = conn.get_database_backend().build(stmt);
    let rows = JsonValue::find_by_statement(built).all(conn).await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| match row {
            JsonValue::Object(map) => Some(normalize(model, map)),
            _ => None,
        })
        .collect())
}

fn normalize(model: &ModelDef, map: Record) -> Record {
    map.into_iter()
        .map(|(k, v)| {
            let v = match model.column(&k) {
                Some(c) => from_db(c.kind(), v),
                None => v,
            };
            (k, v)
        })
        .collect()
}

/// Execute a key query and return the distinct non-null key values.
pub async fn fetch_keys<C: ConnectionTrait>(
    conn: &C,
    stmt: &SelectStatement,
) -> ServiceResult<Vec<JsonValue>> {
    let built = conn.get_database_backend().build(stmt);
    let rows = JsonValue::find_by_statement(built).all(conn).await?;
    let mut keys: Vec<JsonValue> = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(k) = row.get(KEY_ALIAS).filter(|k| !k.is_null())
            && !keys.contains(k)
        {
            keys.push(k.clone());
        }
    }
    Ok(keys)
}

/// `SELECT COUNT(*)` over `model` with `cond`.
pub async fn count<C: ConnectionTrait>(
    conn: &C,
    model: &ModelDef,
    cond: Condition,
    lock: Option<LockMode>,
) -> ServiceResult<u64> {
    let mut stmt = Query::select();
    stmt.expr_as(Expr::cust("COUNT(*)"), Alias::new("count"))
        .from(Alias::new(model.table()))
        .cond_where(cond);
    apply_lock(&mut stmt, lock);
    let built: Statement = conn.get_database_backend().build(&stmt);
    let n = match conn.query_one(built).await? {
        Some(row) => row.try_get::<i64>("", "count")?,
        None => 0,
    };
    Ok(u64::try_from(n).unwrap_or_default())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::model::{AssociationDef, ColumnKind, Schema};
    use sea_orm::sea_query::{QueryStatementWriter, SqliteQueryBuilder};

    fn schema() -> Schema {
        let user = ModelDef::builder("User", "users")
            .column(ColumnDef::new("id", ColumnKind::Integer))
            .column(ColumnDef::new("name", ColumnKind::String).field("user_name"))
            .column(ColumnDef::new("teamId", ColumnKind::Integer).field("team_id").nullable())
            .primary_key(["id"])
            .association(AssociationDef::belongs_to("team", "Team", "teamId"))
            .build()
            .unwrap();
        let team = ModelDef::builder("Team", "teams")
            .column(ColumnDef::new("id", ColumnKind::Integer))
            .column(ColumnDef::new("title", ColumnKind::String))
            .primary_key(["id"])
            .build()
            .unwrap();
        Schema::new([user, team]).unwrap()
    }

    fn sql(model: &ModelDef, filter: &Filter) -> String {
        let mut stmt = Query::select();
        stmt.expr(Expr::val(1))
            .from(Alias::new(model.table()))
            .cond_where(condition(model, filter).unwrap());
        stmt.to_string(SqliteQueryBuilder)
    }

    #[test]
    fn test_storage_names_are_used() {
        let schema = schema();
        let user = schema.model("User").unwrap();
        let s = sql(&user, &Filter::eq("name", "bob"));
        assert!(s.contains(r#""users"."user_name" = 'bob'"#), "{s}");
    }

    #[test]
    fn test_null_and_in_rendering() {
        let schema = schema();
        let user = schema.model("User").unwrap();
        assert!(sql(&user, &Filter::is_null("teamId")).contains(r#""users"."team_id" IS NULL"#));
        let s = sql(&user, &Filter::in_list("id", [1, 2]));
        assert!(s.contains(r#""users"."id" IN (1, 2)"#), "{s}");
        let s = sql(&user, &Filter::in_list("id", Vec::<i64>::new()));
        assert!(!s.contains("IN ("), "{s}");
    }

    #[test]
    fn test_like_is_escaped() {
        let schema = schema();
        let user = schema.model("User").unwrap();
        let s = sql(&user, &Filter::like("name", "%a\\_b%"));
        assert!(s.contains("LIKE"), "{s}");
        assert!(s.contains("ESCAPE"), "{s}");
    }

    #[test]
    fn test_unknown_column_is_an_error() {
        let schema = schema();
        let user = schema.model("User").unwrap();
        assert!(condition(&user, &Filter::eq("nope", 1)).is_err());
    }

    #[test]
    fn test_joined_leaf_left_as_reference() {
        let schema = schema();
        let user = schema.model("User").unwrap();
        let s = sql(&user, &Filter::eq("team.title", "x"));
        assert!(s.contains(r#""team"."title" = 'x'"#), "{s}");
    }

    #[test]
    fn test_path_order_is_correlated_subquery() {
        let schema = schema();
        let user = schema.model("User").unwrap();
        let path = crate::model::AssociationPath::resolve(&schema, &user, "team").unwrap();
        let mut stmt = select(&user, &["id".to_owned()]).unwrap();
        order_by(
            &mut stmt,
            &user,
            &OrderTerm::Path {
                steps: path.steps().to_vec(),
                column: "title".to_owned(),
                locale: None,
                direction: Direction::Desc,
            },
            DbBackend::Sqlite,
            &ServiceConfig::default(),
        )
        .unwrap();
        let s = stmt.to_string(SqliteQueryBuilder);
        assert!(s.contains(r#"FROM "teams" AS "s0""#), "{s}");
        assert!(s.contains(r#""s0"."id" = "users"."team_id""#), "{s}");
        assert!(s.ends_with("DESC"), "{s}");
    }

    #[test]
    fn test_locale_order_uses_template() {
        let schema = schema();
        let user = schema.model("User").unwrap();
        let mut stmt = select(&user, &[]).unwrap();
        order_by(
            &mut stmt,
            &user,
            &OrderTerm::Locale {
                column: "name".to_owned(),
                locale: "gbk".to_owned(),
                direction: Direction::Asc,
            },
            DbBackend::MySql,
            &ServiceConfig::default(),
        )
        .unwrap();
        let s = stmt.to_string(sea_orm::sea_query::MysqlQueryBuilder);
        assert!(s.contains("CONVERT(`users`.`user_name` USING gbk) ASC"), "{s}");
    }

    #[test]
    fn test_path_order_with_locale() {
        let schema = schema();
        let user = schema.model("User").unwrap();
        let path = crate::model::AssociationPath::resolve(&schema, &user, "team").unwrap();
        let mut stmt = select(&user, &["id".to_owned()]).unwrap();
        order_by(
            &mut stmt,
            &user,
            &OrderTerm::Path {
                steps: path.steps().to_vec(),
                column: "title".to_owned(),
                locale: Some("gbk".to_owned()),
                direction: Direction::Asc,
            },
            DbBackend::MySql,
            &ServiceConfig::default(),
        )
        .unwrap();
        let s = stmt.to_string(sea_orm::sea_query::MysqlQueryBuilder);
        assert!(s.contains("SELECT CONVERT(`s0`.`title` USING gbk) FROM `teams` AS `s0`"), "{s}");
    }

    #[test]
    fn test_aliased_condition_uses_storage_names() {
        let schema = schema();
        let user = schema.model("User").unwrap();
        let mut stmt = Query::select();
        stmt.expr(Expr::val(1)).from(Alias::new("users")).cond_where(
            aliased_condition(&user, "author", &Filter::eq("name", "bob")).unwrap(),
        );
        let s = stmt.to_string(SqliteQueryBuilder);
        assert!(s.contains(r#""author"."user_name" = 'bob'"#), "{s}");
        assert!(aliased_condition(&user, "author", &Filter::eq("nope", 1)).is_err());
    }

    #[test]
    fn test_key_select_skips_null_keys() {
        let schema = schema();
        let user = schema.model("User").unwrap();
        let stmt = key_select(&user, "teamId", Condition::all()).unwrap();
        let s = stmt.to_string(SqliteQueryBuilder);
        assert!(s.contains(r#""users"."team_id" IS NOT NULL"#), "{s}");
    }
}
