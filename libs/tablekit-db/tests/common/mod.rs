#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

//! Shared fixture: an in-memory `SQLite` database with a small user/order/team
//! graph, a many-to-many tag relation and two ranked lists (nullable and
//! non-nullable rank column).

use std::sync::Arc;

use sea_orm::sea_query::{Alias, ColumnDef as SqlColumn, Index, Table, TableCreateStatement};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection};
use serde_json::Value as JsonValue;
use tablekit_db::{
    AssociationDef, AuditFields, ColumnDef, ColumnKind, ModelDef, Record, Schema, Service, Session,
};
use tablekit_security::SecurityContext;

pub const ACTOR: &str = "tester";

pub struct Fixture {
    pub db: DatabaseConnection,
    pub schema: Arc<Schema>,
}

impl Fixture {
    pub async fn new() -> Self {
        let mut opts = ConnectOptions::new("sqlite::memory:");
        opts.max_connections(1).sqlx_logging(false);
        let db = Database::connect(opts).await.expect("connect sqlite");
        create_tables(&db).await;
        seed(&db).await;
        Self {
            db,
            schema: Arc::new(schema()),
        }
    }

    pub fn service(&self, model: &str) -> Service {
        Service::new(Arc::clone(&self.schema), model).unwrap()
    }

    pub fn session(&self, model: &str) -> Session {
        self.service(model).session(actor())
    }
}

pub fn actor() -> SecurityContext {
    SecurityContext::builder().actor(ACTOR).build()
}

pub fn schema() -> Schema {
    let user = ModelDef::builder("User", "users")
        .column(ColumnDef::new("id", ColumnKind::Integer))
        .column(ColumnDef::new("name", ColumnKind::String).field("user_name").label("Name"))
        .column(ColumnDef::new("email", ColumnKind::String).nullable().label("Email"))
        .column(
            ColumnDef::new("status", ColumnKind::Integer)
                .label("Status")
                .value_label(1, "Active")
                .value_label(2, "Locked"),
        )
        .column(ColumnDef::new("teamId", ColumnKind::Integer).field("team_id").nullable())
        .column(ColumnDef::new("score", ColumnKind::Integer).label("Score"))
        .column(ColumnDef::new("createBy", ColumnKind::String).field("create_by").nullable())
        .column(ColumnDef::new("createTime", ColumnKind::Integer).field("create_time"))
        .column(ColumnDef::new("updateBy", ColumnKind::String).field("update_by").nullable())
        .column(ColumnDef::new("updateTime", ColumnKind::Integer).field("update_time"))
        .column(ColumnDef::new("deleteBy", ColumnKind::String).field("delete_by").nullable())
        .column(ColumnDef::new("deleteTime", ColumnKind::Integer).field("delete_time"))
        .primary_key(["id"])
        .unique(["email"])
        .audit(AuditFields {
            created_by: Some("createBy".to_owned()),
            created_at: Some("createTime".to_owned()),
            updated_by: Some("updateBy".to_owned()),
            updated_at: Some("updateTime".to_owned()),
            deleted_by: Some("deleteBy".to_owned()),
            deleted_at: Some("deleteTime".to_owned()),
        })
        .association(AssociationDef::has_many("orders", "Order", "userId"))
        .association(AssociationDef::belongs_to("team", "Team", "teamId"))
        .association(AssociationDef::belongs_to_many(
            "tags", "Tag", "UserTag", "userId", "tagId",
        ))
        .build()
        .unwrap();

    let order = ModelDef::builder("Order", "orders")
        .column(ColumnDef::new("id", ColumnKind::Integer))
        .column(ColumnDef::new("userId", ColumnKind::Integer).field("user_id"))
        .column(ColumnDef::new("amount", ColumnKind::Integer).label("Amount"))
        .column(ColumnDef::new("kind", ColumnKind::String))
        .column(ColumnDef::new("deleteTime", ColumnKind::Integer).field("delete_time"))
        .primary_key(["id"])
        .audit(AuditFields {
            deleted_at: Some("deleteTime".to_owned()),
            ..AuditFields::default()
        })
        .association(AssociationDef::belongs_to("user", "User", "userId"))
        .build()
        .unwrap();

    let team = ModelDef::builder("Team", "teams")
        .column(ColumnDef::new("id", ColumnKind::Integer))
        .column(ColumnDef::new("name", ColumnKind::String))
        .primary_key(["id"])
        .association(AssociationDef::has_many("members", "User", "teamId"))
        .build()
        .unwrap();

    let tag = ModelDef::builder("Tag", "tags")
        .column(ColumnDef::new("id", ColumnKind::Integer))
        .column(ColumnDef::new("name", ColumnKind::String))
        .primary_key(["id"])
        .build()
        .unwrap();

    let user_tag = ModelDef::builder("UserTag", "user_tags")
        .column(ColumnDef::new("userId", ColumnKind::Integer).field("user_id"))
        .column(ColumnDef::new("tagId", ColumnKind::Integer).field("tag_id"))
        .primary_key(["userId", "tagId"])
        .build()
        .unwrap();

    let task = ModelDef::builder("Task", "tasks")
        .column(ColumnDef::new("id", ColumnKind::Integer))
        .column(ColumnDef::new("groupId", ColumnKind::Integer).field("group_id"))
        .column(ColumnDef::new("title", ColumnKind::String))
        .column(ColumnDef::new("rank", ColumnKind::Integer).nullable())
        .primary_key(["id"])
        .rank("rank")
        .build()
        .unwrap();

    // Same shape as `Task` but the rank is non-nullable: `0` marks unranked rows.
    let step = ModelDef::builder("Step", "steps")
        .column(ColumnDef::new("id", ColumnKind::Integer))
        .column(ColumnDef::new("groupId", ColumnKind::Integer).field("group_id"))
        .column(ColumnDef::new("title", ColumnKind::String))
        .column(ColumnDef::new("position", ColumnKind::Integer))
        .primary_key(["id"])
        .rank("position")
        .build()
        .unwrap();

    Schema::new([user, order, team, tag, user_tag, task, step]).unwrap()
}

fn id_table(name: &str) -> TableCreateStatement {
    Table::create()
        .table(Alias::new(name))
        .col(
            SqlColumn::new(Alias::new("id"))
                .integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .to_owned()
}

fn text(name: &str) -> SqlColumn {
    SqlColumn::new(Alias::new(name)).string().to_owned()
}

fn int(name: &str) -> SqlColumn {
    SqlColumn::new(Alias::new(name)).integer().to_owned()
}

async fn create_tables(db: &DatabaseConnection) {
    let users = id_table("users")
        .col(text("user_name").not_null())
        .col(text("email").null())
        .col(int("status").not_null().default(1))
        .col(int("team_id").null())
        .col(int("score").not_null().default(0))
        .col(text("create_by").null())
        .col(int("create_time").not_null().default(0))
        .col(text("update_by").null())
        .col(int("update_time").not_null().default(0))
        .col(text("delete_by").null())
        .col(int("delete_time").not_null().default(0))
        .to_owned();
    let orders = id_table("orders")
        .col(int("user_id").not_null())
        .col(int("amount").not_null())
        .col(text("kind").not_null())
        .col(int("delete_time").not_null().default(0))
        .to_owned();
    let teams = id_table("teams").col(text("name").not_null()).to_owned();
    let tags = id_table("tags").col(text("name").not_null()).to_owned();
    let user_tags = Table::create()
        .table(Alias::new("user_tags"))
        .col(int("user_id").not_null())
        .col(int("tag_id").not_null())
        .primary_key(
            Index::create()
                .col(Alias::new("user_id"))
                .col(Alias::new("tag_id")),
        )
        .to_owned();
    let tasks = id_table("tasks")
        .col(int("group_id").not_null())
        .col(text("title").not_null())
        .col(int("rank").null())
        .to_owned();
    let steps = id_table("steps")
        .col(int("group_id").not_null())
        .col(text("title").not_null())
        .col(int("position").not_null().default(0))
        .to_owned();

    let backend = db.get_database_backend();
    for stmt in [users, orders, teams, tags, user_tags, tasks, steps] {
        db.execute(backend.build(&stmt)).await.expect("create table");
    }
}

const SEED: &[&str] = &[
    "INSERT INTO teams (id, name) VALUES (1, 'Alpha'), (2, 'Beta')",
    "INSERT INTO users (id, user_name, email, status, team_id, score, create_time, update_time, delete_by, delete_time) VALUES \
     (1, 'John Smith', 'john@x', 1, 1, 10, 100, 0, NULL, 0), \
     (2, 'Anna Smithson', 'anna@x', 2, 2, 20, 200, 0, NULL, 0), \
     (3, 'Bob Stone', 'bob@x', 1, 1, 30, 300, 0, NULL, 0), \
     (4, 'Old Smith', 'old@x', 1, 2, 40, 50, 450, 'admin', 500), \
     (5, 'Carl Blacksmith', 'carl@x', 2, NULL, 50, 400, 0, NULL, 0)",
    "INSERT INTO orders (id, user_id, amount, kind, delete_time) VALUES \
     (1, 1, 100, 'web', 0), (2, 1, 250, 'shop', 0), (3, 2, 75, 'web', 0), \
     (4, 3, 500, 'web', 0), (5, 3, 900, 'shop', 600), (6, 4, 60, 'web', 0)",
    "INSERT INTO tags (id, name) VALUES (1, 'vip'), (2, 'new')",
    "INSERT INTO user_tags (user_id, tag_id) VALUES (1, 1), (2, 2), (3, 1)",
    "INSERT INTO tasks (id, group_id, title, rank) VALUES \
     (1, 1, 'a', 1), (2, 1, 'b', 2), (3, 1, 'c', 3), (4, 1, 'd', 4), (5, 1, 'e', 5), \
     (6, 1, 'f', NULL), (7, 2, 'g', 1), (8, 2, 'h', 2)",
    "INSERT INTO steps (id, group_id, title, position) VALUES \
     (1, 1, 'a', 1), (2, 1, 'b', 2), (3, 1, 'c', 3), (4, 1, 'd', 4), (5, 1, 'e', 5), \
     (6, 1, 'f', 0), (7, 2, 'g', 1), (8, 2, 'h', 2)",
];

async fn seed(db: &DatabaseConnection) {
    for sql in SEED {
        db.execute_unprepared(sql).await.expect("seed");
    }
}

/// Integer ids of `rows`, in order.
pub fn ids(rows: &[Record]) -> Vec<i64> {
    rows.iter()
        .map(|r| r.get("id").and_then(JsonValue::as_i64).unwrap())
        .collect()
}

/// Sorted integer ids of `rows`.
pub fn id_set(rows: &[Record]) -> Vec<i64> {
    let mut out = ids(rows);
    out.sort_unstable();
    out
}

pub fn key(id: i64) -> Record {
    [("id".to_owned(), JsonValue::from(id))].into_iter().collect()
}
