#![allow(clippy::unwrap_used, clippy::expect_used)]
#![cfg(feature = "sqlite")]

//! Mutations against `SQLite`: stamping, uniqueness, diffs, soft delete,
//! set-reconciliation, counters and the audit log.

mod common;

use std::sync::Arc;

use common::{ACTOR, Fixture, actor, id_set, ids};
use serde_json::{Value as JsonValue, json};
use tablekit_db::{
    AuditConfig, AuditKind, DiffKind, FieldDiff, MutationResult, QueryOptions, Record, Request,
    Service, ServiceConfig, ServiceError,
};

fn rec(v: &JsonValue) -> Record {
    v.as_object().unwrap().clone()
}

fn field<'a>(diffs: &'a [FieldDiff], name: &str) -> &'a FieldDiff {
    diffs
        .iter()
        .find(|d| d.field == name)
        .unwrap_or_else(|| panic!("no diff for {name}"))
}

async fn count_all(fx: &Fixture, model: &str) -> u64 {
    let opts = QueryOptions::builder().scope("all").build();
    fx.session(model)
        .count(&fx.db, &Request::new(), &opts)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_add_stamps_and_fills_from_params() {
    let fx = Fixture::new().await;
    let users = fx.session("User");

    let req = Request::new().param("teamId", 2).body(json!({
        "name": "Dana",
        "email": "dana@x",
        "score": 5,
        "bogus": true
    }));
    let row = users.add(&fx.db, &req, &QueryOptions::default()).await.unwrap();

    assert_eq!(row["id"], json!(6));
    assert_eq!(row["teamId"], json!(2));
    assert_eq!(row["status"], json!(1));
    assert_eq!(row["createBy"], json!(ACTOR));
    assert!(row["createTime"].as_i64().unwrap() > 0);
    assert_eq!(row["deleteTime"], json!(0));
    assert_eq!(row["deleteBy"], JsonValue::Null);

    let log = users.log_infos();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].kind, AuditKind::Add);
    assert_eq!(log[0].method, "add");
    assert_eq!(log[0].model, "User");
    assert!(log[0].before.is_empty());
    assert_eq!(log[0].after.len(), 1);
}

#[tokio::test]
async fn test_add_rejects_duplicates_before_writing() {
    let fx = Fixture::new().await;
    let users = fx.session("User");

    let req = Request::new().body(json!({"name": "Johnny", "email": "john@x"}));
    let err = users
        .add(&fx.db, &req, &QueryOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_duplicate());
    assert!(err.to_string().contains("Email: john@x"), "{err}");
    assert_eq!(count_all(&fx, "User").await, 5);
    assert!(users.log_infos().is_empty());
}

#[tokio::test]
async fn test_soft_deleted_rows_do_not_collide() {
    let fx = Fixture::new().await;
    let users = fx.session("User");

    let req = Request::new().body(json!({"name": "New Old", "email": "old@x"}));
    let row = users.add(&fx.db, &req, &QueryOptions::default()).await.unwrap();
    assert_eq!(row["email"], json!("old@x"));
}

#[tokio::test]
async fn test_add_multi_checks_the_whole_batch() {
    let fx = Fixture::new().await;
    let users = fx.session("User");

    let req = Request::new().body(json!([
        {"name": "A", "email": "a@x"},
        {"name": "B", "email": "a@x"}
    ]));
    let err = users
        .add_multi(&fx.db, &req, &QueryOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_duplicate());
    assert_eq!(count_all(&fx, "User").await, 5);

    let req = Request::new().body(json!([
        {"name": "A", "email": "a@x"},
        {"name": "B", "email": "b@x"}
    ]));
    let rows = users
        .add_multi(&fx.db, &req, &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(ids(&rows), vec![6, 7]);
    assert_eq!(count_all(&fx, "User").await, 7);
}

#[tokio::test]
async fn test_edit_returns_diffs() {
    let fx = Fixture::new().await;
    let users = fx.session("User");

    let req = Request::new()
        .param("id", 1)
        .body(json!({"name": "John Smyth", "status": 2}));
    let opts = QueryOptions::builder().ret_diffs(true).build();
    let MutationResult::Diffs(report) = users.edit(&fx.db, &req, &opts).await.unwrap() else {
        panic!("expected diffs");
    };

    assert_eq!(report.diffs.len(), 1);
    let diffs = &report.diffs[0];
    let name = field(diffs, "name");
    assert_eq!(name.kind, DiffKind::Edit);
    assert_eq!(name.before, json!("John Smith"));
    assert_eq!(name.after, json!("John Smyth"));
    assert_eq!(field(diffs, "status").kind, DiffKind::Edit);
    // The update actor was unset before the edit.
    assert_eq!(field(diffs, "updateBy").kind, DiffKind::Add);
    assert!(diffs.iter().all(|d| d.field != "email"));

    assert_eq!(report.after[0]["name"], json!("John Smyth"));
    assert_eq!(report.after[0]["updateBy"], json!(ACTOR));
}

#[tokio::test]
async fn test_edit_diffs_rebuild_the_row() {
    let fx = Fixture::new().await;
    let users = fx.session("User");

    let req = Request::new()
        .param("id", 2)
        .body(json!({"name": "Anna Smith", "email": null, "status": 1, "score": 0}));
    let opts = QueryOptions::builder().ret_diffs(true).build();
    let MutationResult::Diffs(report) = users.edit(&fx.db, &req, &opts).await.unwrap() else {
        panic!("expected diffs");
    };

    let diffs = &report.diffs[0];
    let fields: Vec<&str> = diffs.iter().map(|d| d.field.as_str()).collect();
    assert_eq!(
        fields,
        vec!["name", "email", "status", "score", "updateBy", "updateTime"]
    );
    assert_eq!(field(diffs, "email").kind, DiffKind::Remove);
    assert_eq!(field(diffs, "score").kind, DiffKind::Remove);

    let mut rebuilt = report.before[0].clone();
    for d in diffs {
        rebuilt.insert(d.field.clone(), d.after.clone());
    }
    assert_eq!(rebuilt, report.after[0]);
}

#[tokio::test]
async fn test_edit_between_falsy_values_is_diffed() {
    let fx = Fixture::new().await;
    let users = fx.session("User");

    // User 5 has no team; 0 is a different falsy value.
    let req = Request::new().param("id", 5).body(json!({"teamId": 0}));
    let opts = QueryOptions::builder().ret_diffs(true).build();
    let MutationResult::Diffs(report) = users.edit(&fx.db, &req, &opts).await.unwrap() else {
        panic!("expected diffs");
    };
    let team = field(&report.diffs[0], "teamId");
    assert_eq!(team.kind, DiffKind::Edit);
    assert_eq!(team.before, JsonValue::Null);
    assert_eq!(team.after, json!(0));
}

#[tokio::test]
async fn test_edit_reports_affected_rows_by_default() {
    let fx = Fixture::new().await;
    let users = fx.session("User");

    let req = Request::new().param("status", 1).body(json!({"score": 0}));
    let out = users
        .edit(&fx.db, &req, &QueryOptions::default())
        .await
        .unwrap();
    // User 4 matches too but is soft-deleted.
    assert_eq!(out, MutationResult::Affected(2));
}

#[tokio::test]
async fn test_edit_without_known_columns_is_rejected() {
    let fx = Fixture::new().await;
    let users = fx.session("User");

    let req = Request::new().param("id", 1).body(json!({"nickname": "J"}));
    let err = users
        .edit(&fx.db, &req, &QueryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidOptions(_)));
}

#[tokio::test]
async fn test_edit_uniqueness() {
    let fx = Fixture::new().await;
    let users = fx.session("User");
    let opts = QueryOptions::default();

    // Another row already holds the value.
    let req = Request::new().param("id", 2).body(json!({"email": "john@x"}));
    assert!(users.edit(&fx.db, &req, &opts).await.unwrap_err().is_duplicate());

    // Rewriting a row's own value is fine.
    let req = Request::new().param("id", 1).body(json!({"email": "john@x"}));
    assert_eq!(users.edit(&fx.db, &req, &opts).await.unwrap().affected(), 1);

    // Two updated rows would end up equal.
    let req = Request::new().param("teamId", 1).body(json!({"email": "same@x"}));
    assert!(users.edit(&fx.db, &req, &opts).await.unwrap_err().is_duplicate());
}

#[tokio::test]
async fn test_fake_remove_stamps_and_hides() {
    let fx = Fixture::new().await;
    let users = fx.session("User");

    let opts = QueryOptions::builder()
        .fake(true)
        .fake_body(rec(&json!({"status": 2})))
        .build();
    let out = users
        .remove(&fx.db, &Request::new().param("id", 3), &opts)
        .await
        .unwrap();
    assert_eq!(out.affected(), 1);

    let hidden = users
        .info(&fx.db, &Request::new().param("id", 3), &QueryOptions::default())
        .await
        .unwrap();
    assert!(hidden.is_none());

    let deleted = QueryOptions::builder().scope("deleted").build();
    let out = users.list(&fx.db, &Request::new(), &deleted).await.unwrap();
    assert_eq!(id_set(out.rows()), vec![3, 4]);
    let row = out.rows().iter().find(|r| r["id"] == 3).unwrap();
    assert_eq!(row["deleteBy"], json!(ACTOR));
    assert!(row["deleteTime"].as_i64().unwrap() > 0);
    assert_eq!(row["status"], json!(2));

    assert_eq!(users.log_infos()[0].kind, AuditKind::Remove);
}

#[tokio::test]
async fn test_hard_remove_returns_removed_rows() {
    let fx = Fixture::new().await;
    let orders = fx.session("Order");

    let opts = QueryOptions::builder().ret_values(true).build();
    let out = orders
        .remove(&fx.db, &Request::new().param("id", 6), &opts)
        .await
        .unwrap();
    let MutationResult::Values(rows) = out else {
        panic!("expected values");
    };
    assert_eq!(ids(&rows), vec![6]);
    assert_eq!(rows[0]["amount"], json!(60));
    assert_eq!(count_all(&fx, "Order").await, 5);
}

#[tokio::test]
async fn test_fake_remove_needs_a_delete_marker() {
    let fx = Fixture::new().await;
    let teams = fx.session("Team");

    let opts = QueryOptions::builder().fake(true).build();
    let err = teams
        .remove(&fx.db, &Request::new().param("id", 1), &opts)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidOptions(_)));
}

#[tokio::test]
async fn test_set_reconciles_children() {
    let fx = Fixture::new().await;
    let orders = fx.session("Order");

    let req = Request::new().param("userId", 1).body(json!([
        {"id": 2, "amount": 300},
        {"amount": 42, "kind": "gift"}
    ]));
    let outcome = orders
        .set(&fx.db, &req, &QueryOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.added.len(), 1);
    assert_eq!(outcome.added[0]["userId"], json!(1));
    assert_eq!(outcome.added[0]["kind"], json!("gift"));
    assert_eq!(ids(&outcome.edited), vec![2]);
    assert_eq!(outcome.edited[0]["amount"], json!(300));
    assert_eq!(ids(&outcome.removed), vec![1]);

    let out = orders
        .list(&fx.db, &Request::new().param("userId", 1), &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(id_set(out.rows()), vec![2, 7]);
    // Other users' orders are untouched.
    assert_eq!(count_all(&fx, "Order").await, 6);

    let log = orders.log_infos();
    assert_eq!(log.len(), 3);
    assert!(log.iter().all(|r| r.kind == AuditKind::Set && r.method == "set"));
}

#[tokio::test]
async fn test_set_skips_unchanged_rows() {
    let fx = Fixture::new().await;
    let orders = fx.session("Order");

    let req = Request::new().param("userId", 2).body(json!([
        {"id": 3, "amount": 75, "kind": "web"}
    ]));
    let outcome = orders
        .set(&fx.db, &req, &QueryOptions::default())
        .await
        .unwrap();
    assert!(outcome.added.is_empty());
    assert!(outcome.edited.is_empty());
    assert!(outcome.removed.is_empty());
}

#[tokio::test]
async fn test_increase_and_decrease() {
    let fx = Fixture::new().await;
    let users = fx.session("User");
    let opts = QueryOptions::builder().ret_values(true).build();

    let req = Request::new().param("id", 1).body(json!({"score": 5}));
    let MutationResult::Values(rows) = users.increase(&fx.db, &req, &opts).await.unwrap() else {
        panic!("expected values");
    };
    assert_eq!(rows[0]["score"], json!(15));
    assert_eq!(rows[0]["updateBy"], json!(ACTOR));

    let req = Request::new().param("id", 2).body(json!({"score": 5}));
    let MutationResult::Values(rows) = users.decrease(&fx.db, &req, &opts).await.unwrap() else {
        panic!("expected values");
    };
    assert_eq!(rows[0]["score"], json!(15));

    let kinds: Vec<AuditKind> = users.log_infos().iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![AuditKind::Increase, AuditKind::Decrease]);
}

#[tokio::test]
async fn test_increase_validates_columns_and_amounts() {
    let fx = Fixture::new().await;
    let users = fx.session("User");
    let opts = QueryOptions::default();

    let req = Request::new().param("id", 1).body(json!({"name": 1}));
    let err = users.increase(&fx.db, &req, &opts).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidValue { .. }));

    let req = Request::new().param("id", 1).body(json!({"score": "x"}));
    let err = users.increase(&fx.db, &req, &opts).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidValue { .. }));
}

#[tokio::test]
async fn test_audit_messages_follow_config() {
    let fx = Fixture::new().await;
    let config = ServiceConfig {
        audit: AuditConfig {
            fields: vec!["name".to_owned(), "status".to_owned()],
            ..AuditConfig::default()
        },
        ..ServiceConfig::default()
    };
    let users = Service::builder(Arc::clone(&fx.schema), "User")
        .config(config)
        .build()
        .unwrap()
        .session(actor());

    let req = Request::new().param("id", 3).body(json!({"status": 2}));
    users
        .edit(&fx.db, &req, &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(
        users.log_messages(),
        vec!["[3] Status: \"Active\" -> \"Locked\"".to_owned()]
    );

    let drained = users.take_log_infos();
    assert_eq!(drained.len(), 1);
    assert!(users.log_infos().is_empty());
}

#[tokio::test]
async fn test_audit_can_be_disabled_per_call() {
    let fx = Fixture::new().await;
    let users = fx.session("User");

    let opts = QueryOptions::builder().audit(false).build();
    let req = Request::new().param("id", 3).body(json!({"score": 1}));
    users.edit(&fx.db, &req, &opts).await.unwrap();
    assert!(users.log_infos().is_empty());
}

#[tokio::test]
async fn test_transaction_rolls_back_mutations() {
    use sea_orm::TransactionTrait;

    let fx = Fixture::new().await;
    let users = fx.session("User");

    let tx = fx.db.begin().await.unwrap();
    let req = Request::new().param("id", 5);
    users
        .remove(&tx, &req, &QueryOptions::default())
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(count_all(&fx, "User").await, 5);
}
