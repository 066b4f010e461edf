#![allow(clippy::unwrap_used, clippy::expect_used)]
#![cfg(feature = "sqlite")]

//! Soft-delete visibility scopes applied to root queries and includes.

mod common;

use common::{Fixture, id_set};
use tablekit_db::{Filter, IncludeSpec, QueryOptions, Request, Scope};

async fn visible(fx: &Fixture, model: &str, scope: &str) -> Vec<i64> {
    let opts = QueryOptions::builder().scope(scope).build();
    let out = fx
        .session(model)
        .list(&fx.db, &Request::new(), &opts)
        .await
        .unwrap();
    id_set(out.rows())
}

#[tokio::test]
async fn test_named_scopes() {
    let fx = Fixture::new().await;
    assert_eq!(visible(&fx, "User", "default").await, vec![1, 2, 3, 5]);
    assert_eq!(visible(&fx, "User", "deleted").await, vec![4]);
    assert_eq!(visible(&fx, "User", "updated").await, vec![4]);
    assert_eq!(visible(&fx, "User", "all").await, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_unknown_scope_falls_back_to_default() {
    let fx = Fixture::new().await;
    assert_eq!(visible(&fx, "User", "archived").await, vec![1, 2, 3, 5]);
}

#[tokio::test]
async fn test_model_without_delete_marker_ignores_scope() {
    let fx = Fixture::new().await;
    assert_eq!(visible(&fx, "Team", "deleted").await, vec![1, 2]);
}

#[tokio::test]
async fn test_scope_overrides_caller_constraint_on_marker() {
    let fx = Fixture::new().await;
    let users = fx.session("User");

    // A caller-supplied constraint on the marker column cannot widen the scope.
    let opts = QueryOptions::builder()
        .filter(Filter::gt("deleteTime", 0))
        .build();
    let out = users.list(&fx.db, &Request::new(), &opts).await.unwrap();
    assert_eq!(id_set(out.rows()), vec![1, 2, 3, 5]);
}

#[tokio::test]
async fn test_deleted_scope_on_orders() {
    let fx = Fixture::new().await;
    assert_eq!(visible(&fx, "Order", "deleted").await, vec![5]);
}

#[tokio::test]
async fn test_include_scope_is_independent_of_root() {
    let fx = Fixture::new().await;
    let users = fx.session("User");

    let opts = QueryOptions::builder()
        .scope(Scope::All)
        .include(IncludeSpec::association("orders").scope(Scope::Deleted))
        .build();
    let out = users
        .list(&fx.db, &Request::new().param("id", 3), &opts)
        .await
        .unwrap();
    let row = &out.rows()[0];
    let orders = row["orders"].as_array().unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0]["id"], 5);
}
