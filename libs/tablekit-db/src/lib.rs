#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Scoped data-access services over `SeaORM`.
//!
//! A [`Service`] binds one model of a runtime [`Schema`] and exposes list/info/
//! count, scoped mutations, ordered-list moves and audit diffs through a
//! request-scoped [`Session`]. Queries are compiled from a [`Request`] and
//! [`QueryOptions`]: scope predicates, search, sort, projection, pagination and
//! eager includes, with join-qualified filters resolved into root key sets so
//! pagination stays exact.
//!
//! ```ignore
//! let svc = Service::builder(schema, "User")
//!     .preset("orders", IncludeSpec::association("orders"))
//!     .build()?;
//! let session = svc.session(ctx);
//! let opts = QueryOptions::builder()
//!     .search(SearchSpec::new("smith").field("name")?)
//!     .sort("-createTime")
//!     .include(IncludeSpec::preset("orders"))
//!     .build();
//! let users = session.list(&db, &Request::new(), &opts).await?;
//! ```

pub mod audit;
pub mod config;
pub mod error;
pub mod filter;
mod loader;
pub mod model;
pub mod query;
pub mod scope;
pub mod service;
pub mod value;

pub use audit::{AuditKind, AuditRecord, DiffKind, DiffReport, FieldDiff, diff, diff_columns};
pub use config::{AuditConfig, MessageTemplates, ServiceConfig, TimestampUnit};
pub use error::{ServiceError, ServiceResult};
pub use filter::{FieldPath, Filter, Op};
pub use model::{
    AssociationDef, AssociationKind, AuditFields, ColumnDef, ColumnKind, ModelDef, Schema,
};
pub use query::{
    Bounds, Direction, IncludeSpec, LockMode, QueryOptions, QueryOptionsBuilder, Request,
    SearchField, SearchKey, SearchMode, SearchSpec, SortEntry,
};
pub use scope::Scope;
pub use service::{
    ListResult, MutationResult, RankChange, Service, ServiceBuilder, Session, SetOutcome,
};
pub use value::Record;
