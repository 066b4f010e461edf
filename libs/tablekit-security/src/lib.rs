#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
pub mod actor;
pub mod context;

pub use actor::ActorId;
pub use context::{SecurityContext, SecurityContextBuilder};
