//! scalegrid-state — embedded store for the scaling control plane.
//!
//! Backed by [redb](https://docs.rs/redb), owns the two durable record
//! kinds of the autoscaler: scaling rules and the append-only scaling-event
//! log. Rules are validated before any write; events are immutable once
//! appended and keyed so that iteration order is creation order.
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! The `StateStore` is `Clone + Send + Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
