//! scalegrid-pool — owns the instance set for every deployment.
//!
//! Each deployment maps to an ordered list of instances. The pool is the
//! single writer of pool membership and lifecycle state:
//!
//! ```text
//! starting ── mark_ready ──> running ── remove ──> draining ──> stopped
//! ```
//!
//! Draining instances keep serving requests that were already assigned to
//! them but receive no new ones; once idle (or once the drain window
//! elapses) the reaper transitions them to `stopped` and purges them.

pub mod pool;

pub use pool::{InstancePool, PoolConfig, PoolError, PoolResult};
