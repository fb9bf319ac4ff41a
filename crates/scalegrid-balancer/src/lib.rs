//! scalegrid-balancer — routes requests across a deployment's running
//! instances.
//!
//! Selection is true rotating round-robin: a per-deployment cursor
//! persists across calls, so N healthy instances each serve one of every
//! N consecutive requests. The balancer is the only writer of per-instance
//! request counters (count + moving-average response time), which it
//! updates through the pool's request accounting on every routed call.

pub mod balancer;

pub use balancer::{BalancerError, BalancerResult, LoadBalancer, LoadBalancerStats, RoutingResult};
