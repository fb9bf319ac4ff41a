//! scalegrid-cost — derives spend and savings from the scaling history.
//!
//! Nothing here is persisted: a report is integrated on demand from the
//! deployment's event log and the governing rule's ceiling. Between two
//! consecutive events the pool ran at the earlier event's `instances_after`,
//! so instance-hours are the sum of those rectangles plus the tail from
//! the newest event to now.

pub mod estimator;

pub use estimator::{CostEstimator, CostReport, RATE_PER_INSTANCE_HOUR};
