//! scalegrid-engine — the autoscaling decision loop.
//!
//! Evaluates the governing rule for a deployment against a current metric
//! value and resizes the instance pool, recording every action in the
//! event log. Manual scaling shares the same serialization domain, so a
//! manual resize can never race an automatic one past the rule's bounds.
//!
//! # Decision ladder
//!
//! ```text
//! no enabled rule            -> no_action "no active rules"
//! cooldown not elapsed       -> no_action "cooldown active (..s remaining)"
//! value > up and n < max     -> scale_up   (pool add + event, atomic pair)
//! value < down and n > min   -> scale_down (pool drain + event, atomic pair)
//! otherwise                  -> no_action "<metric> (..) within thresholds"
//! ```
//!
//! Metric values come from a pluggable [`MetricsProvider`], so tests and
//! deployments inject deterministic sources instead of sampling noise.

pub mod engine;
pub mod metrics;

pub use engine::{EngineError, EngineResult, RuleSpec, ScalingEngine};
pub use metrics::{GaugeMetrics, MetricsProvider};
