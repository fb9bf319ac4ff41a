//! Domain types for the scaling control plane.
//!
//! These types represent scaling rules, instances, and scaling events.
//! Rules and events are persisted (JSON in redb); instances live in memory
//! inside the pool but share the same serde vocabulary so they flow
//! straight out of the REST API.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Unique identifier for a deployment (owned by the external registry).
pub type DeploymentId = String;

/// Unique identifier for a scaling rule.
pub type RuleId = String;

/// Unique identifier for an instance within a deployment.
pub type InstanceId = String;

/// Sentinel rule id recorded on events produced by manual scaling.
pub const MANUAL_RULE_ID: &str = "manual";

// ── Rules ─────────────────────────────────────────────────────────

/// The metric a scaling rule evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Cpu,
    Memory,
    RequestRate,
    ResponseTime,
}

impl MetricKind {
    /// The wire/reason-string name of this metric.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Memory => "memory",
            MetricKind::RequestRate => "request_rate",
            MetricKind::ResponseTime => "response_time",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A threshold policy governing one deployment's instance count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingRule {
    pub id: RuleId,
    pub deployment_id: DeploymentId,
    pub name: String,
    pub metric: MetricKind,
    /// Lower bound on the pool size. Must be at least 1.
    pub min_instances: u32,
    /// Upper bound on the pool size. Must be >= `min_instances`.
    pub max_instances: u32,
    /// Scale up when the metric exceeds this value.
    pub scale_up_threshold: f64,
    /// Scale down when the metric falls below this value.
    pub scale_down_threshold: f64,
    /// Minimum time between consecutive automatic actions for this rule.
    pub cooldown_seconds: u64,
    pub enabled: bool,
    /// Unix timestamp (milliseconds) when this rule was created.
    pub created_at: u64,
}

impl ScalingRule {
    /// Check the rule's bounds and thresholds.
    ///
    /// Rejects before any write: `min_instances >= 1`,
    /// `max_instances >= min_instances`, and
    /// `0 <= scale_down_threshold < scale_up_threshold <= 100`.
    pub fn validate(&self) -> StateResult<()> {
        if self.min_instances < 1 {
            return Err(StateError::InvalidRule(format!(
                "min_instances must be at least 1, got {}",
                self.min_instances
            )));
        }
        if self.max_instances < self.min_instances {
            return Err(StateError::InvalidRule(format!(
                "max_instances ({}) is below min_instances ({})",
                self.max_instances, self.min_instances
            )));
        }
        if self.scale_down_threshold < 0.0
            || self.scale_down_threshold >= self.scale_up_threshold
            || self.scale_up_threshold > 100.0
        {
            return Err(StateError::InvalidRule(format!(
                "thresholds must satisfy 0 <= down ({}) < up ({}) <= 100",
                self.scale_down_threshold, self.scale_up_threshold
            )));
        }
        Ok(())
    }
}

// ── Instances ─────────────────────────────────────────────────────

/// Lifecycle status of an instance.
///
/// `Starting → Running` is driven by the readiness signal;
/// `Running → Draining → Stopped` is the scale-down path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// One running replica of a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub deployment_id: DeploymentId,
    /// Assigned port, unique within the deployment.
    pub port: u16,
    pub status: InstanceStatus,
    /// CPU usage gauge (0–100), fed by telemetry.
    pub cpu_usage: f64,
    /// Memory usage gauge (0–100), fed by telemetry.
    pub memory_usage: f64,
    /// Requests routed to this instance.
    pub request_count: u64,
    /// Exponential moving average of observed response time (ms).
    pub avg_response_time_ms: f64,
    /// Unix timestamp (milliseconds) when this instance started.
    pub started_at: u64,
    pub health_check_url: String,
}

// ── Events ────────────────────────────────────────────────────────

/// The decision an evaluation (or manual scale step) produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    NoAction,
}

/// One scaling decision. Immutable once appended to the event log.
///
/// `instances_after - instances_before` is +1, -1, or 0, matching the
/// action. Only `scale_up`/`scale_down` events are persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingEvent {
    pub id: String,
    pub deployment_id: DeploymentId,
    /// Id of the governing rule, [`MANUAL_RULE_ID`] for manual actions,
    /// or empty on ephemeral no-action results that had no governing rule.
    pub rule_id: RuleId,
    pub action: ScalingAction,
    pub reason: String,
    pub instances_before: u32,
    pub instances_after: u32,
    /// The metric value that triggered the decision (0 for manual actions).
    pub metric_value: f64,
    /// Unix timestamp (milliseconds) when the decision was made.
    pub timestamp: u64,
}

// ── Helpers ───────────────────────────────────────────────────────

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate a short prefixed id, e.g. `rule-3f9a2c1d`.
pub fn fresh_id(prefix: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &hex[..8])
}
