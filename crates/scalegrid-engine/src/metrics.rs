//! Metric source seam.
//!
//! The engine never samples load itself; it asks a `MetricsProvider` for
//! the current value of the governing rule's metric. Production wires
//! this to the telemetry collaborator; tests set gauges directly.

use std::collections::HashMap;
use std::sync::RwLock;

use scalegrid_state::MetricKind;

/// Supplies the current value of a named metric for a deployment.
pub trait MetricsProvider: Send + Sync {
    fn value(&self, deployment_id: &str, metric: MetricKind) -> f64;
}

/// A settable gauge map.
///
/// Deployments with no reported value read 0.0 — an idle deployment
/// legitimately scales down to its floor.
#[derive(Default)]
pub struct GaugeMetrics {
    values: RwLock<HashMap<(String, MetricKind), f64>>,
}

impl GaugeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current value of a metric for a deployment.
    pub fn set(&self, deployment_id: &str, metric: MetricKind, value: f64) {
        let mut values = self.values.write().expect("gauge lock poisoned");
        values.insert((deployment_id.to_string(), metric), value);
    }
}

impl MetricsProvider for GaugeMetrics {
    fn value(&self, deployment_id: &str, metric: MetricKind) -> f64 {
        let values = self.values.read().expect("gauge lock poisoned");
        values
            .get(&(deployment_id.to_string(), metric))
            .copied()
            .unwrap_or(0.0)
    }
}
