//! Cost estimator — instance-hour integration over the event history.

use serde::Serialize;
use tracing::debug;

use scalegrid_state::{DeploymentId, ScalingEvent, StateResult, StateStore, epoch_millis};

/// Flat price of one instance running for one hour.
pub const RATE_PER_INSTANCE_HOUR: f64 = 0.10;

/// Ceiling assumed for the no-autoscaling comparison when no rule
/// survives for the deployment.
const DEFAULT_MAX_INSTANCES: u32 = 10;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Derived cost figures for one deployment. Computed on demand, never
/// stored.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CostReport {
    pub deployment_id: DeploymentId,
    /// Actual spend: instance-hours × rate.
    pub total_cost: f64,
    /// Hypothetical spend at `max_instances` for the same elapsed time.
    pub cost_without_autoscale: f64,
    pub savings: f64,
    /// 0 when the hypothetical spend is 0.
    pub savings_percent: f64,
    /// Mean instance count over the covered period.
    pub avg_instances: f64,
}

/// Computes cost reports from the event log and rule limits.
#[derive(Clone)]
pub struct CostEstimator {
    store: StateStore,
    rate_per_instance_hour: f64,
}

impl CostEstimator {
    /// Create an estimator at the standard rate.
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            rate_per_instance_hour: RATE_PER_INSTANCE_HOUR,
        }
    }

    /// Override the per-instance-hour rate.
    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate_per_instance_hour = rate;
        self
    }

    /// Compute the cost report for a deployment as of now.
    pub fn compute(&self, deployment_id: &str) -> StateResult<CostReport> {
        let events = self.store.event_history(deployment_id)?;
        let max_instances = self
            .store
            .list_rules(Some(deployment_id))?
            .first()
            .map(|r| r.max_instances)
            .unwrap_or(DEFAULT_MAX_INSTANCES);

        let report = compute_report(
            deployment_id,
            &events,
            max_instances,
            self.rate_per_instance_hour,
            epoch_millis(),
        );
        debug!(
            %deployment_id,
            total_cost = report.total_cost,
            savings_percent = report.savings_percent,
            "cost report computed"
        );
        Ok(report)
    }
}

/// Integrate instance-hours over an oldest-first event history up to `now`.
fn compute_report(
    deployment_id: &str,
    events: &[ScalingEvent],
    max_instances: u32,
    rate: f64,
    now: u64,
) -> CostReport {
    let (Some(first), Some(last)) = (events.first(), events.last()) else {
        return CostReport {
            deployment_id: deployment_id.to_string(),
            total_cost: 0.0,
            cost_without_autoscale: 0.0,
            savings: 0.0,
            savings_percent: 0.0,
            avg_instances: 0.0,
        };
    };

    let mut instance_ms = 0.0;
    for pair in events.windows(2) {
        let span = pair[1].timestamp.saturating_sub(pair[0].timestamp);
        instance_ms += pair[0].instances_after as f64 * span as f64;
    }
    let end = now.max(last.timestamp);
    instance_ms += last.instances_after as f64 * end.saturating_sub(last.timestamp) as f64;

    let instance_hours = instance_ms / MS_PER_HOUR;
    let total_hours = end.saturating_sub(first.timestamp) as f64 / MS_PER_HOUR;

    let total_cost = instance_hours * rate;
    let cost_without_autoscale = max_instances as f64 * total_hours * rate;
    let savings = cost_without_autoscale - total_cost;
    let savings_percent = if cost_without_autoscale > 0.0 {
        savings / cost_without_autoscale * 100.0
    } else {
        0.0
    };
    let avg_instances = if total_hours > 0.0 {
        instance_hours / total_hours
    } else {
        0.0
    };

    CostReport {
        deployment_id: deployment_id.to_string(),
        total_cost,
        cost_without_autoscale,
        savings,
        savings_percent,
        avg_instances,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scalegrid_state::{MetricKind, ScalingAction, ScalingRule, fresh_id};

    const HOUR_MS: u64 = 3_600_000;

    fn event(deployment_id: &str, after: u32, timestamp: u64) -> ScalingEvent {
        ScalingEvent {
            id: fresh_id("evt"),
            deployment_id: deployment_id.to_string(),
            rule_id: "rule-1".to_string(),
            action: if after > 1 {
                ScalingAction::ScaleUp
            } else {
                ScalingAction::ScaleDown
            },
            reason: "test".to_string(),
            instances_before: after.saturating_sub(1),
            instances_after: after,
            metric_value: 0.0,
            timestamp,
        }
    }

    fn rule(deployment_id: &str, max_instances: u32) -> ScalingRule {
        ScalingRule {
            id: "rule-1".to_string(),
            deployment_id: deployment_id.to_string(),
            name: "policy".to_string(),
            metric: MetricKind::Cpu,
            min_instances: 1,
            max_instances,
            scale_up_threshold: 70.0,
            scale_down_threshold: 30.0,
            cooldown_seconds: 300,
            enabled: true,
            created_at: 0,
        }
    }

    #[test]
    fn no_events_yields_zeros() {
        let report = compute_report("deploy-1", &[], 5, RATE_PER_INSTANCE_HOUR, 1000);
        assert_eq!(report.total_cost, 0.0);
        assert_eq!(report.cost_without_autoscale, 0.0);
        assert_eq!(report.savings_percent, 0.0);
        assert_eq!(report.avg_instances, 0.0);
    }

    #[test]
    fn running_at_the_ceiling_saves_nothing() {
        // One event takes the pool to the ceiling (2); two hours pass.
        let events = vec![event("deploy-1", 2, 0)];
        let report = compute_report("deploy-1", &events, 2, RATE_PER_INSTANCE_HOUR, 2 * HOUR_MS);

        assert!((report.avg_instances - 2.0).abs() < 1e-9);
        assert!((report.total_cost - 0.4).abs() < 1e-9);
        assert!((report.cost_without_autoscale - 0.4).abs() < 1e-9);
        assert!(report.savings.abs() < 1e-9);
        assert!(report.savings_percent.abs() < 1e-9);
    }

    #[test]
    fn savings_approach_full_as_pool_shrinks() {
        // One instance for ten hours against a ceiling of ten.
        let events = vec![event("deploy-1", 1, 0)];
        let report = compute_report("deploy-1", &events, 10, RATE_PER_INSTANCE_HOUR, 10 * HOUR_MS);

        assert!((report.total_cost - 1.0).abs() < 1e-9);
        assert!((report.cost_without_autoscale - 10.0).abs() < 1e-9);
        assert!((report.savings - 9.0).abs() < 1e-9);
        assert!((report.savings_percent - 90.0).abs() < 1e-9);
        assert!((report.avg_instances - 1.0).abs() < 1e-9);
    }

    #[test]
    fn piecewise_history_integrates_each_segment() {
        // 2 instances for 1h, then 3 instances for 2h.
        let events = vec![event("deploy-1", 2, 0), event("deploy-1", 3, HOUR_MS)];
        let report = compute_report("deploy-1", &events, 5, RATE_PER_INSTANCE_HOUR, 3 * HOUR_MS);

        // instance-hours = 2*1 + 3*2 = 8
        assert!((report.total_cost - 0.8).abs() < 1e-9);
        assert!((report.cost_without_autoscale - 1.5).abs() < 1e-9);
        assert!((report.avg_instances - 8.0 / 3.0).abs() < 1e-9);
        assert!((report.savings_percent - (0.7 / 1.5 * 100.0)).abs() < 1e-6);
    }

    #[test]
    fn single_event_at_now_has_no_elapsed_time() {
        let events = vec![event("deploy-1", 3, 5000)];
        let report = compute_report("deploy-1", &events, 5, RATE_PER_INSTANCE_HOUR, 5000);
        assert_eq!(report.total_cost, 0.0);
        assert_eq!(report.savings_percent, 0.0);
        assert_eq!(report.avg_instances, 0.0);
    }

    #[test]
    fn compute_reads_rule_ceiling_from_store() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_rule(&rule("deploy-1", 4)).unwrap();
        store
            .append_event(&event("deploy-1", 2, epoch_millis() - HOUR_MS))
            .unwrap();

        let estimator = CostEstimator::new(store);
        let report = estimator.compute("deploy-1").unwrap();

        // Two instances over roughly one hour against a ceiling of four.
        assert!((report.total_cost - 0.2).abs() < 0.01);
        assert!((report.cost_without_autoscale - 0.4).abs() < 0.01);
        assert!((report.savings_percent - 50.0).abs() < 1.0);
    }

    #[test]
    fn default_ceiling_applies_without_rules() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .append_event(&event("deploy-1", 1, epoch_millis() - HOUR_MS))
            .unwrap();

        let estimator = CostEstimator::new(store);
        let report = estimator.compute("deploy-1").unwrap();
        // Ceiling defaults to 10 instances.
        assert!((report.savings_percent - 90.0).abs() < 1.0);
    }

    #[test]
    fn custom_rate_scales_costs() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .append_event(&event("deploy-1", 1, epoch_millis() - HOUR_MS))
            .unwrap();

        let estimator = CostEstimator::new(store).with_rate(1.0);
        let report = estimator.compute("deploy-1").unwrap();
        assert!((report.total_cost - 1.0).abs() < 0.05);
    }
}
