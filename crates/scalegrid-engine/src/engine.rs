//! ScalingEngine — evaluates rules and resizes instance pools.
//!
//! Every deployment has one serialization domain: `evaluate`,
//! `set_target`, and `create_rule` all hold the deployment's lock across
//! the read-decide-mutate-append sequence, so concurrent calls cannot
//! both scale past a bound. Pool mutation and event append form an atomic
//! pair: if the append fails, the mutation is rolled back before the
//! error propagates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tracing::{info, warn};

use scalegrid_pool::{InstancePool, PoolError};
use scalegrid_state::{
    Instance, InstanceStatus, MANUAL_RULE_ID, MetricKind, ScalingAction, ScalingEvent,
    ScalingRule, StateError, StateStore, epoch_millis, fresh_id,
};

use crate::metrics::MetricsProvider;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur during scaling operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown deployment: {0}")]
    UnknownDeployment(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),
}

/// A rule as submitted by a client; ids and timestamps are assigned on
/// creation.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    pub deployment_id: String,
    pub name: String,
    pub metric: MetricKind,
    #[serde(default = "default_min_instances")]
    pub min_instances: u32,
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_min_instances() -> u32 {
    1
}

fn default_max_instances() -> u32 {
    10
}

fn default_cooldown_seconds() -> u64 {
    300
}

fn default_enabled() -> bool {
    true
}

/// The autoscaling decision loop plus manual scaling.
pub struct ScalingEngine {
    store: StateStore,
    pool: Arc<InstancePool>,
    metrics: Arc<dyn MetricsProvider>,
    /// One serialization domain per deployment.
    domains: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ScalingEngine {
    /// Create a new engine.
    pub fn new(
        store: StateStore,
        pool: Arc<InstancePool>,
        metrics: Arc<dyn MetricsProvider>,
    ) -> Self {
        Self {
            store,
            pool,
            metrics,
            domains: Mutex::new(HashMap::new()),
        }
    }

    /// Create a scaling rule.
    ///
    /// Validation happens before any write. If the deployment has no
    /// instances yet, one starting instance is provisioned — a deployment
    /// always has at least one instance once a rule targets it.
    pub async fn create_rule(&self, spec: RuleSpec) -> EngineResult<ScalingRule> {
        let rule = ScalingRule {
            id: fresh_id("rule"),
            deployment_id: spec.deployment_id,
            name: spec.name,
            metric: spec.metric,
            min_instances: spec.min_instances,
            max_instances: spec.max_instances,
            scale_up_threshold: spec.scale_up_threshold,
            scale_down_threshold: spec.scale_down_threshold,
            cooldown_seconds: spec.cooldown_seconds,
            enabled: spec.enabled,
            created_at: epoch_millis(),
        };

        let _guard = self.domain(&rule.deployment_id).await;
        self.store.put_rule(&rule)?;

        if self.pool.active_count(&rule.deployment_id).await == 0 {
            let instance = self.pool.add(&rule.deployment_id).await?;
            info!(
                deployment_id = %rule.deployment_id,
                rule_id = %rule.id,
                instance_id = %instance.id,
                "bootstrap instance provisioned"
            );
        }
        Ok(rule)
    }

    /// Run one evaluation cycle for a deployment.
    pub async fn evaluate(&self, deployment_id: &str) -> EngineResult<ScalingEvent> {
        let _guard = self.domain(deployment_id).await;
        if !self.pool.contains(deployment_id).await {
            return Err(EngineError::UnknownDeployment(deployment_id.to_string()));
        }

        let current = self.pool.active_count(deployment_id).await;
        let rules = self.store.list_rules(Some(deployment_id))?;
        let Some(rule) = rules.iter().find(|r| r.enabled) else {
            return Ok(no_action(deployment_id, "", current, 0.0, "no active rules"));
        };

        let now = epoch_millis();
        if let Some(last) = self.store.last_action_time(deployment_id, &rule.id)? {
            let cooldown_ms = rule.cooldown_seconds * 1000;
            let elapsed_ms = now.saturating_sub(last);
            if elapsed_ms < cooldown_ms {
                let remaining = (cooldown_ms - elapsed_ms).div_ceil(1000);
                return Ok(no_action(
                    deployment_id,
                    &rule.id,
                    current,
                    0.0,
                    &format!("cooldown active ({remaining}s remaining)"),
                ));
            }
        }

        let value = self.metrics.value(deployment_id, rule.metric);

        if value > rule.scale_up_threshold && current < rule.max_instances {
            let reason = format!(
                "{} ({value:.1}) exceeded {:.1}",
                rule.metric, rule.scale_up_threshold
            );
            let event = self
                .scale_up(deployment_id, &rule.id, current, value, &reason, now)
                .await?;
            info!(
                %deployment_id,
                rule_id = %rule.id,
                from = event.instances_before,
                to = event.instances_after,
                metric = %rule.metric,
                value,
                "scaled up"
            );
            return Ok(event);
        }

        if value < rule.scale_down_threshold && current > rule.min_instances {
            let reason = format!(
                "{} ({value:.1}) below {:.1}",
                rule.metric, rule.scale_down_threshold
            );
            let Some(event) = self
                .scale_down(deployment_id, &rule.id, current, value, &reason, now)
                .await?
            else {
                // All surplus instances are still starting; nothing to drain.
                return Ok(no_action(
                    deployment_id,
                    &rule.id,
                    current,
                    value,
                    "no running instance to drain",
                ));
            };
            info!(
                %deployment_id,
                rule_id = %rule.id,
                from = event.instances_before,
                to = event.instances_after,
                metric = %rule.metric,
                value,
                "scaled down"
            );
            return Ok(event);
        }

        Ok(no_action(
            deployment_id,
            &rule.id,
            current,
            value,
            &format!("{} ({value:.1}) within thresholds", rule.metric),
        ))
    }

    /// Manually scale a deployment toward a target instance count.
    ///
    /// Bypasses cooldown but still clamps to the governing rule's bounds
    /// (or to at least 1 when no rule exists). Reconciles one step at a
    /// time, appending one event per step so the event-delta invariant
    /// holds.
    pub async fn set_target(
        &self,
        deployment_id: &str,
        target: u32,
    ) -> EngineResult<Vec<ScalingEvent>> {
        let _guard = self.domain(deployment_id).await;
        if !self.pool.contains(deployment_id).await {
            return Err(EngineError::UnknownDeployment(deployment_id.to_string()));
        }

        let rules = self.store.list_rules(Some(deployment_id))?;
        let desired = match rules.iter().find(|r| r.enabled) {
            Some(rule) => target.clamp(rule.min_instances, rule.max_instances),
            None => target.max(1),
        };

        let mut events = Vec::new();
        let mut current = self.pool.active_count(deployment_id).await;
        let from = current;

        while current < desired {
            let event = self
                .scale_up(
                    deployment_id,
                    MANUAL_RULE_ID,
                    current,
                    0.0,
                    "manual scaling",
                    epoch_millis(),
                )
                .await?;
            events.push(event);
            current += 1;
        }
        while current > desired {
            let Some(event) = self
                .scale_down(
                    deployment_id,
                    MANUAL_RULE_ID,
                    current,
                    0.0,
                    "manual scaling",
                    epoch_millis(),
                )
                .await?
            else {
                break; // remaining surplus is still starting
            };
            events.push(event);
            current -= 1;
        }

        if from != current {
            info!(%deployment_id, from, to = current, target, "manually scaled");
        }
        Ok(events)
    }

    /// Evaluate every deployment that has at least one rule.
    pub async fn evaluate_all(&self) -> EngineResult<Vec<ScalingEvent>> {
        let rules = self.store.list_rules(None)?;
        let mut deployments: Vec<String> =
            rules.into_iter().map(|r| r.deployment_id).collect();
        deployments.sort();
        deployments.dedup();

        let mut events = Vec::new();
        for deployment_id in deployments {
            match self.evaluate(&deployment_id).await {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!(%deployment_id, error = %e, "evaluation failed");
                }
            }
        }
        Ok(events)
    }

    /// Run the periodic evaluation loop until the shutdown signal fires.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "scaling engine started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.evaluate_all().await {
                        tracing::error!(error = %e, "evaluation sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("scaling engine shutting down");
                    break;
                }
            }
        }
    }

    // ── Internal helpers ───────────────────────────────────────────

    /// Add one instance and append the matching event atomically.
    async fn scale_up(
        &self,
        deployment_id: &str,
        rule_id: &str,
        current: u32,
        value: f64,
        reason: &str,
        now: u64,
    ) -> EngineResult<ScalingEvent> {
        let instance = self.pool.add(deployment_id).await?;
        let event = action_event(
            deployment_id,
            rule_id,
            ScalingAction::ScaleUp,
            reason,
            current,
            current + 1,
            value,
            now,
        );
        if let Err(e) = self.store.append_event(&event) {
            let _ = self.pool.discard(deployment_id, &instance.id).await;
            return Err(e.into());
        }
        Ok(event)
    }

    /// Drain one instance and append the matching event atomically.
    /// Returns `None` when no instance is running.
    async fn scale_down(
        &self,
        deployment_id: &str,
        rule_id: &str,
        current: u32,
        value: f64,
        reason: &str,
        now: u64,
    ) -> EngineResult<Option<ScalingEvent>> {
        let Some(instance) = self.pool.remove(deployment_id).await? else {
            return Ok(None);
        };
        let event = action_event(
            deployment_id,
            rule_id,
            ScalingAction::ScaleDown,
            reason,
            current,
            current - 1,
            value,
            now,
        );
        if let Err(e) = self.store.append_event(&event) {
            self.undo_remove(deployment_id, &instance).await;
            return Err(e.into());
        }
        Ok(Some(event))
    }

    /// Best-effort restoration of a drained instance after a failed
    /// event append. An instance that already stopped is replaced by a
    /// fresh running one so the pool size stays consistent with the log.
    async fn undo_remove(&self, deployment_id: &str, instance: &Instance) {
        if instance.status == InstanceStatus::Draining {
            let _ = self.pool.reinstate(deployment_id, &instance.id).await;
        } else if let Ok(replacement) = self.pool.add(deployment_id).await {
            let _ = self.pool.mark_ready(deployment_id, &replacement.id).await;
        }
    }

    /// Acquire the serialization domain for a deployment.
    async fn domain(&self, deployment_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut domains = self.domains.lock().await;
            domains
                .entry(deployment_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

fn action_event(
    deployment_id: &str,
    rule_id: &str,
    action: ScalingAction,
    reason: &str,
    before: u32,
    after: u32,
    value: f64,
    now: u64,
) -> ScalingEvent {
    ScalingEvent {
        id: fresh_id("evt"),
        deployment_id: deployment_id.to_string(),
        rule_id: rule_id.to_string(),
        action,
        reason: reason.to_string(),
        instances_before: before,
        instances_after: after,
        metric_value: value,
        timestamp: now,
    }
}

fn no_action(
    deployment_id: &str,
    rule_id: &str,
    current: u32,
    value: f64,
    reason: &str,
) -> ScalingEvent {
    ScalingEvent {
        id: fresh_id("evt"),
        deployment_id: deployment_id.to_string(),
        rule_id: rule_id.to_string(),
        action: ScalingAction::NoAction,
        reason: reason.to_string(),
        instances_before: current,
        instances_after: current,
        metric_value: value,
        timestamp: epoch_millis(),
    }
}
