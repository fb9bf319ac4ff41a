//! Instance pool — per-deployment instance sets and lifecycle.
//!
//! Ports are allocated lowest-free from a configurable base, so a port
//! freed by a stopped instance is reused before the range grows. Usage
//! counters on each instance are written through `complete_request` and
//! `update_usage` only; the balancer is the sole caller of the request
//! path.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use scalegrid_state::{DeploymentId, Instance, InstanceStatus, epoch_millis, fresh_id};

/// Smoothing factor for the per-instance response-time moving average.
const EMA_ALPHA: f64 = 0.2;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("unknown deployment: {0}")]
    UnknownDeployment(String),

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("instance no longer available: {0}")]
    InstanceGone(String),

    #[error("no free port left for deployment: {0}")]
    PortsExhausted(String),
}

/// Configuration for the instance pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Lowest port assigned to instances.
    pub port_base: u16,
    /// How long a draining instance may finish in-flight requests before
    /// it is force-stopped.
    pub drain_window: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            port_base: 10_000,
            drain_window: Duration::from_secs(30),
        }
    }
}

/// One instance plus the pool-internal bookkeeping that never leaves
/// the pool.
struct Slot {
    instance: Instance,
    /// Requests currently assigned to this instance.
    inflight: u32,
    /// Set when the instance enters `draining` (epoch ms).
    drain_deadline: Option<u64>,
}

#[derive(Default)]
struct DeploymentSlots {
    /// Creation order; `remove` drains the newest running instance.
    slots: Vec<Slot>,
}

/// Owns all instances for all deployments.
///
/// Routing reads cloned snapshots under the read lock; every mutation
/// takes the write lock, so an instance moving to `draining` stays
/// visible to requests already assigned to it.
pub struct InstancePool {
    config: PoolConfig,
    deployments: RwLock<HashMap<DeploymentId, DeploymentSlots>>,
}

impl InstancePool {
    /// Create a new, empty pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            deployments: RwLock::new(HashMap::new()),
        }
    }

    // ── Membership ─────────────────────────────────────────────────

    /// Create a `starting` instance on the next free port.
    pub async fn add(&self, deployment_id: &str) -> PoolResult<Instance> {
        let mut deployments = self.deployments.write().await;
        let entry = deployments.entry(deployment_id.to_string()).or_default();

        let used: HashSet<u16> = entry.slots.iter().map(|s| s.instance.port).collect();
        let port = (self.config.port_base..=u16::MAX)
            .find(|p| !used.contains(p))
            .ok_or_else(|| PoolError::PortsExhausted(deployment_id.to_string()))?;

        let instance = Instance {
            id: fresh_id("inst"),
            deployment_id: deployment_id.to_string(),
            port,
            status: InstanceStatus::Starting,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            request_count: 0,
            avg_response_time_ms: 0.0,
            started_at: epoch_millis(),
            health_check_url: format!("http://localhost:{port}/health"),
        };
        entry.slots.push(Slot {
            instance: instance.clone(),
            inflight: 0,
            drain_deadline: None,
        });

        debug!(%deployment_id, instance_id = %instance.id, port, "instance added");
        Ok(instance)
    }

    /// Readiness signal: `starting → running`. Idempotent for instances
    /// that are already past `starting`.
    pub async fn mark_ready(&self, deployment_id: &str, instance_id: &str) -> PoolResult<Instance> {
        let mut deployments = self.deployments.write().await;
        let slot = find_slot(&mut deployments, deployment_id, instance_id)?;
        if slot.instance.status == InstanceStatus::Starting {
            slot.instance.status = InstanceStatus::Running;
            debug!(%deployment_id, %instance_id, "instance ready");
        }
        Ok(slot.instance.clone())
    }

    /// Begin draining the newest `running` instance.
    ///
    /// If it has no in-flight requests it stops and leaves the pool
    /// immediately; otherwise it keeps serving assigned requests until
    /// idle or until the drain window elapses. Returns `None` when no
    /// instance is running.
    pub async fn remove(&self, deployment_id: &str) -> PoolResult<Option<Instance>> {
        let mut deployments = self.deployments.write().await;
        let entry = deployments
            .get_mut(deployment_id)
            .ok_or_else(|| PoolError::UnknownDeployment(deployment_id.to_string()))?;

        let Some(idx) = entry
            .slots
            .iter()
            .rposition(|s| s.instance.status == InstanceStatus::Running)
        else {
            return Ok(None);
        };

        if entry.slots[idx].inflight == 0 {
            let mut slot = entry.slots.remove(idx);
            slot.instance.status = InstanceStatus::Stopped;
            debug!(
                %deployment_id,
                instance_id = %slot.instance.id,
                "instance stopped (idle at drain)"
            );
            return Ok(Some(slot.instance));
        }

        let slot = &mut entry.slots[idx];
        slot.instance.status = InstanceStatus::Draining;
        slot.drain_deadline = Some(epoch_millis() + self.config.drain_window.as_millis() as u64);
        debug!(
            %deployment_id,
            instance_id = %slot.instance.id,
            inflight = slot.inflight,
            "instance draining"
        );
        Ok(Some(slot.instance.clone()))
    }

    /// Roll back a just-added `starting` instance.
    pub async fn discard(&self, deployment_id: &str, instance_id: &str) -> PoolResult<()> {
        let mut deployments = self.deployments.write().await;
        let entry = deployments
            .get_mut(deployment_id)
            .ok_or_else(|| PoolError::UnknownDeployment(deployment_id.to_string()))?;
        let before = entry.slots.len();
        entry.slots.retain(|s| {
            !(s.instance.id == instance_id && s.instance.status == InstanceStatus::Starting)
        });
        if entry.slots.len() == before {
            return Err(PoolError::UnknownInstance(instance_id.to_string()));
        }
        Ok(())
    }

    /// Roll back a drain: `draining → running`.
    pub async fn reinstate(&self, deployment_id: &str, instance_id: &str) -> PoolResult<()> {
        let mut deployments = self.deployments.write().await;
        let slot = find_slot(&mut deployments, deployment_id, instance_id)?;
        if slot.instance.status == InstanceStatus::Draining {
            slot.instance.status = InstanceStatus::Running;
            slot.drain_deadline = None;
        }
        Ok(())
    }

    // ── Views ──────────────────────────────────────────────────────

    /// All current instances of a deployment (empty when unknown).
    pub async fn list(&self, deployment_id: &str) -> Vec<Instance> {
        let deployments = self.deployments.read().await;
        deployments
            .get(deployment_id)
            .map(|e| e.slots.iter().map(|s| s.instance.clone()).collect())
            .unwrap_or_default()
    }

    /// Snapshot of the routable (`running`) subset.
    pub async fn running(&self, deployment_id: &str) -> Vec<Instance> {
        let deployments = self.deployments.read().await;
        deployments
            .get(deployment_id)
            .map(|e| {
                e.slots
                    .iter()
                    .filter(|s| s.instance.status == InstanceStatus::Running)
                    .map(|s| s.instance.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Instances that count toward scaling bounds: `starting + running`.
    /// Draining instances are already on the way out.
    pub async fn active_count(&self, deployment_id: &str) -> u32 {
        let deployments = self.deployments.read().await;
        deployments
            .get(deployment_id)
            .map(|e| {
                e.slots
                    .iter()
                    .filter(|s| {
                        matches!(
                            s.instance.status,
                            InstanceStatus::Starting | InstanceStatus::Running
                        )
                    })
                    .count() as u32
            })
            .unwrap_or(0)
    }

    /// Whether the pool has ever provisioned this deployment.
    pub async fn contains(&self, deployment_id: &str) -> bool {
        self.deployments.read().await.contains_key(deployment_id)
    }

    /// Ids of all deployments with a pool entry.
    pub async fn deployment_ids(&self) -> Vec<DeploymentId> {
        self.deployments.read().await.keys().cloned().collect()
    }

    // ── Request accounting ─────────────────────────────────────────

    /// Assign a request to an instance. Draining instances still accept
    /// requests that were selected before the drain began.
    pub async fn begin_request(&self, deployment_id: &str, instance_id: &str) -> PoolResult<()> {
        let mut deployments = self.deployments.write().await;
        let slot = find_slot(&mut deployments, deployment_id, instance_id)
            .map_err(|_| PoolError::InstanceGone(instance_id.to_string()))?;
        match slot.instance.status {
            InstanceStatus::Running | InstanceStatus::Draining => {
                slot.inflight += 1;
                Ok(())
            }
            _ => Err(PoolError::InstanceGone(instance_id.to_string())),
        }
    }

    /// Complete a request: fold the observed latency into the instance's
    /// moving average and release the in-flight slot. A draining instance
    /// that goes idle here stops immediately.
    ///
    /// Fails with `InstanceGone` when the instance was force-stopped
    /// while the request was in flight.
    pub async fn complete_request(
        &self,
        deployment_id: &str,
        instance_id: &str,
        latency_ms: f64,
    ) -> PoolResult<()> {
        let mut deployments = self.deployments.write().await;
        let entry = deployments
            .get_mut(deployment_id)
            .ok_or_else(|| PoolError::InstanceGone(instance_id.to_string()))?;
        let Some(idx) = entry
            .slots
            .iter()
            .position(|s| s.instance.id == instance_id)
        else {
            return Err(PoolError::InstanceGone(instance_id.to_string()));
        };

        let slot = &mut entry.slots[idx];
        slot.inflight = slot.inflight.saturating_sub(1);
        slot.instance.request_count += 1;
        slot.instance.avg_response_time_ms = if slot.instance.request_count == 1 {
            latency_ms
        } else {
            slot.instance.avg_response_time_ms
                + EMA_ALPHA * (latency_ms - slot.instance.avg_response_time_ms)
        };

        if slot.instance.status == InstanceStatus::Draining && slot.inflight == 0 {
            let slot = entry.slots.remove(idx);
            debug!(
                %deployment_id,
                instance_id = %slot.instance.id,
                "drained instance stopped"
            );
        }
        Ok(())
    }

    /// Telemetry hook for the cpu/memory gauges on an instance.
    pub async fn update_usage(
        &self,
        deployment_id: &str,
        instance_id: &str,
        cpu: f64,
        memory: f64,
    ) -> PoolResult<()> {
        let mut deployments = self.deployments.write().await;
        let slot = find_slot(&mut deployments, deployment_id, instance_id)?;
        slot.instance.cpu_usage = cpu;
        slot.instance.memory_usage = memory;
        Ok(())
    }

    // ── Drain reaper ───────────────────────────────────────────────

    /// Sweep draining instances: idle ones stop gracefully, ones past
    /// their deadline are force-stopped (their in-flight requests fail
    /// with a retryable error on completion). Returns the instances
    /// removed in this sweep.
    pub async fn reap(&self) -> Vec<Instance> {
        let now = epoch_millis();
        let mut stopped = Vec::new();
        let mut deployments = self.deployments.write().await;

        for (deployment_id, entry) in deployments.iter_mut() {
            entry.slots.retain_mut(|slot| {
                if slot.instance.status != InstanceStatus::Draining {
                    return true;
                }
                let expired = slot.drain_deadline.is_some_and(|d| now >= d);
                if slot.inflight == 0 {
                    slot.instance.status = InstanceStatus::Stopped;
                    debug!(%deployment_id, instance_id = %slot.instance.id, "drained instance stopped");
                } else if expired {
                    slot.instance.status = InstanceStatus::Stopped;
                    info!(
                        %deployment_id,
                        instance_id = %slot.instance.id,
                        inflight = slot.inflight,
                        "drain window elapsed, instance force-stopped"
                    );
                } else {
                    return true;
                }
                stopped.push(slot.instance.clone());
                false
            });
        }
        stopped
    }

    /// Run the reaper loop until the shutdown signal fires.
    pub async fn run_reaper(
        &self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "drain reaper started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.reap().await;
                }
                _ = shutdown.changed() => {
                    info!("drain reaper shutting down");
                    break;
                }
            }
        }
    }
}

/// Locate a slot by deployment and instance id.
fn find_slot<'a>(
    deployments: &'a mut HashMap<DeploymentId, DeploymentSlots>,
    deployment_id: &str,
    instance_id: &str,
) -> PoolResult<&'a mut Slot> {
    let entry = deployments
        .get_mut(deployment_id)
        .ok_or_else(|| PoolError::UnknownDeployment(deployment_id.to_string()))?;
    entry
        .slots
        .iter_mut()
        .find(|s| s.instance.id == instance_id)
        .ok_or_else(|| PoolError::UnknownInstance(instance_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool() -> InstancePool {
        InstancePool::new(PoolConfig::default())
    }

    fn short_drain_pool() -> InstancePool {
        InstancePool::new(PoolConfig {
            port_base: 10_000,
            drain_window: Duration::from_millis(0),
        })
    }

    async fn ready_instance(pool: &InstancePool, deployment_id: &str) -> Instance {
        let inst = pool.add(deployment_id).await.unwrap();
        pool.mark_ready(deployment_id, &inst.id).await.unwrap()
    }

    // ── Ports ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn ports_allocate_sequentially() {
        let pool = test_pool();
        let a = pool.add("deploy-1").await.unwrap();
        let b = pool.add("deploy-1").await.unwrap();
        let c = pool.add("deploy-1").await.unwrap();
        assert_eq!((a.port, b.port, c.port), (10_000, 10_001, 10_002));
    }

    #[tokio::test]
    async fn ports_are_per_deployment() {
        let pool = test_pool();
        let a = pool.add("deploy-1").await.unwrap();
        let b = pool.add("deploy-2").await.unwrap();
        assert_eq!(a.port, 10_000);
        assert_eq!(b.port, 10_000);
    }

    #[tokio::test]
    async fn lowest_free_port_is_reused() {
        let pool = test_pool();
        ready_instance(&pool, "deploy-1").await;
        ready_instance(&pool, "deploy-1").await;

        // Drains the newest (port 10001); it is idle so it stops at once.
        let removed = pool.remove("deploy-1").await.unwrap().unwrap();
        assert_eq!(removed.port, 10_001);
        assert_eq!(removed.status, InstanceStatus::Stopped);

        let next = pool.add("deploy-1").await.unwrap();
        assert_eq!(next.port, 10_001);
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    #[tokio::test]
    async fn instances_start_in_starting_state() {
        let pool = test_pool();
        let inst = pool.add("deploy-1").await.unwrap();
        assert_eq!(inst.status, InstanceStatus::Starting);
        assert_eq!(inst.health_check_url, "http://localhost:10000/health");
    }

    #[tokio::test]
    async fn mark_ready_is_idempotent() {
        let pool = test_pool();
        let inst = pool.add("deploy-1").await.unwrap();

        let once = pool.mark_ready("deploy-1", &inst.id).await.unwrap();
        assert_eq!(once.status, InstanceStatus::Running);
        let twice = pool.mark_ready("deploy-1", &inst.id).await.unwrap();
        assert_eq!(twice.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn mark_ready_unknown_instance_fails() {
        let pool = test_pool();
        pool.add("deploy-1").await.unwrap();
        assert!(matches!(
            pool.mark_ready("deploy-1", "inst-nope").await,
            Err(PoolError::UnknownInstance(_))
        ));
        assert!(matches!(
            pool.mark_ready("deploy-9", "inst-nope").await,
            Err(PoolError::UnknownDeployment(_))
        ));
    }

    #[tokio::test]
    async fn remove_targets_newest_running() {
        let pool = test_pool();
        let first = ready_instance(&pool, "deploy-1").await;
        let second = ready_instance(&pool, "deploy-1").await;

        let removed = pool.remove("deploy-1").await.unwrap().unwrap();
        assert_eq!(removed.id, second.id);

        let remaining = pool.list("deploy-1").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, first.id);
    }

    #[tokio::test]
    async fn remove_without_running_instances_returns_none() {
        let pool = test_pool();
        pool.add("deploy-1").await.unwrap(); // still starting
        assert!(pool.remove("deploy-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_unknown_deployment_fails() {
        let pool = test_pool();
        assert!(matches!(
            pool.remove("deploy-9").await,
            Err(PoolError::UnknownDeployment(_))
        ));
    }

    #[tokio::test]
    async fn active_count_excludes_draining() {
        let pool = test_pool();
        ready_instance(&pool, "deploy-1").await;
        ready_instance(&pool, "deploy-1").await;
        assert_eq!(pool.active_count("deploy-1").await, 2);

        // Pin an in-flight request on the newest instance so the drain
        // lingers instead of stopping immediately.
        let newest = ready_instance(&pool, "deploy-1").await;
        pool.begin_request("deploy-1", &newest.id).await.unwrap();
        let removed = pool.remove("deploy-1").await.unwrap().unwrap();
        assert_eq!(removed.id, newest.id);
        assert_eq!(removed.status, InstanceStatus::Draining);

        // Draining no longer counts toward bounds, but is still listed.
        assert_eq!(pool.active_count("deploy-1").await, 2);
        assert_eq!(pool.list("deploy-1").await.len(), 3);
    }

    #[tokio::test]
    async fn draining_excluded_from_running_snapshot() {
        let pool = test_pool();
        ready_instance(&pool, "deploy-1").await;
        let newest = ready_instance(&pool, "deploy-1").await;
        pool.begin_request("deploy-1", &newest.id).await.unwrap();
        pool.remove("deploy-1").await.unwrap();

        let running = pool.running("deploy-1").await;
        assert_eq!(running.len(), 1);
        assert_ne!(running[0].id, newest.id);
    }

    #[tokio::test]
    async fn drain_completes_when_last_request_finishes() {
        let pool = test_pool();
        let inst = ready_instance(&pool, "deploy-1").await;
        pool.begin_request("deploy-1", &inst.id).await.unwrap();
        pool.remove("deploy-1").await.unwrap();
        assert_eq!(pool.list("deploy-1").await.len(), 1);

        pool.complete_request("deploy-1", &inst.id, 12.0).await.unwrap();
        assert!(pool.list("deploy-1").await.is_empty());
    }

    #[tokio::test]
    async fn reaper_force_stops_after_deadline() {
        let pool = short_drain_pool();
        let inst = ready_instance(&pool, "deploy-1").await;
        pool.begin_request("deploy-1", &inst.id).await.unwrap();
        pool.remove("deploy-1").await.unwrap();

        // Deadline is immediate; the sweep force-stops despite in-flight.
        let stopped = pool.reap().await;
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].status, InstanceStatus::Stopped);
        assert!(pool.list("deploy-1").await.is_empty());

        // The in-flight request now fails retryably.
        assert!(matches!(
            pool.complete_request("deploy-1", &inst.id, 5.0).await,
            Err(PoolError::InstanceGone(_))
        ));
    }

    #[tokio::test]
    async fn reaper_leaves_busy_instances_inside_window() {
        let pool = test_pool(); // 30s window
        let inst = ready_instance(&pool, "deploy-1").await;
        pool.begin_request("deploy-1", &inst.id).await.unwrap();
        pool.remove("deploy-1").await.unwrap();

        assert!(pool.reap().await.is_empty());
        assert_eq!(pool.list("deploy-1").await.len(), 1);
    }

    // ── Rollbacks ──────────────────────────────────────────────────

    #[tokio::test]
    async fn discard_removes_starting_instance() {
        let pool = test_pool();
        let inst = pool.add("deploy-1").await.unwrap();
        pool.discard("deploy-1", &inst.id).await.unwrap();
        assert!(pool.list("deploy-1").await.is_empty());
    }

    #[tokio::test]
    async fn reinstate_restores_draining_instance() {
        let pool = test_pool();
        let inst = ready_instance(&pool, "deploy-1").await;
        pool.begin_request("deploy-1", &inst.id).await.unwrap();
        pool.remove("deploy-1").await.unwrap();

        pool.reinstate("deploy-1", &inst.id).await.unwrap();
        assert_eq!(pool.running("deploy-1").await.len(), 1);
        assert_eq!(pool.active_count("deploy-1").await, 1);
    }

    // ── Request accounting ─────────────────────────────────────────

    #[tokio::test]
    async fn first_latency_seeds_the_average() {
        let pool = test_pool();
        let inst = ready_instance(&pool, "deploy-1").await;

        pool.begin_request("deploy-1", &inst.id).await.unwrap();
        pool.complete_request("deploy-1", &inst.id, 100.0).await.unwrap();

        let listed = &pool.list("deploy-1").await[0];
        assert_eq!(listed.request_count, 1);
        assert_eq!(listed.avg_response_time_ms, 100.0);
    }

    #[tokio::test]
    async fn ema_folds_in_subsequent_latencies() {
        let pool = test_pool();
        let inst = ready_instance(&pool, "deploy-1").await;

        for latency in [100.0, 50.0] {
            pool.begin_request("deploy-1", &inst.id).await.unwrap();
            pool.complete_request("deploy-1", &inst.id, latency).await.unwrap();
        }

        // 100 + 0.2 * (50 - 100) = 90
        let listed = &pool.list("deploy-1").await[0];
        assert_eq!(listed.request_count, 2);
        assert!((listed.avg_response_time_ms - 90.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn begin_request_rejects_starting_instance() {
        let pool = test_pool();
        let inst = pool.add("deploy-1").await.unwrap();
        assert!(matches!(
            pool.begin_request("deploy-1", &inst.id).await,
            Err(PoolError::InstanceGone(_))
        ));
    }

    #[tokio::test]
    async fn usage_gauges_are_settable() {
        let pool = test_pool();
        let inst = ready_instance(&pool, "deploy-1").await;
        pool.update_usage("deploy-1", &inst.id, 62.5, 40.0).await.unwrap();

        let listed = &pool.list("deploy-1").await[0];
        assert_eq!(listed.cpu_usage, 62.5);
        assert_eq!(listed.memory_usage, 40.0);
    }

    #[tokio::test]
    async fn views_on_unknown_deployment_are_empty() {
        let pool = test_pool();
        assert!(pool.list("deploy-9").await.is_empty());
        assert!(pool.running("deploy-9").await.is_empty());
        assert_eq!(pool.active_count("deploy-9").await, 0);
        assert!(!pool.contains("deploy-9").await);
    }
}
