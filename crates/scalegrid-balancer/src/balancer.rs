//! Round-robin load balancer over the running subset of a deployment.
//!
//! Each deployment gets a lane holding the rotating cursor and a window
//! of recent request timestamps for the requests-per-second figure. The
//! cursor is an atomic counter taken modulo the current pool size, so it
//! keeps rotating fairly as the pool grows and shrinks.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use scalegrid_pool::{InstancePool, PoolError};
use scalegrid_state::{DeploymentId, InstanceId, InstanceStatus, epoch_millis};

/// Window over which requests-per-second is computed.
const RPS_WINDOW: Duration = Duration::from_secs(60);

/// Result type alias for balancer operations.
pub type BalancerResult<T> = Result<T, BalancerError>;

/// Errors that can occur while routing.
#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("unknown deployment: {0}")]
    UnknownDeployment(String),

    /// No instance in `running` state — a retryable service-unavailable
    /// condition, not a permanent failure.
    #[error("no healthy instances for deployment: {0}")]
    NoHealthyInstances(String),

    /// The selected instance was stopped while the request was in flight
    /// (drain window elapsed). Retryable.
    #[error("instance became unavailable mid-request: {0}")]
    InstanceGone(String),
}

/// Outcome of one routed request.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingResult {
    pub instance_id: InstanceId,
    pub port: u16,
    pub response_time_ms: f64,
    /// The simulated response: an echo of the request payload.
    pub payload: serde_json::Value,
}

/// Aggregate routing statistics for one deployment.
#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerStats {
    pub deployment_id: DeploymentId,
    pub total_instances: u32,
    pub healthy_instances: u32,
    pub total_requests: u64,
    pub avg_response_time_ms: f64,
    /// Requests per second over the last 60 seconds.
    pub requests_per_second: f64,
}

/// Per-deployment routing state.
struct Lane {
    cursor: AtomicUsize,
    /// Timestamps (epoch ms) of recently routed requests.
    recent: Mutex<VecDeque<u64>>,
}

impl Lane {
    fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            recent: Mutex::new(VecDeque::new()),
        }
    }
}

/// Routes requests across running instances and keeps routing stats.
pub struct LoadBalancer {
    pool: Arc<InstancePool>,
    lanes: RwLock<HashMap<DeploymentId, Arc<Lane>>>,
}

impl LoadBalancer {
    /// Create a balancer over the given pool.
    pub fn new(pool: Arc<InstancePool>) -> Self {
        Self {
            pool,
            lanes: RwLock::new(HashMap::new()),
        }
    }

    /// Route one request to the next instance in rotation.
    ///
    /// Reads a snapshot of the running subset, so an instance that starts
    /// draining concurrently still finishes this request but is excluded
    /// from the next snapshot.
    pub async fn route(
        &self,
        deployment_id: &str,
        request: serde_json::Value,
    ) -> BalancerResult<RoutingResult> {
        if !self.pool.contains(deployment_id).await {
            return Err(BalancerError::UnknownDeployment(deployment_id.to_string()));
        }

        let healthy = self.pool.running(deployment_id).await;
        if healthy.is_empty() {
            return Err(BalancerError::NoHealthyInstances(deployment_id.to_string()));
        }

        let lane = self.lane(deployment_id).await;
        let idx = lane.cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
        let target = &healthy[idx];

        self.pool
            .begin_request(deployment_id, &target.id)
            .await
            .map_err(map_request_err)?;

        let started = Instant::now();
        let payload = serde_json::json!({
            "handled_by": target.id,
            "echo": request,
        });
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.pool
            .complete_request(deployment_id, &target.id, latency_ms)
            .await
            .map_err(map_request_err)?;

        {
            let mut recent = lane.recent.lock().await;
            recent.push_back(epoch_millis());
            prune_window(&mut recent);
        }

        debug!(
            %deployment_id,
            instance_id = %target.id,
            port = target.port,
            "request routed"
        );

        Ok(RoutingResult {
            instance_id: target.id.clone(),
            port: target.port,
            response_time_ms: latency_ms,
            payload,
        })
    }

    /// Routing statistics for one deployment.
    pub async fn stats(&self, deployment_id: &str) -> BalancerResult<LoadBalancerStats> {
        if !self.pool.contains(deployment_id).await {
            return Err(BalancerError::UnknownDeployment(deployment_id.to_string()));
        }

        let instances = self.pool.list(deployment_id).await;
        let healthy = instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Running)
            .count() as u32;
        let total_requests: u64 = instances.iter().map(|i| i.request_count).sum();

        let served: Vec<&_> = instances.iter().filter(|i| i.request_count > 0).collect();
        let avg_response_time_ms = if served.is_empty() {
            0.0
        } else {
            served.iter().map(|i| i.avg_response_time_ms).sum::<f64>() / served.len() as f64
        };

        let requests_per_second = {
            let lane = self.lane(deployment_id).await;
            let mut recent = lane.recent.lock().await;
            prune_window(&mut recent);
            recent.len() as f64 / RPS_WINDOW.as_secs_f64()
        };

        Ok(LoadBalancerStats {
            deployment_id: deployment_id.to_string(),
            total_instances: instances.len() as u32,
            healthy_instances: healthy,
            total_requests,
            avg_response_time_ms,
            requests_per_second,
        })
    }

    /// Get or create the lane for a deployment.
    async fn lane(&self, deployment_id: &str) -> Arc<Lane> {
        if let Some(lane) = self.lanes.read().await.get(deployment_id) {
            return lane.clone();
        }
        let mut lanes = self.lanes.write().await;
        lanes
            .entry(deployment_id.to_string())
            .or_insert_with(|| Arc::new(Lane::new()))
            .clone()
    }
}

/// Drop window entries older than the RPS window.
fn prune_window(recent: &mut VecDeque<u64>) {
    let cutoff = epoch_millis().saturating_sub(RPS_WINDOW.as_millis() as u64);
    while recent.front().is_some_and(|&t| t < cutoff) {
        recent.pop_front();
    }
}

/// Pool failures on the request path are all "the instance went away".
fn map_request_err(err: PoolError) -> BalancerError {
    match err {
        PoolError::UnknownDeployment(d) => BalancerError::UnknownDeployment(d),
        PoolError::UnknownInstance(id) | PoolError::InstanceGone(id) => {
            BalancerError::InstanceGone(id)
        }
        PoolError::PortsExhausted(d) => BalancerError::UnknownDeployment(d),
    }
}
