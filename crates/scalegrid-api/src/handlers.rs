//! REST API handlers.
//!
//! Thin glue: each handler delegates to the engine, pool, balancer, store,
//! or estimator and maps component errors onto the HTTP taxonomy
//! (`InvalidRule` → 400, unknown ids → 404, no healthy instances → 503).

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};

use scalegrid_balancer::BalancerError;
use scalegrid_engine::{EngineError, RuleSpec};
use scalegrid_state::{ScalingAction, ScalingEvent, StateError};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn engine_error(err: EngineError) -> (StatusCode, String) {
    let status = match &err {
        EngineError::UnknownDeployment(_) => StatusCode::NOT_FOUND,
        EngineError::State(StateError::InvalidRule(_)) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

fn balancer_error(err: BalancerError) -> (StatusCode, String) {
    let status = match &err {
        BalancerError::UnknownDeployment(_) => StatusCode::NOT_FOUND,
        BalancerError::NoHealthyInstances(_) | BalancerError::InstanceGone(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    (status, err.to_string())
}

// ── Service ────────────────────────────────────────────────────

/// GET /
pub async fn service_info() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "scalegrid",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "features": [
            "auto_scaling",
            "load_balancing",
            "drain_lifecycle",
            "cost_accounting",
            "scaling_history",
        ],
    }))
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy", "service": "scalegrid" }))
}

// ── Rules ──────────────────────────────────────────────────────

/// POST /rules
pub async fn create_rule(
    State(state): State<ApiState>,
    Json(spec): Json<RuleSpec>,
) -> impl IntoResponse {
    match state.engine.create_rule(spec).await {
        Ok(rule) => (StatusCode::CREATED, ApiResponse::ok(rule)).into_response(),
        Err(e) => {
            let (status, msg) = engine_error(e);
            error_response(&msg, status).into_response()
        }
    }
}

#[derive(Deserialize)]
pub struct RuleFilter {
    pub deployment_id: Option<String>,
}

/// GET /rules?deployment_id=
pub async fn list_rules(
    State(state): State<ApiState>,
    Query(filter): Query<RuleFilter>,
) -> impl IntoResponse {
    match state.store.list_rules(filter.deployment_id.as_deref()) {
        Ok(rules) => ApiResponse::ok(rules).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /rules/{id}
pub async fn get_rule(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_rule(&id) {
        Ok(Some(rule)) => ApiResponse::ok(rule).into_response(),
        Ok(None) => error_response("scaling rule not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

#[derive(Deserialize)]
pub struct ToggleParams {
    pub enabled: bool,
}

/// PUT /rules/{id}/toggle?enabled=
pub async fn toggle_rule(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(params): Query<ToggleParams>,
) -> impl IntoResponse {
    match state.store.toggle_rule(&id, params.enabled) {
        Ok(Some(rule)) => ApiResponse::ok(rule).into_response(),
        Ok(None) => error_response("scaling rule not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// DELETE /rules/{id}
pub async fn delete_rule(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.delete_rule(&id) {
        Ok(true) => ApiResponse::ok("deleted").into_response(),
        Ok(false) => error_response("scaling rule not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Instances ──────────────────────────────────────────────────

/// GET /instances/{deployment_id}
///
/// Unknown deployments list as empty rather than 404.
pub async fn list_instances(
    State(state): State<ApiState>,
    Path(deployment_id): Path<String>,
) -> impl IntoResponse {
    ApiResponse::ok(state.pool.list(&deployment_id).await)
}

#[derive(Deserialize)]
pub struct ScaleParams {
    pub target_instances: u32,
}

/// Manual scale outcome: the instance set after reconciliation.
#[derive(Serialize)]
pub struct ScaleResponse {
    pub instances: Vec<scalegrid_state::Instance>,
    pub count: usize,
}

/// POST /instances/{deployment_id}/scale?target_instances=
pub async fn manual_scale(
    State(state): State<ApiState>,
    Path(deployment_id): Path<String>,
    Query(params): Query<ScaleParams>,
) -> impl IntoResponse {
    match state
        .engine
        .set_target(&deployment_id, params.target_instances)
        .await
    {
        Ok(_) => {
            let instances = state.pool.list(&deployment_id).await;
            let count = instances.len();
            ApiResponse::ok(ScaleResponse { instances, count }).into_response()
        }
        Err(e) => {
            let (status, msg) = engine_error(e);
            error_response(&msg, status).into_response()
        }
    }
}

// ── Autoscaling ────────────────────────────────────────────────

/// POST /autoscale/check/{deployment_id}
pub async fn autoscale_check(
    State(state): State<ApiState>,
    Path(deployment_id): Path<String>,
) -> impl IntoResponse {
    match state.engine.evaluate(&deployment_id).await {
        Ok(event) => ApiResponse::ok(event).into_response(),
        Err(e) => {
            let (status, msg) = engine_error(e);
            error_response(&msg, status).into_response()
        }
    }
}

// ── Load balancer ──────────────────────────────────────────────

/// GET /loadbalancer/{deployment_id}/stats
pub async fn balancer_stats(
    State(state): State<ApiState>,
    Path(deployment_id): Path<String>,
) -> impl IntoResponse {
    match state.balancer.stats(&deployment_id).await {
        Ok(stats) => ApiResponse::ok(stats).into_response(),
        Err(e) => {
            let (status, msg) = balancer_error(e);
            error_response(&msg, status).into_response()
        }
    }
}

/// POST /loadbalancer/{deployment_id}/request
pub async fn route_request(
    State(state): State<ApiState>,
    Path(deployment_id): Path<String>,
    Json(request): Json<serde_json::Value>,
) -> impl IntoResponse {
    match state.balancer.route(&deployment_id, request).await {
        Ok(routed) => ApiResponse::ok(routed).into_response(),
        Err(e) => {
            let (status, msg) = balancer_error(e);
            error_response(&msg, status).into_response()
        }
    }
}

// ── Events ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct EventFilter {
    pub deployment_id: Option<String>,
    pub limit: Option<usize>,
}

/// GET /events?deployment_id=&limit=
pub async fn list_events(
    State(state): State<ApiState>,
    Query(filter): Query<EventFilter>,
) -> impl IntoResponse {
    let limit = filter.limit.unwrap_or(50);
    match state.store.list_events(filter.deployment_id.as_deref(), limit) {
        Ok(events) => ApiResponse::ok(events).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// Aggregated scaling history for one deployment.
#[derive(Serialize)]
pub struct ScalingSummary {
    pub deployment_id: String,
    pub current_instances: usize,
    pub total_events: usize,
    pub scale_ups: usize,
    pub scale_downs: usize,
    pub last_event: Option<ScalingEvent>,
}

/// GET /events/{deployment_id}/summary
pub async fn event_summary(
    State(state): State<ApiState>,
    Path(deployment_id): Path<String>,
) -> impl IntoResponse {
    match state.store.event_history(&deployment_id) {
        Ok(history) => {
            let scale_ups = history
                .iter()
                .filter(|e| e.action == ScalingAction::ScaleUp)
                .count();
            let scale_downs = history
                .iter()
                .filter(|e| e.action == ScalingAction::ScaleDown)
                .count();
            let summary = ScalingSummary {
                current_instances: state.pool.list(&deployment_id).await.len(),
                total_events: history.len(),
                scale_ups,
                scale_downs,
                last_event: history.last().cloned(),
                deployment_id,
            };
            ApiResponse::ok(summary).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Cost ───────────────────────────────────────────────────────

/// GET /cost/{deployment_id}
pub async fn deployment_cost(
    State(state): State<ApiState>,
    Path(deployment_id): Path<String>,
) -> impl IntoResponse {
    if !state.pool.contains(&deployment_id).await {
        return error_response("deployment not found", StatusCode::NOT_FOUND).into_response();
    }
    match state.estimator.compute(&deployment_id) {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use scalegrid_balancer::LoadBalancer;
    use scalegrid_cost::CostEstimator;
    use scalegrid_engine::{GaugeMetrics, ScalingEngine};
    use scalegrid_pool::{InstancePool, PoolConfig};
    use scalegrid_state::{InstanceStatus, MetricKind, StateStore};

    fn test_state() -> (ApiState, Arc<GaugeMetrics>) {
        let store = StateStore::open_in_memory().unwrap();
        let pool = Arc::new(InstancePool::new(PoolConfig::default()));
        let gauges = Arc::new(GaugeMetrics::new());
        let engine = Arc::new(ScalingEngine::new(
            store.clone(),
            pool.clone(),
            gauges.clone(),
        ));
        let balancer = Arc::new(LoadBalancer::new(pool.clone()));
        let estimator = CostEstimator::new(store.clone());
        (
            ApiState {
                store,
                pool,
                engine,
                balancer,
                estimator,
            },
            gauges,
        )
    }

    fn cpu_rule(deployment_id: &str) -> RuleSpec {
        RuleSpec {
            deployment_id: deployment_id.to_string(),
            name: "cpu scaling".to_string(),
            metric: MetricKind::Cpu,
            min_instances: 1,
            max_instances: 5,
            scale_up_threshold: 70.0,
            scale_down_threshold: 30.0,
            cooldown_seconds: 300,
            enabled: true,
        }
    }

    async fn mark_all_ready(state: &ApiState, deployment_id: &str) {
        for inst in state.pool.list(deployment_id).await {
            if inst.status == InstanceStatus::Starting {
                state
                    .pool
                    .mark_ready(deployment_id, &inst.id)
                    .await
                    .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn service_endpoints_respond() {
        let resp = service_info().await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = health().await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_list_and_get_rule() {
        let (state, _) = test_state();

        let resp = create_rule(State(state.clone()), Json(cpu_rule("deploy-1")))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = list_rules(
            State(state.clone()),
            Query(RuleFilter {
                deployment_id: Some("deploy-1".to_string()),
            }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let id = state.store.list_rules(None).unwrap()[0].id.clone();
        let resp = get_rule(State(state), Path(id)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn invalid_rule_is_bad_request() {
        let (state, _) = test_state();
        let mut spec = cpu_rule("deploy-1");
        spec.min_instances = 0;

        let resp = create_rule(State(state), Json(spec)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_rule_is_not_found() {
        let (state, _) = test_state();

        let resp = get_rule(State(state.clone()), Path("rule-nope".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = toggle_rule(
            State(state.clone()),
            Path("rule-nope".to_string()),
            Query(ToggleParams { enabled: false }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = delete_rule(State(state), Path("rule-nope".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn toggle_and_delete_rule() {
        let (state, _) = test_state();
        state
            .engine
            .create_rule(cpu_rule("deploy-1"))
            .await
            .unwrap();
        let id = state.store.list_rules(None).unwrap()[0].id.clone();

        let resp = toggle_rule(
            State(state.clone()),
            Path(id.clone()),
            Query(ToggleParams { enabled: false }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = delete_rule(State(state), Path(id)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn instances_list_is_empty_for_unknown_deployment() {
        let (state, _) = test_state();
        let resp = list_instances(State(state), Path("deploy-9".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn manual_scale_unknown_deployment_is_not_found() {
        let (state, _) = test_state();
        let resp = manual_scale(
            State(state),
            Path("deploy-9".to_string()),
            Query(ScaleParams {
                target_instances: 3,
            }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn manual_scale_resizes_pool() {
        let (state, _) = test_state();
        state
            .engine
            .create_rule(cpu_rule("deploy-1"))
            .await
            .unwrap();

        let resp = manual_scale(
            State(state.clone()),
            Path("deploy-1".to_string()),
            Query(ScaleParams {
                target_instances: 3,
            }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.pool.active_count("deploy-1").await, 3);
    }

    #[tokio::test]
    async fn autoscale_check_returns_event() {
        let (state, gauges) = test_state();
        state
            .engine
            .create_rule(cpu_rule("deploy-1"))
            .await
            .unwrap();
        mark_all_ready(&state, "deploy-1").await;
        gauges.set("deploy-1", MetricKind::Cpu, 85.0);

        let resp = autoscale_check(State(state.clone()), Path("deploy-1".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.pool.active_count("deploy-1").await, 2);

        let resp = autoscale_check(State(state), Path("deploy-9".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn routing_without_ready_instances_is_unavailable() {
        let (state, _) = test_state();
        state
            .engine
            .create_rule(cpu_rule("deploy-1"))
            .await
            .unwrap();
        // The bootstrap instance has not reported ready yet.
        let resp = route_request(
            State(state),
            Path("deploy-1".to_string()),
            Json(serde_json::json!({})),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn routing_and_stats_succeed_with_ready_instances() {
        let (state, _) = test_state();
        state
            .engine
            .create_rule(cpu_rule("deploy-1"))
            .await
            .unwrap();
        mark_all_ready(&state, "deploy-1").await;

        let resp = route_request(
            State(state.clone()),
            Path("deploy-1".to_string()),
            Json(serde_json::json!({"input": 1})),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = balancer_stats(State(state), Path("deploy-1".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn events_and_summary_respond() {
        let (state, _) = test_state();
        state
            .engine
            .create_rule(cpu_rule("deploy-1"))
            .await
            .unwrap();
        state.engine.set_target("deploy-1", 3).await.unwrap();

        let resp = list_events(
            State(state.clone()),
            Query(EventFilter {
                deployment_id: Some("deploy-1".to_string()),
                limit: None,
            }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = event_summary(State(state), Path("deploy-1".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cost_endpoint_checks_deployment() {
        let (state, _) = test_state();

        let resp = deployment_cost(State(state.clone()), Path("deploy-9".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        state
            .engine
            .create_rule(cpu_rule("deploy-1"))
            .await
            .unwrap();
        let resp = deployment_cost(State(state), Path("deploy-1".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
