//! scalegrid-api — REST surface for the scaling control plane.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/` | Service info |
//! | GET | `/health` | Liveness |
//! | POST | `/rules` | Create a scaling rule |
//! | GET | `/rules?deployment_id=` | List rules |
//! | GET | `/rules/{id}` | Get one rule |
//! | PUT | `/rules/{id}/toggle?enabled=` | Enable/disable a rule |
//! | DELETE | `/rules/{id}` | Delete a rule |
//! | GET | `/instances/{deployment_id}` | List instances |
//! | POST | `/instances/{deployment_id}/scale?target_instances=` | Manual scale |
//! | POST | `/autoscale/check/{deployment_id}` | Run one evaluation cycle |
//! | GET | `/loadbalancer/{deployment_id}/stats` | Routing stats |
//! | POST | `/loadbalancer/{deployment_id}/request` | Route one request |
//! | GET | `/events?deployment_id=&limit=` | Scaling history |
//! | GET | `/events/{deployment_id}/summary` | History summary |
//! | GET | `/cost/{deployment_id}` | Cost report |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};

use scalegrid_balancer::LoadBalancer;
use scalegrid_cost::CostEstimator;
use scalegrid_engine::ScalingEngine;
use scalegrid_pool::InstancePool;
use scalegrid_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub pool: Arc<InstancePool>,
    pub engine: Arc<ScalingEngine>,
    pub balancer: Arc<LoadBalancer>,
    pub estimator: CostEstimator,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(handlers::service_info))
        .route("/health", get(handlers::health))
        .route("/rules", post(handlers::create_rule).get(handlers::list_rules))
        .route("/rules/{id}", get(handlers::get_rule).delete(handlers::delete_rule))
        .route("/rules/{id}/toggle", put(handlers::toggle_rule))
        .route("/instances/{deployment_id}", get(handlers::list_instances))
        .route("/instances/{deployment_id}/scale", post(handlers::manual_scale))
        .route("/autoscale/check/{deployment_id}", post(handlers::autoscale_check))
        .route("/loadbalancer/{deployment_id}/stats", get(handlers::balancer_stats))
        .route("/loadbalancer/{deployment_id}/request", post(handlers::route_request))
        .route("/events", get(handlers::list_events))
        .route("/events/{deployment_id}/summary", get(handlers::event_summary))
        .route("/cost/{deployment_id}", get(handlers::deployment_cost))
        .with_state(state)
}
