//! Ambient HTTP status surface (not a spec feature; the kind of ambient
//! observability the teacher always ships alongside its core protocol).
//!
//! Grounded on the teacher's `src/api/http.rs` (axum `AppState`/router shape).

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::cluster::MembershipView;
use crate::election::ElectionCoordinator;

#[derive(Clone)]
pub struct ApiState {
    pub node_id: u64,
    pub membership: Arc<MembershipView>,
    pub election: Arc<ElectionCoordinator>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/members", get(members))
        .route("/leader", get(leader))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct MembersResponse {
    node_id: u64,
    members: Vec<crate::model::RegistryEntry>,
}

async fn members(State(state): State<ApiState>) -> Json<MembersResponse> {
    Json(MembersResponse {
        node_id: state.node_id,
        members: state.membership.all().await,
    })
}

#[derive(Serialize)]
struct LeaderResponse {
    node_id: u64,
    leader_id: Option<u64>,
    is_leader: bool,
}

async fn leader(State(state): State<ApiState>) -> Json<LeaderResponse> {
    Json(LeaderResponse {
        node_id: state.node_id,
        leader_id: state.membership.leader_id().await,
        is_leader: state.election.is_leader().await,
    })
}
