//! The agent's HTTP surface: health, queue inspection and activation.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use super::AllocatorAgent;
use super::queue::PendingActionView;

type AgentState = Arc<AllocatorAgent>;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub last_analysis: Option<DateTime<Utc>>,
    pub pending_actions: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsResponse {
    pub is_active: bool,
    pub last_analysis: Option<DateTime<Utc>>,
    pub pending_actions: Vec<PendingActionView>,
    pub total_actions: usize,
}

pub fn router(agent: AgentState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/activate", post(activate))
        .route("/deactivate", post(deactivate))
        .with_state(agent)
}

async fn health(State(agent): State<AgentState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if agent.is_active() { "healthy" } else { "inactive" },
        last_analysis: agent.last_analysis().await,
        pending_actions: agent.queue().len().await,
        timestamp: Utc::now(),
    })
}

async fn metrics(State(agent): State<AgentState>) -> Json<MetricsResponse> {
    let pending: Vec<PendingActionView> = agent
        .queue()
        .snapshot()
        .await
        .iter()
        .map(|a| a.view())
        .collect();
    Json(MetricsResponse {
        is_active: agent.is_active(),
        last_analysis: agent.last_analysis().await,
        total_actions: pending.len(),
        pending_actions: pending,
    })
}

async fn activate(State(agent): State<AgentState>) -> Json<serde_json::Value> {
    agent.set_active(true);
    Json(json!({"message": "Agent activated"}))
}

async fn deactivate(State(agent): State<AgentState>) -> Json<serde_json::Value> {
    agent.set_active(false);
    Json(json!({"message": "Agent deactivated"}))
}
