//! HTTP control service handlers

pub mod feedback;
pub mod login;
pub mod resolve;
pub mod search;
pub mod sessions;
pub mod skills;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::state::AppState;

/// Build the full control-service router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(readiness))
        .route("/v1/intent/resolve", post(resolve::resolve_intent))
        .route("/v1/skills", get(skills::list_skills))
        .route("/v1/skills/{id}", get(skills::get_skill))
        .route("/v1/skills/{id}/execute", post(skills::execute_skill))
        .route("/v1/skills/{id}/publish", post(skills::publish_skill))
        .route(
            "/v1/skills/{id}/endpoints/{eid}/recipe",
            post(skills::store_recipe),
        )
        .route("/v1/feedback", post(feedback::submit_feedback))
        .route("/v1/search", post(search::search_global))
        .route("/v1/search/domain", post(search::search_domain))
        .route("/v1/auth/login", post(login::interactive_login))
        .route("/v1/sessions/{domain}", get(sessions::domain_sessions))
        .with_state(state)
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Readiness check response with dependency status
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub service: String,
    pub dependencies: HashMap<String, DependencyStatus>,
}

/// Individual dependency status
#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Liveness probe; 200 whenever the process runs
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "healthy".to_string(),
        service: state.config().service.name.clone(),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
    };
    (StatusCode::OK, Json(response))
}

/// Readiness probe. The marketplace is optional: its state is reported but
/// never flips readiness.
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let mut dependencies = HashMap::new();

    let marketplace_up = state.market().health().await;
    dependencies.insert(
        "marketplace".to_string(),
        DependencyStatus {
            healthy: marketplace_up,
            message: (!marketplace_up).then(|| "index unreachable".to_string()),
        },
    );

    let browser_up = state.browser().is_available().await;
    dependencies.insert(
        "browser".to_string(),
        DependencyStatus {
            healthy: browser_up,
            message: (!browser_up).then(|| "control channel unreachable".to_string()),
        },
    );

    let response = ReadinessResponse {
        ready: true,
        service: state.config().service.name.clone(),
        dependencies,
    };
    (StatusCode::OK, Json(response))
}
