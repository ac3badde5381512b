use crate::api_error::ApiResult;
use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post}
};
use orchestrator::{ActiveCall, AdminApi, SessionOrchestrator};
use providers::BreakerSnapshot;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub admin: AdminApi,
    pub orchestrator: Arc<SessionOrchestrator>
}

impl AppState {
    pub fn new(orchestrator: Arc<SessionOrchestrator>) -> Self {
        Self {
            admin: AdminApi::new(Arc::clone(&orchestrator)),
            orchestrator
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/admin/breakers", get(list_breakers_handler))
        .route("/admin/breakers/{name}", get(breaker_status_handler))
        .route("/admin/breakers/{name}/reset", post(reset_breaker_handler))
        .route("/admin/breakers/{name}/open", post(force_open_breaker_handler))
        .route("/admin/calls", get(active_calls_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "active_sessions": state.orchestrator.active_sessions().len(),
        "providers": state.orchestrator.registry().len(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

pub async fn list_breakers_handler(State(state): State<AppState>) -> Json<Vec<BreakerSnapshot>> {
    Json(state.admin.list_breakers())
}

pub async fn breaker_status_handler(
    State(state): State<AppState>,
    Path(name): Path<String>
) -> ApiResult<Json<BreakerSnapshot>> {
    Ok(Json(state.admin.breaker_status(&name)?))
}

pub async fn reset_breaker_handler(
    State(state): State<AppState>,
    Path(name): Path<String>
) -> ApiResult<Json<BreakerSnapshot>> {
    Ok(Json(state.admin.reset_breaker(&name)?))
}

pub async fn force_open_breaker_handler(
    State(state): State<AppState>,
    Path(name): Path<String>
) -> ApiResult<Json<BreakerSnapshot>> {
    Ok(Json(state.admin.force_open_breaker(&name)?))
}

pub async fn active_calls_handler(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<ActiveCall>>> {
    Ok(Json(state.admin.active_calls().await?))
}
