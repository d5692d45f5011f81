use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::api::extract::{ApiJson, ApiPath, ApiQuery};
use crate::api::{auth, response::Envelope};
use crate::core::domain::{DeployAction, DeployQuery, DeployUpdate, ServerCreate};
use crate::core::error::FleetError;
use crate::AppState;

type ApiResult = Result<axum::response::Response, FleetError>;

pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/add", post(add_server_handler))
        .route("/list_server", get(list_server_handler))
        .route("/:server_id", delete(delete_server_handler))
        .route("/list", get(list_handler))
        .route("/model/:deploy_id", get(get_deploy_handler))
        .route("/update", post(update_handler))
        .route("/load", post(load_handler))
        .route("/unload", post(unload_handler))
        .route("/GPU", get(gpu_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_token));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/api/v1/server", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn add_server_handler(State(state): State<Arc<AppState>>, ApiJson(req): ApiJson<ServerCreate>) -> ApiResult {
    Ok(Envelope::ok(state.fleet.add_server(req).await?).into_response())
}

async fn list_server_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    Ok(Envelope::ok(state.fleet.list_servers().await).into_response())
}

async fn delete_server_handler(State(state): State<Arc<AppState>>, ApiPath(server_id): ApiPath<i64>) -> ApiResult {
    state.fleet.delete_server(server_id).await?;
    Ok(Envelope::empty().into_response())
}

async fn list_handler(State(state): State<Arc<AppState>>, ApiQuery(q): ApiQuery<DeployQuery>) -> ApiResult {
    Ok(Envelope::ok(state.fleet.list_deployments(q.server.as_deref()).await?).into_response())
}

async fn get_deploy_handler(State(state): State<Arc<AppState>>, ApiPath(deploy_id): ApiPath<i64>) -> ApiResult {
    Ok(Envelope::ok(state.fleet.get_deployment(deploy_id).await?).into_response())
}

async fn update_handler(State(state): State<Arc<AppState>>, ApiJson(update): ApiJson<DeployUpdate>) -> ApiResult {
    Ok(Envelope::ok(state.fleet.update_deployment(update).await?).into_response())
}

async fn load_handler(State(state): State<Arc<AppState>>, ApiJson(p): ApiJson<DeployAction>) -> ApiResult {
    state.fleet.load(p.deploy_id).await?;
    Ok((StatusCode::CREATED, Envelope::empty()).into_response())
}

async fn unload_handler(State(state): State<Arc<AppState>>, ApiJson(p): ApiJson<DeployAction>) -> ApiResult {
    state.fleet.unload(p.deploy_id).await?;
    Ok((StatusCode::CREATED, Envelope::empty()).into_response())
}

async fn gpu_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    let gpus = state.fleet.gpu_snapshot().await;
    Ok(Envelope::ok(json!({ "list": gpus })).into_response())
}
