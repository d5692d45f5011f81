use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::api::response::Envelope;
use crate::AppState;

/// Bearer-token gate for `/api`. Open when no token is configured.
pub async fn require_token(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let Some(expected) = state.api_token.as_deref() else {
        return next.run(req).await;
    };
    let presented = req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if presented == Some(expected) {
        next.run(req).await
    } else {
        warn!(event = "AUTH_REJECTED", path = %req.uri().path(), "Missing or invalid API token");
        let status = StatusCode::UNAUTHORIZED;
        (status, Envelope::<()>::error(status, "missing or invalid API token".into())).into_response()
    }
}
