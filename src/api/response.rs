use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Uniform body for every `/api` reply.
#[derive(Serialize, Debug)]
pub struct Envelope<T: Serialize> {
    pub status_code: u16,
    pub status_message: String,
    pub data: Option<T>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self { status_code: 200, status_message: "SUCCESS".into(), data: Some(data) }
    }

    pub fn error(status: StatusCode, message: String) -> Self {
        Self { status_code: status.as_u16(), status_message: message, data: None }
    }
}

impl Envelope<()> {
    pub fn empty() -> Self {
        Self { status_code: 200, status_message: "SUCCESS".into(), data: None }
    }
}

impl<T: Serialize> IntoResponse for Envelope<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}
