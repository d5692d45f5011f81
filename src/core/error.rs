use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::{debug, error};

use crate::api::response::Envelope;

pub type Result<T> = std::result::Result<T, FleetError>;

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// Transport failure, timeout, or an unusable response.
    #[error("inference node unavailable: {0}")]
    RemoteUnavailable(String),

    /// The node answered but refused the operation.
    #[error("{0}")]
    RemoteRejected(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl FleetError {
    pub fn status(&self) -> StatusCode {
        match self {
            FleetError::Validation(_) => StatusCode::BAD_REQUEST,
            FleetError::NotFound(_) => StatusCode::NOT_FOUND,
            FleetError::Conflict(_) => StatusCode::CONFLICT,
            FleetError::RemoteUnavailable(_) | FleetError::RemoteRejected(_) => StatusCode::BAD_GATEWAY,
            FleetError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for FleetError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            FleetError::Internal(e) => {
                error!(event = "INTERNAL_ERROR", error = ?e, "Request failed");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Envelope::<()>::error(status, message)).into_response()
    }
}

// Parser detail goes to the log; the client gets a short reason.
impl From<JsonRejection> for FleetError {
    fn from(rejection: JsonRejection) -> Self {
        debug!(event = "REQUEST_REJECTED", detail = %rejection.body_text(), "Unusable JSON body");
        let reason = match rejection {
            JsonRejection::MissingJsonContentType(_) => "expected an application/json body",
            JsonRejection::JsonSyntaxError(_) => "request body is not valid JSON",
            _ => "request body is missing required fields or has wrong types",
        };
        FleetError::Validation(reason.into())
    }
}

impl From<PathRejection> for FleetError {
    fn from(rejection: PathRejection) -> Self {
        debug!(event = "REQUEST_REJECTED", detail = %rejection.body_text(), "Unusable path parameter");
        FleetError::Validation("invalid path parameter".into())
    }
}

impl From<QueryRejection> for FleetError {
    fn from(rejection: QueryRejection) -> Self {
        debug!(event = "REQUEST_REJECTED", detail = %rejection.body_text(), "Unusable query string");
        FleetError::Validation("invalid query string".into())
    }
}
