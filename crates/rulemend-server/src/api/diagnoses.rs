//! Diagnosis endpoint.
//!
//! The request body is `{org_id, user_id, report, email, matched_rule_id}` and the
//! response is the finished session's outcome. Sessions that start always return
//! 200, including ones that ended at the round limit or on a reasoning failure.

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use serde::Serialize;

use rulemend_core::diagnosis::{DiagnosisError, DiagnosisRequest};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(create_diagnosis))
}

/// Error response for API errors.
#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
    message: String,
}

impl ApiError {
    fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new("bad_request", message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }
}

fn error_response(err: &DiagnosisError) -> Response {
    match err {
        DiagnosisError::EmptyReport => {
            (StatusCode::BAD_REQUEST, Json(ApiError::bad_request(err.to_string()))).into_response()
        }
        DiagnosisError::RuleNotFound(_) => {
            (StatusCode::NOT_FOUND, Json(ApiError::not_found(err.to_string()))).into_response()
        }
        _ => {
            tracing::error!("Diagnosis failed to start: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal("Failed to start diagnosis")),
            )
                .into_response()
        }
    }
}

async fn create_diagnosis(
    State(state): State<AppState>,
    payload: Result<Json<DiagnosisRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiError::bad_request(rejection.body_text())),
            )
                .into_response();
        }
    };

    match state.orchestrator.diagnose(request).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err) => error_response(&err),
    }
}
