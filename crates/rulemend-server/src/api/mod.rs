//! HTTP API handlers.
//!
//! - POST /api/diagnoses - Run a diagnosis session for one reported email

pub mod diagnoses;

use axum::Router;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().nest("/diagnoses", diagnoses::router())
}
