//! Status tally over every stored notification.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use courier_common::error::AppError;
use courier_common::types::StatusCounts;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/metrics", get(metrics))
}

/// GET /api/metrics — Count notifications by status.
async fn metrics(State(state): State<AppState>) -> Result<Json<StatusCounts>, AppError> {
    let records = state.store.get_all().await?;
    Ok(Json(StatusCounts::tally(&records)))
}
