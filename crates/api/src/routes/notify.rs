//! Notification scheduling routes.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use courier_common::error::AppError;
use courier_common::types::{Notification, Status};
use courier_store::mutator;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/notify",
            post(create_notification).get(list_notifications),
        )
        .route(
            "/api/notify/{id}",
            get(get_notification).delete(cancel_notification),
        )
}

#[derive(Debug, Deserialize)]
pub struct CreateNotificationRequest {
    pub message: String,
    pub send_at: DateTime<Utc>,
    /// Missing or zero falls back to the configured default.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelParams {
    /// Remove the record entirely instead of marking it cancelled.
    #[serde(default)]
    pub purge: bool,
}

/// POST /api/notify — Store a notification and schedule it for `send_at`.
async fn create_notification(
    State(state): State<AppState>,
    payload: Result<Json<CreateNotificationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Notification>), AppError> {
    let Json(req) =
        payload.map_err(|e| AppError::Validation(format!("Invalid request body: {}", e.body_text())))?;

    if req.message.trim().is_empty() {
        return Err(AppError::Validation("Message is required".to_string()));
    }

    let max_retries = match req.max_retries {
        Some(n) if n > 0 => n,
        _ => state.config.default_max_retries,
    };

    let notification = Notification::new(req.message, req.send_at, max_retries);
    state.store.create(&notification).await?;
    let placement = state.broker.publish_delayed(&notification).await?;

    tracing::info!(
        notification_id = %notification.id,
        send_at = %notification.send_at,
        placement = ?placement,
        "Notification scheduled"
    );
    Ok((StatusCode::CREATED, Json(notification)))
}

/// GET /api/notify — List every notification, newest first.
async fn list_notifications(
    State(state): State<AppState>,
) -> Result<Json<Vec<Notification>>, AppError> {
    let mut notifications = state.store.get_all().await?;
    // Ids are UUIDv7, so they order by creation time.
    notifications.sort_by(|a, b| b.id.cmp(&a.id));
    Ok(Json(notifications))
}

/// GET /api/notify/{id} — Fetch a single notification.
async fn get_notification(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Notification>, AppError> {
    state
        .store
        .get_by_id(&id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))
}

/// DELETE /api/notify/{id} — Cancel a notification, or remove it with `?purge=true`.
async fn cancel_notification(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<CancelParams>,
) -> Result<StatusCode, AppError> {
    if state.store.get_by_id(&id).await?.is_none() {
        return Err(AppError::NotFound(format!("Notification {} not found", id)));
    }

    if params.purge {
        state.store.delete(&id).await?;
        tracing::info!(notification_id = %id, "Notification purged");
    } else {
        state
            .store
            .update(&id, mutator(|n| n.status = Status::Cancelled))
            .await?;
        tracing::info!(notification_id = %id, "Notification cancelled");
    }

    Ok(StatusCode::NO_CONTENT)
}
