//! Personnel seeding, audit listing and daemon status.

use armory_core::{ArmoryStore, Subject};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::api::error::ApiError;

/// `GET /subjects/`
pub async fn list_subjects(State(state): State<AppState>) -> Result<Json<Vec<Subject>>, ApiError> {
    Ok(Json(state.store.list_subjects().await?))
}

/// `POST /subjects/`: insert or update by `id_number`.
pub async fn upsert_subject(
    State(state): State<AppState>,
    Json(subject): Json<Subject>,
) -> Result<impl IntoResponse, ApiError> {
    if subject.id_number.trim().is_empty() {
        return Err(ApiError::BadRequest("id_number is required".into()));
    }
    state.store.upsert_subject(&subject).await?;
    tracing::info!(subject_id = %subject.id_number, "subject saved");
    Ok((StatusCode::CREATED, Json(subject)))
}

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<usize>,
}

/// `GET /attempts/`
pub async fn attempts(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = params.limit.unwrap_or(50).min(1000);
    let attempts = state.store.recent_attempts(limit).await?;
    Ok(Json(json!({ "count": attempts.len(), "attempts": attempts })))
}

/// `GET /status`
pub async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let counts = state.store.counts().await?;
    Ok(Json(json!({
        "daemon": state.info.as_ref(),
        "counts": counts,
    })))
}
