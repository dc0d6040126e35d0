//! Handlers for enrollment, verification and template replication.
//!
//! | Method   | Path | Notes |
//! |----------|------|-------|
//! | `POST`   | `/register/` | `{personnel_id, face_image, operator?}` |
//! | `POST`   | `/verify/` | `{personnel_id, face_image}`; 404 without a template |
//! | `POST`   | `/identify/` | `{face_image}` |
//! | `POST`   | `/detect/` | `{image}`; face boxes for frame polling |
//! | `GET`    | `/list_faces/` | Active templates, no embeddings |
//! | `GET`    | `/get_face_data/{id}/` | Base64 embedding of one template |
//! | `DELETE` | `/faces/{id}/` | Soft delete |
//! | `POST`   | `/sync/` | Pull templates from the remote armory |

use armory_core::sync::{FaceData, RemoteEntry};
use armory_core::types::AttemptOutcome;
use armory_core::{ArmoryStore, VerifyOutcome};
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{decode_image, require, AppState, PeerAddr};
use crate::api::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct FaceBody {
    pub personnel_id: Option<String>,
    pub face_image: Option<String>,
    pub operator: Option<String>,
}

// ─── Register ────────────────────────────────────────────────────────────────

/// `POST /register/`
pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<FaceBody>,
) -> Result<Json<Value>, ApiError> {
    let subject_id = require("personnel_id", body.personnel_id.as_deref())?;
    let image = decode_image("face_image", body.face_image.as_deref())?;

    let outcome = state
        .engine
        .register(subject_id.to_string(), image, body.operator)
        .await?;
    Ok(Json(json!({
        "status": "success",
        "message": "Face registered successfully",
        "face_id": outcome.face_id,
        "created": outcome.created,
    })))
}

// ─── Verify ──────────────────────────────────────────────────────────────────

/// `POST /verify/`
pub async fn verify(
    State(state): State<AppState>,
    peer: PeerAddr,
    Json(body): Json<FaceBody>,
) -> Result<Json<Value>, ApiError> {
    let subject_id = require("personnel_id", body.personnel_id.as_deref())?;
    let image = decode_image("face_image", body.face_image.as_deref())?;

    let report = state
        .engine
        .verify(subject_id.to_string(), image, peer.0)
        .await?;

    if report.outcome == VerifyOutcome::NoTemplate {
        return Err(ApiError::NotFound(
            "No face record found for this personnel".into(),
        ));
    }

    let status = match report.attempt.outcome {
        AttemptOutcome::Success => "success",
        AttemptOutcome::Failure => "failed",
        AttemptOutcome::Error => "error",
    };
    let message = match (&report.outcome, report.outcome.error()) {
        (VerifyOutcome::Match { .. }, _) => "Face verified".to_string(),
        (_, Some(detail)) => format!("Face verification failed: {detail}"),
        (_, None) => "Face verification failed".to_string(),
    };
    Ok(Json(json!({
        "status": status,
        "verified": report.verified(),
        "confidence": report.confidence(),
        "message": message,
        "error": report.outcome.error(),
        "attempt_id": report.attempt.id,
    })))
}

// ─── Identify ────────────────────────────────────────────────────────────────

/// `POST /identify/`
pub async fn identify(
    State(state): State<AppState>,
    peer: PeerAddr,
    Json(body): Json<FaceBody>,
) -> Result<Json<Value>, ApiError> {
    let image = decode_image("face_image", body.face_image.as_deref())?;
    let report = state.engine.identify(image, peer.0).await?;

    let identified = report.subject_id.is_some();
    let message = match report.outcome.error() {
        Some(detail) => detail,
        None if identified => "Face identified".to_string(),
        None => "No matching face record".to_string(),
    };
    Ok(Json(json!({
        "identified": identified,
        "personnel_id": report.subject_id,
        "confidence": report.outcome.confidence(),
        "message": message,
    })))
}

// ─── Detect ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DetectBody {
    #[serde(alias = "face_image")]
    pub image: Option<String>,
}

/// `POST /detect/`
pub async fn detect(
    State(state): State<AppState>,
    Json(body): Json<DetectBody>,
) -> Result<Json<Value>, ApiError> {
    let image = decode_image("image", body.image.as_deref())?;
    let faces = state.engine.detect(image).await?;
    Ok(Json(json!({ "count": faces.len(), "faces": faces })))
}

// ─── Replication ─────────────────────────────────────────────────────────────

/// `GET /list_faces/`
pub async fn list_faces(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let summaries = state.store.template_summaries().await?;
    let records: Vec<RemoteEntry> = summaries
        .into_iter()
        .map(|t| RemoteEntry {
            registration_date: Some(t.created_at.to_rfc3339()),
            last_updated: Some(t.updated_at.to_rfc3339()),
            has_embedding: t.dim > 0,
            subject_id: Some(t.subject_id),
        })
        .collect();
    Ok(Json(json!({
        "status": "success",
        "count": records.len(),
        "records": records,
    })))
}

/// `GET /get_face_data/{id}/`
pub async fn get_face_data(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let template = state.store.active_template(&id).await?.ok_or_else(|| {
        ApiError::NotFound(format!("No face record found for personnel ID {id}"))
    })?;
    if template.embedding.dim() == 0 {
        return Err(ApiError::BadRequest("Face record has no embedding data".into()));
    }

    let data = FaceData {
        subject_id: Some(template.subject_id),
        embedding: Some(FaceData::encode(&template.embedding)),
        registration_date: Some(template.created_at.to_rfc3339()),
        last_updated: Some(template.updated_at.to_rfc3339()),
    };
    let mut body = serde_json::to_value(data).map_err(|e| ApiError::Store(Box::new(e)))?;
    body["status"] = json!("success");
    Ok(Json(body))
}

/// `DELETE /faces/{id}/`
pub async fn deactivate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.store.deactivate_template(&id).await? {
        return Err(ApiError::NotFound(format!(
            "No face record found for personnel ID {id}"
        )));
    }
    tracing::info!(subject_id = %id, "template deactivated");
    Ok(Json(json!({ "status": "success", "deactivated": true })))
}

/// `POST /sync/`
pub async fn sync(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let report = state.engine.sync().await?;
    Ok(Json(json!({
        "status": "success",
        "success_count": report.success_count,
        "fail_count": report.fail_count,
    })))
}
