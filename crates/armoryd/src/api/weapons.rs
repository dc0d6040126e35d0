//! Handlers for weapon lookup and custody transactions.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/weapon_info/` | `{qr_code}`; holder and recommended action |
//! | `POST` | `/weapon_transaction/` | `{personnel_id, face_image, qr_code, transaction_type}` |
//! | `GET`  | `/weapons/` | |
//! | `POST` | `/weapons/` | `{serial_number, model, qr_code?, status?}` |
//! | `GET`  | `/transactions/` | Optional `?weapon=<code>&limit=<n>` |

use armory_core::types::NewWeapon;
use armory_core::{weapon_info as lookup_weapon, ArmoryStore, TransactionKind, TransactionOutcome, Weapon};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{decode_image, require, AppState, PeerAddr};
use crate::api::error::ApiError;
use crate::engine::TransactionJob;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 1000;

fn weapon_json(weapon: &Weapon) -> Value {
    json!({
        "id": weapon.id,
        "serial_number": weapon.serial_number,
        "model": weapon.model,
        "qr_code": weapon.qr_code,
        "status": weapon.status,
        "location": weapon.location,
    })
}

// ─── Lookup ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WeaponInfoBody {
    pub qr_code: Option<String>,
}

/// `POST /weapon_info/`
pub async fn weapon_info(
    State(state): State<AppState>,
    Json(body): Json<WeaponInfoBody>,
) -> Result<Json<Value>, ApiError> {
    let code = require("qr_code", body.qr_code.as_deref())?;
    let info = lookup_weapon(&state.store, code)
        .await
        .map_err(ApiError::Store)?
        .ok_or_else(|| ApiError::NotFound("Weapon not found with the provided QR code".into()))?;

    let personnel_info = info.holder.as_ref().map(|s| {
        json!({
            "id_number": s.id_number,
            "name": format!("{} {}", s.first_name, s.last_name),
            "rank": s.rank,
        })
    });
    Ok(Json(json!({
        "weapon_info": weapon_json(&info.weapon),
        "personnel_id": info.weapon.assigned_subject_id,
        "personnel_info": personnel_info,
        "recommended_action": info.recommended,
    })))
}

// ─── Transaction ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TransactionBody {
    pub personnel_id: Option<String>,
    pub face_image: Option<String>,
    pub qr_code: Option<String>,
    pub transaction_type: Option<String>,
    pub notes: Option<String>,
}

/// `POST /weapon_transaction/`
///
/// Unknown weapon or subject is a 404; a duplicate trigger while the same
/// pair is verifying is a 409. Every other outcome, including a refused
/// transition, is a 200 carrying `verified` and `transaction_success`.
pub async fn weapon_transaction(
    State(state): State<AppState>,
    peer: PeerAddr,
    Json(body): Json<TransactionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let subject_id = require("personnel_id", body.personnel_id.as_deref())?;
    let code = require("qr_code", body.qr_code.as_deref())?;
    let image = decode_image("face_image", body.face_image.as_deref())?;
    let requested = body.transaction_type.as_deref().unwrap_or("checkin");
    let kind = TransactionKind::parse(requested)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown transaction_type {requested:?}")))?;

    let notes = body.notes.or_else(|| {
        peer.0
            .as_ref()
            .map(|addr| format!("via armoryd from {addr}"))
    });
    let outcome = state
        .engine
        .transact(TransactionJob {
            subject_id: subject_id.to_string(),
            weapon_code: code.to_string(),
            image,
            kind,
            source: peer.0,
            notes,
        })
        .await?;

    let status = match &outcome {
        TransactionOutcome::WeaponNotFound { .. } | TransactionOutcome::SubjectNotFound { .. } => {
            return Err(ApiError::NotFound(outcome.message()));
        }
        TransactionOutcome::Busy => StatusCode::CONFLICT,
        _ => StatusCode::OK,
    };

    let mut response = json!({
        "verified": outcome.verified(),
        "transaction_success": outcome.transaction_success(),
        "message": outcome.message(),
        "confidence": outcome.confidence(),
        "transaction_type": kind,
    });
    if let TransactionOutcome::Completed { records, weapon, .. } = &outcome {
        response["weapon_info"] = weapon_json(weapon);
        response["transaction_ids"] = json!(records.iter().map(|r| r.id).collect::<Vec<_>>());
    }
    Ok((status, Json(response)))
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// `GET /weapons/`
pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Weapon>>, ApiError> {
    Ok(Json(state.store.list_weapons().await?))
}

/// `POST /weapons/`
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<NewWeapon>,
) -> Result<impl IntoResponse, ApiError> {
    if body.serial_number.trim().is_empty() {
        return Err(ApiError::BadRequest("serial_number is required".into()));
    }
    let weapon = state.store.add_weapon(body).await?;
    tracing::info!(weapon_id = weapon.id, serial = %weapon.serial_number, "weapon added");
    Ok((StatusCode::CREATED, Json(weapon)))
}

// ─── History ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    /// QR payload or serial number.
    pub weapon: Option<String>,
    pub limit: Option<usize>,
}

/// `GET /transactions/`
pub async fn transactions(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Value>, ApiError> {
    let weapon_id = match params.weapon.as_deref() {
        Some(code) => Some(
            state
                .store
                .find_weapon_by_code(code)
                .await?
                .ok_or_else(|| ApiError::NotFound("Weapon not found".into()))?
                .id,
        ),
        None => None,
    };
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let records = state.store.recent_transactions(weapon_id, limit).await?;
    Ok(Json(json!({ "count": records.len(), "transactions": records })))
}
