//! JSON-over-HTTP surface of the daemon, mounted at `/api/face/`.
//!
//! Request and response field names (`personnel_id`, `face_image`,
//! `qr_code`, `transaction_type`) are the wire contract kiosks already
//! speak. Images travel as base64, optionally as a `data:` URL.

pub mod error;
mod faces;
mod registry;
mod weapons;


use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use armory_core::{Metric, ProbeImage, ReassignPolicy};
use armory_store::SqliteStore;
use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::request::Parts,
    routing::{delete, get, post},
    Router,
};
use serde::Serialize;

use crate::engine::EngineHandle;
use error::ApiError;

/// Static facts about the running daemon, reported by `GET status`.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonInfo {
    pub version: &'static str,
    pub strategy: Metric,
    pub threshold: f32,
    pub reassign_policy: ReassignPolicy,
    pub verifier_identity: String,
    pub camera_device: String,
    pub offline: bool,
    pub remote_configured: bool,
    pub encrypted_templates: bool,
    pub reset_delay_ms: u64,
    pub debounce_frames: u32,
    pub min_face_px: f32,
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: SqliteStore,
    pub engine: EngineHandle,
    pub info: Arc<DaemonInfo>,
}

/// Build the daemon's router.
pub fn api_router(state: AppState) -> Router<()> {
    let face = Router::new()
        .route("/register/", post(faces::register))
        .route("/verify/", post(faces::verify))
        .route("/identify/", post(faces::identify))
        .route("/detect/", post(faces::detect))
        .route("/list_faces/", get(faces::list_faces))
        .route("/get_face_data/{id}/", get(faces::get_face_data))
        .route("/faces/{id}/", delete(faces::deactivate))
        .route("/sync/", post(faces::sync))
        .route("/weapon_info/", post(weapons::weapon_info))
        .route("/weapon_transaction/", post(weapons::weapon_transaction))
        .route("/weapons/", get(weapons::list).post(weapons::create))
        .route("/transactions/", get(weapons::transactions))
        .route("/subjects/", get(registry::list_subjects).post(registry::upsert_subject))
        .route("/attempts/", get(registry::attempts))
        .route("/status", get(registry::status));

    Router::new().nest("/api/face", face).with_state(state)
}

/// The caller's address: the socket peer when served with connect info,
/// else the first `X-Forwarded-For` hop.
#[derive(Debug, Clone, Default)]
pub struct PeerAddr(pub Option<String>);

impl<S: Send + Sync> FromRequestParts<S> for PeerAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            return Ok(PeerAddr(Some(addr.ip().to_string())));
        }
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        Ok(PeerAddr(forwarded))
    }
}

/// Decode a required base64 image field.
fn decode_image(field: &str, payload: Option<&str>) -> Result<Vec<u8>, ApiError> {
    let payload = payload
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("{field} is required")))?;
    Ok(ProbeImage::decode_base64(payload)?)
}

fn require<'a>(field: &str, value: Option<&'a str>) -> Result<&'a str, ApiError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("{field} is required")))
}
