//! Pull active templates from a remote armory into the local store.
//!
//! Used by offline kiosks. Each record is fetched and stored on its own;
//! a bad record is counted and skipped, never fatal to the batch.

use std::future::Future;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{ArmoryStore, StoreError};
use crate::types::Embedding;

/// One row of a remote face listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntry {
    #[serde(default, rename = "personnel_id", alias = "subject_id")]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub registration_date: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub has_embedding: bool,
}

/// A remote template. `embedding` is base64 over little-endian `f32`s.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceData {
    #[serde(default, rename = "personnel_id", alias = "subject_id")]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub embedding: Option<String>,
    #[serde(default)]
    pub registration_date: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
}

impl FaceData {
    pub fn encode(embedding: &Embedding) -> String {
        base64::engine::general_purpose::STANDARD.encode(embedding.to_le_bytes())
    }

    /// Decode the payload. `None` if the record carries no embedding.
    pub fn decode(&self) -> Option<Result<Embedding, String>> {
        let payload = self.embedding.as_deref().filter(|p| !p.is_empty())?;
        Some(
            base64::engine::general_purpose::STANDARD
                .decode(payload)
                .map_err(|e| format!("base64: {e}"))
                .and_then(|bytes| Embedding::from_le_bytes(&bytes).map_err(|e| e.to_string())),
        )
    }
}

/// Somewhere templates can be pulled from.
pub trait TemplateSource: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn list_entries(&self) -> impl Future<Output = Result<Vec<RemoteEntry>, Self::Error>> + Send;

    fn fetch_face_data(
        &self,
        subject_id: &str,
    ) -> impl Future<Output = Result<FaceData, Self::Error>> + Send;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub success_count: usize,
    pub fail_count: usize,
}

#[derive(Error, Debug)]
pub enum SyncError {
    /// The listing itself could not be fetched; nothing was attempted.
    #[error("failed to retrieve face list: {0}")]
    List(#[source] StoreError),
}

pub async fn sync<T, S>(source: &T, store: &S) -> Result<SyncReport, SyncError>
where
    T: TemplateSource,
    S: ArmoryStore,
{
    let entries = source
        .list_entries()
        .await
        .map_err(|e| SyncError::List(Box::new(e)))?;
    tracing::info!(records = entries.len(), "starting template sync");

    let mut report = SyncReport::default();
    for entry in &entries {
        match sync_one(source, store, entry).await {
            Ok(()) => report.success_count += 1,
            Err(reason) => {
                tracing::warn!(subject_id = ?entry.subject_id, %reason, "skipping record");
                report.fail_count += 1;
            }
        }
    }

    tracing::info!(
        synchronized = report.success_count,
        failed = report.fail_count,
        "template sync complete"
    );
    Ok(report)
}

async fn sync_one<T, S>(source: &T, store: &S, entry: &RemoteEntry) -> Result<(), String>
where
    T: TemplateSource,
    S: ArmoryStore,
{
    let subject_id = entry
        .subject_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or("missing identifier")?;

    let data = source
        .fetch_face_data(subject_id)
        .await
        .map_err(|e| format!("fetch failed: {e}"))?;
    let embedding = data.decode().ok_or("missing embedding")??;

    store
        .upsert_template(subject_id, &embedding)
        .await
        .map_err(|e| format!("store failed: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_face_data_round_trip() {
        let embedding = Embedding::new(vec![0.25, -1.5, 3.0]);
        let data = FaceData {
            subject_id: Some("101".into()),
            embedding: Some(FaceData::encode(&embedding)),
            ..Default::default()
        };
        assert_eq!(data.decode().unwrap().unwrap(), embedding);
    }

    #[test]
    fn test_face_data_missing_embedding() {
        let data = FaceData {
            subject_id: Some("101".into()),
            embedding: Some(String::new()),
            ..Default::default()
        };
        assert!(data.decode().is_none());
    }

    #[test]
    fn test_face_data_truncated_payload() {
        let data = FaceData {
            embedding: Some(base64::engine::general_purpose::STANDARD.encode([0u8, 1, 2])),
            ..Default::default()
        };
        assert!(data.decode().unwrap().is_err());
    }

    #[test]
    fn test_remote_entry_accepts_personnel_id() {
        let entry: RemoteEntry =
            serde_json::from_str(r#"{"personnel_id":"101","has_embedding":true}"#).unwrap();
        assert_eq!(entry.subject_id.as_deref(), Some("101"));
    }
}
