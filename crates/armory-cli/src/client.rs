//! Async HTTP client for the armoryd JSON API.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use armory_core::types::{BoundingBox, NewWeapon};
use armory_core::{Subject, TransactionKind};
use base64::Engine as _;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{json, Value};

/// Cheap to clone; the inner [`reqwest::Client`] is `Arc`-based.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

/// Read an image file and base64-encode it for the wire.
pub fn encode_image(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("reading image {}", path.display()))?;
    Ok(encode_bytes(&bytes))
}

pub fn encode_bytes(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[derive(Deserialize)]
struct DetectResponse {
    faces: Vec<BoundingBox>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/face/{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Send a request and return the JSON body. Non-2xx statuses become
    /// errors carrying the server's `error` (or `message`) text.
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Value> {
        let mut req = self.client.request(method.clone(), self.url(path)).query(query);
        if let Some(body) = &body {
            req = req.json(body);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("{method} {path} failed"))?;

        let status = resp.status();
        let value: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let reason = value["error"]
                .as_str()
                .or_else(|| value["message"].as_str())
                .unwrap_or("no details");
            return Err(anyhow!("{method} {path} → {status}: {reason}"));
        }
        Ok(value)
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        self.send(Method::GET, path, query, None).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.send(Method::POST, path, &[], Some(body)).await
    }

    // ── Faces ─────────────────────────────────────────────────────────────

    pub async fn register(&self, subject_id: &str, image: String, operator: Option<&str>) -> Result<Value> {
        self.post(
            "register/",
            json!({ "personnel_id": subject_id, "face_image": image, "operator": operator }),
        )
        .await
    }

    pub async fn verify(&self, subject_id: &str, image: String) -> Result<Value> {
        self.post("verify/", json!({ "personnel_id": subject_id, "face_image": image }))
            .await
    }

    pub async fn identify(&self, image: String) -> Result<Value> {
        self.post("identify/", json!({ "face_image": image })).await
    }

    pub async fn detect(&self, image: String) -> Result<Vec<BoundingBox>> {
        let value = self.post("detect/", json!({ "image": image })).await?;
        let resp: DetectResponse =
            serde_json::from_value(value).context("deserialising detect response")?;
        Ok(resp.faces)
    }

    pub async fn list_faces(&self) -> Result<Value> {
        self.get("list_faces/", &[]).await
    }

    pub async fn deactivate(&self, subject_id: &str) -> Result<Value> {
        self.send(Method::DELETE, &format!("faces/{subject_id}/"), &[], None)
            .await
    }

    pub async fn sync(&self) -> Result<Value> {
        self.post("sync/", json!({})).await
    }

    // ── Weapons ───────────────────────────────────────────────────────────

    pub async fn weapon_info(&self, code: &str) -> Result<Value> {
        self.post("weapon_info/", json!({ "qr_code": code })).await
    }

    pub async fn transaction(
        &self,
        subject_id: &str,
        code: &str,
        kind: TransactionKind,
        image: String,
        notes: Option<&str>,
    ) -> Result<Value> {
        self.post(
            "weapon_transaction/",
            json!({
                "personnel_id": subject_id,
                "qr_code": code,
                "transaction_type": kind,
                "face_image": image,
                "notes": notes,
            }),
        )
        .await
    }

    pub async fn transactions(&self, weapon: Option<&str>, limit: usize) -> Result<Value> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(code) = weapon {
            query.push(("weapon", code.to_string()));
        }
        self.get("transactions/", &query).await
    }

    pub async fn add_weapon(&self, weapon: &NewWeapon) -> Result<Value> {
        self.post("weapons/", json!(weapon)).await
    }

    pub async fn list_weapons(&self) -> Result<Value> {
        self.get("weapons/", &[]).await
    }

    // ── Registry / audit ──────────────────────────────────────────────────

    pub async fn add_subject(&self, subject: &Subject) -> Result<Value> {
        self.post("subjects/", json!(subject)).await
    }

    pub async fn attempts(&self, limit: usize) -> Result<Value> {
        self.get("attempts/", &[("limit", limit.to_string())]).await
    }

    pub async fn status(&self) -> Result<Value> {
        self.get("status", &[]).await
    }
}
