//! HTTP clients for the two remote services the daemon depends on: the
//! InsightFace embedding server and the remote armory's template listing.

use std::time::Duration;

use armory_core::sync::{FaceData, RemoteEntry, TemplateSource};
use armory_core::types::{BoundingBox, DetectedFace, Embedding};
use armory_core::{EmbeddingProvider, Metric, ProviderError};
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Faces requested from `/detect` per frame. More than one lets the
/// debouncer see crowded frames and reset.
const DETECT_MAX_FACES: u32 = 5;

fn join(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

// ─── Embedding provider ──────────────────────────────────────────────────────

#[derive(Serialize)]
struct ImageBody<'a> {
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_faces: Option<u32>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embeddings: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct DetectResponse {
    #[serde(default)]
    faces: Vec<DetectedBox>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct DetectedBox {
    /// `[x1, y1, x2, y2]`
    bbox: [f32; 4],
    #[serde(default)]
    score: f32,
}

impl From<DetectedBox> for BoundingBox {
    fn from(d: DetectedBox) -> Self {
        let [x1, y1, x2, y2] = d.bbox;
        BoundingBox {
            x: x1,
            y: y1,
            width: (x2 - x1).max(0.0),
            height: (y2 - y1).max(0.0),
            confidence: d.score,
        }
    }
}

/// Client for an InsightFace server (`/extract_embeddings`, `/detect`).
///
/// The server embeds only the largest face and does not report its box,
/// so [`EmbeddingProvider::detect_and_embed`] yields at most one face.
#[derive(Clone)]
pub struct InsightFaceProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    metric: Metric,
}

impl InsightFaceProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        metric: Metric,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
            metric,
        })
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &ImageBody<'_>,
    ) -> Result<T, ProviderError> {
        let mut req = self.client.post(join(&self.base_url, path)).json(body);
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ProviderError::Unavailable(format!("{path} returned {status}")));
        }
        resp.json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))
    }
}

fn classify_error(message: String) -> ProviderError {
    if message.to_ascii_lowercase().contains("no face") {
        ProviderError::NoFace
    } else {
        ProviderError::Unavailable(message)
    }
}

impl EmbeddingProvider for InsightFaceProvider {
    fn metric(&self) -> Metric {
        self.metric
    }

    async fn detect_and_embed(&self, image: &[u8]) -> Result<Vec<DetectedFace>, ProviderError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        let resp: EmbeddingResponse = self
            .post(
                "extract_embeddings",
                &ImageBody {
                    image: &encoded,
                    max_faces: None,
                },
            )
            .await?;

        if let Some(message) = resp.error {
            return Err(classify_error(message));
        }
        let payload = resp
            .embeddings
            .ok_or_else(|| ProviderError::Malformed("response has neither embeddings nor error".into()))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| ProviderError::Malformed(format!("embedding base64: {e}")))?;
        let embedding =
            Embedding::from_le_bytes(&bytes).map_err(|e| ProviderError::Malformed(e.to_string()))?;

        Ok(vec![DetectedFace {
            bbox: BoundingBox::default(),
            embedding,
        }])
    }

    async fn detect(&self, image: &[u8]) -> Result<Vec<BoundingBox>, ProviderError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        let resp: DetectResponse = self
            .post(
                "detect",
                &ImageBody {
                    image: &encoded,
                    max_faces: Some(DETECT_MAX_FACES),
                },
            )
            .await?;
        if let Some(message) = resp.error {
            return Err(classify_error(message));
        }
        Ok(resp.faces.into_iter().map(BoundingBox::from).collect())
    }
}

// ─── Remote template source ──────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },
}

#[derive(Deserialize)]
struct ListFacesResponse {
    #[serde(default)]
    records: Vec<RemoteEntry>,
}

/// Reads templates from another armory's `list_faces/` and
/// `get_face_data/{id}/` endpoints.
#[derive(Clone)]
pub struct HttpTemplateSource {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpTemplateSource {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token,
        })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, RemoteError> {
        let url = join(&self.base_url, path);
        let mut req = self.client.get(&url);
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Token {token}"));
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::Status { url, status, body });
        }
        Ok(resp.json().await?)
    }
}

impl TemplateSource for HttpTemplateSource {
    type Error = RemoteError;

    async fn list_entries(&self) -> Result<Vec<RemoteEntry>, RemoteError> {
        let resp: ListFacesResponse = self.get_json("list_faces/").await?;
        Ok(resp.records)
    }

    async fn fetch_face_data(&self, subject_id: &str) -> Result<FaceData, RemoteError> {
        self.get_json(&format!("get_face_data/{subject_id}/")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armory_core::testing::test_image;
    use axum::extract::Path;
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};

    /// Serve `router` on an ephemeral port and return its base URL.
    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/api")
    }

    fn encoded(values: &[f32]) -> String {
        FaceData::encode(&Embedding::new(values.to_vec()))
    }

    fn provider(base: String) -> InsightFaceProvider {
        InsightFaceProvider::new(base, Some("k3y".into()), Metric::Cosine, Duration::from_secs(5))
            .unwrap()
    }

    #[tokio::test]
    async fn test_extract_embeddings_sends_key_and_decodes() {
        let router = Router::new().route(
            "/api/extract_embeddings",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(headers["x-api-key"], "k3y");
                assert!(body["image"].as_str().is_some_and(|s| !s.is_empty()));
                Json(json!({ "embeddings": encoded(&[0.5, -0.25, 1.0]), "status": "SUCCESS" }))
            }),
        );
        let faces = provider(serve(router).await)
            .detect_and_embed(&test_image(1))
            .await
            .unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].embedding.values, vec![0.5, -0.25, 1.0]);
    }

    #[tokio::test]
    async fn test_no_face_error_body() {
        let router = Router::new().route(
            "/api/extract_embeddings",
            post(|| async { Json(json!({ "error": "No face detected" })) }),
        );
        let err = provider(serve(router).await)
            .detect_and_embed(&test_image(1))
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::NoFace);
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let router = Router::new().route(
            "/api/extract_embeddings",
            post(|| async { (axum::http::StatusCode::BAD_GATEWAY, "down") }),
        );
        let err = provider(serve(router).await)
            .detect_and_embed(&test_image(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_unreachable_is_unavailable() {
        let err = provider("http://127.0.0.1:1/api".into())
            .detect_and_embed(&test_image(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_detect_converts_corner_boxes() {
        let router = Router::new().route(
            "/api/detect",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["max_faces"], 5);
                Json(json!({ "faces": [
                    { "bbox": [10.0, 20.0, 130.0, 180.0], "landmarks": null, "score": 0.97 }
                ]}))
            }),
        );
        let boxes = provider(serve(router).await).detect(&test_image(1)).await.unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].width, 120.0);
        assert_eq!(boxes[0].height, 160.0);
        assert_eq!(boxes[0].confidence, 0.97);
    }

    #[tokio::test]
    async fn test_template_source_lists_and_fetches() {
        let router = Router::new()
            .route(
                "/api/list_faces/",
                get(|headers: HeaderMap| async move {
                    assert_eq!(headers["authorization"], "Token t0k");
                    Json(json!({
                        "status": "success",
                        "count": 1,
                        "records": [{
                            "personnel_id": "101",
                            "registration_date": "2024-01-01T00:00:00+00:00",
                            "last_updated": "2024-01-02T00:00:00+00:00",
                            "has_embedding": true
                        }]
                    }))
                }),
            )
            .route(
                "/api/get_face_data/{id}/",
                get(|Path(id): Path<String>| async move {
                    Json(json!({ "personnel_id": id, "embedding": encoded(&[1.0, 0.0]) }))
                }),
            );
        let source =
            HttpTemplateSource::new(serve(router).await, Some("t0k".into()), Duration::from_secs(5))
                .unwrap();

        let entries = source.list_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].subject_id.as_deref(), Some("101"));
        assert!(entries[0].has_embedding);

        let data = source.fetch_face_data("101").await.unwrap();
        assert_eq!(data.decode().unwrap().unwrap().values, vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_template_source_reports_status() {
        let router = Router::new().route(
            "/api/get_face_data/{id}/",
            get(|| async {
                (
                    axum::http::StatusCode::NOT_FOUND,
                    Json(json!({ "error": "No face record found" })),
                )
            }),
        );
        let source =
            HttpTemplateSource::new(serve(router).await, None, Duration::from_secs(5)).unwrap();
        let err = source.fetch_face_data("999").await.unwrap_err();
        assert!(matches!(err, RemoteError::Status { status, .. } if status == StatusCode::NOT_FOUND));
    }
}
