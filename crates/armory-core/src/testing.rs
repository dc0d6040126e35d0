//! Deterministic stand-ins for the provider and a remote template source.
//!
//! Enabled with the `testing` feature so store and daemon tests can drive
//! the full flows without a face-analysis service.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use thiserror::Error;

use crate::provider::{EmbeddingProvider, ProviderError};
use crate::similarity::Metric;
use crate::sync::{FaceData, RemoteEntry, TemplateSource};
use crate::types::{BoundingBox, DetectedFace, Embedding};

/// A valid 64x64 PNG whose pixels are all `shade`. Distinct shades give
/// distinct byte strings, which is all [`ScriptedProvider`] keys on.
pub fn test_image(shade: u8) -> Vec<u8> {
    let img = image::DynamicImage::ImageLuma8(image::GrayImage::from_pixel(64, 64, image::Luma([shade])));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .expect("encoding a PNG into memory");
    out.into_inner()
}

/// A face box large enough to pass the default debounce size.
pub fn face_box(side: f32) -> BoundingBox {
    BoundingBox {
        x: 10.0,
        y: 10.0,
        width: side,
        height: side,
        confidence: 0.99,
    }
}

/// Provider that answers from a table keyed by image bytes. Unknown images
/// contain no face.
pub struct ScriptedProvider {
    metric: Metric,
    scripts: HashMap<Vec<u8>, Result<Vec<DetectedFace>, ProviderError>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(metric: Metric) -> Self {
        Self {
            metric,
            scripts: HashMap::new(),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// One face with this embedding.
    pub fn with_face(self, image: &[u8], embedding: Vec<f32>) -> Self {
        self.with_faces(
            image,
            vec![DetectedFace {
                bbox: face_box(160.0),
                embedding: Embedding::new(embedding),
            }],
        )
    }

    pub fn with_faces(mut self, image: &[u8], faces: Vec<DetectedFace>) -> Self {
        self.scripts.insert(image.to_vec(), Ok(faces));
        self
    }

    pub fn with_error(mut self, image: &[u8], err: ProviderError) -> Self {
        self.scripts.insert(image.to_vec(), Err(err));
        self
    }

    /// Hold every call for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingProvider for ScriptedProvider {
    fn metric(&self) -> Metric {
        self.metric
    }

    async fn detect_and_embed(&self, image: &[u8]) -> Result<Vec<DetectedFace>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.scripts.get(image) {
            Some(answer) => answer.clone(),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Error, Debug)]
#[error("{0}")]
pub struct SourceError(pub String);

/// In-memory remote armory.
#[derive(Default)]
pub struct StaticTemplateSource {
    entries: Vec<RemoteEntry>,
    data: HashMap<String, FaceData>,
    unreachable: bool,
}

impl StaticTemplateSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A listed subject whose record carries this embedding.
    pub fn with_template(mut self, subject_id: &str, embedding: &Embedding) -> Self {
        self.entries.push(RemoteEntry {
            subject_id: Some(subject_id.to_string()),
            has_embedding: true,
            ..Default::default()
        });
        self.data.insert(
            subject_id.to_string(),
            FaceData {
                subject_id: Some(subject_id.to_string()),
                embedding: Some(FaceData::encode(embedding)),
                ..Default::default()
            },
        );
        self
    }

    /// A listed subject whose record has no embedding payload.
    pub fn with_empty_record(mut self, subject_id: &str) -> Self {
        self.entries.push(RemoteEntry {
            subject_id: Some(subject_id.to_string()),
            ..Default::default()
        });
        self.data.insert(
            subject_id.to_string(),
            FaceData {
                subject_id: Some(subject_id.to_string()),
                ..Default::default()
            },
        );
        self
    }

    /// A listing row without an identifier.
    pub fn with_anonymous_entry(mut self) -> Self {
        self.entries.push(RemoteEntry::default());
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }
}

impl TemplateSource for StaticTemplateSource {
    type Error = SourceError;

    async fn list_entries(&self) -> Result<Vec<RemoteEntry>, SourceError> {
        if self.unreachable {
            return Err(SourceError("connection refused".into()));
        }
        Ok(self.entries.clone())
    }

    async fn fetch_face_data(&self, subject_id: &str) -> Result<FaceData, SourceError> {
        self.data
            .get(subject_id)
            .cloned()
            .ok_or_else(|| SourceError(format!("No face record found for personnel ID {subject_id}")))
    }
}
