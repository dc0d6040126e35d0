//! The embedding provider seam and probe image handling.
//!
//! Providers are black boxes: image bytes in, zero or more faces with
//! embeddings out. Two bindings exist in deployment (a remote face-analysis
//! service and an on-device model); the core only sees this trait.

use std::future::Future;
use std::io::Cursor;

use base64::Engine as _;
use thiserror::Error;

use crate::similarity::Metric;
use crate::types::{BoundingBox, DetectedFace};

const MIN_PROBE_SIDE: u32 = 32;
const MAX_PROBE_SIDE: u32 = 8192;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("no face detected")]
    NoFace,
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

/// Face detection + embedding capability.
pub trait EmbeddingProvider: Send + Sync {
    /// Embedding space of this provider's model.
    fn metric(&self) -> Metric;

    /// Detect faces in an encoded image and embed each of them.
    ///
    /// An empty vector and `Err(ProviderError::NoFace)` mean the same thing.
    fn detect_and_embed(
        &self,
        image: &[u8],
    ) -> impl Future<Output = Result<Vec<DetectedFace>, ProviderError>> + Send;

    /// Face boxes only. Providers with a cheaper detection call override this.
    fn detect(
        &self,
        image: &[u8],
    ) -> impl Future<Output = Result<Vec<BoundingBox>, ProviderError>> + Send {
        async move {
            let faces = self.detect_and_embed(image).await?;
            Ok(faces.into_iter().map(|f| f.bbox).collect())
        }
    }
}

/// Pick the face with the largest bounding box (closest to the camera).
///
/// Ties keep the earliest face so the choice is deterministic.
pub fn select_largest_face(faces: Vec<DetectedFace>) -> Option<DetectedFace> {
    let mut best: Option<DetectedFace> = None;
    for face in faces {
        let better = match &best {
            None => true,
            Some(current) => face.bbox.area() > current.bbox.area(),
        };
        if better {
            best = Some(face);
        }
    }
    best
}

/// Run the provider and reduce its answer to a single face.
pub async fn embed_single_face<P: EmbeddingProvider>(
    provider: &P,
    image: &[u8],
) -> Result<DetectedFace, ProviderError> {
    let probe = ProbeImage::from_bytes(image.to_vec())?;
    let faces = provider.detect_and_embed(probe.bytes()).await?;
    let count = faces.len();
    let face = select_largest_face(faces).ok_or(ProviderError::NoFace)?;
    if count > 1 {
        tracing::debug!(count, area = face.bbox.area(), "multiple faces; using largest");
    }
    if face.embedding.dim() == 0 {
        return Err(ProviderError::Malformed("empty embedding".into()));
    }
    Ok(face)
}

/// Face boxes in a frame, for polling before a verification is triggered.
/// A frame without faces is an empty list, not an error.
pub async fn detect_faces<P: EmbeddingProvider>(
    provider: &P,
    image: &[u8],
) -> Result<Vec<BoundingBox>, ProviderError> {
    let probe = ProbeImage::from_bytes(image.to_vec())?;
    match provider.detect(probe.bytes()).await {
        Ok(faces) => Ok(faces),
        Err(ProviderError::NoFace) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// An encoded camera frame that has been checked to be a decodable raster.
#[derive(Debug, Clone)]
pub struct ProbeImage {
    bytes: Vec<u8>,
    width: u32,
    height: u32,
}

impl ProbeImage {
    /// Validate encoded image bytes (JPEG or PNG) without fully decoding them.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ProviderError> {
        let reader = image::ImageReader::new(Cursor::new(&bytes))
            .with_guessed_format()
            .map_err(|e| ProviderError::InvalidImage(e.to_string()))?;
        if reader.format().is_none() {
            return Err(ProviderError::InvalidImage("unrecognised image format".into()));
        }
        let (width, height) = reader
            .into_dimensions()
            .map_err(|e| ProviderError::InvalidImage(e.to_string()))?;

        if width < MIN_PROBE_SIDE || height < MIN_PROBE_SIDE {
            return Err(ProviderError::InvalidImage(format!(
                "{width}x{height} is smaller than {MIN_PROBE_SIDE}x{MIN_PROBE_SIDE}"
            )));
        }
        if width > MAX_PROBE_SIDE || height > MAX_PROBE_SIDE {
            return Err(ProviderError::InvalidImage(format!(
                "{width}x{height} exceeds {MAX_PROBE_SIDE}x{MAX_PROBE_SIDE}"
            )));
        }

        Ok(Self { bytes, width, height })
    }

    /// Decode a base64 payload, accepting an optional `data:image/...;base64,` prefix.
    pub fn decode_base64(payload: &str) -> Result<Vec<u8>, ProviderError> {
        let body = match payload.split_once(',') {
            Some((_, rest)) => rest,
            None => payload,
        };
        base64::engine::general_purpose::STANDARD
            .decode(body.trim())
            .map_err(|e| ProviderError::InvalidImage(format!("base64: {e}")))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Embedding;

    fn face(w: f32, h: f32, tag: f32) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox { width: w, height: h, confidence: 0.9, ..Default::default() },
            embedding: Embedding::new(vec![tag]),
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = image::DynamicImage::ImageLuma8(image::GrayImage::new(width, height));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_largest_face_wins() {
        let picked = select_largest_face(vec![
            face(10.0, 10.0, 1.0),
            face(50.0, 40.0, 2.0),
            face(30.0, 30.0, 3.0),
        ])
        .unwrap();
        assert_eq!(picked.embedding.values, vec![2.0]);
    }

    #[test]
    fn test_largest_face_tie_keeps_first() {
        let picked = select_largest_face(vec![face(20.0, 20.0, 1.0), face(20.0, 20.0, 2.0)]).unwrap();
        assert_eq!(picked.embedding.values, vec![1.0]);
    }

    #[test]
    fn test_largest_face_empty() {
        assert!(select_largest_face(Vec::new()).is_none());
    }

    #[test]
    fn test_probe_accepts_png() {
        let probe = ProbeImage::from_bytes(png(64, 48)).unwrap();
        assert_eq!(probe.dimensions(), (64, 48));
    }

    #[test]
    fn test_probe_rejects_garbage() {
        let err = ProbeImage::from_bytes(b"not an image".to_vec()).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidImage(_)));
    }

    #[test]
    fn test_probe_rejects_tiny() {
        let err = ProbeImage::from_bytes(png(8, 8)).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidImage(_)));
    }

    #[test]
    fn test_decode_base64_strips_data_url() {
        let bytes = ProbeImage::decode_base64("data:image/jpeg;base64,aGVsbG8=").unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(ProbeImage::decode_base64("aGVsbG8=").unwrap(), b"hello");
        assert!(ProbeImage::decode_base64("!!!").is_err());
    }
}
