//! Similarity strategies and the match decision.
//!
//! A deployment runs exactly one strategy, chosen to match the embedding
//! space of its provider: cosine for angular-margin models (ArcFace),
//! scaled Euclidean for distance-trained models (dlib ResNet).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Embedding, Template};

/// Calibration constant for distance-trained 128-d embeddings.
pub const DEFAULT_EUCLIDEAN_SCALE: f32 = 0.6;
/// Default cosine acceptance threshold.
pub const DEFAULT_COSINE_THRESHOLD: f32 = 0.6;
/// Default threshold on scaled-Euclidean similarity (distance <= 0.45 at scale 0.6).
pub const DEFAULT_EUCLIDEAN_THRESHOLD: f32 = 0.25;

/// Embedding space a provider's model was trained in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Cosine,
    Euclidean,
}

#[derive(Error, Debug, PartialEq)]
pub enum ThresholdError {
    #[error("threshold {0} is outside [0, 1]")]
    OutOfRange(f32),
}

/// Acceptance threshold on similarity, guaranteed to lie in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
pub struct Threshold(f32);

impl Threshold {
    pub fn new(value: f32) -> Result<Self, ThresholdError> {
        if (0.0..=1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ThresholdError::OutOfRange(value))
        }
    }

    pub fn value(self) -> f32 {
        self.0
    }
}

/// Result of comparing a probe against one template or a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Raw similarity of the best candidate (cosine may be negative).
    pub similarity: f32,
    /// Subject of the matched template (gallery comparisons only).
    pub subject_id: Option<String>,
}

impl MatchResult {
    /// Similarity clamped into [0, 1] for reporting.
    pub fn confidence(&self) -> f32 {
        self.similarity.clamp(0.0, 1.0)
    }
}

/// Strategy for scoring a probe embedding against a stored one.
pub trait Similarity {
    /// Embedding space this strategy is calibrated for.
    fn metric(&self) -> Metric;

    /// Similarity score; higher is better, identical embeddings score 1.0.
    fn score(&self, probe: &Embedding, reference: &Embedding) -> f32;

    fn compare(&self, probe: &Embedding, reference: &Embedding, threshold: Threshold) -> MatchResult {
        let similarity = self.score(probe, reference);
        MatchResult {
            matched: similarity >= threshold.value(),
            similarity,
            subject_id: None,
        }
    }

    /// Best match across a gallery of templates.
    ///
    /// Always iterates every entry so response time does not leak gallery
    /// size or match position.
    fn best_match(&self, probe: &Embedding, gallery: &[Template], threshold: Threshold) -> MatchResult {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, template) in gallery.iter().enumerate() {
            if template.embedding.dim() != probe.dim() {
                continue;
            }
            let sim = self.score(probe, &template.embedding);
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_sim >= threshold.value() => MatchResult {
                matched: true,
                similarity: best_sim,
                subject_id: Some(gallery[idx].subject_id.clone()),
            },
            _ => MatchResult {
                matched: false,
                similarity: if best_sim == f32::NEG_INFINITY { 0.0 } else { best_sim },
                subject_id: None,
            },
        }
    }
}

/// Cosine similarity: `dot(a, b) / (|a| * |b|)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineSimilarity;

impl Similarity for CosineSimilarity {
    fn metric(&self) -> Metric {
        Metric::Cosine
    }

    fn score(&self, probe: &Embedding, reference: &Embedding) -> f32 {
        probe.cosine_similarity(reference)
    }
}

/// Euclidean distance mapped to similarity: `max(0, 1 - distance / scale)`.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanSimilarity {
    pub scale: f32,
}

impl Default for EuclideanSimilarity {
    fn default() -> Self {
        Self {
            scale: DEFAULT_EUCLIDEAN_SCALE,
        }
    }
}

impl Similarity for EuclideanSimilarity {
    fn metric(&self) -> Metric {
        Metric::Euclidean
    }

    fn score(&self, probe: &Embedding, reference: &Embedding) -> f32 {
        let distance = probe.euclidean_distance(reference);
        (1.0 - distance / self.scale).max(0.0)
    }
}

/// The configured strategy, selected once at startup.
#[derive(Debug, Clone, Copy)]
pub enum SimilarityStrategy {
    Cosine(CosineSimilarity),
    Euclidean(EuclideanSimilarity),
}

impl SimilarityStrategy {
    pub fn cosine() -> Self {
        SimilarityStrategy::Cosine(CosineSimilarity)
    }

    pub fn euclidean(scale: f32) -> Self {
        SimilarityStrategy::Euclidean(EuclideanSimilarity { scale })
    }

    /// Calibrated default threshold for this strategy.
    pub fn default_threshold(&self) -> Threshold {
        match self {
            SimilarityStrategy::Cosine(_) => Threshold(DEFAULT_COSINE_THRESHOLD),
            SimilarityStrategy::Euclidean(_) => Threshold(DEFAULT_EUCLIDEAN_THRESHOLD),
        }
    }
}

impl Similarity for SimilarityStrategy {
    fn metric(&self) -> Metric {
        match self {
            SimilarityStrategy::Cosine(s) => s.metric(),
            SimilarityStrategy::Euclidean(s) => s.metric(),
        }
    }

    fn score(&self, probe: &Embedding, reference: &Embedding) -> f32 {
        match self {
            SimilarityStrategy::Cosine(s) => s.score(probe, reference),
            SimilarityStrategy::Euclidean(s) => s.score(probe, reference),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn template(id: &str, values: Vec<f32>) -> Template {
        Template {
            face_id: uuid::Uuid::new_v4(),
            subject_id: id.into(),
            embedding: Embedding::new(values),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            active: true,
        }
    }

    #[test]
    fn test_identical_embeddings_score_one() {
        let e = Embedding::new(vec![0.3, -0.2, 0.9, 0.1]);
        assert!((CosineSimilarity.score(&e, &e) - 1.0).abs() < 1e-6);
        assert_eq!(EuclideanSimilarity::default().score(&e, &e), 1.0);
    }

    /// Deterministic 512-d unit-ish vectors, like a real recognition model.
    fn pseudo_embeddings(count: usize) -> Vec<Embedding> {
        let mut state: u32 = 0x9e37_79b9;
        (0..count)
            .map(|_| {
                let values = (0..512)
                    .map(|_| {
                        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                        (state >> 8) as f32 / (1u32 << 24) as f32 - 0.5
                    })
                    .collect();
                Embedding::new(values)
            })
            .collect()
    }

    #[test]
    fn test_self_match_at_strictest_threshold() {
        let strict = Threshold::new(1.0).unwrap();
        for e in pseudo_embeddings(200) {
            assert_eq!(CosineSimilarity.score(&e, &e), 1.0);
            assert!(CosineSimilarity.compare(&e, &e, strict).matched);
            assert!(EuclideanSimilarity::default().compare(&e, &e, strict).matched);
        }
    }

    #[test]
    fn test_cosine_stays_in_range() {
        let embeddings = pseudo_embeddings(20);
        for pair in embeddings.windows(2) {
            let s = CosineSimilarity.score(&pair[0], &pair[1]);
            assert!((-1.0..=1.0).contains(&s));
        }
        let e = &embeddings[0];
        let flipped = Embedding::new(e.values.iter().map(|v| -v).collect());
        assert_eq!(CosineSimilarity.score(e, &flipped), -1.0);
    }

    #[test]
    fn test_euclidean_floors_at_zero() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(EuclideanSimilarity::default().score(&a, &b), 0.0);
    }

    #[test]
    fn test_euclidean_scale() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![0.3, 0.0]);
        let sim = EuclideanSimilarity { scale: 0.6 }.score(&a, &b);
        assert!((sim - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let e = Embedding::new(vec![1.0, 0.0]);
        let t = Threshold::new(1.0).unwrap();
        assert!(EuclideanSimilarity::default().compare(&e, &e, t).matched);
    }

    #[test]
    fn test_threshold_range() {
        assert!(Threshold::new(0.0).is_ok());
        assert_eq!(Threshold::new(1.5), Err(ThresholdError::OutOfRange(1.5)));
        assert!(Threshold::new(-0.1).is_err());
    }

    #[test]
    fn test_confidence_clamps_negative_cosine() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![-1.0, 0.0]);
        let r = CosineSimilarity.compare(&a, &b, Threshold::new(0.5).unwrap());
        assert!(!r.matched);
        assert_eq!(r.confidence(), 0.0);
    }

    #[test]
    fn test_best_match_visits_all_entries() {
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);
        let gallery = vec![
            template("201", vec![0.0, 1.0, 0.0]),
            template("202", vec![0.0, 0.0, 1.0]),
            template("101", vec![1.0, 0.0, 0.0]),
        ];
        let r = CosineSimilarity.best_match(&probe, &gallery, Threshold::new(0.5).unwrap());
        assert!(r.matched);
        assert_eq!(r.subject_id.as_deref(), Some("101"));
    }

    #[test]
    fn test_best_match_skips_foreign_dimensions() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let gallery = vec![template("101", vec![1.0, 0.0, 0.0])];
        let r = CosineSimilarity.best_match(&probe, &gallery, Threshold::new(0.5).unwrap());
        assert!(!r.matched);
        assert_eq!(r.similarity, 0.0);
    }

    #[test]
    fn test_best_match_empty_gallery() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let r = CosineSimilarity.best_match(&probe, &[], Threshold::new(0.5).unwrap());
        assert!(!r.matched);
        assert_eq!(r.similarity, 0.0);
    }

    #[test]
    fn test_strategy_metric_dispatch() {
        assert_eq!(SimilarityStrategy::cosine().metric(), Metric::Cosine);
        assert_eq!(SimilarityStrategy::euclidean(0.6).metric(), Metric::Euclidean);
        assert_eq!(SimilarityStrategy::cosine().default_threshold().value(), 0.6);
    }
}
