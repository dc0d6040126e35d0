//! Verification engine: live probe vs. stored template → decision.
//!
//! Every call writes exactly one [`VerificationAttempt`], whatever the
//! outcome. A verification that cannot be audited is reported as an error
//! rather than returned as if it had happened.

use thiserror::Error;

use crate::provider::{embed_single_face, EmbeddingProvider, ProviderError};
use crate::similarity::{Metric, Similarity, SimilarityStrategy, Threshold, ThresholdError};
use crate::store::{ArmoryStore, StoreError};
use crate::types::{AttemptOutcome, Template, VerificationAttempt};

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("similarity strategy expects {strategy:?} embeddings but the provider produces {provider:?}")]
    MetricMismatch { strategy: Metric, provider: Metric },
    #[error(transparent)]
    Threshold(#[from] ThresholdError),
    #[error("euclidean scale must be a positive number, got {0}")]
    InvalidScale(f32),
}

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("template lookup failed: {0}")]
    Lookup(#[source] StoreError),
    #[error("could not record verification attempt: {0}")]
    Audit(#[source] StoreError),
}

/// How a single verification ended.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyOutcome {
    Match { similarity: f32 },
    Mismatch { similarity: f32 },
    /// The subject has no active template.
    NoTemplate,
    /// The provider found nobody in the frame.
    NoFace,
    InvalidImage(String),
    ProviderUnavailable(String),
    /// Template and probe came from different models.
    DimensionMismatch { template: usize, probe: usize },
}

impl VerifyOutcome {
    pub fn verified(&self) -> bool {
        matches!(self, VerifyOutcome::Match { .. })
    }

    /// Reported confidence in [0, 1]; zero whenever no comparison ran.
    pub fn confidence(&self) -> f32 {
        match self {
            VerifyOutcome::Match { similarity } | VerifyOutcome::Mismatch { similarity } => {
                similarity.clamp(0.0, 1.0)
            }
            _ => 0.0,
        }
    }

    pub fn error(&self) -> Option<String> {
        match self {
            VerifyOutcome::Match { .. } | VerifyOutcome::Mismatch { .. } => None,
            VerifyOutcome::NoTemplate => Some("no template".into()),
            VerifyOutcome::NoFace => Some("no face detected".into()),
            VerifyOutcome::InvalidImage(m) => Some(format!("invalid image: {m}")),
            VerifyOutcome::ProviderUnavailable(m) => Some(format!("provider unavailable: {m}")),
            VerifyOutcome::DimensionMismatch { template, probe } => Some(format!(
                "embedding dimension mismatch (template {template}, probe {probe})"
            )),
        }
    }

    /// Audit category for this outcome.
    pub fn attempt_outcome(&self) -> AttemptOutcome {
        match self {
            VerifyOutcome::Match { .. } => AttemptOutcome::Success,
            VerifyOutcome::Mismatch { .. } | VerifyOutcome::NoTemplate => AttemptOutcome::Failure,
            _ => AttemptOutcome::Error,
        }
    }

    fn from_provider(err: ProviderError) -> Self {
        match err {
            ProviderError::NoFace => VerifyOutcome::NoFace,
            ProviderError::InvalidImage(m) => VerifyOutcome::InvalidImage(m),
            ProviderError::Unavailable(m) | ProviderError::Malformed(m) => {
                VerifyOutcome::ProviderUnavailable(m)
            }
        }
    }
}

/// A verification request for a claimed identity.
#[derive(Debug, Clone, Copy)]
pub struct VerifyRequest<'a> {
    pub subject_id: &'a str,
    pub image: &'a [u8],
    pub source_address: Option<&'a str>,
}

/// Outcome plus the audit record that was written for it.
#[derive(Debug, Clone)]
pub struct VerificationReport {
    pub outcome: VerifyOutcome,
    pub attempt: VerificationAttempt,
}

impl VerificationReport {
    pub fn verified(&self) -> bool {
        self.outcome.verified()
    }

    pub fn confidence(&self) -> f32 {
        self.outcome.confidence()
    }
}

/// Result of a 1:N search over all active templates.
#[derive(Debug, Clone)]
pub struct IdentifyReport {
    /// Best-matching subject above threshold.
    pub subject_id: Option<String>,
    pub outcome: VerifyOutcome,
    pub attempt: VerificationAttempt,
}

/// Compares probes against templates with one configured strategy.
pub struct VerificationEngine<P> {
    provider: P,
    strategy: SimilarityStrategy,
    threshold: Threshold,
}

impl<P: EmbeddingProvider> VerificationEngine<P> {
    /// Build an engine. The strategy must be calibrated for the provider's
    /// embedding space; `threshold` defaults per strategy.
    pub fn new(
        provider: P,
        strategy: SimilarityStrategy,
        threshold: Option<f32>,
    ) -> Result<Self, ConfigError> {
        if strategy.metric() != provider.metric() {
            return Err(ConfigError::MetricMismatch {
                strategy: strategy.metric(),
                provider: provider.metric(),
            });
        }
        if let SimilarityStrategy::Euclidean(e) = strategy {
            if !(e.scale.is_finite() && e.scale > 0.0) {
                return Err(ConfigError::InvalidScale(e.scale));
            }
        }
        let threshold = match threshold {
            Some(t) => Threshold::new(t)?,
            None => strategy.default_threshold(),
        };
        Ok(Self {
            provider,
            strategy,
            threshold,
        })
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn threshold(&self) -> Threshold {
        self.threshold
    }

    pub fn strategy(&self) -> SimilarityStrategy {
        self.strategy
    }

    /// Decide without touching the store. `template` is the subject's
    /// active template, if any.
    pub async fn evaluate(&self, template: Option<&Template>, image: &[u8]) -> VerifyOutcome {
        let Some(template) = template else {
            return VerifyOutcome::NoTemplate;
        };

        let face = match embed_single_face(&self.provider, image).await {
            Ok(face) => face,
            Err(e) => return VerifyOutcome::from_provider(e),
        };

        if face.embedding.dim() != template.embedding.dim() {
            return VerifyOutcome::DimensionMismatch {
                template: template.embedding.dim(),
                probe: face.embedding.dim(),
            };
        }

        let result = self
            .strategy
            .compare(&face.embedding, &template.embedding, self.threshold);
        if result.matched {
            VerifyOutcome::Match {
                similarity: result.similarity,
            }
        } else {
            VerifyOutcome::Mismatch {
                similarity: result.similarity,
            }
        }
    }

    /// Verify a claimed identity and record the attempt.
    pub async fn verify<S: ArmoryStore>(
        &self,
        store: &S,
        request: VerifyRequest<'_>,
    ) -> Result<VerificationReport, VerifyError> {
        let template = match store.active_template(request.subject_id).await {
            Ok(t) => t,
            Err(e) => {
                let attempt = VerificationAttempt::new(
                    Some(request.subject_id.to_string()),
                    AttemptOutcome::Error,
                )
                .with_source(request.source_address.map(str::to_string))
                .with_error(format!("template lookup failed: {e}"));
                if let Err(log_err) = store.log_verification_attempt(&attempt).await {
                    tracing::error!(error = %log_err, "could not record failed lookup");
                }
                return Err(VerifyError::Lookup(Box::new(e)));
            }
        };

        let outcome = self.evaluate(template.as_ref(), request.image).await;
        let attempt = record_attempt(
            store,
            Some(request.subject_id.to_string()),
            &outcome,
            request.source_address,
        )
        .await?;

        match &outcome {
            VerifyOutcome::Match { similarity } => {
                tracing::info!(subject_id = request.subject_id, similarity, "verification matched");
            }
            other => {
                tracing::warn!(
                    subject_id = request.subject_id,
                    confidence = other.confidence(),
                    error = ?other.error(),
                    "verification rejected"
                );
            }
        }

        Ok(VerificationReport { outcome, attempt })
    }

    /// Search every active template for the probe's best match.
    pub async fn identify<S: ArmoryStore>(
        &self,
        store: &S,
        image: &[u8],
        source_address: Option<&str>,
    ) -> Result<IdentifyReport, VerifyError> {
        let gallery = store
            .active_templates()
            .await
            .map_err(|e| VerifyError::Lookup(Box::new(e)))?;

        let (subject_id, outcome) = if gallery.is_empty() {
            (None, VerifyOutcome::NoTemplate)
        } else {
            match embed_single_face(&self.provider, image).await {
                Err(e) => (None, VerifyOutcome::from_provider(e)),
                Ok(face) => {
                    let result = self
                        .strategy
                        .best_match(&face.embedding, &gallery, self.threshold);
                    if result.matched {
                        (
                            result.subject_id,
                            VerifyOutcome::Match {
                                similarity: result.similarity,
                            },
                        )
                    } else {
                        (
                            None,
                            VerifyOutcome::Mismatch {
                                similarity: result.similarity,
                            },
                        )
                    }
                }
            }
        };

        let attempt = record_attempt(store, subject_id.clone(), &outcome, source_address).await?;
        tracing::info!(
            subject_id = ?subject_id,
            gallery = gallery.len(),
            confidence = outcome.confidence(),
            "identification finished"
        );

        Ok(IdentifyReport {
            subject_id,
            outcome,
            attempt,
        })
    }
}

/// Write the audit entry for an outcome.
pub(crate) async fn record_attempt<S: ArmoryStore>(
    store: &S,
    subject_id: Option<String>,
    outcome: &VerifyOutcome,
    source_address: Option<&str>,
) -> Result<VerificationAttempt, VerifyError> {
    let mut attempt = VerificationAttempt::new(subject_id, outcome.attempt_outcome())
        .with_confidence(outcome.confidence())
        .with_source(source_address.map(str::to_string));
    if let Some(detail) = outcome.error() {
        attempt = attempt.with_error(detail);
    }

    store
        .log_verification_attempt(&attempt)
        .await
        .map_err(|e| VerifyError::Audit(Box::new(e)))?;
    Ok(attempt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DetectedFace;

    struct FixedProvider(Metric);

    impl EmbeddingProvider for FixedProvider {
        fn metric(&self) -> Metric {
            self.0
        }

        async fn detect_and_embed(&self, _image: &[u8]) -> Result<Vec<DetectedFace>, ProviderError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_engine_rejects_mixed_metrics() {
        let err = VerificationEngine::new(
            FixedProvider(Metric::Cosine),
            SimilarityStrategy::euclidean(0.6),
            None,
        )
        .err()
        .unwrap();
        assert_eq!(
            err,
            ConfigError::MetricMismatch {
                strategy: Metric::Euclidean,
                provider: Metric::Cosine
            }
        );
    }

    #[test]
    fn test_engine_rejects_out_of_range_threshold() {
        let err = VerificationEngine::new(
            FixedProvider(Metric::Cosine),
            SimilarityStrategy::cosine(),
            Some(1.2),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ConfigError::Threshold(_)));
    }

    #[test]
    fn test_engine_rejects_degenerate_scale() {
        for scale in [0.0, -0.6, f32::NAN] {
            let err = VerificationEngine::new(
                FixedProvider(Metric::Euclidean),
                SimilarityStrategy::euclidean(scale),
                None,
            )
            .err()
            .unwrap();
            assert!(matches!(err, ConfigError::InvalidScale(_)));
        }
    }

    #[test]
    fn test_engine_default_threshold_per_strategy() {
        let engine = VerificationEngine::new(
            FixedProvider(Metric::Euclidean),
            SimilarityStrategy::euclidean(0.6),
            None,
        )
        .unwrap();
        assert_eq!(engine.threshold().value(), 0.25);
    }

    #[tokio::test]
    async fn test_evaluate_without_template_skips_provider() {
        let engine =
            VerificationEngine::new(FixedProvider(Metric::Cosine), SimilarityStrategy::cosine(), None)
                .unwrap();
        let outcome = engine.evaluate(None, b"irrelevant").await;
        assert_eq!(outcome, VerifyOutcome::NoTemplate);
        assert_eq!(outcome.confidence(), 0.0);
        assert_eq!(outcome.attempt_outcome(), AttemptOutcome::Failure);
    }

    #[test]
    fn test_outcome_categories() {
        assert_eq!(VerifyOutcome::NoFace.attempt_outcome(), AttemptOutcome::Error);
        assert_eq!(VerifyOutcome::NoFace.error().as_deref(), Some("no face detected"));
        assert_eq!(
            VerifyOutcome::ProviderUnavailable("timeout".into()).error().as_deref(),
            Some("provider unavailable: timeout")
        );
        let m = VerifyOutcome::Mismatch { similarity: -0.3 };
        assert!(!m.verified());
        assert_eq!(m.confidence(), 0.0);
        assert!(m.error().is_none());
    }
}
