//! Enrollment: image → embedding → upsert the subject's template.
//!
//! Re-registering overwrites; there is never more than one active template
//! per subject. Every attempt leaves a [`RegistrationLog`] entry.

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::provider::{embed_single_face, EmbeddingProvider, ProviderError};
use crate::store::{ArmoryStore, StoreError};
use crate::types::RegistrationLog;

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationOutcome {
    /// `false` when an existing template was overwritten.
    pub created: bool,
    pub face_id: Uuid,
}

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("subject {0} not found")]
    UnknownSubject(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("store error: {0}")]
    Store(#[source] StoreError),
}

impl RegistrationError {
    /// Whether the caller sent something unusable, as opposed to a backend fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RegistrationError::UnknownSubject(_)
                | RegistrationError::Provider(ProviderError::NoFace)
                | RegistrationError::Provider(ProviderError::InvalidImage(_))
        )
    }
}

pub async fn register<P, S>(
    provider: &P,
    store: &S,
    subject_id: &str,
    image: &[u8],
    operator: Option<&str>,
) -> Result<RegistrationOutcome, RegistrationError>
where
    P: EmbeddingProvider,
    S: ArmoryStore,
{
    let result = enroll(provider, store, subject_id, image).await;

    let entry = RegistrationLog {
        id: Uuid::new_v4(),
        subject_id: subject_id.to_string(),
        timestamp: Utc::now(),
        operator: operator.map(str::to_string),
        successful: result.is_ok(),
        error_message: result.as_ref().err().map(ToString::to_string),
    };
    if let Err(e) = store.log_registration(&entry).await {
        tracing::error!(subject_id, error = %e, "could not record registration");
    }

    match &result {
        Ok(outcome) => tracing::info!(
            subject_id,
            created = outcome.created,
            face_id = %outcome.face_id,
            "template registered"
        ),
        Err(e) => tracing::warn!(subject_id, error = %e, "registration failed"),
    }
    result
}

async fn enroll<P, S>(
    provider: &P,
    store: &S,
    subject_id: &str,
    image: &[u8],
) -> Result<RegistrationOutcome, RegistrationError>
where
    P: EmbeddingProvider,
    S: ArmoryStore,
{
    let known = store
        .find_subject(subject_id)
        .await
        .map_err(|e| RegistrationError::Store(Box::new(e)))?;
    if known.is_none() {
        return Err(RegistrationError::UnknownSubject(subject_id.to_string()));
    }

    let face = embed_single_face(provider, image).await?;

    let upsert = store
        .upsert_template(subject_id, &face.embedding)
        .await
        .map_err(|e| RegistrationError::Store(Box::new(e)))?;

    Ok(RegistrationOutcome {
        created: upsert.created,
        face_id: upsert.template.face_id,
    })
}
