use std::sync::Arc;

use armory_core::provider::detect_faces;
use armory_core::types::{BoundingBox, TransactionKind};
use armory_core::verify::{IdentifyReport, VerificationReport};
use armory_core::{
    register, sync, EmbeddingProvider, ProviderError, RegistrationError, RegistrationOutcome,
    SyncError, SyncReport, TemplateSource, TransactionError, TransactionMachine,
    TransactionOutcome, TransactionRequest, VerifyRequest,
};
use armory_core::verify::VerifyError;
use armory_store::SqliteStore;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Requests queued ahead of the dispatcher before senders wait.
const QUEUE_DEPTH: usize = 32;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("no remote template source is configured")]
    SyncDisabled,
    #[error("engine task exited")]
    ChannelClosed,
}

/// A verification-bearing operation plus everything it needs, owned.
enum EngineRequest {
    Verify {
        subject_id: String,
        image: Vec<u8>,
        source: Option<String>,
        reply: oneshot::Sender<Result<VerificationReport, EngineError>>,
    },
    Identify {
        image: Vec<u8>,
        source: Option<String>,
        reply: oneshot::Sender<Result<IdentifyReport, EngineError>>,
    },
    Register {
        subject_id: String,
        image: Vec<u8>,
        operator: Option<String>,
        reply: oneshot::Sender<Result<RegistrationOutcome, EngineError>>,
    },
    Transact {
        job: TransactionJob,
        reply: oneshot::Sender<Result<TransactionOutcome, EngineError>>,
    },
    Detect {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<BoundingBox>, EngineError>>,
    },
    Sync {
        reply: oneshot::Sender<Result<SyncReport, EngineError>>,
    },
}

/// Owned form of [`TransactionRequest`].
#[derive(Debug, Clone)]
pub struct TransactionJob {
    pub subject_id: String,
    pub weapon_code: String,
    pub image: Vec<u8>,
    pub kind: TransactionKind,
    pub source: Option<String>,
    pub notes: Option<String>,
}

/// Clone-safe handle to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn verify(
        &self,
        subject_id: String,
        image: Vec<u8>,
        source: Option<String>,
    ) -> Result<VerificationReport, EngineError> {
        self.call(|reply| EngineRequest::Verify {
            subject_id,
            image,
            source,
            reply,
        })
        .await
    }

    pub async fn identify(
        &self,
        image: Vec<u8>,
        source: Option<String>,
    ) -> Result<IdentifyReport, EngineError> {
        self.call(|reply| EngineRequest::Identify {
            image,
            source,
            reply,
        })
        .await
    }

    pub async fn register(
        &self,
        subject_id: String,
        image: Vec<u8>,
        operator: Option<String>,
    ) -> Result<RegistrationOutcome, EngineError> {
        self.call(|reply| EngineRequest::Register {
            subject_id,
            image,
            operator,
            reply,
        })
        .await
    }

    pub async fn transact(&self, job: TransactionJob) -> Result<TransactionOutcome, EngineError> {
        self.call(|reply| EngineRequest::Transact { job, reply }).await
    }

    /// Face boxes only, for kiosks polling frames before a transaction.
    pub async fn detect(&self, image: Vec<u8>) -> Result<Vec<BoundingBox>, EngineError> {
        self.call(|reply| EngineRequest::Detect { image, reply }).await
    }

    pub async fn sync(&self) -> Result<SyncReport, EngineError> {
        self.call(|reply| EngineRequest::Sync { reply }).await
    }
}

/// Everything the engine task owns.
pub struct Engine<P, T> {
    store: SqliteStore,
    machine: TransactionMachine<P>,
    source: Option<T>,
}

impl<P, T> Engine<P, T>
where
    P: EmbeddingProvider + 'static,
    T: TemplateSource + 'static,
{
    pub fn new(store: SqliteStore, machine: TransactionMachine<P>, source: Option<T>) -> Self {
        Self {
            store,
            machine,
            source,
        }
    }

    async fn handle(&self, req: EngineRequest) {
        match req {
            EngineRequest::Verify {
                subject_id,
                image,
                source,
                reply,
            } => {
                let result = self
                    .machine
                    .engine()
                    .verify(
                        &self.store,
                        VerifyRequest {
                            subject_id: &subject_id,
                            image: &image,
                            source_address: source.as_deref(),
                        },
                    )
                    .await
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Identify {
                image,
                source,
                reply,
            } => {
                let result = self
                    .machine
                    .engine()
                    .identify(&self.store, &image, source.as_deref())
                    .await
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Register {
                subject_id,
                image,
                operator,
                reply,
            } => {
                let result = register(
                    self.machine.engine().provider(),
                    &self.store,
                    &subject_id,
                    &image,
                    operator.as_deref(),
                )
                .await
                .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Transact { job, reply } => {
                let result = self
                    .machine
                    .execute(
                        &self.store,
                        TransactionRequest {
                            subject_id: &job.subject_id,
                            weapon_code: &job.weapon_code,
                            image: &job.image,
                            kind: job.kind,
                            source_address: job.source.as_deref(),
                            notes: job.notes.as_deref(),
                        },
                    )
                    .await
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Detect { image, reply } => {
                let result = detect_faces(self.machine.engine().provider(), &image)
                    .await
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Sync { reply } => {
                let result = match &self.source {
                    Some(source) => sync(source, &self.store).await.map_err(EngineError::from),
                    None => Err(EngineError::SyncDisabled),
                };
                let _ = reply.send(result);
            }
        }
    }
}

/// Spawn the engine dispatcher on the current runtime.
///
/// Each request runs on its own task so a slow provider call never holds
/// up the queue; every request gets exactly one reply, or a
/// `ChannelClosed` if its task died.
pub fn spawn_engine<P, T>(engine: Engine<P, T>) -> EngineHandle
where
    P: EmbeddingProvider + 'static,
    T: TemplateSource + 'static,
{
    let engine = Arc::new(engine);
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(QUEUE_DEPTH);

    tokio::spawn(async move {
        tracing::info!("engine task started");
        while let Some(req) = rx.recv().await {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.handle(req).await });
        }
        tracing::info!("engine task exiting");
    });

    EngineHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use armory_core::testing::{test_image, ScriptedProvider, StaticTemplateSource};
    use armory_core::types::{NewWeapon, Subject, WeaponStatus};
    use armory_core::{ArmoryStore, Metric, ReassignPolicy, SimilarityStrategy, VerificationEngine};

    const FACE: [f32; 4] = [0.9, 0.1, 0.3, 0.2];

    async fn engine_with(provider: ScriptedProvider, source: Option<StaticTemplateSource>) -> (EngineHandle, SqliteStore) {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store
            .upsert_subject(&Subject {
                id_number: "101".into(),
                first_name: "Ada".into(),
                last_name: "Okafor".into(),
                rank: "Sgt".into(),
                active: true,
            })
            .await
            .unwrap();
        store
            .add_weapon(NewWeapon {
                serial_number: "S1001".into(),
                model: "AK-47".into(),
                qr_code: Some("QR-1".into()),
                status: WeaponStatus::Available,
            })
            .await
            .unwrap();
        let verifier = VerificationEngine::new(provider, SimilarityStrategy::cosine(), None).unwrap();
        let machine = TransactionMachine::new(verifier, ReassignPolicy::AutoCheckIn, "test");
        let handle = spawn_engine(Engine::new(store.clone(), machine, source));
        (handle, store)
    }

    #[tokio::test]
    async fn test_register_then_transact() {
        let provider = ScriptedProvider::new(Metric::Cosine).with_face(&test_image(10), FACE.to_vec());
        let (engine, _store) = engine_with(provider, None).await;

        let outcome = engine.register("101".into(), test_image(10), Some("admin".into())).await.unwrap();
        assert!(outcome.created);

        let outcome = engine
            .transact(TransactionJob {
                subject_id: "101".into(),
                weapon_code: "QR-1".into(),
                image: test_image(10),
                kind: TransactionKind::CheckOut,
                source: Some("10.0.0.5".into()),
                notes: None,
            })
            .await
            .unwrap();
        assert!(outcome.transaction_success());
        assert_eq!(outcome.message(), "Weapon checked out successfully");
    }

    #[tokio::test]
    async fn test_concurrent_requests_each_get_one_reply() {
        let provider = ScriptedProvider::new(Metric::Cosine)
            .with_face(&test_image(10), FACE.to_vec())
            .with_delay(Duration::from_millis(50));
        let (engine, _store) = engine_with(provider, None).await;
        engine.register("101".into(), test_image(10), None).await.unwrap();

        let (a, b, c) = tokio::join!(
            engine.verify("101".into(), test_image(10), None),
            engine.verify("101".into(), test_image(10), None),
            engine.detect(test_image(10)),
        );
        assert!(a.unwrap().verified());
        assert!(b.unwrap().verified());
        assert_eq!(c.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_detect_blank_frame_is_empty() {
        let (engine, _store) = engine_with(ScriptedProvider::new(Metric::Cosine), None).await;
        assert!(engine.detect(test_image(99)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_detect_rejects_garbage() {
        let (engine, _store) = engine_with(ScriptedProvider::new(Metric::Cosine), None).await;
        let err = engine.detect(b"not an image".to_vec()).await.unwrap_err();
        assert!(matches!(err, EngineError::Provider(ProviderError::InvalidImage(_))));
    }

    #[tokio::test]
    async fn test_sync_without_source() {
        let (engine, _store) = engine_with(ScriptedProvider::new(Metric::Cosine), None).await;
        assert!(matches!(engine.sync().await, Err(EngineError::SyncDisabled)));
    }

    #[tokio::test]
    async fn test_sync_with_source() {
        let source = StaticTemplateSource::new()
            .with_template("101", &armory_core::Embedding::new(FACE.to_vec()))
            .with_empty_record("202");
        let (engine, store) = engine_with(ScriptedProvider::new(Metric::Cosine), Some(source)).await;
        let report = engine.sync().await.unwrap();
        assert_eq!(report.success_count, 1);
        assert_eq!(report.fail_count, 1);
        assert!(store.active_template("101").await.unwrap().is_some());
    }
}
