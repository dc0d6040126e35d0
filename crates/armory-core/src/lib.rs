//! armory-core: face verification and weapon custody.
//!
//! The verification engine compares a live probe against a subject's stored
//! template with one configured similarity strategy. The transaction machine
//! gates custody changes (check-out, check-in, reassign) on that decision and
//! hands the resulting records to an [`ArmoryStore`] to commit atomically.
//!
//! Face detection and embedding are delegated to an [`EmbeddingProvider`];
//! persistence to an [`ArmoryStore`].

pub mod provider;
pub mod registration;
pub mod session;
pub mod similarity;
pub mod store;
pub mod sync;
pub mod transaction;
pub mod types;
pub mod verify;

#[cfg(feature = "testing")]
pub mod testing;

pub use provider::{EmbeddingProvider, ProbeImage, ProviderError};
pub use registration::{register, RegistrationError, RegistrationOutcome};
pub use session::{FaceDebouncer, InFlightRegistry, ScanSession};
pub use similarity::{Metric, Similarity, SimilarityStrategy, Threshold};
pub use store::{ArmoryStore, StoreError};
pub use sync::{sync, SyncError, SyncReport, TemplateSource};
pub use transaction::{
    weapon_info, ReassignPolicy, TransactionError, TransactionMachine, TransactionOutcome,
    TransactionRequest, WeaponInfo,
};
pub use types::{
    Embedding, Location, Subject, Template, Transaction, TransactionKind, VerificationAttempt,
    Weapon, WeaponStatus,
};
pub use verify::{VerificationEngine, VerifyOutcome, VerifyRequest};
