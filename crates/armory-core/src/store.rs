//! The `ArmoryStore` trait: everything the core reads from or writes to
//! persistence.
//!
//! Implemented by storage backends (e.g. `armory-store`). The core never
//! holds long-lived references to stored records; it reads, decides, and
//! hands back values to write.

use std::future::Future;

use uuid::Uuid;

use crate::types::{
    Embedding, NewWeapon, RegistrationLog, Subject, Template, Transaction, TransactionKind,
    VerificationAttempt, Weapon, WeaponState,
};

/// A backend error, type-erased at the core's boundary.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Result of writing a template.
#[derive(Debug, Clone)]
pub struct TemplateUpsert {
    pub template: Template,
    /// `true` if no template existed for the subject before this write.
    pub created: bool,
}

/// One custody record to append as part of a [`TransactionCommit`].
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub subject_id: String,
    pub kind: TransactionKind,
    pub confidence: Option<f32>,
    /// The verification that authorised this record. `None` for records
    /// written on behalf of a subject who was not verified, such as the
    /// displaced holder of a reassigned weapon.
    pub attempt_id: Option<Uuid>,
    pub notes: Option<String>,
}

/// A unit of work applied atomically by [`ArmoryStore::commit_transaction`].
///
/// The backend must write every record and the weapon's new state, or
/// nothing. `expected` is the state the transition was planned against; if
/// the stored row no longer matches it, the backend reports a conflict and
/// writes nothing.
#[derive(Debug, Clone)]
pub struct TransactionCommit {
    pub weapon_id: i64,
    pub expected: WeaponState,
    pub next: WeaponState,
    /// Records in the order they happened.
    pub records: Vec<NewTransaction>,
    pub verifier_identity: String,
}

/// What happened to a [`TransactionCommit`].
#[derive(Debug, Clone)]
pub enum CommitResult {
    /// Everything was written; records in commit order.
    Committed(Vec<Transaction>),
    /// The weapon no longer matched `expected`; nothing was written.
    Conflict { current: WeaponState },
}

/// Abstraction over the armory's persistence.
///
/// All methods return `Send` futures so the trait can be driven from a
/// multi-threaded runtime.
pub trait ArmoryStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    // ── Templates ─────────────────────────────────────────────────────────

    /// The active template for a subject, if one exists.
    fn active_template(
        &self,
        subject_id: &str,
    ) -> impl Future<Output = Result<Option<Template>, Self::Error>> + Send;

    /// Insert or overwrite the subject's template and mark it active.
    fn upsert_template(
        &self,
        subject_id: &str,
        embedding: &Embedding,
    ) -> impl Future<Output = Result<TemplateUpsert, Self::Error>> + Send;

    /// Soft-delete. Returns `false` if there was no active template.
    fn deactivate_template(
        &self,
        subject_id: &str,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Every active template. Rows that cannot be decoded are skipped so
    /// one bad record does not hide the rest of the gallery.
    fn active_templates(&self) -> impl Future<Output = Result<Vec<Template>, Self::Error>> + Send;

    // ── Registry ──────────────────────────────────────────────────────────

    fn find_subject(
        &self,
        id_number: &str,
    ) -> impl Future<Output = Result<Option<Subject>, Self::Error>> + Send;

    fn upsert_subject(
        &self,
        subject: &Subject,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Resolve a scanned code: QR payload first, then serial number.
    fn find_weapon_by_code(
        &self,
        code: &str,
    ) -> impl Future<Output = Result<Option<Weapon>, Self::Error>> + Send;

    /// The weapon currently assigned to a subject, if any.
    fn weapon_assigned_to(
        &self,
        subject_id: &str,
    ) -> impl Future<Output = Result<Option<Weapon>, Self::Error>> + Send;

    fn add_weapon(
        &self,
        weapon: NewWeapon,
    ) -> impl Future<Output = Result<Weapon, Self::Error>> + Send;

    fn list_weapons(&self) -> impl Future<Output = Result<Vec<Weapon>, Self::Error>> + Send;

    // ── Audit ─────────────────────────────────────────────────────────────

    fn log_verification_attempt(
        &self,
        attempt: &VerificationAttempt,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn log_registration(
        &self,
        entry: &RegistrationLog,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn recent_attempts(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<VerificationAttempt>, Self::Error>> + Send;

    // ── Custody ───────────────────────────────────────────────────────────

    /// Apply a commit atomically. An `Err` means the unit of work was
    /// rolled back and no partial state is visible.
    fn commit_transaction(
        &self,
        commit: TransactionCommit,
    ) -> impl Future<Output = Result<CommitResult, Self::Error>> + Send;

    /// Most recent transactions first, optionally for a single weapon.
    fn recent_transactions(
        &self,
        weapon_id: Option<i64>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Transaction>, Self::Error>> + Send;
}
