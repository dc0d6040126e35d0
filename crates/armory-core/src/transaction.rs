//! Weapon custody state machine.
//!
//! A transaction resolves the weapon and subject, verifies the subject's
//! face, checks that the requested transition is legal for the weapon's
//! current state, and commits the custody records together with the new
//! weapon state as one unit of work.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::EmbeddingProvider;
use crate::session::InFlightRegistry;
use crate::store::{ArmoryStore, CommitResult, NewTransaction, StoreError, TransactionCommit};
use crate::types::{
    AttemptOutcome, Location, Subject, Transaction, TransactionKind, VerificationAttempt, Weapon,
    WeaponState, WeaponStatus,
};
use crate::verify::{VerificationEngine, VerificationReport, VerifyError, VerifyOutcome, VerifyRequest};

/// What `reassign` does with a weapon that is already out with someone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReassignPolicy {
    /// Check the weapon in for its current holder, then assign it.
    #[default]
    AutoCheckIn,
    /// Refuse; the holder must check the weapon in first.
    RejectFielded,
}

/// Why a verified subject may not perform the requested transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IllegalTransition {
    #[error("This weapon is already checked out and not in the armory")]
    AlreadyCheckedOut,
    #[error("This weapon is already checked in and in the armory")]
    AlreadyCheckedIn,
    #[error("This weapon is assigned to {holder}")]
    HeldByOther { holder: String },
    #[error("This weapon is in the field without a recorded holder")]
    NoHolder,
    #[error("This weapon is out of service ({})", status.as_str())]
    OutOfService { status: WeaponStatus },
    #[error("This weapon is already assigned to this subject")]
    AlreadyAssigned,
    #[error("This weapon must be checked in by its holder before reassignment")]
    ReassignFielded,
    #[error("This subject is not active")]
    InactiveSubject,
    #[error("This personnel already holds weapon {serial_number}")]
    SubjectHoldsWeapon { serial_number: String },
    #[error("The weapon changed state while the request was processed")]
    StateChanged,
}

/// A legal transition: the weapon's next state and, for a reassignment of
/// a fielded weapon, the holder who is checked in first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionPlan {
    pub next: WeaponState,
    pub displaced_holder: Option<String>,
}

/// Decide whether `subject_id` may perform `kind` on a weapon in `state`.
pub fn plan_transition(
    state: &WeaponState,
    subject_id: &str,
    kind: TransactionKind,
    policy: ReassignPolicy,
) -> Result<TransitionPlan, IllegalTransition> {
    match kind {
        TransactionKind::CheckOut => {
            if state.location == Location::Field {
                return Err(IllegalTransition::AlreadyCheckedOut);
            }
            if !state.status.in_service() {
                return Err(IllegalTransition::OutOfService {
                    status: state.status,
                });
            }
            if let Some(holder) = &state.assigned_subject_id {
                if holder != subject_id {
                    return Err(IllegalTransition::HeldByOther {
                        holder: holder.clone(),
                    });
                }
            }
            Ok(TransitionPlan {
                next: fielded_with(subject_id),
                displaced_holder: None,
            })
        }
        TransactionKind::CheckIn => {
            if state.location == Location::Armory {
                return Err(IllegalTransition::AlreadyCheckedIn);
            }
            match &state.assigned_subject_id {
                None => return Err(IllegalTransition::NoHolder),
                Some(holder) if holder != subject_id => {
                    return Err(IllegalTransition::HeldByOther {
                        holder: holder.clone(),
                    })
                }
                Some(_) => {}
            }
            let status = match state.status {
                WeaponStatus::Assigned => WeaponStatus::Available,
                other => other,
            };
            Ok(TransitionPlan {
                next: WeaponState {
                    location: Location::Armory,
                    status,
                    assigned_subject_id: None,
                },
                displaced_holder: None,
            })
        }
        TransactionKind::Reassign => {
            if !state.status.in_service() {
                return Err(IllegalTransition::OutOfService {
                    status: state.status,
                });
            }
            if state.assigned_subject_id.as_deref() == Some(subject_id) {
                return Err(IllegalTransition::AlreadyAssigned);
            }
            let displaced_holder = state.assigned_subject_id.clone();
            if policy == ReassignPolicy::RejectFielded
                && (state.location == Location::Field || displaced_holder.is_some())
            {
                return Err(IllegalTransition::ReassignFielded);
            }
            Ok(TransitionPlan {
                next: fielded_with(subject_id),
                displaced_holder,
            })
        }
    }
}

fn fielded_with(subject_id: &str) -> WeaponState {
    WeaponState {
        location: Location::Field,
        status: WeaponStatus::Assigned,
        assigned_subject_id: Some(subject_id.to_string()),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransactionRequest<'a> {
    pub subject_id: &'a str,
    /// Scanned QR payload or serial number.
    pub weapon_code: &'a str,
    pub image: &'a [u8],
    pub kind: TransactionKind,
    pub source_address: Option<&'a str>,
    pub notes: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub enum TransactionOutcome {
    WeaponNotFound {
        code: String,
    },
    SubjectNotFound {
        subject_id: String,
    },
    /// The same subject and weapon already have a request in flight.
    Busy,
    NotVerified {
        verification: VerificationReport,
    },
    /// Identity confirmed, operation refused.
    Rejected {
        confidence: f32,
        reason: IllegalTransition,
    },
    Completed {
        confidence: f32,
        /// Records written, in order. A reassignment of a fielded weapon
        /// writes the synthetic check-in first.
        records: Vec<Transaction>,
        weapon: Weapon,
    },
}

impl TransactionOutcome {
    pub fn verified(&self) -> bool {
        matches!(
            self,
            TransactionOutcome::Rejected { .. } | TransactionOutcome::Completed { .. }
        )
    }

    pub fn transaction_success(&self) -> bool {
        matches!(self, TransactionOutcome::Completed { .. })
    }

    pub fn confidence(&self) -> f32 {
        match self {
            TransactionOutcome::NotVerified { verification } => verification.confidence(),
            TransactionOutcome::Rejected { confidence, .. }
            | TransactionOutcome::Completed { confidence, .. } => *confidence,
            _ => 0.0,
        }
    }

    /// Operator-facing banner text.
    pub fn message(&self) -> String {
        match self {
            TransactionOutcome::WeaponNotFound { .. } => "Weapon not found".into(),
            TransactionOutcome::SubjectNotFound { .. } => "Personnel not found".into(),
            TransactionOutcome::Busy => {
                "A verification for this weapon is already in progress".into()
            }
            TransactionOutcome::NotVerified { verification } => match &verification.outcome {
                VerifyOutcome::NoTemplate => "No face record found for this personnel".into(),
                VerifyOutcome::Mismatch { .. } => "Face verification failed".into(),
                other => match other.error() {
                    Some(detail) => format!("Face verification failed: {detail}"),
                    None => "Face verification failed".into(),
                },
            },
            TransactionOutcome::Rejected { reason, .. } => reason.to_string(),
            TransactionOutcome::Completed { records, weapon, .. } => {
                match records.last().map(|r| r.kind) {
                    Some(TransactionKind::CheckIn) => "Weapon checked in successfully".into(),
                    Some(TransactionKind::CheckOut) => "Weapon checked out successfully".into(),
                    Some(TransactionKind::Reassign) => format!(
                        "Weapon reassigned to {}",
                        weapon.assigned_subject_id.as_deref().unwrap_or("unknown")
                    ),
                    None => "Transaction completed".into(),
                }
            }
        }
    }
}

impl fmt::Display for TransactionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error("lookup failed: {0}")]
    Lookup(#[source] StoreError),
    /// The commit failed and was rolled back.
    #[error("transaction commit failed: {0}")]
    Persistence(#[source] StoreError),
}

/// Runs custody transactions against a store.
pub struct TransactionMachine<P> {
    engine: VerificationEngine<P>,
    policy: ReassignPolicy,
    verifier_identity: String,
    in_flight: InFlightRegistry,
}

impl<P: EmbeddingProvider> TransactionMachine<P> {
    pub fn new(
        engine: VerificationEngine<P>,
        policy: ReassignPolicy,
        verifier_identity: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            policy,
            verifier_identity: verifier_identity.into(),
            in_flight: InFlightRegistry::new(),
        }
    }

    pub fn engine(&self) -> &VerificationEngine<P> {
        &self.engine
    }

    pub fn policy(&self) -> ReassignPolicy {
        self.policy
    }

    pub fn in_flight(&self) -> &InFlightRegistry {
        &self.in_flight
    }

    pub async fn execute<S: ArmoryStore>(
        &self,
        store: &S,
        request: TransactionRequest<'_>,
    ) -> Result<TransactionOutcome, TransactionError> {
        let Some(weapon) = store
            .find_weapon_by_code(request.weapon_code)
            .await
            .map_err(|e| TransactionError::Lookup(Box::new(e)))?
        else {
            tracing::warn!(code = request.weapon_code, "weapon not found");
            return Ok(TransactionOutcome::WeaponNotFound {
                code: request.weapon_code.to_string(),
            });
        };

        let Some(subject) = store
            .find_subject(request.subject_id)
            .await
            .map_err(|e| TransactionError::Lookup(Box::new(e)))?
        else {
            let attempt =
                VerificationAttempt::new(Some(request.subject_id.to_string()), AttemptOutcome::Failure)
                    .with_confidence(0.0)
                    .with_source(request.source_address.map(str::to_string))
                    .with_error("subject not found");
            store
                .log_verification_attempt(&attempt)
                .await
                .map_err(|e| VerifyError::Audit(Box::new(e)))?;
            tracing::warn!(subject_id = request.subject_id, "subject not found");
            return Ok(TransactionOutcome::SubjectNotFound {
                subject_id: request.subject_id.to_string(),
            });
        };

        let Some(_permit) = self.in_flight.try_acquire(&subject.id_number, weapon.id) else {
            tracing::debug!(
                subject_id = %subject.id_number,
                weapon = %weapon.serial_number,
                "duplicate request while in flight"
            );
            return Ok(TransactionOutcome::Busy);
        };

        let verification = self
            .engine
            .verify(
                store,
                VerifyRequest {
                    subject_id: &subject.id_number,
                    image: request.image,
                    source_address: request.source_address,
                },
            )
            .await?;

        if !verification.verified() {
            return Ok(TransactionOutcome::NotVerified { verification });
        }
        let confidence = verification.confidence();

        let held = match request.kind {
            TransactionKind::CheckOut | TransactionKind::Reassign => store
                .weapon_assigned_to(&subject.id_number)
                .await
                .map_err(|e| TransactionError::Lookup(Box::new(e)))?
                .filter(|held| held.id != weapon.id),
            TransactionKind::CheckIn => None,
        };

        let plan = match self.plan(&weapon, &subject, held.as_ref(), request.kind) {
            Ok(plan) => plan,
            Err(reason) => {
                tracing::warn!(
                    subject_id = %subject.id_number,
                    weapon = %weapon.serial_number,
                    kind = request.kind.as_str(),
                    %reason,
                    "transition rejected"
                );
                return Ok(TransactionOutcome::Rejected { confidence, reason });
            }
        };

        let mut records = Vec::with_capacity(2);
        if let Some(holder) = &plan.displaced_holder {
            records.push(NewTransaction {
                subject_id: holder.clone(),
                kind: TransactionKind::CheckIn,
                confidence: None,
                attempt_id: None,
                notes: Some(format!(
                    "Automatic check-in during reassignment to {}",
                    subject.id_number
                )),
            });
        }
        records.push(NewTransaction {
            subject_id: subject.id_number.clone(),
            kind: request.kind,
            confidence: Some(confidence),
            attempt_id: Some(verification.attempt.id),
            notes: request.notes.map(str::to_string),
        });

        let commit = TransactionCommit {
            weapon_id: weapon.id,
            expected: weapon.state(),
            next: plan.next.clone(),
            records,
            verifier_identity: self.verifier_identity.clone(),
        };

        let written = match store.commit_transaction(commit).await {
            Ok(CommitResult::Committed(written)) => written,
            Ok(CommitResult::Conflict { current }) => {
                tracing::warn!(
                    weapon = %weapon.serial_number,
                    location = current.location.as_str(),
                    "weapon changed state before commit"
                );
                return Ok(TransactionOutcome::Rejected {
                    confidence,
                    reason: IllegalTransition::StateChanged,
                });
            }
            Err(e) => {
                tracing::error!(
                    subject_id = %subject.id_number,
                    weapon = %weapon.serial_number,
                    kind = request.kind.as_str(),
                    error = %e,
                    "transaction commit failed"
                );
                return Err(TransactionError::Persistence(Box::new(e)));
            }
        };

        let weapon = Weapon {
            status: plan.next.status,
            location: plan.next.location,
            assigned_subject_id: plan.next.assigned_subject_id,
            ..weapon
        };
        tracing::info!(
            subject_id = %subject.id_number,
            weapon = %weapon.serial_number,
            kind = request.kind.as_str(),
            records = written.len(),
            confidence,
            "transaction committed"
        );

        Ok(TransactionOutcome::Completed {
            confidence,
            records: written,
            weapon,
        })
    }

    fn plan(
        &self,
        weapon: &Weapon,
        subject: &Subject,
        held: Option<&Weapon>,
        kind: TransactionKind,
    ) -> Result<TransitionPlan, IllegalTransition> {
        if !subject.active {
            return Err(IllegalTransition::InactiveSubject);
        }
        // One weapon per subject.
        if let Some(other) = held {
            return Err(IllegalTransition::SubjectHoldsWeapon {
                serial_number: other.serial_number.clone(),
            });
        }
        plan_transition(&weapon.state(), &subject.id_number, kind, self.policy)
    }
}

/// A weapon together with who holds it and what a scan should do next.
#[derive(Debug, Clone, Serialize)]
pub struct WeaponInfo {
    pub weapon: Weapon,
    pub holder: Option<Subject>,
    pub recommended: TransactionKind,
}

/// Look up a scanned code for display before a transaction.
pub async fn weapon_info<S: ArmoryStore>(store: &S, code: &str) -> Result<Option<WeaponInfo>, StoreError> {
    let Some(weapon) = store.find_weapon_by_code(code).await? else {
        return Ok(None);
    };
    let holder = match &weapon.assigned_subject_id {
        Some(id) => store.find_subject(id).await?,
        None => None,
    };
    let recommended = match weapon.location {
        Location::Field => TransactionKind::CheckIn,
        Location::Armory => TransactionKind::CheckOut,
    };
    Ok(Some(WeaponInfo {
        weapon,
        holder,
        recommended,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_armory() -> WeaponState {
        WeaponState {
            location: Location::Armory,
            status: WeaponStatus::Available,
            assigned_subject_id: None,
        }
    }

    fn fielded(holder: &str) -> WeaponState {
        fielded_with(holder)
    }

    #[test]
    fn test_check_out_from_armory() {
        let plan = plan_transition(&in_armory(), "101", TransactionKind::CheckOut, ReassignPolicy::default())
            .unwrap();
        assert_eq!(plan.next, fielded("101"));
        assert!(plan.displaced_holder.is_none());
    }

    #[test]
    fn test_check_out_when_fielded_is_rejected() {
        let err = plan_transition(&fielded("101"), "101", TransactionKind::CheckOut, ReassignPolicy::default())
            .unwrap_err();
        assert_eq!(err, IllegalTransition::AlreadyCheckedOut);
        assert!(err.to_string().contains("already checked out"));
    }

    #[test]
    fn test_check_out_out_of_service() {
        let state = WeaponState {
            status: WeaponStatus::Maintenance,
            ..in_armory()
        };
        let err = plan_transition(&state, "101", TransactionKind::CheckOut, ReassignPolicy::default())
            .unwrap_err();
        assert_eq!(
            err,
            IllegalTransition::OutOfService {
                status: WeaponStatus::Maintenance
            }
        );
    }

    #[test]
    fn test_check_in_by_holder() {
        let plan = plan_transition(&fielded("101"), "101", TransactionKind::CheckIn, ReassignPolicy::default())
            .unwrap();
        assert_eq!(plan.next, in_armory());
    }

    #[test]
    fn test_check_in_keeps_non_assignment_status() {
        let state = WeaponState {
            status: WeaponStatus::Maintenance,
            ..fielded("101")
        };
        let plan =
            plan_transition(&state, "101", TransactionKind::CheckIn, ReassignPolicy::default()).unwrap();
        assert_eq!(plan.next.status, WeaponStatus::Maintenance);
        assert_eq!(plan.next.location, Location::Armory);
    }

    #[test]
    fn test_check_in_by_other_subject() {
        let err = plan_transition(&fielded("101"), "202", TransactionKind::CheckIn, ReassignPolicy::default())
            .unwrap_err();
        assert_eq!(
            err,
            IllegalTransition::HeldByOther {
                holder: "101".into()
            }
        );
    }

    #[test]
    fn test_check_in_when_in_armory() {
        let err = plan_transition(&in_armory(), "101", TransactionKind::CheckIn, ReassignPolicy::default())
            .unwrap_err();
        assert_eq!(err, IllegalTransition::AlreadyCheckedIn);
    }

    #[test]
    fn test_reassign_displaces_holder() {
        let plan = plan_transition(&fielded("101"), "202", TransactionKind::Reassign, ReassignPolicy::AutoCheckIn)
            .unwrap();
        assert_eq!(plan.next, fielded("202"));
        assert_eq!(plan.displaced_holder.as_deref(), Some("101"));
    }

    #[test]
    fn test_reassign_from_armory_has_no_synthetic_check_in() {
        let plan = plan_transition(&in_armory(), "202", TransactionKind::Reassign, ReassignPolicy::RejectFielded)
            .unwrap();
        assert!(plan.displaced_holder.is_none());
    }

    #[test]
    fn test_reassign_policy_rejects_fielded() {
        let err = plan_transition(&fielded("101"), "202", TransactionKind::Reassign, ReassignPolicy::RejectFielded)
            .unwrap_err();
        assert_eq!(err, IllegalTransition::ReassignFielded);
    }

    #[test]
    fn test_reassign_to_current_holder() {
        let err = plan_transition(&fielded("101"), "101", TransactionKind::Reassign, ReassignPolicy::AutoCheckIn)
            .unwrap_err();
        assert_eq!(err, IllegalTransition::AlreadyAssigned);
    }

    #[test]
    fn test_busy_outcome_is_unverified() {
        let outcome = TransactionOutcome::Busy;
        assert!(!outcome.verified());
        assert!(!outcome.transaction_success());
        assert_eq!(outcome.confidence(), 0.0);
    }

    #[test]
    fn test_rejected_outcome_is_verified() {
        let outcome = TransactionOutcome::Rejected {
            confidence: 0.91,
            reason: IllegalTransition::AlreadyCheckedOut,
        };
        assert!(outcome.verified());
        assert!(!outcome.transaction_success());
        assert_eq!(outcome.confidence(), 0.91);
        assert_eq!(
            outcome.message(),
            "This weapon is already checked out and not in the armory"
        );
    }
}
