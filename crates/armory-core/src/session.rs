//! Scan-session state: the in-flight guard, face debouncing, and the
//! QR → face → verify → re-arm workflow that drives a kiosk client.
//!
//! None of this is global. A daemon owns one [`InFlightRegistry`]; each
//! client loop owns one [`ScanSession`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::types::{BoundingBox, TransactionKind};

/// Default number of consecutive stable frames before verification fires.
pub const DEFAULT_DEBOUNCE_FRAMES: u32 = 3;
/// Default minimum face box side, in pixels of the full-resolution frame.
pub const DEFAULT_MIN_FACE_PX: f32 = 100.0;
/// Default pause after a completed transaction before the next scan.
pub const DEFAULT_RESET_DELAY: Duration = Duration::from_secs(3);

type InFlightKey = (String, i64);

/// Tracks which (subject, weapon) pairs have a verification in flight.
///
/// Cloning shares the same registry.
#[derive(Clone, Default)]
pub struct InFlightRegistry {
    inner: Arc<Mutex<HashSet<InFlightKey>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the pair. Returns `None` if it is already claimed.
    pub fn try_acquire(&self, subject_id: &str, weapon_id: i64) -> Option<InFlightPermit> {
        let key = (subject_id.to_string(), weapon_id);
        let mut set = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(key.clone()) {
            return None;
        }
        Some(InFlightPermit {
            registry: Arc::clone(&self.inner),
            key,
        })
    }

    pub fn is_in_flight(&self, subject_id: &str, weapon_id: i64) -> bool {
        let set = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        set.contains(&(subject_id.to_string(), weapon_id))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases its pair when dropped, whether the work completed or failed.
pub struct InFlightPermit {
    registry: Arc<Mutex<HashSet<InFlightKey>>>,
    key: InFlightKey,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        let mut set = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        set.remove(&self.key);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    /// Zero faces, several faces, or a face too small to trust.
    Waiting,
    /// A single good face seen this many frames in a row.
    Stabilizing(u32),
    Ready,
}

/// Counts consecutive frames showing exactly one sufficiently large face.
#[derive(Debug, Clone)]
pub struct FaceDebouncer {
    required: u32,
    min_face_px: f32,
    stable: u32,
}

impl FaceDebouncer {
    pub fn new(required: u32, min_face_px: f32) -> Self {
        Self {
            required: required.max(1),
            min_face_px,
            stable: 0,
        }
    }

    pub fn observe(&mut self, faces: &[BoundingBox]) -> DebounceState {
        let single_large = match faces {
            [face] => face.width >= self.min_face_px && face.height >= self.min_face_px,
            _ => false,
        };

        if !single_large {
            self.stable = 0;
            return DebounceState::Waiting;
        }

        self.stable = self.stable.saturating_add(1);
        if self.stable >= self.required {
            DebounceState::Ready
        } else {
            DebounceState::Stabilizing(self.stable)
        }
    }

    pub fn reset(&mut self) {
        self.stable = 0;
    }
}

impl Default for FaceDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_FRAMES, DEFAULT_MIN_FACE_PX)
    }
}

/// What the operator asked for after scanning a weapon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanContext {
    pub weapon_code: String,
    pub subject_id: String,
    pub kind: TransactionKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanPhase {
    AwaitingWeapon,
    AwaitingFace(ScanContext),
    /// Verification in flight; frames are ignored.
    Verifying(ScanContext),
    Complete {
        context: ScanContext,
        success: bool,
        message: String,
        /// When the session re-arms on its own; `None` waits for retry or cancel.
        rearm_at: Option<Instant>,
    },
}

/// One kiosk's workflow.
pub struct ScanSession {
    phase: ScanPhase,
    debouncer: FaceDebouncer,
    reset_delay: Duration,
}

impl ScanSession {
    pub fn new(debouncer: FaceDebouncer, reset_delay: Duration) -> Self {
        Self {
            phase: ScanPhase::AwaitingWeapon,
            debouncer,
            reset_delay,
        }
    }

    pub fn phase(&self) -> &ScanPhase {
        &self.phase
    }

    /// A weapon was scanned and the claimed identity entered.
    /// Ignored unless the session is waiting for a weapon.
    pub fn arm(&mut self, context: ScanContext) -> bool {
        if self.phase != ScanPhase::AwaitingWeapon {
            return false;
        }
        self.debouncer.reset();
        self.phase = ScanPhase::AwaitingFace(context);
        true
    }

    /// Feed one frame's face boxes. Returns the context to verify exactly
    /// once, when the face has been stable long enough.
    pub fn observe_faces(&mut self, faces: &[BoundingBox]) -> Option<ScanContext> {
        let ScanPhase::AwaitingFace(context) = &self.phase else {
            return None;
        };
        if self.debouncer.observe(faces) != DebounceState::Ready {
            return None;
        }
        let context = context.clone();
        self.debouncer.reset();
        self.phase = ScanPhase::Verifying(context.clone());
        Some(context)
    }

    /// Record the result of the triggered transaction. A successful one
    /// schedules the automatic re-arm.
    pub fn finish(&mut self, success: bool, message: impl Into<String>, now: Instant) {
        let ScanPhase::Verifying(context) = &self.phase else {
            return;
        };
        self.phase = ScanPhase::Complete {
            context: context.clone(),
            success,
            message: message.into(),
            rearm_at: success.then(|| now + self.reset_delay),
        };
    }

    /// Advance time. Returns `true` if the session re-armed for the next weapon.
    pub fn tick(&mut self, now: Instant) -> bool {
        match &self.phase {
            ScanPhase::Complete {
                rearm_at: Some(at), ..
            } if now >= *at => {
                self.phase = ScanPhase::AwaitingWeapon;
                true
            }
            _ => false,
        }
    }

    /// After a failed attempt, look for the face again with the same context.
    pub fn retry(&mut self) -> bool {
        match &self.phase {
            ScanPhase::Complete {
                context,
                success: false,
                ..
            } => {
                self.debouncer.reset();
                self.phase = ScanPhase::AwaitingFace(context.clone());
                true
            }
            _ => false,
        }
    }

    /// Abandon whatever is in progress (e.g. camera stopped).
    pub fn cancel(&mut self) {
        self.debouncer.reset();
        self.phase = ScanPhase::AwaitingWeapon;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(side: f32) -> BoundingBox {
        BoundingBox {
            width: side,
            height: side,
            confidence: 0.9,
            ..Default::default()
        }
    }

    fn context() -> ScanContext {
        ScanContext {
            weapon_code: "S1001".into(),
            subject_id: "101".into(),
            kind: TransactionKind::CheckOut,
        }
    }

    #[test]
    fn test_in_flight_blocks_duplicate() {
        let registry = InFlightRegistry::new();
        let permit = registry.try_acquire("101", 1).unwrap();
        assert!(registry.try_acquire("101", 1).is_none());
        assert!(registry.try_acquire("102", 1).is_some());
        drop(permit);
        assert!(!registry.is_in_flight("101", 1));
        assert!(registry.try_acquire("101", 1).is_some());
    }

    #[test]
    fn test_in_flight_clones_share_state() {
        let a = InFlightRegistry::new();
        let b = a.clone();
        let _permit = a.try_acquire("101", 7).unwrap();
        assert!(b.try_acquire("101", 7).is_none());
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_debounce_needs_consecutive_frames() {
        let mut d = FaceDebouncer::new(3, 100.0);
        assert_eq!(d.observe(&[face(120.0)]), DebounceState::Stabilizing(1));
        assert_eq!(d.observe(&[face(120.0)]), DebounceState::Stabilizing(2));
        assert_eq!(d.observe(&[face(120.0)]), DebounceState::Ready);
    }

    #[test]
    fn test_debounce_resets_on_zero_or_many() {
        let mut d = FaceDebouncer::new(3, 100.0);
        d.observe(&[face(120.0)]);
        d.observe(&[face(120.0)]);
        assert_eq!(d.observe(&[]), DebounceState::Waiting);
        assert_eq!(d.observe(&[face(120.0)]), DebounceState::Stabilizing(1));
        assert_eq!(d.observe(&[face(120.0), face(130.0)]), DebounceState::Waiting);
        assert_eq!(d.observe(&[face(120.0)]), DebounceState::Stabilizing(1));
    }

    #[test]
    fn test_debounce_ignores_small_faces() {
        let mut d = FaceDebouncer::new(1, 100.0);
        assert_eq!(d.observe(&[face(40.0)]), DebounceState::Waiting);
        assert_eq!(d.observe(&[face(100.0)]), DebounceState::Ready);
    }

    #[test]
    fn test_session_triggers_once() {
        let mut s = ScanSession::new(FaceDebouncer::new(2, 50.0), Duration::from_secs(3));
        assert!(s.observe_faces(&[face(80.0)]).is_none());
        assert!(s.arm(context()));
        assert!(s.observe_faces(&[face(80.0)]).is_none());
        assert_eq!(s.observe_faces(&[face(80.0)]), Some(context()));
        // Frames while verifying never re-trigger.
        for _ in 0..5 {
            assert!(s.observe_faces(&[face(80.0)]).is_none());
        }
        assert!(matches!(s.phase(), ScanPhase::Verifying(_)));
    }

    #[test]
    fn test_session_rearms_after_delay() {
        let mut s = ScanSession::new(FaceDebouncer::new(1, 50.0), Duration::from_secs(3));
        s.arm(context());
        s.observe_faces(&[face(80.0)]).unwrap();
        let now = Instant::now();
        s.finish(true, "Weapon checked out successfully", now);
        assert!(!s.tick(now + Duration::from_secs(1)));
        assert!(s.tick(now + Duration::from_secs(3)));
        assert_eq!(s.phase(), &ScanPhase::AwaitingWeapon);
    }

    #[test]
    fn test_session_failure_waits_for_retry() {
        let mut s = ScanSession::new(FaceDebouncer::new(1, 50.0), Duration::from_secs(3));
        s.arm(context());
        s.observe_faces(&[face(80.0)]).unwrap();
        let now = Instant::now();
        s.finish(false, "Face verification failed", now);
        assert!(!s.tick(now + Duration::from_secs(60)));
        assert!(s.retry());
        assert_eq!(s.phase(), &ScanPhase::AwaitingFace(context()));
    }

    #[test]
    fn test_session_arm_only_when_idle() {
        let mut s = ScanSession::new(FaceDebouncer::default(), DEFAULT_RESET_DELAY);
        assert!(s.arm(context()));
        assert!(!s.arm(context()));
        s.cancel();
        assert!(s.arm(context()));
    }
}
