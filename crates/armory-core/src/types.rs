use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Bounding box for a detected face, in source image pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector score for this face.
    pub confidence: f32,
}

impl BoundingBox {
    /// Box area; degenerate boxes count as zero.
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EmbeddingError {
    #[error("embedding payload is empty")]
    Empty,
    #[error("embedding payload length {0} is not a multiple of 4")]
    Misaligned(usize),
}

/// Face embedding vector (128-dimensional for dlib-style providers,
/// 512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    #[serde(default)]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// L2 norm.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Always processes
    /// all dimensions; a zero vector on either side yields 0.0.
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        // A single square root keeps self-comparison exact: sqrt(n * n) == n.
        let denom = (norm_a * norm_b).sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }

    /// Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Little-endian `f32` byte encoding, the wire and storage format.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, EmbeddingError> {
        if bytes.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        if bytes.len() % 4 != 0 {
            return Err(EmbeddingError::Misaligned(bytes.len()));
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self::new(values))
    }
}

/// One face found by an embedding provider.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// The stored biometric reference for one subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    /// Stable identifier of this enrollment record.
    pub face_id: Uuid,
    pub subject_id: String,
    pub embedding: Embedding,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub active: bool,
}

/// A member of personnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub id_number: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub rank: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Subject {
    pub fn display_name(&self) -> String {
        format!("{} {} {}", self.rank, self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeaponStatus {
    Available,
    Assigned,
    Maintenance,
    Decommissioned,
}

impl WeaponStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WeaponStatus::Available => "available",
            WeaponStatus::Assigned => "assigned",
            WeaponStatus::Maintenance => "maintenance",
            WeaponStatus::Decommissioned => "decommissioned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(WeaponStatus::Available),
            "assigned" => Some(WeaponStatus::Assigned),
            "maintenance" => Some(WeaponStatus::Maintenance),
            "decommissioned" => Some(WeaponStatus::Decommissioned),
            _ => None,
        }
    }

    /// Whether the weapon may leave the armory at all.
    pub fn in_service(self) -> bool {
        matches!(self, WeaponStatus::Available | WeaponStatus::Assigned)
    }
}

/// Where a weapon physically is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    Armory,
    Field,
}

impl Location {
    pub fn as_str(self) -> &'static str {
        match self {
            Location::Armory => "armory",
            Location::Field => "field",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "armory" => Some(Location::Armory),
            "field" => Some(Location::Field),
            _ => None,
        }
    }
}

/// The mutable custody part of a weapon record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeaponState {
    pub location: Location,
    pub status: WeaponStatus,
    pub assigned_subject_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Weapon {
    pub id: i64,
    pub serial_number: String,
    pub model: String,
    /// Payload of the QR label on the weapon.
    pub qr_code: String,
    pub status: WeaponStatus,
    pub location: Location,
    pub assigned_subject_id: Option<String>,
}

impl Weapon {
    pub fn state(&self) -> WeaponState {
        WeaponState {
            location: self.location,
            status: self.status,
            assigned_subject_id: self.assigned_subject_id.clone(),
        }
    }

    /// QR payload printed on labels when none is supplied at intake.
    pub fn default_qr_code(serial_number: &str) -> String {
        let unique = Uuid::new_v4().simple().to_string();
        format!("WPN-{serial_number}-{}", &unique[..12])
    }
}

/// Input for adding a weapon to the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWeapon {
    pub serial_number: String,
    pub model: String,
    #[serde(default)]
    pub qr_code: Option<String>,
    #[serde(default = "default_new_status")]
    pub status: WeaponStatus,
}

fn default_new_status() -> WeaponStatus {
    WeaponStatus::Available
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    #[serde(alias = "checkin")]
    CheckIn,
    #[serde(alias = "checkout")]
    CheckOut,
    Reassign,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::CheckIn => "check_in",
            TransactionKind::CheckOut => "check_out",
            TransactionKind::Reassign => "reassign",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "check_in" | "checkin" => Some(TransactionKind::CheckIn),
            "check_out" | "checkout" => Some(TransactionKind::CheckOut),
            "reassign" => Some(TransactionKind::Reassign),
            _ => None,
        }
    }
}

/// A durable custody record. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub subject_id: String,
    pub weapon_id: i64,
    pub kind: TransactionKind,
    pub timestamp: DateTime<Utc>,
    pub confidence: Option<f32>,
    pub verifier_identity: String,
    pub notes: Option<String>,
    /// Verification attempt that authorised this record, if any.
    pub attempt_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Error,
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failure => "failure",
            AttemptOutcome::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(AttemptOutcome::Success),
            "failure" => Some(AttemptOutcome::Failure),
            "error" => Some(AttemptOutcome::Error),
            _ => None,
        }
    }
}

/// Audit entry written for every verification attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationAttempt {
    pub id: Uuid,
    pub subject_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub confidence: Option<f32>,
    pub source_address: Option<String>,
    pub error_detail: Option<String>,
}

impl VerificationAttempt {
    pub fn new(subject_id: Option<String>, outcome: AttemptOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject_id,
            timestamp: Utc::now(),
            outcome,
            confidence: None,
            source_address: None,
            error_detail: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_source(mut self, source_address: Option<String>) -> Self {
        self.source_address = source_address;
        self
    }

    pub fn with_error(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }
}

/// Audit entry written for every registration attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationLog {
    pub id: Uuid,
    pub subject_id: String,
    pub timestamp: DateTime<Utc>,
    pub operator: Option<String>,
    pub successful: bool,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.cosine_similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![-1.0, 0.0]);
        assert!((a.cosine_similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.cosine_similarity(&b), 0.0);
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_le_bytes_layout() {
        let e = Embedding::new(vec![1.0, -2.5]);
        let bytes = e.to_le_bytes();
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
        assert_eq!(Embedding::from_le_bytes(&bytes).unwrap().values, vec![1.0, -2.5]);
    }

    #[test]
    fn test_le_bytes_rejects_bad_payloads() {
        assert_eq!(Embedding::from_le_bytes(&[]), Err(EmbeddingError::Empty));
        assert_eq!(
            Embedding::from_le_bytes(&[0, 0, 0]),
            Err(EmbeddingError::Misaligned(3))
        );
    }

    #[test]
    fn test_bbox_area_degenerate() {
        let b = BoundingBox { width: -4.0, height: 10.0, ..Default::default() };
        assert_eq!(b.area(), 0.0);
    }

    #[test]
    fn test_transaction_kind_aliases() {
        let k: TransactionKind = serde_json::from_str("\"checkout\"").unwrap();
        assert_eq!(k, TransactionKind::CheckOut);
        assert_eq!(TransactionKind::parse("check_in"), Some(TransactionKind::CheckIn));
        assert_eq!(TransactionKind::parse("transfer"), None);
    }

    #[test]
    fn test_default_qr_code_shape() {
        let code = Weapon::default_qr_code("S1001");
        assert!(code.starts_with("WPN-S1001-"));
        assert_eq!(code.len(), "WPN-S1001-".len() + 12);
    }

    #[test]
    fn test_subject_display_name() {
        let s = Subject {
            id_number: "101".into(),
            first_name: "Bat".into(),
            last_name: "Erdene".into(),
            rank: "Sgt".into(),
            active: true,
        };
        assert_eq!(s.display_name(), "Sgt Bat Erdene");
    }
}
