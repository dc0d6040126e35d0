//! Conversions between domain types and the plain values stored in SQLite.
//!
//! Timestamps are RFC 3339 strings, UUIDs hyphenated lowercase strings,
//! enums their snake_case tags. Embeddings are little-endian `f32` blobs,
//! optionally sealed by a [`TemplateCipher`].

use chrono::{DateTime, Utc};
use uuid::Uuid;

use armory_core::types::{
    AttemptOutcome, Embedding, Location, Template, Transaction, TransactionKind,
    VerificationAttempt, Weapon, WeaponStatus,
};

use crate::cipher::TemplateCipher;
use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String {
    id.hyphenated().to_string()
}

pub fn decode_uuid(s: &str) -> Result<Uuid> {
    Ok(Uuid::parse_str(s)?)
}

pub fn encode_dt(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::DateParse(e.to_string()))
}

fn decode_status(s: &str) -> Result<WeaponStatus> {
    WeaponStatus::parse(s).ok_or_else(|| Error::Corrupt(format!("unknown weapon status {s:?}")))
}

fn decode_location(s: &str) -> Result<Location> {
    Location::parse(s).ok_or_else(|| Error::Corrupt(format!("unknown location {s:?}")))
}

// ─── Embeddings ──────────────────────────────────────────────────────────────

/// Encode an embedding for storage: `(blob, nonce)`.
pub fn seal_embedding(
    embedding: &Embedding,
    cipher: Option<&TemplateCipher>,
) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
    let bytes = embedding.to_le_bytes();
    match cipher {
        Some(cipher) => {
            let (nonce, ciphertext) = cipher.seal(&bytes)?;
            Ok((ciphertext, Some(nonce)))
        }
        None => Ok((bytes, None)),
    }
}

pub fn open_embedding(
    blob: &[u8],
    nonce: Option<&[u8]>,
    cipher: Option<&TemplateCipher>,
) -> Result<Embedding> {
    let bytes = match (nonce, cipher) {
        (Some(nonce), Some(cipher)) => cipher.open(nonce, blob)?,
        (Some(_), None) => {
            return Err(Error::Cipher(
                "template is encrypted but no key is configured".into(),
            ))
        }
        (None, _) => blob.to_vec(),
    };
    Embedding::from_le_bytes(&bytes).map_err(|e| Error::Corrupt(e.to_string()))
}

// ─── Rows ────────────────────────────────────────────────────────────────────

pub const TEMPLATE_COLUMNS: &str =
    "face_id, subject_id, embedding, nonce, model_version, created_at, updated_at, active";

/// A `templates` row as read from SQLite, before decryption.
pub struct RawTemplate {
    pub face_id: String,
    pub subject_id: String,
    pub embedding: Vec<u8>,
    pub nonce: Option<Vec<u8>>,
    pub model_version: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub active: bool,
}

impl RawTemplate {
    pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            face_id: row.get(0)?,
            subject_id: row.get(1)?,
            embedding: row.get(2)?,
            nonce: row.get(3)?,
            model_version: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            active: row.get(7)?,
        })
    }

    pub fn into_template(self, cipher: Option<&TemplateCipher>) -> Result<Template> {
        let mut embedding = open_embedding(&self.embedding, self.nonce.as_deref(), cipher)?;
        embedding.model_version = self.model_version;
        Ok(Template {
            face_id: decode_uuid(&self.face_id)?,
            subject_id: self.subject_id,
            embedding,
            created_at: decode_dt(&self.created_at)?,
            updated_at: decode_dt(&self.updated_at)?,
            active: self.active,
        })
    }
}

pub const WEAPON_COLUMNS: &str =
    "id, serial_number, model, qr_code, status, location, assigned_subject_id";

pub struct RawWeapon {
    pub id: i64,
    pub serial_number: String,
    pub model: String,
    pub qr_code: String,
    pub status: String,
    pub location: String,
    pub assigned_subject_id: Option<String>,
}

impl RawWeapon {
    pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            serial_number: row.get(1)?,
            model: row.get(2)?,
            qr_code: row.get(3)?,
            status: row.get(4)?,
            location: row.get(5)?,
            assigned_subject_id: row.get(6)?,
        })
    }

    pub fn into_weapon(self) -> Result<Weapon> {
        Ok(Weapon {
            id: self.id,
            serial_number: self.serial_number,
            model: self.model,
            qr_code: self.qr_code,
            status: decode_status(&self.status)?,
            location: decode_location(&self.location)?,
            assigned_subject_id: self.assigned_subject_id,
        })
    }
}

pub const TRANSACTION_COLUMNS: &str =
    "id, subject_id, weapon_id, kind, timestamp, confidence, verifier_identity, notes, attempt_id";

pub struct RawTransaction {
    pub id: String,
    pub subject_id: String,
    pub weapon_id: i64,
    pub kind: String,
    pub timestamp: String,
    pub confidence: Option<f64>,
    pub verifier_identity: String,
    pub notes: Option<String>,
    pub attempt_id: Option<String>,
}

impl RawTransaction {
    pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            subject_id: row.get(1)?,
            weapon_id: row.get(2)?,
            kind: row.get(3)?,
            timestamp: row.get(4)?,
            confidence: row.get(5)?,
            verifier_identity: row.get(6)?,
            notes: row.get(7)?,
            attempt_id: row.get(8)?,
        })
    }

    pub fn into_transaction(self) -> Result<Transaction> {
        Ok(Transaction {
            id: decode_uuid(&self.id)?,
            subject_id: self.subject_id,
            weapon_id: self.weapon_id,
            kind: TransactionKind::parse(&self.kind)
                .ok_or_else(|| Error::Corrupt(format!("unknown transaction kind {:?}", self.kind)))?,
            timestamp: decode_dt(&self.timestamp)?,
            confidence: self.confidence.map(|c| c as f32),
            verifier_identity: self.verifier_identity,
            notes: self.notes,
            attempt_id: self.attempt_id.as_deref().map(decode_uuid).transpose()?,
        })
    }
}

pub const ATTEMPT_COLUMNS: &str =
    "id, subject_id, timestamp, outcome, confidence, source_address, error_detail";

pub struct RawAttempt {
    pub id: String,
    pub subject_id: Option<String>,
    pub timestamp: String,
    pub outcome: String,
    pub confidence: Option<f64>,
    pub source_address: Option<String>,
    pub error_detail: Option<String>,
}

impl RawAttempt {
    pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            subject_id: row.get(1)?,
            timestamp: row.get(2)?,
            outcome: row.get(3)?,
            confidence: row.get(4)?,
            source_address: row.get(5)?,
            error_detail: row.get(6)?,
        })
    }

    pub fn into_attempt(self) -> Result<VerificationAttempt> {
        Ok(VerificationAttempt {
            id: decode_uuid(&self.id)?,
            subject_id: self.subject_id,
            timestamp: decode_dt(&self.timestamp)?,
            outcome: AttemptOutcome::parse(&self.outcome)
                .ok_or_else(|| Error::Corrupt(format!("unknown attempt outcome {:?}", self.outcome)))?,
            confidence: self.confidence.map(|c| c as f32),
            source_address: self.source_address,
            error_detail: self.error_detail,
        })
    }
}
