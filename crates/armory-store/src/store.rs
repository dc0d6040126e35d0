//! [`SqliteStore`], the SQLite implementation of [`ArmoryStore`].

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension as _;
use serde::Serialize;
use uuid::Uuid;

use armory_core::store::{ArmoryStore, CommitResult, TemplateUpsert, TransactionCommit};
use armory_core::types::{
    Embedding, Location, NewWeapon, RegistrationLog, Subject, Template, Transaction,
    VerificationAttempt, Weapon, WeaponState, WeaponStatus,
};

use crate::cipher::TemplateCipher;
use crate::encode::{
    decode_dt, decode_uuid, encode_dt, encode_uuid, seal_embedding, RawAttempt, RawTemplate, RawTransaction,
    RawWeapon, ATTEMPT_COLUMNS, TEMPLATE_COLUMNS, TRANSACTION_COLUMNS, WEAPON_COLUMNS,
};
use crate::schema::SCHEMA;
use crate::{Error, Result};

/// Row counts for the status endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub subjects: u64,
    pub active_templates: u64,
    pub weapons: u64,
    pub fielded_weapons: u64,
    pub transactions: u64,
}

/// Template metadata for replication listings. Embeddings are never
/// opened, so a row sealed under another key still shows up here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateSummary {
    pub subject_id: String,
    pub dim: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// The armory's store, backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
    conn: tokio_rusqlite::Connection,
    cipher: Option<Arc<TemplateCipher>>,
}

/// How a custody commit ended inside the SQLite transaction.
enum CommitStep {
    Committed,
    Conflict {
        location: String,
        status: String,
        assigned_subject_id: Option<String>,
    },
    Missing,
}

impl SqliteStore {
    /// Open (or create) a store at `path` and run schema initialisation.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path).await?;
        let store = Self { conn, cipher: None };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory store, for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        let store = Self { conn, cipher: None };
        store.init_schema().await?;
        Ok(store)
    }

    /// Encrypt embeddings written from now on, and decrypt sealed ones on read.
    pub fn with_cipher(mut self, cipher: TemplateCipher) -> Self {
        self.cipher = Some(Arc::new(cipher));
        self
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn counts(&self) -> Result<StoreCounts> {
        let counts = self
            .conn
            .call(|conn| {
                let count = |sql: &str| -> rusqlite::Result<u64> {
                    conn.query_row(sql, [], |r| r.get::<_, i64>(0))
                        .map(|n| n.max(0) as u64)
                };
                Ok(StoreCounts {
                    subjects: count("SELECT COUNT(*) FROM subjects")?,
                    active_templates: count("SELECT COUNT(*) FROM templates WHERE active = 1")?,
                    weapons: count("SELECT COUNT(*) FROM weapons")?,
                    fielded_weapons: count("SELECT COUNT(*) FROM weapons WHERE location = 'field'")?,
                    transactions: count("SELECT COUNT(*) FROM transactions")?,
                })
            })
            .await?;
        Ok(counts)
    }

    /// Active templates, metadata only.
    pub async fn template_summaries(&self) -> Result<Vec<TemplateSummary>> {
        let rows: Vec<(String, i64, String, String)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT subject_id, dim, created_at, updated_at
                     FROM templates WHERE active = 1 ORDER BY subject_id",
                )?;
                let rows = stmt
                    .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter()
            .map(|(subject_id, dim, created_at, updated_at)| {
                Ok(TemplateSummary {
                    subject_id,
                    dim: dim.max(0) as usize,
                    created_at: decode_dt(&created_at)?,
                    updated_at: decode_dt(&updated_at)?,
                })
            })
            .collect()
    }

    pub async fn list_subjects(&self) -> Result<Vec<Subject>> {
        let subjects = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id_number, first_name, last_name, rank, active
                     FROM subjects ORDER BY id_number",
                )?;
                let rows = stmt
                    .query_map([], subject_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(subjects)
    }

    async fn select_weapon(&self, column: &'static str, value: String) -> Result<Option<Weapon>> {
        let raw: Option<RawWeapon> = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {WEAPON_COLUMNS} FROM weapons WHERE {column} = ?1 LIMIT 1"),
                        rusqlite::params![value],
                        RawWeapon::from_row,
                    )
                    .optional()?)
            })
            .await?;
        raw.map(RawWeapon::into_weapon).transpose()
    }
}

fn subject_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subject> {
    Ok(Subject {
        id_number: row.get(0)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        rank: row.get(3)?,
        active: row.get(4)?,
    })
}

// ─── ArmoryStore impl ────────────────────────────────────────────────────────

impl ArmoryStore for SqliteStore {
    type Error = Error;

    // ── Templates ─────────────────────────────────────────────────────────────

    async fn active_template(&self, subject_id: &str) -> Result<Option<Template>> {
        let subject_id = subject_id.to_string();
        let raw: Option<RawTemplate> = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!(
                            "SELECT {TEMPLATE_COLUMNS} FROM templates
                             WHERE subject_id = ?1 AND active = 1"
                        ),
                        rusqlite::params![subject_id],
                        RawTemplate::from_row,
                    )
                    .optional()?)
            })
            .await?;
        raw.map(|r| r.into_template(self.cipher.as_deref())).transpose()
    }

    async fn upsert_template(&self, subject_id: &str, embedding: &Embedding) -> Result<TemplateUpsert> {
        let (blob, nonce) = seal_embedding(embedding, self.cipher.as_deref())?;
        let now = Utc::now();
        let now_str = encode_dt(now);
        let fresh_id = Uuid::new_v4();
        let fresh_id_str = encode_uuid(fresh_id);
        let dim = embedding.dim() as i64;
        let model_version = embedding.model_version.clone();
        let subject = subject_id.to_string();

        // (face_id, created_at, was_active) of the row before this write.
        let previous: Option<(String, String, bool)> = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let previous: Option<(String, String, bool)> = tx
                    .query_row(
                        "SELECT face_id, created_at, active FROM templates WHERE subject_id = ?1",
                        rusqlite::params![subject],
                        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                    )
                    .optional()?;

                if previous.is_some() {
                    tx.execute(
                        "UPDATE templates
                         SET embedding = ?1, nonce = ?2, dim = ?3, model_version = ?4,
                             updated_at = ?5, active = 1
                         WHERE subject_id = ?6",
                        rusqlite::params![blob, nonce, dim, model_version, now_str, subject],
                    )?;
                } else {
                    tx.execute(
                        "INSERT INTO templates (
                           face_id, subject_id, embedding, nonce, dim, model_version,
                           created_at, updated_at, active
                         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 1)",
                        rusqlite::params![fresh_id_str, subject, blob, nonce, dim, model_version, now_str],
                    )?;
                }
                tx.commit()?;
                Ok(previous)
            })
            .await?;

        let (face_id, created_at, created) = match previous {
            Some((face_id, created_at, was_active)) => {
                (decode_uuid(&face_id)?, decode_dt(&created_at)?, !was_active)
            }
            None => (fresh_id, now, true),
        };

        Ok(TemplateUpsert {
            template: Template {
                face_id,
                subject_id: subject_id.to_string(),
                embedding: embedding.clone(),
                created_at,
                updated_at: now,
                active: true,
            },
            created,
        })
    }

    async fn deactivate_template(&self, subject_id: &str) -> Result<bool> {
        let subject_id = subject_id.to_string();
        let now_str = encode_dt(Utc::now());
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE templates SET active = 0, updated_at = ?1
                     WHERE subject_id = ?2 AND active = 1",
                    rusqlite::params![now_str, subject_id],
                )?)
            })
            .await?;
        Ok(changed > 0)
    }

    async fn active_templates(&self) -> Result<Vec<Template>> {
        let raws: Vec<RawTemplate> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TEMPLATE_COLUMNS} FROM templates WHERE active = 1 ORDER BY subject_id"
                ))?;
                let rows = stmt
                    .query_map([], RawTemplate::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        let mut templates = Vec::with_capacity(raws.len());
        for raw in raws {
            let subject_id = raw.subject_id.clone();
            match raw.into_template(self.cipher.as_deref()) {
                Ok(template) => templates.push(template),
                Err(e) => {
                    tracing::warn!(subject_id = %subject_id, error = %e, "skipping unreadable template")
                }
            }
        }
        Ok(templates)
    }

    // ── Registry ──────────────────────────────────────────────────────────────

    async fn find_subject(&self, id_number: &str) -> Result<Option<Subject>> {
        let id_number = id_number.to_string();
        let subject = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id_number, first_name, last_name, rank, active
                         FROM subjects WHERE id_number = ?1",
                        rusqlite::params![id_number],
                        subject_from_row,
                    )
                    .optional()?)
            })
            .await?;
        Ok(subject)
    }

    async fn upsert_subject(&self, subject: &Subject) -> Result<()> {
        let s = subject.clone();
        let now_str = encode_dt(Utc::now());
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO subjects (id_number, first_name, last_name, rank, active, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(id_number) DO UPDATE SET
                       first_name = excluded.first_name,
                       last_name  = excluded.last_name,
                       rank       = excluded.rank,
                       active     = excluded.active",
                    rusqlite::params![s.id_number, s.first_name, s.last_name, s.rank, s.active, now_str],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn find_weapon_by_code(&self, code: &str) -> Result<Option<Weapon>> {
        if let Some(weapon) = self.select_weapon("qr_code", code.to_string()).await? {
            return Ok(Some(weapon));
        }
        self.select_weapon("serial_number", code.to_string()).await
    }

    async fn weapon_assigned_to(&self, subject_id: &str) -> Result<Option<Weapon>> {
        self.select_weapon("assigned_subject_id", subject_id.to_string())
            .await
    }

    async fn add_weapon(&self, weapon: NewWeapon) -> Result<Weapon> {
        let qr_code = weapon
            .qr_code
            .clone()
            .filter(|q| !q.is_empty())
            .unwrap_or_else(|| Weapon::default_qr_code(&weapon.serial_number));
        let serial = weapon.serial_number.clone();
        let model = weapon.model.clone();
        let status = weapon.status.as_str();
        let qr = qr_code.clone();
        let now_str = encode_dt(Utc::now());

        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO weapons (serial_number, model, qr_code, status, location, created_at)
                     VALUES (?1, ?2, ?3, ?4, 'armory', ?5)",
                    rusqlite::params![serial, model, qr, status, now_str],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        Ok(Weapon {
            id,
            serial_number: weapon.serial_number,
            model: weapon.model,
            qr_code,
            status: weapon.status,
            location: Location::Armory,
            assigned_subject_id: None,
        })
    }

    async fn list_weapons(&self) -> Result<Vec<Weapon>> {
        let raws: Vec<RawWeapon> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!("SELECT {WEAPON_COLUMNS} FROM weapons ORDER BY id"))?;
                let rows = stmt
                    .query_map([], RawWeapon::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        raws.into_iter().map(RawWeapon::into_weapon).collect()
    }

    // ── Audit ─────────────────────────────────────────────────────────────────

    async fn log_verification_attempt(&self, attempt: &VerificationAttempt) -> Result<()> {
        let id = encode_uuid(attempt.id);
        let subject_id = attempt.subject_id.clone();
        let timestamp = encode_dt(attempt.timestamp);
        let outcome = attempt.outcome.as_str();
        let confidence = attempt.confidence.map(f64::from);
        let source = attempt.source_address.clone();
        let detail = attempt.error_detail.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO verification_attempts (
                       id, subject_id, timestamp, outcome, confidence, source_address, error_detail
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![id, subject_id, timestamp, outcome, confidence, source, detail],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn log_registration(&self, entry: &RegistrationLog) -> Result<()> {
        let id = encode_uuid(entry.id);
        let subject_id = entry.subject_id.clone();
        let timestamp = encode_dt(entry.timestamp);
        let operator = entry.operator.clone();
        let successful = entry.successful;
        let error_message = entry.error_message.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO registration_logs (
                       id, subject_id, timestamp, operator, successful, error_message
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![id, subject_id, timestamp, operator, successful, error_message],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn recent_attempts(&self, limit: usize) -> Result<Vec<VerificationAttempt>> {
        let limit = limit as i64;
        let raws: Vec<RawAttempt> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM verification_attempts ORDER BY rowid DESC LIMIT ?1"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![limit], RawAttempt::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        raws.into_iter().map(RawAttempt::into_attempt).collect()
    }

    // ── Custody ───────────────────────────────────────────────────────────────

    async fn commit_transaction(&self, commit: TransactionCommit) -> Result<CommitResult> {
        let now = Utc::now();
        let written: Vec<Transaction> = commit
            .records
            .into_iter()
            .map(|r| Transaction {
                id: Uuid::new_v4(),
                subject_id: r.subject_id,
                weapon_id: commit.weapon_id,
                kind: r.kind,
                timestamp: now,
                confidence: r.confidence,
                verifier_identity: commit.verifier_identity.clone(),
                notes: r.notes,
                attempt_id: r.attempt_id,
            })
            .collect();

        let rows: Vec<_> = written
            .iter()
            .map(|t| {
                (
                    encode_uuid(t.id),
                    t.subject_id.clone(),
                    t.kind.as_str(),
                    encode_dt(t.timestamp),
                    t.confidence.map(f64::from),
                    t.verifier_identity.clone(),
                    t.notes.clone(),
                    t.attempt_id.map(encode_uuid),
                )
            })
            .collect();

        let weapon_id = commit.weapon_id;
        let expected = commit.expected;
        let next = commit.next.clone();

        let step = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let current: Option<(String, String, Option<String>)> = tx
                    .query_row(
                        "SELECT location, status, assigned_subject_id FROM weapons WHERE id = ?1",
                        rusqlite::params![weapon_id],
                        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                    )
                    .optional()?;
                let Some((location, status, assigned_subject_id)) = current else {
                    return Ok(CommitStep::Missing);
                };
                if location != expected.location.as_str()
                    || status != expected.status.as_str()
                    || assigned_subject_id != expected.assigned_subject_id
                {
                    return Ok(CommitStep::Conflict {
                        location,
                        status,
                        assigned_subject_id,
                    });
                }

                tx.execute(
                    "UPDATE weapons SET location = ?1, status = ?2, assigned_subject_id = ?3
                     WHERE id = ?4",
                    rusqlite::params![
                        next.location.as_str(),
                        next.status.as_str(),
                        next.assigned_subject_id,
                        weapon_id
                    ],
                )?;

                for (id, subject_id, kind, timestamp, confidence, verifier, notes, attempt_id) in rows {
                    tx.execute(
                        "INSERT INTO transactions (
                           id, subject_id, weapon_id, kind, timestamp,
                           confidence, verifier_identity, notes, attempt_id
                         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        rusqlite::params![
                            id, subject_id, weapon_id, kind, timestamp, confidence, verifier, notes,
                            attempt_id
                        ],
                    )?;
                }

                tx.commit()?;
                Ok(CommitStep::Committed)
            })
            .await?;

        match step {
            CommitStep::Committed => Ok(CommitResult::Committed(written)),
            CommitStep::Missing => Err(Error::WeaponNotFound(weapon_id)),
            CommitStep::Conflict {
                location,
                status,
                assigned_subject_id,
            } => Ok(CommitResult::Conflict {
                current: WeaponState {
                    location: Location::parse(&location)
                        .ok_or_else(|| Error::Corrupt(format!("unknown location {location:?}")))?,
                    status: WeaponStatus::parse(&status)
                        .ok_or_else(|| Error::Corrupt(format!("unknown weapon status {status:?}")))?,
                    assigned_subject_id,
                },
            }),
        }
    }

    async fn recent_transactions(&self, weapon_id: Option<i64>, limit: usize) -> Result<Vec<Transaction>> {
        let limit = limit as i64;
        let raws: Vec<RawTransaction> = self
            .conn
            .call(move |conn| {
                let rows = match weapon_id {
                    Some(w) => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {TRANSACTION_COLUMNS} FROM transactions
                             WHERE weapon_id = ?1 ORDER BY rowid DESC LIMIT ?2"
                        ))?;
                        let rows = stmt
                            .query_map(rusqlite::params![w, limit], RawTransaction::from_row)?
                            .collect::<rusqlite::Result<Vec<_>>>()?;
                        rows
                    }
                    None => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {TRANSACTION_COLUMNS} FROM transactions ORDER BY rowid DESC LIMIT ?1"
                        ))?;
                        let rows = stmt
                            .query_map(rusqlite::params![limit], RawTransaction::from_row)?
                            .collect::<rusqlite::Result<Vec<_>>>()?;
                        rows
                    }
                };
                Ok(rows)
            })
            .await?;
        raws.into_iter().map(RawTransaction::into_transaction).collect()
    }
}
