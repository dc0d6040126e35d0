//! SQL schema for the armory SQLite store.
//!
//! Executed once at connection startup. `PRAGMA user_version` marks the
//! layout so later migrations can be gated on it.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS subjects (
    id_number   TEXT PRIMARY KEY,
    first_name  TEXT NOT NULL DEFAULT '',
    last_name   TEXT NOT NULL DEFAULT '',
    rank        TEXT NOT NULL DEFAULT '',
    active      INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT NOT NULL
);

-- One row per subject; re-registration overwrites in place.
-- Synced templates may arrive before their subject row, so no FK here.
CREATE TABLE IF NOT EXISTS templates (
    face_id        TEXT PRIMARY KEY,
    subject_id     TEXT NOT NULL UNIQUE,
    embedding      BLOB NOT NULL,   -- little-endian f32s, or AES-GCM ciphertext
    nonce          BLOB,            -- set iff embedding is encrypted
    dim            INTEGER NOT NULL,
    model_version  TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    active         INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS weapons (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    serial_number        TEXT NOT NULL UNIQUE,
    model                TEXT NOT NULL,
    qr_code              TEXT NOT NULL UNIQUE,
    status               TEXT NOT NULL,   -- 'available' | 'assigned' | 'maintenance' | 'decommissioned'
    location             TEXT NOT NULL,   -- 'armory' | 'field'
    assigned_subject_id  TEXT REFERENCES subjects(id_number),
    created_at           TEXT NOT NULL
);

-- Custody log. Append-only: no UPDATE or DELETE is ever issued.
CREATE TABLE IF NOT EXISTS transactions (
    id                 TEXT PRIMARY KEY,
    subject_id         TEXT NOT NULL REFERENCES subjects(id_number),
    weapon_id          INTEGER NOT NULL REFERENCES weapons(id),
    kind               TEXT NOT NULL,   -- 'check_in' | 'check_out' | 'reassign'
    timestamp          TEXT NOT NULL,
    confidence         REAL,
    verifier_identity  TEXT NOT NULL,
    notes              TEXT,
    attempt_id         TEXT
);

-- Unknown subject IDs are logged too, so no FK on subject_id.
CREATE TABLE IF NOT EXISTS verification_attempts (
    id              TEXT PRIMARY KEY,
    subject_id      TEXT,
    timestamp       TEXT NOT NULL,
    outcome         TEXT NOT NULL,   -- 'success' | 'failure' | 'error'
    confidence      REAL,
    source_address  TEXT,
    error_detail    TEXT
);

CREATE TABLE IF NOT EXISTS registration_logs (
    id             TEXT PRIMARY KEY,
    subject_id     TEXT NOT NULL,
    timestamp      TEXT NOT NULL,
    operator       TEXT,
    successful     INTEGER NOT NULL,
    error_message  TEXT
);

CREATE INDEX IF NOT EXISTS transactions_weapon_idx ON transactions(weapon_id);
-- A subject holds at most one weapon. NULLs never collide.
DROP INDEX IF EXISTS weapons_assigned_idx;
CREATE UNIQUE INDEX IF NOT EXISTS weapons_holder_idx ON weapons(assigned_subject_id);
CREATE INDEX IF NOT EXISTS attempts_subject_idx    ON verification_attempts(subject_id);

PRAGMA user_version = 2;
";
