//! Error type for `armory-store`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),

    #[error("uuid parse error: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("date/time parse error: {0}")]
    DateParse(String),

    /// A stored value no longer decodes (unknown enum tag, truncated embedding).
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("template encryption error: {0}")]
    Cipher(String),

    #[error("weapon not found: {0}")]
    WeaponNotFound(i64),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
