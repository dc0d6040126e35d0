//! SQLite backend for the armory store.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated
//! thread without blocking the async runtime. Custody commits run inside a
//! single SQLite transaction.

mod encode;
mod schema;
mod store;

pub mod cipher;
pub mod error;

pub use cipher::TemplateCipher;
pub use error::{Error, Result};
pub use store::{SqliteStore, StoreCounts, TemplateSummary};
