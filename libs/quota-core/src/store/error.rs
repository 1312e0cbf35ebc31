use std::io;

use thiserror::Error;

use crate::scope::EntityRef;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),
    #[error("quota {name} not found for scope {scope}")]
    QuotaNotFound { scope: EntityRef, name: String },
    #[error("store lock poisoned: {0}")]
    Poisoned(String),
    #[error("io error: {0}")]
    IoError(#[from] io::Error),
}
