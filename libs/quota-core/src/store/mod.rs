//! Persistence of quota records.
//!
//! Caller increments go through [`QuotaStore::add_usage`], which must apply
//! `usage = max(usage + delta, 0)` atomically and, when validating, decide
//! and roll back inside the same critical section. Aggregate adjustments go
//! through [`QuotaStore::shift_usage`], which applies the delta exactly.

pub mod error;
pub mod memory;
pub mod schema;
pub mod sqlite;

pub use error::StorageError;
pub use memory::MemoryQuotaStore;
pub use sqlite::SqliteQuotaStore;

use crate::record::{QuotaRecord, UsageUpdate};
use crate::scope::EntityRef;

pub const QUOTA_DB_FILENAME: &str = "quotas.db";

pub trait QuotaStore: Send + Sync {
    fn get(&self, scope: &EntityRef, name: &str) -> Result<Option<QuotaRecord>, StorageError>;

    /// Inserts `(limit, usage)` unless a record already exists. Returns the
    /// stored record and whether it was inserted.
    fn get_or_create(
        &self,
        scope: &EntityRef,
        name: &str,
        limit: i64,
        usage: i64,
    ) -> Result<(QuotaRecord, bool), StorageError>;

    /// Upserts the limit and returns the previous one, `None` when inserted.
    fn set_limit(
        &self,
        scope: &EntityRef,
        name: &str,
        limit: i64,
    ) -> Result<Option<i64>, StorageError>;

    /// Upserts the usage and returns the previous one, `None` when inserted.
    fn set_usage(
        &self,
        scope: &EntityRef,
        name: &str,
        usage: i64,
    ) -> Result<Option<i64>, StorageError>;

    /// Atomic increment floored at zero. With `validate`, a positive delta
    /// that leaves usage above a finite limit is rolled back and reported as
    /// [`UsageUpdate::Rejected`].
    fn add_usage(
        &self,
        scope: &EntityRef,
        name: &str,
        delta: i64,
        validate: bool,
    ) -> Result<UsageUpdate, StorageError>;

    /// Atomic, unvalidated increment without the zero floor. Aggregated
    /// limits may legitimately sum below zero through unlimited children.
    fn shift_usage(
        &self,
        scope: &EntityRef,
        name: &str,
        delta: i64,
    ) -> Result<UsageUpdate, StorageError>;

    /// Records of a scope ordered by name.
    fn list_scope(&self, scope: &EntityRef) -> Result<Vec<QuotaRecord>, StorageError>;

    fn delete_scope(&self, scope: &EntityRef) -> Result<Vec<QuotaRecord>, StorageError>;
}

pub(crate) fn exceeds_after(new_usage: i64, limit: i64, delta: i64, validate: bool) -> bool {
    validate && delta > 0 && limit != crate::record::UNLIMITED && new_usage > limit
}

/// Usage after applying `delta`; saturates instead of overflowing.
pub(crate) fn next_usage(old_usage: i64, delta: i64, floored: bool) -> i64 {
    let usage = old_usage.saturating_add(delta);
    if floored {
        usage.max(0)
    } else {
        usage
    }
}
