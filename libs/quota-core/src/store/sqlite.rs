use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::schema::init_database;
use super::{exceeds_after, next_usage, QuotaStore, StorageError, QUOTA_DB_FILENAME};
use crate::record::{QuotaRecord, UsageUpdate, UNLIMITED};
use crate::scope::EntityRef;

/// Durable store backed by a single SQLite database.
///
/// Increments run in `IMMEDIATE` transactions so the write lock is held from
/// the read of the current usage until the commit-or-rollback decision.
pub struct SqliteQuotaStore {
    conn: Mutex<Connection>,
}

impl SqliteQuotaStore {
    pub fn new(data_dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join(QUOTA_DB_FILENAME))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        init_database(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        init_database(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Poisoned("sqlite connection".into()))
    }

    /// Read, decide and write inside one `IMMEDIATE` transaction. The new
    /// value is computed in Rust so an overflowing delta saturates instead of
    /// turning the column into a REAL.
    fn increment(
        &self,
        scope: &EntityRef,
        name: &str,
        delta: i64,
        validate: bool,
        floored: bool,
    ) -> Result<UsageUpdate, StorageError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(record) = select_record(&tx, scope, name)? else {
            return Err(StorageError::QuotaNotFound {
                scope: scope.clone(),
                name: name.to_string(),
            });
        };
        let old_usage = record.usage;
        let new_usage = next_usage(old_usage, delta, floored);

        if exceeds_after(new_usage, record.limit, delta, validate) {
            tx.rollback()?;
            return Ok(UsageUpdate::Rejected {
                usage: old_usage,
                limit: record.limit,
            });
        }

        tx.execute(
            r#"
            UPDATE quotas
            SET usage = ?4,
                updated_at = ?5
            WHERE scope_type = ?1 AND scope_id = ?2 AND name = ?3
            "#,
            params![
                scope.entity_type,
                scope.id,
                name,
                new_usage,
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.commit()?;

        Ok(UsageUpdate::Applied {
            old_usage,
            new_usage,
            limit: record.limit,
        })
    }
}

fn select_record(
    conn: &Connection,
    scope: &EntityRef,
    name: &str,
) -> Result<Option<QuotaRecord>, StorageError> {
    let record = conn
        .query_row(
            r#"
            SELECT limit_value, usage
            FROM quotas
            WHERE scope_type = ?1 AND scope_id = ?2 AND name = ?3
            "#,
            params![scope.entity_type, scope.id, name],
            |row| {
                Ok(QuotaRecord::new(
                    scope.clone(),
                    name,
                    row.get(0)?,
                    row.get(1)?,
                ))
            },
        )
        .optional()?;
    Ok(record)
}

fn select_scope(conn: &Connection, scope: &EntityRef) -> Result<Vec<QuotaRecord>, StorageError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT name, limit_value, usage
        FROM quotas
        WHERE scope_type = ?1 AND scope_id = ?2
        ORDER BY name
        "#,
    )?;

    let rows = stmt.query_map(params![scope.entity_type, scope.id], |row| {
        Ok(QuotaRecord::new(
            scope.clone(),
            row.get::<_, String>(0)?,
            row.get(1)?,
            row.get(2)?,
        ))
    })?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

impl QuotaStore for SqliteQuotaStore {
    fn get(&self, scope: &EntityRef, name: &str) -> Result<Option<QuotaRecord>, StorageError> {
        let conn = self.connection()?;
        select_record(&conn, scope, name)
    }

    fn get_or_create(
        &self,
        scope: &EntityRef,
        name: &str,
        limit: i64,
        usage: i64,
    ) -> Result<(QuotaRecord, bool), StorageError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now().to_rfc3339();

        let inserted = tx.execute(
            r#"
            INSERT INTO quotas (scope_type, scope_id, name, limit_value, usage, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(scope_type, scope_id, name) DO NOTHING
            "#,
            params![scope.entity_type, scope.id, name, limit, usage, now],
        )?;
        let record = select_record(&tx, scope, name)?.ok_or_else(|| {
            StorageError::QuotaNotFound {
                scope: scope.clone(),
                name: name.to_string(),
            }
        })?;
        tx.commit()?;

        Ok((record, inserted > 0))
    }

    fn set_limit(
        &self,
        scope: &EntityRef,
        name: &str,
        limit: i64,
    ) -> Result<Option<i64>, StorageError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let previous = select_record(&tx, scope, name)?.map(|record| record.limit);
        let now = Utc::now().to_rfc3339();

        tx.execute(
            r#"
            INSERT INTO quotas (scope_type, scope_id, name, limit_value, usage, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)
            ON CONFLICT(scope_type, scope_id, name) DO UPDATE SET
                limit_value = excluded.limit_value,
                updated_at = excluded.updated_at
            "#,
            params![scope.entity_type, scope.id, name, limit, now],
        )?;
        tx.commit()?;

        Ok(previous)
    }

    fn set_usage(
        &self,
        scope: &EntityRef,
        name: &str,
        usage: i64,
    ) -> Result<Option<i64>, StorageError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let previous = select_record(&tx, scope, name)?.map(|record| record.usage);
        let now = Utc::now().to_rfc3339();

        tx.execute(
            r#"
            INSERT INTO quotas (scope_type, scope_id, name, limit_value, usage, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(scope_type, scope_id, name) DO UPDATE SET
                usage = excluded.usage,
                updated_at = excluded.updated_at
            "#,
            params![scope.entity_type, scope.id, name, UNLIMITED, usage, now],
        )?;
        tx.commit()?;

        Ok(previous)
    }

    fn add_usage(
        &self,
        scope: &EntityRef,
        name: &str,
        delta: i64,
        validate: bool,
    ) -> Result<UsageUpdate, StorageError> {
        self.increment(scope, name, delta, validate, true)
    }

    fn shift_usage(
        &self,
        scope: &EntityRef,
        name: &str,
        delta: i64,
    ) -> Result<UsageUpdate, StorageError> {
        self.increment(scope, name, delta, false, false)
    }

    fn list_scope(&self, scope: &EntityRef) -> Result<Vec<QuotaRecord>, StorageError> {
        let conn = self.connection()?;
        select_scope(&conn, scope)
    }

    fn delete_scope(&self, scope: &EntityRef) -> Result<Vec<QuotaRecord>, StorageError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let records = select_scope(&tx, scope)?;
        tx.execute(
            "DELETE FROM quotas WHERE scope_type = ?1 AND scope_id = ?2",
            params![scope.entity_type, scope.id],
        )?;
        tx.commit()?;
        Ok(records)
    }
}
