use rusqlite::Connection;

pub const QUOTAS_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS quotas (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scope_type TEXT NOT NULL,
    scope_id TEXT NOT NULL,
    name TEXT NOT NULL,
    limit_value INTEGER NOT NULL DEFAULT -1,
    usage INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(scope_type, scope_id, name)
);
"#;

pub const QUOTAS_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_quotas_scope ON quotas(scope_type, scope_id);
"#;

pub fn init_database(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(QUOTAS_TABLE_SCHEMA)?;
    conn.execute_batch(QUOTAS_INDEXES)?;
    Ok(())
}
