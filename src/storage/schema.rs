//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS incidents (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            severity TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS logs (
            id INTEGER PRIMARY KEY,
            service_id TEXT NOT NULL,
            level TEXT NOT NULL,
            message TEXT NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            incident_id TEXT REFERENCES incidents(id) ON DELETE SET NULL,
            received_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS cron_locks (
            id TEXT PRIMARY KEY,
            locked_at INTEGER NOT NULL,
            expiry INTEGER NOT NULL,
            CHECK (expiry > locked_at)
        );

        CREATE INDEX IF NOT EXISTS idx_logs_level_ts ON logs(level, timestamp_ms);
        CREATE INDEX IF NOT EXISTS idx_logs_incident ON logs(incident_id);
        CREATE INDEX IF NOT EXISTS idx_incidents_created ON incidents(created_at);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        for table in ["logs", "incidents", "cron_locks"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "{} should start empty", table);
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error

        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(versions, 1);
    }

    #[test]
    fn test_lock_expiry_must_follow_locked_at() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let res = conn.execute(
            "INSERT INTO cron_locks (id, locked_at, expiry) VALUES ('k', 10, 10)",
            [],
        );
        assert!(res.is_err());
    }
}
