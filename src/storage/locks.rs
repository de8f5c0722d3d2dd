//! Lock rows for [`LeaseLock`](crate::lease::LeaseLock).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, ErrorCode, OptionalExtension};

use super::{from_millis, to_millis, SqliteStore};
use crate::lease::{LockRecord, LockTable};

#[async_trait]
impl LockTable for SqliteStore {
    async fn find(&self, key: &str) -> Result<Option<LockRecord>> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let record = conn
                .query_row(
                    "SELECT id, locked_at, expiry FROM cron_locks WHERE id = ?1",
                    params![key],
                    |row| {
                        Ok(LockRecord {
                            id: row.get(0)?,
                            locked_at: from_millis(row.get(1)?),
                            expiry: from_millis(row.get(2)?),
                        })
                    },
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn create(&self, record: &LockRecord) -> Result<bool> {
        let record = record.clone();
        self.blocking(move |conn| {
            // Plain INSERT: the primary key makes this the exclusive step.
            let inserted = conn.execute(
                "INSERT INTO cron_locks (id, locked_at, expiry) VALUES (?1, ?2, ?3)",
                params![record.id, to_millis(record.locked_at), to_millis(record.expiry)],
            );
            match inserted {
                Ok(_) => Ok(true),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation
                        && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
                {
                    Ok(false)
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.blocking(move |conn| {
            conn.execute("DELETE FROM cron_locks WHERE id = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn delete_expired(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM cron_locks WHERE id = ?1 AND expiry <= ?2",
                params![key, to_millis(now)],
            )?;
            Ok(deleted > 0)
        })
        .await
    }
}
