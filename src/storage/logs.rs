//! Log persistence: bulk insert, unassigned-error counts, attribution and
//! baseline bucket sampling.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Row};
use uuid::Uuid;

use super::{from_millis, to_millis, Page, Paged, SqliteStore};
use crate::detect::{BaselineBucket, ErrorFilter};
use crate::ingest::{LogRecord, NewLogRecord};

/// Durable log storage as seen by ingestion and detection.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Persist `batch` in one write. Returns the number of rows inserted.
    async fn insert_batch(&self, batch: &[NewLogRecord]) -> Result<usize>;

    /// Count records matching `filter` with `timestamp >= since` and no incident.
    async fn count_unassigned(&self, filter: &ErrorFilter, since: DateTime<Utc>) -> Result<u64>;

    /// Point every record [`count_unassigned`](Self::count_unassigned) would
    /// count at `incident_id`. Returns the number of rows updated.
    async fn attribute(
        &self,
        incident_id: Uuid,
        filter: &ErrorFilter,
        since: DateTime<Utc>,
    ) -> Result<u64>;

    /// Error counts for up to `bucket_count` buckets of `bucket_width`
    /// tiling the time right before `current_start`, oldest first.
    ///
    /// Buckets that end before the first persisted record are not history
    /// and are left out.
    async fn error_buckets(
        &self,
        filter: &ErrorFilter,
        current_start: DateTime<Utc>,
        bucket_width: Duration,
        bucket_count: usize,
    ) -> Result<Vec<BaselineBucket>>;

    async fn logs_for_incident(&self, incident_id: Uuid, page: Page) -> Result<Paged<LogRecord>>;
}

/// `level IN (...) AND timestamp_ms >= ? AND incident_id IS NULL`, with its parameters.
fn unassigned_predicate(filter: &ErrorFilter, since: DateTime<Utc>) -> (String, Vec<Value>) {
    let (levels, mut values) = level_clause(filter);
    values.push(Value::Integer(to_millis(since)));
    (
        format!("{} AND timestamp_ms >= ? AND incident_id IS NULL", levels),
        values,
    )
}

fn level_clause(filter: &ErrorFilter) -> (String, Vec<Value>) {
    let placeholders = vec!["?"; filter.levels().len()].join(", ");
    let values = filter
        .levels()
        .iter()
        .map(|l| Value::Text(l.as_str().to_string()))
        .collect();
    (format!("level IN ({})", placeholders), values)
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<LogRecord> {
    let metadata: String = row.get(5)?;
    let incident_id: Option<String> = row.get(6)?;
    Ok(LogRecord {
        id: row.get(0)?,
        service_id: row.get(1)?,
        level: row.get(2)?,
        message: row.get(3)?,
        timestamp: from_millis(row.get(4)?),
        metadata: serde_json::from_str(&metadata)
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default())),
        incident_id: incident_id.and_then(|id| Uuid::parse_str(&id).ok()),
    })
}

#[async_trait]
impl LogStore for SqliteStore {
    async fn insert_batch(&self, batch: &[NewLogRecord]) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let batch = batch.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO logs (service_id, level, message, timestamp_ms, metadata_json)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for record in &batch {
                    stmt.execute(params![
                        record.service_id,
                        record.level,
                        record.message,
                        to_millis(record.timestamp),
                        serde_json::to_string(&record.metadata)?,
                    ])?;
                }
            }
            tx.commit().context("Failed to commit log batch")?;
            Ok(batch.len())
        })
        .await
    }

    async fn count_unassigned(&self, filter: &ErrorFilter, since: DateTime<Utc>) -> Result<u64> {
        let (predicate, values) = unassigned_predicate(filter, since);
        self.blocking(move |conn| {
            let sql = format!("SELECT COUNT(*) FROM logs WHERE {}", predicate);
            let count: i64 = conn.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    async fn attribute(
        &self,
        incident_id: Uuid,
        filter: &ErrorFilter,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        let (predicate, mut values) = unassigned_predicate(filter, since);
        values.insert(0, Value::Text(incident_id.to_string()));
        self.blocking(move |conn| {
            let sql = format!("UPDATE logs SET incident_id = ? WHERE {}", predicate);
            let changed = conn
                .execute(&sql, params_from_iter(values.iter()))
                .context("Failed to attribute logs")?;
            Ok(changed as u64)
        })
        .await
    }

    async fn error_buckets(
        &self,
        filter: &ErrorFilter,
        current_start: DateTime<Utc>,
        bucket_width: Duration,
        bucket_count: usize,
    ) -> Result<Vec<BaselineBucket>> {
        let width_ms = bucket_width.num_milliseconds();
        if width_ms <= 0 || bucket_count == 0 {
            return Ok(Vec::new());
        }
        let end_ms = to_millis(current_start);
        let start_ms = end_ms - width_ms * bucket_count as i64;
        let (levels, mut values) = level_clause(filter);

        self.blocking(move |conn| {
            let first_seen: Option<i64> =
                conn.query_row("SELECT MIN(timestamp_ms) FROM logs", [], |row| row.get(0))?;
            let Some(first_seen) = first_seen else {
                return Ok(Vec::new());
            };

            let sql = format!(
                "SELECT (timestamp_ms - ?) / ? AS bucket, COUNT(*) FROM logs
                 WHERE {} AND timestamp_ms >= ? AND timestamp_ms < ?
                 GROUP BY bucket",
                levels
            );
            let mut params = vec![Value::Integer(start_ms), Value::Integer(width_ms)];
            params.append(&mut values);
            params.push(Value::Integer(start_ms));
            params.push(Value::Integer(end_ms));

            let mut stmt = conn.prepare(&sql)?;
            let counts = stmt
                .query_map(params_from_iter(params.iter()), |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<Result<HashMap<_, _>, _>>()?;

            let buckets = (0..bucket_count as i64)
                .map(|k| (start_ms + k * width_ms, start_ms + (k + 1) * width_ms, k))
                .filter(|&(_, end, _)| end > first_seen)
                .map(|(start, end, k)| BaselineBucket {
                    start: from_millis(start),
                    end: from_millis(end),
                    error_count: counts.get(&k).copied().unwrap_or(0) as u64,
                })
                .collect();
            Ok(buckets)
        })
        .await
    }

    async fn logs_for_incident(&self, incident_id: Uuid, page: Page) -> Result<Paged<LogRecord>> {
        let id = incident_id.to_string();
        self.blocking(move |conn| {
            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM logs WHERE incident_id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            let mut stmt = conn.prepare(
                "SELECT id, service_id, level, message, timestamp_ms, metadata_json, incident_id
                 FROM logs WHERE incident_id = ?1
                 ORDER BY timestamp_ms DESC, id DESC
                 LIMIT ?2 OFFSET ?3",
            )?;
            let data = stmt
                .query_map(
                    params![id, page.limit, page.offset() as i64],
                    log_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Paged::new(data, total as u64, page))
        })
        .await
    }
}
