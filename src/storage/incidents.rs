//! Incident persistence.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{Page, Paged, SqliteStore};
use crate::detect::{Incident, IncidentUpdate, NewIncident};

/// Incident storage used by the materializer and the incident endpoints.
#[async_trait]
pub trait IncidentStore: Send + Sync {
    async fn create(&self, incident: NewIncident) -> Result<Incident>;

    async fn get(&self, id: Uuid) -> Result<Option<Incident>>;

    /// Newest first.
    async fn list(&self, page: Page) -> Result<Paged<Incident>>;

    /// Apply the fields set in `update`. `None` if the incident does not exist.
    async fn update(&self, id: Uuid, update: IncidentUpdate) -> Result<Option<Incident>>;

    /// Returns `false` if the incident did not exist. Linked logs are detached.
    async fn delete(&self, id: Uuid) -> Result<bool>;
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn incident_from_row(row: &Row<'_>) -> rusqlite::Result<Incident> {
    let id: String = row.get(0)?;
    Ok(Incident {
        id: Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        title: row.get(1)?,
        severity: row.get(2)?,
        status: row.get(3)?,
        created_at: parse_timestamp(4, &row.get::<_, String>(4)?)?,
        updated_at: parse_timestamp(5, &row.get::<_, String>(5)?)?,
    })
}

const SELECT_INCIDENT: &str =
    "SELECT id, title, severity, status, created_at, updated_at FROM incidents";

#[async_trait]
impl IncidentStore for SqliteStore {
    async fn create(&self, incident: NewIncident) -> Result<Incident> {
        self.blocking(move |conn| {
            let now = Utc::now();
            let created = Incident {
                id: Uuid::new_v4(),
                title: incident.title,
                severity: incident.severity,
                status: incident.status,
                created_at: now,
                updated_at: now,
            };
            conn.execute(
                "INSERT INTO incidents (id, title, severity, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    created.id.to_string(),
                    created.title,
                    created.severity,
                    created.status,
                    timestamp(created.created_at),
                    timestamp(created.updated_at),
                ],
            )
            .context("Failed to insert incident")?;
            Ok(created)
        })
        .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Incident>> {
        self.blocking(move |conn| {
            let incident = conn
                .query_row(
                    &format!("{} WHERE id = ?1", SELECT_INCIDENT),
                    params![id.to_string()],
                    incident_from_row,
                )
                .optional()?;
            Ok(incident)
        })
        .await
    }

    async fn list(&self, page: Page) -> Result<Paged<Incident>> {
        self.blocking(move |conn| {
            let total: i64 = conn.query_row("SELECT COUNT(*) FROM incidents", [], |row| row.get(0))?;
            let mut stmt = conn.prepare(&format!(
                "{} ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                SELECT_INCIDENT
            ))?;
            let data = stmt
                .query_map(params![page.limit, page.offset() as i64], incident_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Paged::new(data, total as u64, page))
        })
        .await
    }

    async fn update(&self, id: Uuid, update: IncidentUpdate) -> Result<Option<Incident>> {
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let existing = tx
                .query_row(
                    &format!("{} WHERE id = ?1", SELECT_INCIDENT),
                    params![id.to_string()],
                    incident_from_row,
                )
                .optional()?;
            let Some(mut incident) = existing else {
                return Ok(None);
            };

            if let Some(title) = update.title {
                incident.title = title;
            }
            if let Some(severity) = update.severity {
                incident.severity = severity;
            }
            if let Some(status) = update.status {
                incident.status = status;
            }
            incident.updated_at = Utc::now();

            tx.execute(
                "UPDATE incidents SET title = ?2, severity = ?3, status = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    incident.title,
                    incident.severity,
                    incident.status,
                    timestamp(incident.updated_at),
                ],
            )?;
            tx.commit()?;
            Ok(Some(incident))
        })
        .await
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        self.blocking(move |conn| {
            let changed = conn.execute("DELETE FROM incidents WHERE id = ?1", params![id.to_string()])?;
            Ok(changed > 0)
        })
        .await
    }
}
