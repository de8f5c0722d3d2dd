//! Anomaly detection and incident materialization.

pub mod anomaly;
pub mod engine;
pub mod incident;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ingest::LogLevel;

pub use self::anomaly::{BaselineBucket, DetectionRule, TimeSeries, Verdict};
pub use self::engine::{AnomalyDetector, CycleOutcome, DetectorSettings};
pub use self::incident::IncidentMaterializer;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("insufficient baseline data: need {needed} buckets, have {have}")]
    InsufficientBaseline { needed: usize, have: usize },
    #[error("unknown {kind} '{value}'")]
    UnknownVariant { kind: &'static str, value: String },
}

/// Severity levels for incidents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Lifecycle of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IncidentStatus {
    #[default]
    Open,
    Acknowledged,
    Resolved,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "OPEN",
            IncidentStatus::Acknowledged => "ACKNOWLEDGED",
            IncidentStatus::Resolved => "RESOLVED",
        }
    }
}

impl FromStr for Severity {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(DetectError::UnknownVariant {
                kind: "severity",
                value: other.to_string(),
            }),
        }
    }
}

impl FromStr for IncidentStatus {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(IncidentStatus::Open),
            "ACKNOWLEDGED" => Ok(IncidentStatus::Acknowledged),
            "RESOLVED" => Ok(IncidentStatus::Resolved),
            other => Err(DetectError::UnknownVariant {
                kind: "incident status",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl ToSql for Severity {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Severity {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str()?.parse().map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for IncidentStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for IncidentStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str()?.parse().map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// An operational incident, either detected or created by hand.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Incident {
    pub id: uuid::Uuid,
    pub title: String,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewIncident {
    pub title: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub status: IncidentStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncidentUpdate {
    pub title: Option<String>,
    pub severity: Option<Severity>,
    pub status: Option<IncidentStatus>,
}

/// The set of log levels that count as errors for detection.
///
/// Baseline sampling, the current count and attribution all take the same
/// filter so the counted set and the attributed set always agree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFilter {
    levels: Vec<LogLevel>,
}

impl ErrorFilter {
    /// Only `ERROR` records.
    pub fn errors_only() -> Self {
        Self { levels: vec![LogLevel::Error] }
    }

    /// `ERROR` and `FATAL` records.
    pub fn errors_and_fatal() -> Self {
        Self { levels: vec![LogLevel::Error, LogLevel::Fatal] }
    }

    pub fn levels(&self) -> &[LogLevel] {
        &self.levels
    }

    pub fn matches(&self, level: LogLevel) -> bool {
        self.levels.contains(&level)
    }
}

impl Default for ErrorFilter {
    fn default() -> Self {
        Self::errors_only()
    }
}
