//! Log ingestion -- record types, the write buffer, and the flusher.

pub mod buffer;
pub mod flush;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use self::buffer::IngestBuffer;
pub use self::flush::{FlushPolicy, Flusher};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("service_id must not be empty")]
    MissingServiceId,
    #[error("metadata must be a JSON object")]
    MetadataNotObject,
}

#[derive(Debug, Error)]
#[error("unknown log level '{0}'")]
pub struct ParseLevelError(String);

/// Severity of a log record, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            "FATAL" => Ok(LogLevel::Fatal),
            other => Err(ParseLevelError(other.to_string())),
        }
    }
}

impl ToSql for LogLevel {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for LogLevel {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// A log record accepted by ingestion but not yet persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLogRecord {
    pub service_id: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// A persisted log record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub id: i64,
    pub service_id: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
    pub incident_id: Option<Uuid>,
}

/// Wire shape of a single log submission.
#[derive(Debug, Clone, Deserialize)]
pub struct LogSubmission {
    pub service_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl LogSubmission {
    pub fn into_record(self) -> Result<NewLogRecord, IngestError> {
        if self.service_id.trim().is_empty() {
            return Err(IngestError::MissingServiceId);
        }
        let metadata = match self.metadata {
            None | Some(serde_json::Value::Null) => serde_json::Value::Object(Default::default()),
            Some(value @ serde_json::Value::Object(_)) => value,
            Some(_) => return Err(IngestError::MetadataNotObject),
        };
        Ok(NewLogRecord {
            service_id: self.service_id,
            level: self.level,
            message: self.message,
            timestamp: self.timestamp,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_ordered() {
        assert!(LogLevel::Fatal > LogLevel::Error);
        assert!(LogLevel::Error > LogLevel::Warn);
        assert!(LogLevel::Debug < LogLevel::Info);
    }

    #[test]
    fn test_level_round_trips_through_str() {
        for level in [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error, LogLevel::Fatal] {
            assert_eq!(level.as_str().parse::<LogLevel>().unwrap(), level);
        }
        assert!("error".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_submission_parses_wire_format() {
        let submission: LogSubmission = serde_json::from_str(
            r#"{
                "service_id": "payment-service",
                "timestamp": "2023-10-27T10:00:00Z",
                "level": "ERROR",
                "message": "Payment gateway timeout",
                "metadata": { "transaction_id": "tx_123", "amount": 50 }
            }"#,
        )
        .unwrap();

        let record = submission.into_record().unwrap();
        assert_eq!(record.level, LogLevel::Error);
        assert_eq!(record.metadata["transaction_id"], "tx_123");
        assert_eq!(record.timestamp.to_rfc3339(), "2023-10-27T10:00:00+00:00");
    }

    #[test]
    fn test_submission_defaults_metadata() {
        let submission: LogSubmission = serde_json::from_str(
            r#"{"service_id":"api","timestamp":"2023-10-27T10:00:00Z","level":"INFO","message":"ok"}"#,
        )
        .unwrap();
        let record = submission.into_record().unwrap();
        assert!(record.metadata.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_submission_rejects_blank_service() {
        let submission: LogSubmission = serde_json::from_str(
            r#"{"service_id":"  ","timestamp":"2023-10-27T10:00:00Z","level":"INFO","message":"ok"}"#,
        )
        .unwrap();
        assert!(matches!(submission.into_record(), Err(IngestError::MissingServiceId)));
    }

    #[test]
    fn test_submission_rejects_unknown_level() {
        let parsed = serde_json::from_str::<LogSubmission>(
            r#"{"service_id":"api","timestamp":"2023-10-27T10:00:00Z","level":"TRACE","message":"ok"}"#,
        );
        assert!(parsed.is_err());
    }
}
