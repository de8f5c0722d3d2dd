use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::detect::{ErrorFilter, Incident, IncidentStatus, NewIncident, Severity};
use crate::storage::{IncidentStore, LogStore};

/// Turns a detected anomaly into an incident and links its logs.
pub struct IncidentMaterializer {
    incidents: Arc<dyn IncidentStore>,
    logs: Arc<dyn LogStore>,
}

impl IncidentMaterializer {
    pub fn new(incidents: Arc<dyn IncidentStore>, logs: Arc<dyn LogStore>) -> Self {
        Self { incidents, logs }
    }

    pub async fn materialize(
        &self,
        title: &str,
        severity: Severity,
        status: IncidentStatus,
    ) -> Result<Incident> {
        self.incidents
            .create(NewIncident {
                title: title.to_string(),
                severity,
                status,
            })
            .await
            .context("Failed to create incident")
    }

    /// Point every unassigned record matching `filter` since `window_start` at the incident.
    pub async fn attribute_logs(
        &self,
        incident_id: Uuid,
        filter: &ErrorFilter,
        window_start: DateTime<Utc>,
    ) -> Result<u64> {
        self.logs
            .attribute(incident_id, filter, window_start)
            .await
            .with_context(|| format!("Failed to attribute logs to incident {}", incident_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeIncidentStore, FakeLogStore};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_materialize_then_attribute() {
        let incidents = Arc::new(FakeIncidentStore::default());
        let logs = Arc::new(FakeLogStore::with_baseline(&[], 12));
        let materializer = IncidentMaterializer::new(incidents.clone(), logs.clone());

        let incident = materializer
            .materialize("Anomaly Detected", Severity::High, IncidentStatus::Open)
            .await
            .unwrap();
        assert_eq!(incident.severity, Severity::High);
        assert_eq!(incidents.created.lock().unwrap().len(), 1);

        let since = Utc::now();
        let linked = materializer
            .attribute_logs(incident.id, &ErrorFilter::default(), since)
            .await
            .unwrap();
        assert_eq!(linked, 12);
        assert_eq!(logs.attributed_to.lock().unwrap()[0], (incident.id, since));
    }

    #[tokio::test]
    async fn test_create_failure_is_reported() {
        let incidents = Arc::new(FakeIncidentStore::default());
        incidents.fail_create.store(true, Ordering::SeqCst);
        let materializer =
            IncidentMaterializer::new(incidents, Arc::new(FakeLogStore::default()));

        let err = materializer
            .materialize("Anomaly Detected", Severity::High, IncidentStatus::Open)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("incident table unavailable"));
    }
}
