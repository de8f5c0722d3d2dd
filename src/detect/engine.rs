use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::DetectionConfig;
use crate::detect::anomaly::{DetectionRule, TimeSeries, Verdict, MIN_BASELINE_BUCKETS};
use crate::detect::incident::IncidentMaterializer;
use crate::detect::{ErrorFilter, Incident, IncidentStatus, Severity};
use crate::lease::{with_lease, Lease};
use crate::storage::LogStore;

/// Resolved detector parameters.
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub lock_key: String,
    pub lease: Duration,
    /// Width of the current window and of every baseline bucket.
    pub window: Duration,
    pub bucket_count: usize,
    pub rule: DetectionRule,
    pub filter: ErrorFilter,
    pub severity: Severity,
    pub status: IncidentStatus,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            lock_key: "detection_service_lock".to_string(),
            lease: Duration::seconds(9),
            window: Duration::minutes(1),
            bucket_count: 10,
            rule: DetectionRule::default(),
            filter: ErrorFilter::default(),
            severity: Severity::High,
            status: IncidentStatus::Open,
        }
    }
}

impl DetectorSettings {
    pub fn from_config(config: &DetectionConfig) -> Result<Self> {
        let millis = |ms: u64| -> Result<Duration> {
            let ms = i64::try_from(ms).context("duration out of range")?;
            Ok(Duration::milliseconds(ms))
        };
        Ok(Self {
            lock_key: config.lock_key.clone(),
            lease: millis(config.lease_ms)?,
            window: millis(config.window_secs.saturating_mul(1000))?,
            bucket_count: config.bucket_count,
            rule: DetectionRule {
                min_error_count: config.min_error_count,
                z_threshold: config.z_threshold,
            },
            filter: if config.include_fatal {
                ErrorFilter::errors_and_fatal()
            } else {
                ErrorFilter::errors_only()
            },
            severity: config.severity,
            status: config.status,
        })
    }
}

/// How one detection cycle ended.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Another instance holds the lease.
    Skipped,
    /// Not enough history to judge against.
    InsufficientBaseline { buckets: usize },
    NoAnomaly {
        current: u64,
        mean: f64,
        z_score: Option<f64>,
    },
    Anomaly {
        incident: Incident,
        current: u64,
        mean: f64,
        z_score: f64,
        attributed: u64,
    },
}

/// Periodic error-spike detector, guarded by a lease so only one instance runs a cycle at a time.
pub struct AnomalyDetector {
    lease: Arc<dyn Lease>,
    logs: Arc<dyn LogStore>,
    materializer: IncidentMaterializer,
    settings: DetectorSettings,
}

impl AnomalyDetector {
    pub fn new(
        lease: Arc<dyn Lease>,
        logs: Arc<dyn LogStore>,
        materializer: IncidentMaterializer,
        settings: DetectorSettings,
    ) -> Self {
        Self {
            lease,
            logs,
            materializer,
            settings,
        }
    }

    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    /// Run one cycle as of `now`. The lease is released before this returns.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleOutcome> {
        let outcome = with_lease(
            self.lease.as_ref(),
            &self.settings.lock_key,
            now,
            self.settings.lease,
            || self.evaluate(now),
        )
        .await?;

        match outcome {
            Some(outcome) => Ok(outcome),
            None => {
                debug!("Job locked by another instance. Skipping.");
                Ok(CycleOutcome::Skipped)
            }
        }
    }

    async fn evaluate(&self, now: DateTime<Utc>) -> Result<CycleOutcome> {
        let s = &self.settings;
        let window_start = now
            .checked_sub_signed(s.window)
            .context("Detection window reaches before the representable time range")?;

        let buckets = self
            .logs
            .error_buckets(&s.filter, window_start, s.window, s.bucket_count)
            .await
            .context("Failed to sample baseline")?;
        if buckets.len() < MIN_BASELINE_BUCKETS {
            debug!(
                buckets = buckets.len(),
                needed = MIN_BASELINE_BUCKETS,
                "Not enough baseline history, skipping detection"
            );
            return Ok(CycleOutcome::InsufficientBaseline {
                buckets: buckets.len(),
            });
        }
        let baseline = TimeSeries::from_buckets(&buckets);

        let current = self
            .logs
            .count_unassigned(&s.filter, window_start)
            .await
            .context("Failed to count recent errors")?;
        let mean = baseline.mean();
        debug!(
            current,
            mean,
            std_dev = baseline.std_dev(),
            "Checking for incidents"
        );

        let z_score = match s.rule.evaluate(current, &baseline)? {
            Verdict::Anomaly { z_score } => z_score,
            verdict => {
                return Ok(CycleOutcome::NoAnomaly {
                    current,
                    mean,
                    z_score: verdict.z_score(),
                })
            }
        };

        warn!(current, mean, z_score, "Error rate anomaly detected. Creating incident...");
        let title = format!(
            "Anomaly Detected: {} errors in last {} (baseline mean {:.1}, z-score {:.1})",
            current,
            describe_window(s.window),
            mean,
            z_score
        );
        let incident = self
            .materializer
            .materialize(&title, s.severity, s.status)
            .await
            .map_err(|e| {
                error!(error = %format!("{:#}", e), "Failed to create incident");
                e
            })?;
        info!(incident_id = %incident.id, "Incident created");

        let attributed = match self
            .materializer
            .attribute_logs(incident.id, &s.filter, window_start)
            .await
        {
            Ok(n) => {
                info!(incident_id = %incident.id, count = n, "Attributed logs to incident");
                n
            }
            Err(e) => {
                error!(incident_id = %incident.id, error = %format!("{:#}", e), "Failed to attribute logs");
                0
            }
        };

        Ok(CycleOutcome::Anomaly {
            incident,
            current,
            mean,
            z_score,
            attributed,
        })
    }
}

fn describe_window(window: Duration) -> String {
    match window.num_seconds() {
        60 => "minute".to_string(),
        s if s % 60 == 0 => format!("{} minutes", s / 60),
        s => format!("{}s", s),
    }
}
