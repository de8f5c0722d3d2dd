use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::detect::DetectError;

/// Fewest baseline buckets a z-score is computed over.
pub const MIN_BASELINE_BUCKETS: usize = 5;

/// Z-score reported when the baseline is perfectly flat and the current value exceeds it.
pub const FLAT_BASELINE_Z_SCORE: f64 = 999.0;

/// Error volume observed in one historical time bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BaselineBucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub error_count: u64,
}

/// A simple time series for statistical analysis.
pub struct TimeSeries {
    values: Vec<f64>,
}

impl TimeSeries {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn from_buckets(buckets: &[BaselineBucket]) -> Self {
        Self::new(buckets.iter().map(|b| b.error_count as f64).collect())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Population variance.
    pub fn variance(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let sum_sq_diff: f64 = self
            .values
            .iter()
            .map(|&x| (x - mean).powi(2))
            .sum();
        sum_sq_diff / self.values.len() as f64
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Calculate the Z-score of a value relative to this series.
    /// Z = (value - mean) / std_dev
    pub fn z_score(&self, value: f64) -> Result<f64, DetectError> {
        if self.values.len() < MIN_BASELINE_BUCKETS {
            return Err(DetectError::InsufficientBaseline {
                needed: MIN_BASELINE_BUCKETS,
                have: self.values.len(),
            });
        }
        let std = self.std_dev();
        if std == 0.0 {
            // A flat history has no tolerance band: any excess is extreme.
            if value > self.mean() {
                return Ok(FLAT_BASELINE_Z_SCORE);
            }
            return Ok(0.0);
        }
        Ok((value - self.mean()) / std)
    }
}

/// Outcome of judging the current error count against a baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Too few errors to be worth flagging, whatever the statistics say.
    BelowNoiseFloor,
    Normal { z_score: f64 },
    Anomaly { z_score: f64 },
}

impl Verdict {
    pub fn is_anomaly(&self) -> bool {
        matches!(self, Verdict::Anomaly { .. })
    }

    pub fn z_score(&self) -> Option<f64> {
        match self {
            Verdict::BelowNoiseFloor => None,
            Verdict::Normal { z_score } | Verdict::Anomaly { z_score } => Some(*z_score),
        }
    }
}

/// Z-score decision rule with a noise floor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionRule {
    /// Counts at or below this are never anomalous.
    pub min_error_count: u64,
    pub z_threshold: f64,
}

impl Default for DetectionRule {
    fn default() -> Self {
        Self {
            min_error_count: 5,
            z_threshold: 3.0,
        }
    }
}

impl DetectionRule {
    pub fn evaluate(&self, current: u64, baseline: &TimeSeries) -> Result<Verdict, DetectError> {
        let z_score = baseline.z_score(current as f64)?;
        if current <= self.min_error_count {
            return Ok(Verdict::BelowNoiseFloor);
        }
        if z_score > self.z_threshold {
            Ok(Verdict::Anomaly { z_score })
        } else {
            Ok(Verdict::Normal { z_score })
        }
    }
}
