//! TOML configuration for logwarden.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) yields a working service. The file is located via `--config`, then
//! the `LOGWARDEN_CONFIG` environment variable, then the system location.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::detect::{IncidentStatus, Severity};
use crate::ingest::FlushPolicy;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "LOGWARDEN_CONFIG";

/// Standard system location of the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/logwarden/logwarden.toml";

/// Upper bound on `detection.window_secs` (one day).
pub const MAX_WINDOW_SECS: u64 = 86_400;

/// Upper bound on `detection.bucket_count`.
pub const MAX_BUCKET_COUNT: usize = 1_440;

/// Upper bound on `detection.interval_ms` (one day).
pub const MAX_INTERVAL_MS: u64 = 86_400_000;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Resolve the configuration, in order:
    /// 1. `explicit` (the `--config` flag).
    /// 2. The path in `LOGWARDEN_CONFIG`.
    /// 3. `/etc/logwarden/logwarden.toml`, when it exists.
    /// 4. Compiled-in defaults.
    ///
    /// Returns the path the config came from, if any. A path that was asked
    /// for explicitly but cannot be loaded is an error.
    pub fn discover(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(env_path);
            let config = Self::load(&path).with_context(|| format!("{} is set", CONFIG_ENV))?;
            return Ok((config, Some(path)));
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            return Ok((Self::load(system_path)?, Some(system_path.to_path_buf())));
        }

        Ok((Self::default(), None))
    }

    pub fn validate(&self) -> Result<()> {
        if self.ingest.batch_size == 0 {
            bail!("ingest.batch_size must be at least 1");
        }
        if self.ingest.flush_interval_ms == 0 {
            bail!("ingest.flush_interval_ms must be positive");
        }
        if self.ingest.max_buffered < self.ingest.batch_size {
            bail!("ingest.max_buffered must be at least ingest.batch_size");
        }

        let d = &self.detection;
        if d.interval_ms > MAX_INTERVAL_MS {
            bail!("detection.interval_ms must be at most {}", MAX_INTERVAL_MS);
        }
        if d.lease_ms == 0 || d.lease_ms >= d.interval_ms {
            bail!(
                "detection.lease_ms ({}) must be positive and shorter than detection.interval_ms ({})",
                d.lease_ms,
                d.interval_ms
            );
        }
        if d.window_secs == 0 || d.window_secs > MAX_WINDOW_SECS {
            bail!("detection.window_secs must be between 1 and {}", MAX_WINDOW_SECS);
        }
        if d.bucket_count > MAX_BUCKET_COUNT {
            bail!("detection.bucket_count must be at most {}", MAX_BUCKET_COUNT);
        }
        if d.bucket_count < crate::detect::anomaly::MIN_BASELINE_BUCKETS {
            bail!(
                "detection.bucket_count must be at least {}",
                crate::detect::anomaly::MIN_BASELINE_BUCKETS
            );
        }
        if !d.z_threshold.is_finite() || d.z_threshold <= 0.0 {
            bail!("detection.z_threshold must be a positive number");
        }
        if d.lock_key.trim().is_empty() {
            bail!("detection.lock_key must not be empty");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the HTTP API.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/logwarden.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

/// Write buffer and flush settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Records per generation before a flush is triggered early.
    pub batch_size: usize,
    /// Period of the flush timer.
    pub flush_interval_ms: u64,
    /// What to do with a batch whose bulk write failed.
    pub on_flush_failure: FlushPolicy,
    /// Upper bound on buffered records when requeueing failed batches.
    pub max_buffered: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_ms: 5_000,
            on_flush_failure: FlushPolicy::Drop,
            max_buffered: 10_000,
        }
    }
}

impl IngestConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Anomaly detector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub enabled: bool,
    /// Period between detection cycles.
    pub interval_ms: u64,
    /// Lease held per cycle. Must be shorter than `interval_ms`.
    pub lease_ms: u64,
    /// Key of the lock row guarding detection.
    pub lock_key: String,
    /// Width of the current window whose errors are counted, and of each
    /// baseline bucket it is compared against.
    pub window_secs: u64,
    pub bucket_count: usize,
    /// Error counts at or below this never raise an incident.
    pub min_error_count: u64,
    pub z_threshold: f64,
    /// Count FATAL records as errors alongside ERROR.
    pub include_fatal: bool,
    pub severity: Severity,
    pub status: IncidentStatus,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            lease_ms: 9_000,
            lock_key: "detection_service_lock".to_string(),
            window_secs: 60,
            bucket_count: 10,
            min_error_count: 5,
            z_threshold: 3.0,
            include_fatal: false,
            severity: Severity::High,
            status: IncidentStatus::Open,
        }
    }
}

impl DetectionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = Config::default();
        cfg.validate().unwrap();

        assert_eq!(cfg.server.bind, "0.0.0.0:3000");
        assert_eq!(cfg.ingest.batch_size, 100);
        assert_eq!(cfg.ingest.flush_interval(), Duration::from_secs(5));
        assert_eq!(cfg.ingest.on_flush_failure, FlushPolicy::Drop);
        assert_eq!(cfg.detection.interval(), Duration::from_secs(10));
        assert_eq!(cfg.detection.lease_ms, 9_000);
        assert_eq!(cfg.detection.bucket_count, 10);
        assert_eq!(cfg.detection.min_error_count, 5);
        assert_eq!(cfg.detection.z_threshold, 3.0);
        assert!(!cfg.detection.include_fatal);
        assert_eq!(cfg.detection.severity, Severity::High);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[ingest]\nbatch_size = 20\non_flush_failure = \"requeue\"\n\n[detection]\ninclude_fatal = true"
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.ingest.batch_size, 20);
        assert_eq!(cfg.ingest.on_flush_failure, FlushPolicy::Requeue);
        assert_eq!(cfg.ingest.flush_interval_ms, 5_000);
        assert!(cfg.detection.include_fatal);
        assert_eq!(cfg.detection.lock_key, "detection_service_lock");
    }

    #[test]
    fn test_lease_must_be_shorter_than_interval() {
        let mut cfg = Config::default();
        cfg.detection.lease_ms = cfg.detection.interval_ms;
        assert!(cfg.validate().is_err());

        cfg.detection.lease_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bucket_count_has_hard_minimum() {
        let mut cfg = Config::default();
        cfg.detection.bucket_count = 4;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_detection_sizes_are_bounded() {
        let mut cfg = Config::default();
        cfg.detection.window_secs = u64::MAX / 1000;
        assert!(cfg.validate().is_err());
        cfg.detection.window_secs = MAX_WINDOW_SECS;
        cfg.validate().unwrap();

        cfg.detection.bucket_count = MAX_BUCKET_COUNT + 1;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.detection.interval_ms = u64::MAX;
        cfg.detection.lease_ms = u64::MAX - 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_window_sets_bucket_width() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[detection]\nwindow_secs = 300").unwrap();

        let cfg = Config::load(file.path()).unwrap();
        let settings = crate::detect::DetectorSettings::from_config(&cfg.detection).unwrap();
        assert_eq!(settings.window, chrono::Duration::minutes(5));
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let missing = Path::new("/nonexistent/logwarden.toml");
        assert!(Config::discover(Some(missing)).is_err());
    }

    #[test]
    fn test_round_trips_through_toml() {
        let rendered = toml::to_string(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.detection.lock_key, "detection_service_lock");
        assert_eq!(parsed.ingest.max_buffered, 10_000);
    }
}
