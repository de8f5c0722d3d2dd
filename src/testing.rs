//! In-memory stand-ins for the stores, used by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::detect::{BaselineBucket, ErrorFilter, Incident, IncidentUpdate, NewIncident};
use crate::ingest::{LogRecord, NewLogRecord};
use crate::lease::{Lease, LockRecord, LockTable};
use crate::storage::{IncidentStore, LogStore, Page, Paged};

#[derive(Default)]
pub struct MemoryLockTable {
    rows: Mutex<HashMap<String, LockRecord>>,
}

#[async_trait]
impl LockTable for MemoryLockTable {
    async fn find(&self, key: &str) -> Result<Option<LockRecord>> {
        Ok(self.rows.lock().unwrap().get(key).cloned())
    }

    async fn create(&self, record: &LockRecord) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&record.id) {
            return Ok(false);
        }
        rows.insert(record.id.clone(), record.clone());
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.rows.lock().unwrap().remove(key);
        Ok(())
    }

    async fn delete_expired(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get(key) {
            Some(row) if row.expiry <= now => {
                rows.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// A lock table whose `find` always answers with a row read earlier, as an
/// instance that looked before another one took over would see it.
pub struct StaleReadTable<T> {
    pub inner: T,
    pub stale: LockRecord,
}

#[async_trait]
impl<T: LockTable> LockTable for StaleReadTable<T> {
    async fn find(&self, _key: &str) -> Result<Option<LockRecord>> {
        Ok(Some(self.stale.clone()))
    }

    async fn create(&self, record: &LockRecord) -> Result<bool> {
        self.inner.create(record).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn delete_expired(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        self.inner.delete_expired(key, now).await
    }
}

/// A lease that is either free or held by "another instance".
#[derive(Default)]
pub struct FakeLease {
    pub held_elsewhere: AtomicBool,
    pub holding: AtomicBool,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
}

impl FakeLease {
    pub fn held_elsewhere() -> Self {
        let lease = Self::default();
        lease.held_elsewhere.store(true, Ordering::SeqCst);
        lease
    }
}

#[async_trait]
impl Lease for FakeLease {
    async fn try_acquire(&self, _key: &str, _now: DateTime<Utc>, _duration: Duration) -> Result<bool> {
        if self.held_elsewhere.load(Ordering::SeqCst) || self.holding.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn release(&self, _key: &str) {
        self.holding.store(false, Ordering::SeqCst);
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scripted log store that records what was asked of it.
#[derive(Default)]
pub struct FakeLogStore {
    pub baseline: Mutex<Vec<u64>>,
    pub current: AtomicU64,
    pub fail_inserts: AtomicBool,
    pub fail_attribution: AtomicBool,
    pub inserted: Mutex<Vec<NewLogRecord>>,
    pub insert_calls: AtomicUsize,
    pub bucket_calls: AtomicUsize,
    pub count_calls: AtomicUsize,
    pub attributed_to: Mutex<Vec<(Uuid, DateTime<Utc>)>>,
    pub sampled_widths: Mutex<Vec<Duration>>,
}

impl FakeLogStore {
    pub fn with_baseline(baseline: &[u64], current: u64) -> Self {
        let store = Self::default();
        *store.baseline.lock().unwrap() = baseline.to_vec();
        store.current.store(current, Ordering::SeqCst);
        store
    }

    pub fn inserted_messages(&self) -> Vec<String> {
        self.inserted.lock().unwrap().iter().map(|r| r.message.clone()).collect()
    }
}

#[async_trait]
impl LogStore for FakeLogStore {
    async fn insert_batch(&self, batch: &[NewLogRecord]) -> Result<usize> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_inserts.load(Ordering::SeqCst) {
            bail!("database is locked");
        }
        self.inserted.lock().unwrap().extend_from_slice(batch);
        Ok(batch.len())
    }

    async fn count_unassigned(&self, _filter: &ErrorFilter, _since: DateTime<Utc>) -> Result<u64> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.current.load(Ordering::SeqCst))
    }

    async fn attribute(
        &self,
        incident_id: Uuid,
        _filter: &ErrorFilter,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        if self.fail_attribution.load(Ordering::SeqCst) {
            bail!("disk I/O error");
        }
        self.attributed_to.lock().unwrap().push((incident_id, since));
        Ok(self.current.load(Ordering::SeqCst))
    }

    async fn error_buckets(
        &self,
        _filter: &ErrorFilter,
        current_start: DateTime<Utc>,
        bucket_width: Duration,
        _bucket_count: usize,
    ) -> Result<Vec<BaselineBucket>> {
        self.bucket_calls.fetch_add(1, Ordering::SeqCst);
        self.sampled_widths.lock().unwrap().push(bucket_width);
        let counts = self.baseline.lock().unwrap().clone();
        let n = counts.len() as i32;
        Ok(counts
            .into_iter()
            .enumerate()
            .map(|(i, error_count)| {
                let start = current_start - bucket_width * (n - i as i32);
                BaselineBucket {
                    start,
                    end: start + bucket_width,
                    error_count,
                }
            })
            .collect())
    }

    async fn logs_for_incident(&self, _incident_id: Uuid, page: Page) -> Result<Paged<LogRecord>> {
        Ok(Paged::new(Vec::new(), 0, page))
    }
}

/// Incident store that keeps created incidents in memory.
#[derive(Default)]
pub struct FakeIncidentStore {
    pub fail_create: AtomicBool,
    pub created: Mutex<Vec<Incident>>,
}

#[async_trait]
impl IncidentStore for FakeIncidentStore {
    async fn create(&self, incident: NewIncident) -> Result<Incident> {
        if self.fail_create.load(Ordering::SeqCst) {
            bail!("incident table unavailable");
        }
        let now = Utc::now();
        let created = Incident {
            id: Uuid::new_v4(),
            title: incident.title,
            severity: incident.severity,
            status: incident.status,
            created_at: now,
            updated_at: now,
        };
        self.created.lock().unwrap().push(created.clone());
        Ok(created)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Incident>> {
        Ok(self.created.lock().unwrap().iter().find(|i| i.id == id).cloned())
    }

    async fn list(&self, page: Page) -> Result<Paged<Incident>> {
        let all = self.created.lock().unwrap().clone();
        let total = all.len() as u64;
        Ok(Paged::new(all, total, page))
    }

    async fn update(&self, id: Uuid, update: IncidentUpdate) -> Result<Option<Incident>> {
        let mut created = self.created.lock().unwrap();
        let Some(incident) = created.iter_mut().find(|i| i.id == id) else {
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
        Ok(Some(incident.clone()))
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut created = self.created.lock().unwrap();
        let before = created.len();
        created.retain(|i| i.id != id);
        Ok(created.len() != before)
    }
}
