//! Lease-style mutual exclusion across cooperating instances.
//!
//! A lease is a single row per key carrying an expiry. Acquisition hinges on
//! an exclusive create: when two instances race for a free key, exactly one
//! insert succeeds. A holder that crashes is recovered once its lease
//! expires; the next caller deletes the stale row and creates its own.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use tracing::{debug, warn};

/// One lock row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub id: String,
    pub locked_at: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
}

/// Storage for lock rows.
#[async_trait]
pub trait LockTable: Send + Sync {
    async fn find(&self, key: &str) -> Result<Option<LockRecord>>;

    /// Insert `record`. Returns `false` if a row with the same key already exists.
    async fn create(&self, record: &LockRecord) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete the row for `key` only if its expiry is at or before `now`.
    /// Returns `false` if no expired row was there to delete.
    async fn delete_expired(&self, key: &str, now: DateTime<Utc>) -> Result<bool>;
}

/// The narrow interface the detector depends on.
#[async_trait]
pub trait Lease: Send + Sync {
    /// Returns `true` only if this call took the lease.
    async fn try_acquire(&self, key: &str, now: DateTime<Utc>, duration: Duration) -> Result<bool>;

    /// Drop the lease. Never fails; an unreleased lease expires on its own.
    async fn release(&self, key: &str);
}

/// [`Lease`] implemented over any [`LockTable`].
pub struct LeaseLock<T> {
    table: T,
}

impl<T: LockTable> LeaseLock<T> {
    pub fn new(table: T) -> Self {
        Self { table }
    }
}

#[async_trait]
impl<T: LockTable> Lease for LeaseLock<T> {
    async fn try_acquire(&self, key: &str, now: DateTime<Utc>, duration: Duration) -> Result<bool> {
        if duration <= Duration::zero() {
            bail!("lease duration must be positive, got {}", duration);
        }

        if let Some(existing) = self.table.find(key).await? {
            if existing.expiry > now {
                debug!(key, expiry = %existing.expiry, "lease held by another instance");
                return Ok(false);
            }
            // Stale. Only an expired row may go: another instance may have
            // replaced it with a live lease since our read.
            match self.table.delete_expired(key, now).await {
                Ok(true) => {}
                Ok(false) => debug!(key, "expired lease already replaced"),
                Err(e) => debug!(key, error = %e, "failed to delete expired lease"),
            }
        }

        let record = LockRecord {
            id: key.to_string(),
            locked_at: now,
            expiry: now + duration,
        };
        let created = self.table.create(&record).await?;
        if !created {
            debug!(key, "lost lease acquisition race");
        }
        Ok(created)
    }

    async fn release(&self, key: &str) {
        if let Err(e) = self.table.delete(key).await {
            warn!(key, error = %e, "failed to release lease, it will expire on its own");
        }
    }
}

/// Run `body` while holding the lease on `key`.
///
/// Returns `Ok(None)` without running `body` when the lease is held
/// elsewhere. The lease is released on every exit path, including an error
/// or a panic inside `body`.
pub async fn with_lease<L, F, Fut, R>(
    lease: &L,
    key: &str,
    now: DateTime<Utc>,
    duration: Duration,
    body: F,
) -> Result<Option<R>>
where
    L: Lease + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    if !lease.try_acquire(key, now, duration).await? {
        return Ok(None);
    }

    let outcome = AssertUnwindSafe(body()).catch_unwind().await;
    lease.release(key).await;

    match outcome {
        Ok(result) => result.map(Some),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
