//! In-memory write buffer for incoming log records.
//!
//! Submissions append to the live generation under a short critical section.
//! When a generation reaches the batch size it is swapped out in the same
//! critical section and handed to the flusher over a channel, so the write
//! itself never happens under the buffer lock.

use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::NewLogRecord;

/// Receiving end of the size-triggered hand-off.
pub type Handoff = mpsc::UnboundedReceiver<Vec<NewLogRecord>>;

pub struct IngestBuffer {
    pending: Mutex<Vec<NewLogRecord>>,
    batch_size: usize,
    handoff: mpsc::UnboundedSender<Vec<NewLogRecord>>,
}

impl IngestBuffer {
    /// Create a buffer that hands off a full generation every `batch_size` records.
    pub fn new(batch_size: usize) -> (Self, Handoff) {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffer = Self {
            pending: Mutex::new(Vec::with_capacity(batch_size)),
            batch_size: batch_size.max(1),
            handoff: tx,
        };
        (buffer, rx)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Append a record. Never blocks on storage.
    pub fn submit(&self, record: NewLogRecord) {
        let full = {
            let mut pending = self.lock();
            pending.push(record);
            if pending.len() >= self.batch_size {
                Some(std::mem::replace(
                    &mut *pending,
                    Vec::with_capacity(self.batch_size),
                ))
            } else {
                None
            }
        };

        if let Some(batch) = full {
            debug!(count = batch.len(), "batch size reached, handing off to flusher");
            if let Err(mpsc::error::SendError(batch)) = self.handoff.send(batch) {
                // Flusher is gone; keep the records for whoever drains next.
                warn!(count = batch.len(), "flusher not running, keeping batch in buffer");
                let _ = self.requeue(batch, usize::MAX);
            }
        }
    }

    /// Swap out the live generation, leaving an empty buffer behind.
    pub fn take(&self) -> Vec<NewLogRecord> {
        std::mem::take(&mut *self.lock())
    }

    /// Put a failed batch back in front of the live generation.
    ///
    /// Refused (and the batch returned) when the result would exceed `limit` records.
    pub fn requeue(
        &self,
        mut batch: Vec<NewLogRecord>,
        limit: usize,
    ) -> Result<(), Vec<NewLogRecord>> {
        let mut pending = self.lock();
        if batch.len().saturating_add(pending.len()) > limit {
            return Err(batch);
        }
        batch.append(&mut pending);
        *pending = batch;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<NewLogRecord>> {
        // A panic while holding the lock cannot leave the Vec half-written.
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
