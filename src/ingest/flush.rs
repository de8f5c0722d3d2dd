//! Drains the ingest buffer into the log store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::{IngestBuffer, NewLogRecord};
use crate::storage::LogStore;

/// What happens to a batch whose bulk write failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPolicy {
    /// Log the loss and move on. Keeps memory bounded during outages.
    #[default]
    Drop,
    /// Put the batch back in front of the buffer while it stays under `max_buffered`.
    Requeue,
}

pub struct Flusher {
    buffer: Arc<IngestBuffer>,
    store: Arc<dyn LogStore>,
    policy: FlushPolicy,
    max_buffered: usize,
    // Serializes every write path so flushes never overlap.
    gate: Mutex<()>,
}

impl Flusher {
    pub fn new(
        buffer: Arc<IngestBuffer>,
        store: Arc<dyn LogStore>,
        policy: FlushPolicy,
        max_buffered: usize,
    ) -> Self {
        Self {
            buffer,
            store,
            policy,
            max_buffered,
            gate: Mutex::new(()),
        }
    }

    pub fn buffer(&self) -> &Arc<IngestBuffer> {
        &self.buffer
    }

    /// Take the live generation and write it in one batch.
    ///
    /// Returns the number of records persisted; 0 for an empty buffer or a
    /// failed write.
    pub async fn flush(&self) -> usize {
        let _gate = self.gate.lock().await;
        let batch = self.buffer.take();
        self.write_locked(batch).await
    }

    /// Write a generation that was already swapped out of the buffer.
    pub async fn write_batch(&self, batch: Vec<NewLogRecord>) -> usize {
        let _gate = self.gate.lock().await;
        self.write_locked(batch).await
    }

    async fn write_locked(&self, batch: Vec<NewLogRecord>) -> usize {
        if batch.is_empty() {
            return 0;
        }

        match self.store.insert_batch(&batch).await {
            Ok(written) => {
                info!(count = written, "Flushed logs to database");
                written
            }
            Err(e) => {
                self.handle_failure(batch, e);
                0
            }
        }
    }

    fn handle_failure(&self, batch: Vec<NewLogRecord>, e: anyhow::Error) {
        let count = batch.len();
        match self.policy {
            FlushPolicy::Drop => {
                error!(count, error = %format!("{:#}", e), "Failed to flush logs, batch dropped");
            }
            FlushPolicy::Requeue => match self.buffer.requeue(batch, self.max_buffered) {
                Ok(()) => {
                    warn!(count, error = %format!("{:#}", e), "Failed to flush logs, batch requeued");
                }
                Err(batch) => {
                    error!(
                        count = batch.len(),
                        max_buffered = self.max_buffered,
                        error = %format!("{:#}", e),
                        "Failed to flush logs and buffer is full, batch dropped"
                    );
                }
            },
        }
    }
}
