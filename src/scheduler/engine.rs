use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::detect::{AnomalyDetector, CycleOutcome};
use crate::ingest::buffer::Handoff;
use crate::ingest::Flusher;

/// Flush loop: drains the buffer every `period`, writes size-triggered
/// batches as they arrive, and performs the final flush on shutdown.
///
/// All writes happen on this one task, so flushes never overlap.
pub async fn run_flush_loop(
    flusher: Arc<Flusher>,
    mut handoff: Handoff,
    period: Duration,
    shutdown: CancellationToken,
) {
    info!(period_ms = period.as_millis() as u64, "Flush scheduler started");

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; nothing is buffered yet.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(batch) = handoff.recv() => {
                flusher.write_batch(batch).await;
            }
            _ = interval.tick() => {
                flusher.flush().await;
            }
        }
    }

    // Stop the timer before the final drain so no tick can race it.
    drop(interval);
    handoff.close();
    let mut written = 0;
    while let Ok(batch) = handoff.try_recv() {
        written += flusher.write_batch(batch).await;
    }
    written += flusher.flush().await;
    info!(count = written, "Flush scheduler stopped after final flush");
}

/// Detection loop: one cycle every `period`, awaited in-line so cycles
/// never overlap within a process.
pub async fn run_detection_loop(
    detector: Arc<AnomalyDetector>,
    period: Duration,
    shutdown: CancellationToken,
) {
    info!(period_ms = period.as_millis() as u64, "Detection scheduler started");

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        match detector.run_cycle(Utc::now()).await {
            Ok(CycleOutcome::Anomaly { incident, current, z_score, attributed, .. }) => {
                warn!(
                    incident_id = %incident.id,
                    current,
                    z_score,
                    attributed,
                    "Anomaly cycle finished"
                );
            }
            Ok(outcome) => debug!(?outcome, "Detection cycle finished"),
            Err(e) => error!("Detection cycle failed: {:#}", e),
        }
    }

    info!("Detection scheduler stopped");
}
