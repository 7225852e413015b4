use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::source::{ConsumerRecord, PartitionClaim};
use crate::telemetry::InputMetrics;

/// Downstream sink for forwarded records, called with each record's event id.
pub type RecordCallback = Arc<dyn Fn(&ConsumerRecord, u64) -> anyhow::Result<()> + Send + Sync>;

/// Event ids handed out to forwarded records, shared by every partition.
#[derive(Debug, Default)]
pub struct EventIdCounter(AtomicU64);

impl EventIdCounter {
    /// Wraps to 0 after `u64::MAX`.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// Makes the next id handed out `id + 1`.
    pub fn reset(&self, id: u64) {
        self.0.store(id, Ordering::SeqCst);
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Forwards one claim's records downstream in arrival order.
///
/// Ends when the claim's stream closes or `cancel` fires; neither is an error.
pub async fn forward_claim(
    mut claim: PartitionClaim,
    cancel: CancellationToken,
    callback: Option<RecordCallback>,
    event_ids: &EventIdCounter,
    metrics: &InputMetrics,
) {
    debug!(topic = %claim.topic, partition = claim.partition, "Claim started");

    loop {
        let record = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            record = claim.messages.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };

        let event_id = event_ids.next();
        metrics.record_forwarded();

        let Some(callback) = callback.as_ref() else {
            continue;
        };
        if let Err(e) = callback(&record, event_id) {
            metrics.callback_failed();
            warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                event_id,
                error = %e,
                "Downstream callback failed"
            );
        }
    }

    debug!(topic = %claim.topic, partition = claim.partition, "Claim ended");
}
