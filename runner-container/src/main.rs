use anyhow::{Context, Result};
use input_core::config::load_config;
use input_core::position::{self, TopicPartitionOffset};
use input_core::telemetry::init_tracing;
use input_core::{
    ConsumerRecord, KafkaConnector, KafkaInput, PendingPosition, RecordCallback, StatusFlag,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Highest forwarded offset per partition, plus the event id of the latest record.
///
/// Records are handled synchronously in the callback, so everything forwarded
/// counts as processed.
#[derive(Default)]
struct PositionTracker {
    offsets: BTreeMap<(String, i32), i64>,
    last_event_id: u64,
}

impl PositionTracker {
    fn observe(&mut self, record: &ConsumerRecord, event_id: u64) {
        let offset = self
            .offsets
            .entry((record.topic.clone(), record.partition))
            .or_insert(record.offset);
        *offset = (*offset).max(record.offset);
        self.last_event_id = self.last_event_id.max(event_id);
    }

    fn pending(&self) -> Option<PendingPosition> {
        if self.offsets.is_empty() {
            return None;
        }
        let positions: Vec<TopicPartitionOffset> = self
            .offsets
            .iter()
            .map(|((topic, partition), offset)| {
                TopicPartitionOffset::new(topic.as_str(), *partition, *offset)
            })
            .collect();
        Some(PendingPosition {
            event_id: self.last_event_id,
            gtid: position::encode(&positions),
        })
    }
}

/// Long-running Kafka input for container hosts (EKS, ECS, ...).
///
/// Loads the config from the path given as first argument, or from
/// `KAFKA_INPUT_CONFIG`, then consumes until ctrl-c, reporting the processed
/// position back every few seconds so it gets committed.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref()).context("Failed to load input config")?;
    config.validate()?;

    let input = KafkaInput::new(Arc::new(KafkaConnector));
    input.set_option(config.input.clone(), config.kafka.clone())?;

    let tracker = Arc::new(Mutex::new(PositionTracker::default()));
    let sink = Arc::clone(&tracker);
    let callback: RecordCallback = Arc::new(move |record: &ConsumerRecord, event_id: u64| {
        debug!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            event_id,
            bytes = record.payload.as_ref().map_or(0, Vec::len),
            "Record received"
        );
        sink.lock().observe(record, event_id);
        Ok(())
    });
    input.set_callback(callback);

    let (status_tx, mut status_rx) = mpsc::unbounded_channel();
    let mut run = input.start(status_tx)?;
    info!(db_name = %config.input.db_name, "Kafka input started");

    let mut report = tokio::time::interval(REPORT_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                input.stop();
                break;
            }
            _ = &mut run => {
                warn!("Input run loop ended on its own");
                break;
            }
            status = status_rx.recv() => match status {
                Some(status) if status.status == StatusFlag::Closed => {
                    if let Some(e) = &status.error {
                        error!(error = %e, "Input closed");
                    }
                    break;
                }
                Some(status) => debug!(status = ?status.status, "Status update"),
                None => break,
            },
            _ = report.tick() => {
                let pending = tracker.lock().pending();
                if let Some(pending) = pending {
                    input.done_min_position(pending).await;
                }
                info!(metrics = %serde_json::to_string(&input.metrics())?, "Input metrics");
            }
        }
    }

    if !run.is_finished() {
        if let Err(e) = tokio::time::timeout(Duration::from_secs(10), &mut run).await {
            warn!(error = %e, "Run loop did not exit in time");
        }
    }
    input.close();
    info!(metrics = %serde_json::to_string(&input.metrics())?, "Final input metrics");

    match input.last_error() {
        Some(e) if !e.is_retryable() => Err(anyhow::anyhow!("input closed: {e}")),
        _ => Ok(()),
    }
}
