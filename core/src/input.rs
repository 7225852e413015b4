use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::claim::{EventIdCounter, RecordCallback, forward_claim};
use crate::commit::{OffsetCommitQueue, PendingPosition};
use crate::config::{DEFAULT_MAX_CONSECUTIVE_COMMIT_FAILURES, InputInfo, KafkaOptions};
use crate::errors::{ConfigError, InputError, KafkaError};
use crate::source::{ConsumerGroup, GroupConnector, GroupHandler, GroupSession, PartitionClaim};
use crate::telemetry::{InputMetrics, MetricsSnapshot};

/// Prefix of the consumer group derived from the data-source name.
pub const DEFAULT_GROUP_ID_PREFIX: &str = "kafka_input_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFlag {
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Terminal.
    Closed,
}

/// A status transition as reported to the host.
#[derive(Debug, Clone)]
pub struct PluginStatus {
    pub status: StatusFlag,
    pub error: Option<Arc<InputError>>,
}

/// Keeps ASCII letters, digits and `_`.
pub fn sanitize_source_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// The configured group id, or one derived from the source name so the same
/// source always rejoins the same group.
pub fn consumer_group_id(configured: Option<&str>, db_name: &str) -> String {
    match configured {
        Some(group_id) if !group_id.is_empty() => group_id.to_string(),
        _ => format!("{DEFAULT_GROUP_ID_PREFIX}{}", sanitize_source_name(db_name)),
    }
}

fn validate_options(info: &InputInfo, options: &KafkaOptions) -> Result<(), ConfigError> {
    options.validate()?;
    if options.group_id.is_none() && sanitize_source_name(&info.db_name).is_empty() {
        return Err(ConfigError::Invalid {
            message: format!(
                "cannot derive a consumer group from source name '{}'",
                info.db_name
            ),
        });
    }
    Ok(())
}

#[derive(Default)]
struct LifecycleState {
    status: Option<StatusFlag>,
    error: Option<Arc<InputError>>,
    status_tx: Option<mpsc::UnboundedSender<PluginStatus>>,
    info: InputInfo,
    options: Option<KafkaOptions>,
    root: Option<CancellationToken>,
    group: Option<Arc<dyn ConsumerGroup>>,
}

enum SessionEnd {
    /// Session torn down; the run loop may rejoin.
    Retry,
    /// Input closed; the run loop must exit.
    Finished,
}

struct Shared {
    connector: Arc<dyn GroupConnector>,
    state: Mutex<LifecycleState>,
    callback: RwLock<Option<RecordCallback>>,
    event_ids: EventIdCounter,
    queue: RwLock<Arc<OffsetCommitQueue>>,
    commit_task: Mutex<Option<JoinHandle<Result<(), KafkaError>>>>,
    commit_failure: Mutex<Option<KafkaError>>,
    metrics: Arc<InputMetrics>,
}

/// Kafka input for the change-data pipeline.
///
/// The host configures it with [`set_option`](Self::set_option), registers a
/// record callback, and calls [`start`](Self::start). Records are forwarded
/// with an event id; the host reports back the lowest position it has fully
/// processed through [`done_min_position`](Self::done_min_position), and
/// those positions are committed to the broker in the background.
pub struct KafkaInput {
    shared: Arc<Shared>,
}

impl KafkaInput {
    pub fn new(connector: Arc<dyn GroupConnector>) -> Self {
        let metrics = Arc::new(InputMetrics::default());
        let defaults = KafkaOptions::default();
        let queue = OffsetCommitQueue::new(
            defaults.commit_queue_capacity,
            defaults.commit_submit_timeout(),
            Arc::clone(&metrics),
        );

        Self {
            shared: Arc::new(Shared {
                connector,
                state: Mutex::new(LifecycleState::default()),
                callback: RwLock::new(None),
                event_ids: EventIdCounter::default(),
                queue: RwLock::new(Arc::new(queue)),
                commit_task: Mutex::new(None),
                commit_failure: Mutex::new(None),
                metrics,
            }),
        }
    }

    /// Stores the source description and options. They are validated here and
    /// again by [`start`](Self::start); new options apply from the next session.
    pub fn set_option(&self, info: InputInfo, options: KafkaOptions) -> Result<(), ConfigError> {
        let validated = validate_options(&info, &options);

        let mut state = self.shared.state.lock();
        if state.root.is_none() {
            *self.shared.queue.write() = Arc::new(OffsetCommitQueue::new(
                options.commit_queue_capacity,
                options.commit_submit_timeout(),
                Arc::clone(&self.shared.metrics),
            ));
        }
        state.info = info;
        state.options = Some(options);
        validated
    }

    /// Starts consuming in the background and returns the run loop's handle.
    ///
    /// Status transitions are sent to `status_tx`. Must be called from within
    /// a Tokio runtime.
    pub fn start(
        &self,
        status_tx: mpsc::UnboundedSender<PluginStatus>,
    ) -> Result<JoinHandle<()>, Arc<InputError>> {
        let root = CancellationToken::new();

        let validated = {
            let mut state = self.shared.state.lock();
            if state.status == Some(StatusFlag::Closed) {
                return Err(Arc::new(InputError::Closed));
            }
            if state.root.as_ref().is_some_and(|root| !root.is_cancelled()) {
                return Err(Arc::new(InputError::AlreadyStarted));
            }
            state.status_tx = Some(status_tx);
            state.error = None;

            let validated = match &state.options {
                Some(options) => validate_options(&state.info, options),
                None => Err(ConfigError::NotConfigured),
            };
            if validated.is_ok() {
                state.root = Some(root.clone());
            }
            validated
        };

        if let Err(e) = validated {
            let e = Arc::new(InputError::Config(e));
            error!(error = %e, "Invalid input configuration");
            self.shared.state.lock().error = Some(Arc::clone(&e));
            self.shared.set_status(StatusFlag::Stopped);
            self.shared.close();
            return Err(e);
        }

        self.shared.set_status(StatusFlag::Starting);
        let shared = Arc::clone(&self.shared);
        Ok(tokio::spawn(shared.run(root)))
    }

    /// Cancels the running session and leaves the consumer group.
    pub fn stop(&self) {
        self.shared.set_status(StatusFlag::Stopping);
        let (root, group) = {
            let mut state = self.shared.state.lock();
            (state.root.take(), state.group.take())
        };
        if let Some(root) = root {
            root.cancel();
        }
        if let Some(group) = group {
            group.close();
        }
    }

    pub fn close(&self) {
        self.shared.close();
    }

    pub fn kill(&self) {
        self.stop();
        self.close();
    }

    pub fn set_callback(&self, callback: RecordCallback) {
        *self.shared.callback.write() = Some(callback);
    }

    /// Resets the event id counter; the next forwarded record gets `event_id + 1`.
    pub fn set_event_id(&self, event_id: u64) {
        self.shared.event_ids.reset(event_id);
    }

    /// Reports the lowest position the host has fully processed.
    ///
    /// Never fails; waits at most the configured submit timeout.
    pub async fn done_min_position(&self, position: PendingPosition) {
        let queue = Arc::clone(&self.shared.queue.read());
        queue.submit(Some(position)).await;
    }

    pub fn status(&self) -> Option<StatusFlag> {
        self.shared.state.lock().status
    }

    pub fn last_error(&self) -> Option<Arc<InputError>> {
        self.shared.state.lock().error.clone()
    }

    pub fn event_id(&self) -> u64 {
        self.shared.event_ids.current()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl Shared {
    fn set_status(&self, status: StatusFlag) {
        let mut state = self.state.lock();
        if state.status == Some(StatusFlag::Closed) {
            return;
        }
        state.status = Some(status);

        match &state.error {
            Some(e) => info!(?status, error = %e, "Input status changed"),
            None => info!(?status, "Input status changed"),
        }
        if let Some(status_tx) = &state.status_tx {
            let _ = status_tx.send(PluginStatus {
                status,
                error: state.error.clone(),
            });
        }
    }

    fn set_error(&self, error: Option<InputError>) {
        self.state.lock().error = error.map(Arc::new);
    }

    /// Terminal. A running session is cancelled and its group left first.
    fn close(&self) {
        let (root, group) = {
            let mut state = self.state.lock();
            (state.root.take(), state.group.take())
        };
        self.set_status(StatusFlag::Closed);
        if let Some(root) = root {
            root.cancel();
        }
        if let Some(group) = group {
            group.close();
        }
        self.queue.read().try_shutdown();
    }

    fn snapshot_options(&self) -> (InputInfo, KafkaOptions) {
        let state = self.state.lock();
        (state.info.clone(), state.options.clone().unwrap_or_default())
    }

    fn max_commit_failures(&self) -> u32 {
        self.state
            .lock()
            .options
            .as_ref()
            .map_or(DEFAULT_MAX_CONSECUTIVE_COMMIT_FAILURES, |options| {
                options.max_consecutive_commit_failures
            })
    }

    fn release_group(&self, group: &Arc<dyn ConsumerGroup>) {
        group.close();
        self.state.lock().group = None;
    }

    async fn run(self: Arc<Self>, root: CancellationToken) {
        loop {
            if let SessionEnd::Finished = self.run_session(&root).await {
                return;
            }
            if root.is_cancelled() {
                break;
            }

            let backoff = self.snapshot_options().1.retry_backoff();
            tokio::select! {
                _ = root.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }

            self.set_error(None);
            self.set_status(StatusFlag::Starting);
        }

        // stop() may have reported STOPPING after the last session already ended.
        let status = self.state.lock().status;
        if !matches!(status, Some(StatusFlag::Stopped | StatusFlag::Closed)) {
            self.set_status(StatusFlag::Stopped);
        }
        info!("Input run loop exited");
    }

    async fn run_session(self: &Arc<Self>, root: &CancellationToken) -> SessionEnd {
        let (info, options) = self.snapshot_options();
        let group_id = consumer_group_id(options.group_id.as_deref(), &info.db_name);

        let connected = tokio::select! {
            biased;
            _ = root.cancelled() => None,
            connected = self.connector.connect(&options, &group_id) => Some(connected),
        };
        let group = match connected {
            None => {
                self.set_status(StatusFlag::Stopped);
                return SessionEnd::Retry;
            }
            Some(Err(e)) => {
                warn!(%group_id, error = %e, "Failed to join consumer group, will retry");
                self.set_status(StatusFlag::Stopped);
                return SessionEnd::Retry;
            }
            Some(Ok(group)) => group,
        };
        self.state.lock().group = Some(Arc::clone(&group));
        info!(%group_id, "Joined consumer group");

        let discovered = tokio::select! {
            biased;
            _ = root.cancelled() => None,
            topics = discover_topics(&options, group.as_ref()) => Some(topics),
        };
        // Discovery failures are never retried.
        let topics = match discovered {
            Some(Ok(topics)) => topics,
            Some(Err(e)) => {
                error!(error = %e, "Topic discovery failed, closing input");
                self.release_group(&group);
                self.set_error(Some(e));
                self.set_status(StatusFlag::Stopped);
                self.close();
                return SessionEnd::Finished;
            }
            None => {
                self.release_group(&group);
                self.set_status(StatusFlag::Stopped);
                return SessionEnd::Retry;
            }
        };
        if root.is_cancelled() {
            self.release_group(&group);
            self.set_status(StatusFlag::Stopped);
            return SessionEnd::Retry;
        }

        self.set_status(StatusFlag::Running);
        info!(?topics, "Consuming topics");

        let handler = Arc::clone(self) as Arc<dyn GroupHandler>;
        // The consume call also returns without error on its own from time to
        // time (rebalances, client housekeeping); that just means rejoin.
        let outcome = loop {
            let result = group.consume(root, &topics, Arc::clone(&handler)).await;
            if let Some(e) = self.commit_failure.lock().take() {
                break Err(InputError::Kafka(e));
            }
            match result {
                Err(e) => break Err(InputError::Kafka(e)),
                Ok(()) if root.is_cancelled() => break Ok(()),
                Ok(()) => debug!("Consume returned without error, rejoining"),
            }
        };
        self.release_group(&group);

        match outcome {
            Ok(()) => info!("Consumer group session stopped"),
            Err(e @ InputError::Kafka(KafkaError::OffsetCommit { .. })) => {
                warn!(error = %e, "Consumer group session ended on commit failures");
                self.set_error(Some(e));
            }
            Err(e) => warn!(error = %e, "Consumer group session ended, will rejoin"),
        }
        self.set_status(StatusFlag::Stopped);
        SessionEnd::Retry
    }
}

async fn discover_topics(
    options: &KafkaOptions,
    group: &dyn ConsumerGroup,
) -> Result<Vec<String>, InputError> {
    if !options.topics.is_empty() {
        return Ok(options.topics.clone());
    }

    let topics = group.topics().await.map_err(|e| InputError::Discovery {
        reason: e.to_string(),
    })?;
    if topics.is_empty() {
        return Err(InputError::NoTopics);
    }
    Ok(topics)
}

#[async_trait]
impl GroupHandler for Shared {
    async fn setup(&self, session: Arc<dyn GroupSession>) -> Result<(), KafkaError> {
        self.metrics.session_started();
        let max_failures = self.max_commit_failures();
        let commit_loop = self.queue.read().commit_loop(max_failures);
        let handle = tokio::spawn(commit_loop.run(session));
        let previous = self.commit_task.lock().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    async fn cleanup(&self, _session: Arc<dyn GroupSession>) -> Result<(), KafkaError> {
        let handle = self.commit_task.lock().take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => *self.commit_failure.lock() = Some(e),
                Err(e) => warn!(error = %e, "Commit loop task failed"),
            }
        }
        Ok(())
    }

    async fn consume_claim(
        &self,
        session: Arc<dyn GroupSession>,
        claim: PartitionClaim,
    ) -> Result<(), KafkaError> {
        let callback = self.callback.read().clone();
        forward_claim(
            claim,
            session.cancellation(),
            callback,
            &self.event_ids,
            &self.metrics,
        )
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_id_derived_from_source_name() {
        assert_eq!(consumer_group_id(None, "my db-1"), "kafka_input_mydb1");
        assert_eq!(consumer_group_id(None, "orders_v2"), "kafka_input_orders_v2");
        assert_eq!(consumer_group_id(None, "订单 db"), "kafka_input_db");
    }

    #[test]
    fn test_configured_group_id_wins() {
        assert_eq!(consumer_group_id(Some("cdc-orders"), "my db-1"), "cdc-orders");
        assert_eq!(consumer_group_id(Some(""), "orders"), "kafka_input_orders");
    }

    #[test]
    fn test_validate_options_needs_group_source() {
        let options = KafkaOptions {
            bootstrap_servers: "localhost:9092".to_string(),
            ..Default::default()
        };
        let info = InputInfo {
            db_name: "--- !!".to_string(),
        };
        assert!(matches!(
            validate_options(&info, &options),
            Err(ConfigError::Invalid { .. })
        ));

        let options = KafkaOptions {
            group_id: Some("explicit".to_string()),
            ..options
        };
        assert!(validate_options(&info, &options).is_ok());
    }
}
