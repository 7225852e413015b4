//! In-memory consumer group used to drive the input without a broker.

#![allow(dead_code)]

use async_trait::async_trait;
use input_core::config::{InputInfo, KafkaOptions};
use input_core::errors::KafkaError;
use input_core::source::{
    ConsumerGroup, ConsumerRecord, GroupConnector, GroupHandler, GroupSession, PartitionClaim,
};
use input_core::PluginStatus;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

pub type Commits = Arc<Mutex<Vec<(String, i32, i64)>>>;

pub fn record(topic: &str, partition: i32, offset: i64) -> ConsumerRecord {
    ConsumerRecord {
        topic: topic.to_string(),
        partition,
        offset,
        key: Some(offset.to_string().into_bytes()),
        payload: Some(format!(r#"{{"id": {offset}}}"#).into_bytes()),
        timestamp: None,
        headers: HashMap::new(),
    }
}

pub fn info(db_name: &str) -> InputInfo {
    InputInfo {
        db_name: db_name.to_string(),
    }
}

pub fn options(topics: &[&str]) -> KafkaOptions {
    KafkaOptions {
        bootstrap_servers: "localhost:9092".to_string(),
        topics: topics.iter().map(|t| t.to_string()).collect(),
        retry_backoff_ms: 10,
        ..Default::default()
    }
}

pub async fn next_status(rx: &mut mpsc::UnboundedReceiver<PluginStatus>) -> PluginStatus {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a status change")
        .expect("status channel closed")
}

pub fn drain_statuses(rx: &mut mpsc::UnboundedReceiver<PluginStatus>) -> Vec<PluginStatus> {
    let mut statuses = Vec::new();
    while let Ok(status) = rx.try_recv() {
        statuses.push(status);
    }
    statuses
}

pub async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub struct MemoryConnector {
    pub group: Arc<MemoryGroup>,
    pub group_ids: Mutex<Vec<String>>,
    stall: bool,
}

impl MemoryConnector {
    pub fn new(group: Arc<MemoryGroup>) -> Arc<Self> {
        Arc::new(Self {
            group,
            group_ids: Mutex::new(Vec::new()),
            stall: false,
        })
    }

    /// A connector whose connect call never completes.
    pub fn stalled() -> Arc<Self> {
        Arc::new(Self {
            group: Arc::new(MemoryGroup::new(&[])),
            group_ids: Mutex::new(Vec::new()),
            stall: true,
        })
    }
}

#[async_trait]
impl GroupConnector for MemoryConnector {
    async fn connect(
        &self,
        _options: &KafkaOptions,
        group_id: &str,
    ) -> Result<Arc<dyn ConsumerGroup>, KafkaError> {
        self.group_ids.lock().push(group_id.to_string());
        if self.stall {
            std::future::pending::<()>().await;
        }
        Ok(Arc::clone(&self.group) as Arc<dyn ConsumerGroup>)
    }
}

pub struct MemoryGroup {
    topics: Result<Vec<String>, String>,
    partitions: Mutex<Vec<(String, i32, Vec<ConsumerRecord>)>>,
    failing_consumes: AtomicUsize,
    idle_returns: AtomicUsize,
    pub commits: Commits,
    pub fail_commits: Arc<AtomicBool>,
    pub consume_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
}

impl MemoryGroup {
    pub fn new(topics: &[&str]) -> Self {
        Self {
            topics: Ok(topics.iter().map(|t| t.to_string()).collect()),
            partitions: Mutex::new(Vec::new()),
            failing_consumes: AtomicUsize::new(0),
            idle_returns: AtomicUsize::new(0),
            commits: Arc::new(Mutex::new(Vec::new())),
            fail_commits: Arc::new(AtomicBool::new(false)),
            consume_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_topic_error(mut self, reason: &str) -> Self {
        self.topics = Err(reason.to_string());
        self
    }

    /// Records delivered on the first session that claims the partition.
    pub fn with_partition(self, topic: &str, partition: i32, offsets: Range<i64>) -> Self {
        let records = offsets.map(|offset| record(topic, partition, offset)).collect();
        self.partitions
            .lock()
            .push((topic.to_string(), partition, records));
        self
    }

    pub fn with_failing_consumes(self, count: usize) -> Self {
        self.failing_consumes.store(count, Ordering::SeqCst);
        self
    }

    /// Sessions that end on their own, as a rebalance would, before records flow.
    pub fn with_idle_returns(self, count: usize) -> Self {
        self.idle_returns.store(count, Ordering::SeqCst);
        self
    }

    pub fn commits(&self) -> Vec<(String, i32, i64)> {
        self.commits.lock().clone()
    }
}

#[async_trait]
impl ConsumerGroup for MemoryGroup {
    async fn topics(&self) -> Result<Vec<String>, KafkaError> {
        self.topics.clone().map_err(|reason| KafkaError::Metadata { reason })
    }

    async fn consume(
        &self,
        cancel: &CancellationToken,
        _topics: &[String],
        handler: Arc<dyn GroupHandler>,
    ) -> Result<(), KafkaError> {
        self.consume_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_consumes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_consumes.store(failing - 1, Ordering::SeqCst);
            return Err(KafkaError::Consumption {
                reason: "broker transport failure".to_string(),
            });
        }

        let session_token = cancel.child_token();
        let session: Arc<dyn GroupSession> = Arc::new(MemorySession {
            commits: Arc::clone(&self.commits),
            fail_commits: Arc::clone(&self.fail_commits),
            marked: Mutex::new(Vec::new()),
            token: session_token.clone(),
        });
        handler.setup(Arc::clone(&session)).await?;

        let idle = self.idle_returns.load(Ordering::SeqCst);
        if idle > 0 {
            self.idle_returns.store(idle - 1, Ordering::SeqCst);
            session_token.cancel();
            return handler.cleanup(session).await;
        }

        let batches = std::mem::take(&mut *self.partitions.lock());
        let mut claims = JoinSet::new();
        for (topic, partition, records) in batches {
            let (tx, messages) = mpsc::channel(records.len().max(1));
            for record in records {
                tx.try_send(record).expect("claim buffer sized to fit");
            }
            let claim = PartitionClaim {
                topic,
                partition,
                messages,
            };
            let handler = Arc::clone(&handler);
            let session = Arc::clone(&session);
            claims.spawn(async move {
                // The claim stays open until the session ends.
                let _open = tx;
                handler.consume_claim(session, claim).await
            });
        }

        session_token.cancelled().await;
        while claims.join_next().await.is_some() {}
        handler.cleanup(session).await
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

struct MemorySession {
    commits: Commits,
    fail_commits: Arc<AtomicBool>,
    marked: Mutex<Vec<(String, i32, i64)>>,
    token: CancellationToken,
}

impl GroupSession for MemorySession {
    fn mark_offset(&self, topic: &str, partition: i32, offset: i64) {
        self.marked.lock().push((topic.to_string(), partition, offset));
    }

    fn commit(&self) -> Result<(), KafkaError> {
        let marked = std::mem::take(&mut *self.marked.lock());
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(KafkaError::OffsetCommit {
                reason: "coordinator not available".to_string(),
            });
        }
        self.commits.lock().extend(marked);
        Ok(())
    }

    fn cancellation(&self) -> CancellationToken {
        self.token.clone()
    }
}
