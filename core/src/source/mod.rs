pub mod kafka;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::KafkaOptions;
use crate::errors::KafkaError;
use crate::position::TopicPartitionOffset;

/// A record received from one partition of a claimed topic.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    /// raw payload of message e.g. kafka message body
    pub payload: Option<Vec<u8>>,
    pub timestamp: Option<DateTime<Utc>>,
    pub headers: HashMap<String, Vec<u8>>,
}

impl ConsumerRecord {
    /// Position of this record, in the form the host reports back once processed.
    pub fn position(&self) -> TopicPartitionOffset {
        TopicPartitionOffset::new(self.topic.clone(), self.partition, self.offset)
    }
}

/// One partition assigned to this consumer for the current group generation.
///
/// The claim ends when `messages` yields `None`.
pub struct PartitionClaim {
    pub topic: String,
    pub partition: i32,
    pub messages: mpsc::Receiver<ConsumerRecord>,
}

/// Creates consumer-group handles. Called once per session attempt.
#[async_trait]
pub trait GroupConnector: Send + Sync {
    async fn connect(
        &self,
        options: &KafkaOptions,
        group_id: &str,
    ) -> Result<Arc<dyn ConsumerGroup>, KafkaError>;
}

/// A joined consumer group.
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Lists the consumable topics on the cluster, internal topics excluded.
    async fn topics(&self) -> Result<Vec<String>, KafkaError>;

    /// Runs one group session over `topics`.
    ///
    /// Blocks until the session ends: `cancel` fired, the assignment was
    /// revoked, or an error occurred. Returning `Ok` does not mean the group
    /// is done; the caller is expected to call `consume` again.
    ///
    /// Implementations must call `handler.setup` before the first claim,
    /// run `handler.consume_claim` concurrently per claimed partition, cancel
    /// the session token once the session ends, and call `handler.cleanup`
    /// after every claim has returned.
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: Arc<dyn GroupHandler>,
    ) -> Result<(), KafkaError>;

    /// Leaves the group. Safe to call more than once.
    fn close(&self);
}

/// Per-session handle for offset bookkeeping.
#[cfg_attr(test, mockall::automock)]
pub trait GroupSession: Send + Sync {
    /// Records `offset` as the next offset to read for the partition.
    fn mark_offset(&self, topic: &str, partition: i32, offset: i64);

    /// Synchronously commits every marked offset.
    fn commit(&self) -> Result<(), KafkaError>;

    /// Fires when the session ends.
    fn cancellation(&self) -> CancellationToken;
}

/// Callbacks the consumer group invokes during a session, possibly from
/// several tasks at once.
#[async_trait]
pub trait GroupHandler: Send + Sync {
    async fn setup(&self, session: Arc<dyn GroupSession>) -> Result<(), KafkaError>;

    async fn cleanup(&self, session: Arc<dyn GroupSession>) -> Result<(), KafkaError>;

    async fn consume_claim(
        &self,
        session: Arc<dyn GroupSession>,
        claim: PartitionClaim,
    ) -> Result<(), KafkaError>;
}
