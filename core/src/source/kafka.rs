use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use parking_lot::Mutex;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::KafkaOptions;
use crate::errors::KafkaError;
use crate::source::{
    ConsumerGroup, ConsumerRecord, GroupConnector, GroupHandler, GroupSession, PartitionClaim,
};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects consumer groups through librdkafka.
#[derive(Debug, Default, Clone, Copy)]
pub struct KafkaConnector;

#[async_trait]
impl GroupConnector for KafkaConnector {
    async fn connect(
        &self,
        options: &KafkaOptions,
        group_id: &str,
    ) -> Result<Arc<dyn ConsumerGroup>, KafkaError> {
        let group = KafkaConsumerGroup::new(options, group_id)?;
        Ok(Arc::new(group))
    }
}

pub fn client_config(options: &KafkaOptions, group_id: &str) -> ClientConfig {
    let mut client_config = ClientConfig::new();

    client_config
        .set("bootstrap.servers", &options.bootstrap_servers)
        .set("group.id", group_id)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", options.auto_offset_reset());

    if let Some(client_id) = &options.client_id {
        client_config.set("client.id", client_id);
    }

    if let Some(timeout) = options.session_timeout_ms {
        client_config.set("session.timeout.ms", timeout.to_string());
    }

    if let Some(heartbeat) = options.heartbeat_interval_ms {
        client_config.set("heartbeat.interval.ms", heartbeat.to_string());
    }

    if let Some(security_protocol) = &options.security_protocol {
        client_config.set("security.protocol", security_protocol);
    }

    if let Some(sasl_mechanisms) = &options.sasl_mechanisms {
        client_config.set("sasl.mechanisms", sasl_mechanisms);
    }

    if let Some(sasl_username) = &options.sasl_username {
        client_config.set("sasl.username", sasl_username);
    }

    if let Some(sasl_password) = &options.sasl_password {
        client_config.set("sasl.password", sasl_password);
    }

    if let Some(ssl_ca_location) = &options.ssl_ca_location {
        client_config.set("ssl.ca.location", ssl_ca_location);
    }

    client_config
}

/// Ends the running group session when librdkafka revokes our assignment.
struct GroupContext {
    revocations: mpsc::UnboundedSender<usize>,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                let count = tpl.count();
                info!(partitions_revoked = count, "Kafka rebalance: partitions revoked");
                if count > 0 {
                    let _ = self.revocations.send(count);
                }
            }
            Rebalance::Assign(tpl) => {
                info!(
                    partitions_assigned = tpl.count(),
                    "Kafka rebalance: partitions assigned"
                );
            }
            Rebalance::Error(e) => {
                warn!(error = %e, "Kafka rebalance error");
            }
        }
    }
}

type GroupConsumer = StreamConsumer<GroupContext>;

pub struct KafkaConsumerGroup {
    consumer: Arc<GroupConsumer>,
    revocations: AsyncMutex<mpsc::UnboundedReceiver<usize>>,
    subscribed: Mutex<Vec<String>>,
    claim_buffer_size: usize,
}

impl KafkaConsumerGroup {
    pub fn new(options: &KafkaOptions, group_id: &str) -> Result<Self, KafkaError> {
        let (revocations_tx, revocations_rx) = mpsc::unbounded_channel();
        let context = GroupContext {
            revocations: revocations_tx,
        };

        let consumer: GroupConsumer = client_config(options, group_id)
            .create_with_context(context)
            .map_err(|e| KafkaError::ConsumerCreation {
                group_id: group_id.to_string(),
                reason: e.to_string(),
            })?;

        info!(group_id, "Created Kafka consumer group client");

        Ok(Self {
            consumer: Arc::new(consumer),
            revocations: AsyncMutex::new(revocations_rx),
            subscribed: Mutex::new(Vec::new()),
            claim_buffer_size: options.claim_buffer_size,
        })
    }

    fn ensure_subscribed(&self, topics: &[String]) -> Result<(), KafkaError> {
        let mut subscribed = self.subscribed.lock();
        if subscribed.as_slice() == topics {
            return Ok(());
        }

        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&names)
            .map_err(|e| KafkaError::Subscription {
                topics: topics.to_vec(),
                reason: e.to_string(),
            })?;
        *subscribed = topics.to_vec();

        info!(?topics, "Subscribed to Kafka topics");
        Ok(())
    }

    fn open_claim(
        &self,
        tasks: &mut JoinSet<Result<(), KafkaError>>,
        handler: &Arc<dyn GroupHandler>,
        session: &Arc<dyn GroupSession>,
        topic: &str,
        partition: i32,
    ) -> mpsc::Sender<ConsumerRecord> {
        let (sender, messages) = mpsc::channel(self.claim_buffer_size);
        let claim = PartitionClaim {
            topic: topic.to_string(),
            partition,
            messages,
        };
        let handler = Arc::clone(handler);
        let session = Arc::clone(session);
        tasks.spawn(async move { handler.consume_claim(session, claim).await });
        sender
    }
}

pub fn is_internal_topic(topic: &str) -> bool {
    topic.starts_with("__")
}

#[async_trait]
impl ConsumerGroup for KafkaConsumerGroup {
    async fn topics(&self) -> Result<Vec<String>, KafkaError> {
        let consumer = Arc::clone(&self.consumer);
        let metadata = tokio::task::spawn_blocking(move || {
            consumer
                .fetch_metadata(None, METADATA_TIMEOUT)
                .map(|metadata| {
                    metadata
                        .topics()
                        .iter()
                        .map(|topic| topic.name().to_string())
                        .collect::<Vec<_>>()
                })
        })
        .await
        .map_err(|e| KafkaError::Metadata {
            reason: e.to_string(),
        })?;

        let topics = metadata
            .map_err(|e| KafkaError::Metadata {
                reason: e.to_string(),
            })?
            .into_iter()
            .filter(|topic| !is_internal_topic(topic))
            .collect();
        Ok(topics)
    }

    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: Arc<dyn GroupHandler>,
    ) -> Result<(), KafkaError> {
        self.ensure_subscribed(topics)?;

        let mut revocations = self.revocations.lock().await;
        // Revocations from before this session belong to a generation that is already over.
        while revocations.try_recv().is_ok() {}

        let session_token = cancel.child_token();
        let session: Arc<dyn GroupSession> = Arc::new(KafkaGroupSession {
            consumer: Arc::clone(&self.consumer),
            marked: Mutex::new(HashMap::new()),
            cancel: session_token.clone(),
        });
        handler.setup(Arc::clone(&session)).await?;

        let mut claims: HashMap<(String, i32), mpsc::Sender<ConsumerRecord>> = HashMap::new();
        let mut tasks = JoinSet::new();
        let mut stream = self.consumer.stream();

        loop {
            tokio::select! {
                _ = session_token.cancelled() => break,
                Some(revoked) = revocations.recv() => {
                    info!(revoked, "Assignment revoked, ending group session");
                    break;
                }
                next = stream.next() => match next {
                    None => break,
                    Some(Err(e)) => {
                        warn!("Error receiving message: {}", e);
                        continue;
                    }
                    Some(Ok(message)) => {
                        let record = convert_message(&message);
                        drop(message);
                        let key = (record.topic.clone(), record.partition);
                        if !claims.contains_key(&key) {
                            let sender =
                                self.open_claim(&mut tasks, &handler, &session, &key.0, key.1);
                            claims.insert(key.clone(), sender);
                        }
                        if let Some(sender) = claims.get(&key) {
                            if sender.send(record).await.is_err() {
                                debug!(topic = %key.0, partition = key.1, "Claim already ended");
                                claims.remove(&key);
                            }
                        }
                    }
                }
            }
        }
        drop(stream);

        // Closing the claim channels lets the forwarders drain what they already hold.
        drop(claims);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Claim ended with error"),
                Err(e) => warn!(error = %e, "Claim task failed"),
            }
        }
        session_token.cancel();

        handler.cleanup(session).await
    }

    fn close(&self) {
        self.consumer.unsubscribe();
        self.subscribed.lock().clear();
        debug!("Unsubscribed Kafka consumer group");
    }
}

struct KafkaGroupSession {
    consumer: Arc<GroupConsumer>,
    marked: Mutex<HashMap<(String, i32), i64>>,
    cancel: CancellationToken,
}

impl GroupSession for KafkaGroupSession {
    fn mark_offset(&self, topic: &str, partition: i32, offset: i64) {
        self.marked
            .lock()
            .insert((topic.to_string(), partition), offset);
    }

    fn commit(&self) -> Result<(), KafkaError> {
        let marked: Vec<((String, i32), i64)> = self.marked.lock().drain().collect();
        if marked.is_empty() {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        for ((topic, partition), offset) in &marked {
            tpl.add_partition_offset(topic, *partition, Offset::Offset(*offset))
                .map_err(|e| KafkaError::OffsetCommit {
                    reason: e.to_string(),
                })?;
        }

        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| KafkaError::OffsetCommit {
                reason: e.to_string(),
            })?;

        debug!(partitions = marked.len(), "Committed marked offsets");
        Ok(())
    }

    fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

fn convert_message(message: &BorrowedMessage<'_>) -> ConsumerRecord {
    let mut headers = HashMap::new();
    if let Some(header_map) = message.headers() {
        for header in header_map.iter() {
            if let Some(value) = header.value {
                headers.insert(header.key.to_string(), value.to_vec());
            }
        }
    }

    ConsumerRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec),
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        headers,
    }
}
