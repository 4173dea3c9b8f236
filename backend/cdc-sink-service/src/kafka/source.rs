use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::error::{CommitError, FetchError};
use crate::services::pipeline::{GroupState, GroupStateProbe, InboundMessage, MessageSource};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Manually committed consumer subscribed to a single topic
#[derive(Clone)]
pub struct KafkaSource {
    consumer: Arc<StreamConsumer>,
    topic: String,
}

impl KafkaSource {
    pub fn new(brokers: &str, group_id: &str, topic: &str) -> Result<Self, KafkaError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false") // Commit only after apply
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| {
                error!("Failed to create Kafka consumer: {}", e);
                e
            })?;

        consumer.subscribe(&[topic]).map_err(|e| {
            error!(topic = %topic, "Failed to subscribe: {}", e);
            e
        })?;

        info!(topic = %topic, group_id = %group_id, "Kafka consumer subscribed");

        Ok(Self {
            consumer: Arc::new(consumer),
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn fetch(&self, wait: Duration) -> Result<InboundMessage, FetchError> {
        match tokio::time::timeout(wait, self.consumer.recv()).await {
            Err(_) => Err(FetchError::IdleTimeout(wait)),
            Ok(Err(e)) => Err(FetchError::Broker(e.to_string())),
            Ok(Ok(msg)) => {
                let message = InboundMessage {
                    topic: msg.topic().to_string(),
                    partition: msg.partition(),
                    offset: msg.offset(),
                    key: msg.key().map(<[u8]>::to_vec),
                    payload: msg.payload().map(<[u8]>::to_vec),
                };
                debug!(
                    "Received CDC message: topic={}, partition={}, offset={}",
                    message.topic, message.partition, message.offset
                );
                Ok(message)
            }
        }
    }

    async fn commit(&self, message: &InboundMessage) -> Result<(), CommitError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )
        .map_err(|e| CommitError(e.to_string()))?;

        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| CommitError(format!("commit task failed: {}", e)))?
            .map_err(|e| CommitError(e.to_string()))
    }

    async fn partition_count(&self) -> Result<i32, FetchError> {
        let consumer = self.consumer.clone();
        let topic = self.topic.clone();

        tokio::task::spawn_blocking(move || {
            let metadata = consumer
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
                .map_err(|e| FetchError::Broker(e.to_string()))?;

            metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic)
                .map(|t| t.partitions().len() as i32)
                .filter(|count| *count > 0)
                .ok_or_else(|| FetchError::Broker(format!("topic {} has no partitions", topic)))
        })
        .await
        .map_err(|e| FetchError::Broker(format!("metadata task failed: {}", e)))?
    }
}

#[async_trait]
impl GroupStateProbe for KafkaSource {
    async fn group_state(&self, group_id: &str) -> Result<GroupState, String> {
        let consumer = self.consumer.clone();
        let group_id = group_id.to_string();

        tokio::task::spawn_blocking(move || {
            let groups = consumer
                .fetch_group_list(Some(&group_id), METADATA_TIMEOUT)
                .map_err(|e| format!("Failed to fetch group list: {}", e))?;

            // An unknown group has no members yet.
            Ok(groups
                .groups()
                .iter()
                .find(|g| g.name() == group_id)
                .map(|g| GroupState::from_broker(g.state()))
                .unwrap_or(GroupState::Empty))
        })
        .await
        .map_err(|e| format!("group list task failed: {}", e))?
    }
}
