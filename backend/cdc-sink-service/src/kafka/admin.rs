use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use std::sync::Arc;
use std::time::Duration;

use crate::services::pipeline::{TopicAdmin, TopicSpec};

pub struct KafkaTopicAdmin {
    admin: Arc<AdminClient<DefaultClientContext>>,
}

impl KafkaTopicAdmin {
    pub fn new(brokers: &str) -> Result<Self, KafkaError> {
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("request.timeout.ms", "5000")
            .create()?;
        Ok(Self {
            admin: Arc::new(admin),
        })
    }
}

#[async_trait]
impl TopicAdmin for KafkaTopicAdmin {
    async fn topic_exists(&self, topic: &str) -> Result<bool, String> {
        let admin = self.admin.clone();
        let topic = topic.to_string();

        tokio::task::spawn_blocking(move || {
            let metadata = admin
                .inner()
                .fetch_metadata(Some(&topic), Duration::from_secs(5))
                .map_err(|e| format!("Failed to fetch Kafka metadata: {}", e))?;

            Ok(metadata
                .topics()
                .iter()
                .any(|t| t.name() == topic && t.error().is_none() && !t.partitions().is_empty()))
        })
        .await
        .map_err(|e| format!("Failed to join task: {}", e))?
    }

    async fn create_topic(&self, topic: &str, spec: TopicSpec) -> Result<(), String> {
        let new_topic = NewTopic::new(
            topic,
            spec.partitions,
            TopicReplication::Fixed(spec.replication),
        );
        let opts = AdminOptions::new().operation_timeout(Some(Duration::from_secs(10)));

        let results = self
            .admin
            .create_topics(&[new_topic], &opts)
            .await
            .map_err(|e| format!("Failed to create topic {}: {}", topic, e))?;

        for result in results {
            match result {
                Ok(_) => {}
                // Another instance may have created it between check and create.
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((name, code)) => {
                    return Err(format!("Failed to create topic {}: {:?}", name, code))
                }
            }
        }
        Ok(())
    }
}
