use resilience::RetryPolicy;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::readiness::ReadinessCheck;
use super::worker::{PartitionWorker, WorkerExit, WorkerHandle, WorkerState};
use super::{GroupStateProbe, MessageHandler, MessageSource, TopicAdmin, TopicSpec};
use crate::error::{ConsumeError, FetchError};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub topic: String,
    pub group_id: String,
    /// Per-partition queue bound
    pub queue_capacity: usize,
    /// Shut down after this long without a message
    pub idle_timeout: Duration,
    pub process_policy: RetryPolicy,
    pub readiness_policy: RetryPolicy,
    /// Wait before the first group state probe
    pub readiness_delay: Duration,
    /// Create the topic with this layout if it does not exist
    pub ensure_topic: Option<TopicSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    IdleTimeout,
    Signal,
    /// The broker failed; the report travels in [`ConsumeError::FetchAborted`]
    FetchError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionReport {
    pub partition: i32,
    pub exit: WorkerExit,
    pub final_state: WorkerState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicReport {
    pub topic: String,
    pub reason: ShutdownReason,
    pub messages_dispatched: u64,
    pub partitions: Vec<PartitionReport>,
}

impl TopicReport {
    pub fn all_clean(&self) -> bool {
        self.partitions.iter().all(|p| p.exit.is_clean())
    }
}

/// Drives consumption of one topic from readiness to shutdown
pub struct TopicCoordinator {
    config: CoordinatorConfig,
    source: Arc<dyn MessageSource>,
    probe: Arc<dyn GroupStateProbe>,
    admin: Option<Arc<dyn TopicAdmin>>,
    handler: Arc<dyn MessageHandler>,
}

impl TopicCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        source: Arc<dyn MessageSource>,
        probe: Arc<dyn GroupStateProbe>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            config,
            source,
            probe,
            admin: None,
            handler,
        }
    }

    pub fn with_admin(mut self, admin: Arc<dyn TopicAdmin>) -> Self {
        self.admin = Some(admin);
        self
    }

    /// Run until idle timeout, shutdown signal or a fatal fetch error.
    ///
    /// Every path closes the partition queues and waits for the workers to
    /// finish the messages they already hold. A fetch error still returns
    /// the drained report inside [`ConsumeError::FetchAborted`].
    pub async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<TopicReport, ConsumeError> {
        let topic = self.config.topic.clone();

        self.ensure_topic().await?;

        ReadinessCheck::new(
            self.probe.clone(),
            self.config.group_id.clone(),
            self.config.readiness_policy.clone(),
            self.config.readiness_delay,
        )
        .wait_until_ready()
        .await?;

        let partitions = self
            .source
            .partition_count()
            .await
            .map_err(ConsumeError::Fetch)?;

        let mut workers: HashMap<i32, WorkerHandle> = (0..partitions)
            .map(|partition| {
                let handle = PartitionWorker::spawn(
                    &topic,
                    partition,
                    self.config.queue_capacity,
                    self.handler.clone(),
                    self.source.clone(),
                    self.config.process_policy.clone(),
                );
                (partition, handle)
            })
            .collect();

        info!(
            topic = %topic,
            partitions = partitions,
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            "Consuming topic"
        );

        let mut dispatched: u64 = 0;
        let mut fetch_error = None;
        let outcome = loop {
            if *shutdown.borrow() {
                break Ok(ShutdownReason::Signal);
            }

            let fetched = tokio::select! {
                fetched = self.source.fetch(self.config.idle_timeout) => fetched,
                changed = shutdown.changed() => {
                    // A dropped signal sender counts as shutdown.
                    if changed.is_err() {
                        break Ok(ShutdownReason::Signal);
                    }
                    continue;
                }
            };

            let message = match fetched {
                Ok(message) => message,
                Err(FetchError::IdleTimeout(waited)) => {
                    info!(
                        topic = %topic,
                        waited_secs = waited.as_secs(),
                        "Topic idle, shutting down"
                    );
                    break Ok(ShutdownReason::IdleTimeout);
                }
                Err(e) => {
                    error!(topic = %topic, error = %e, "Fetch failed, shutting down");
                    fetch_error = Some(e);
                    break Ok(ShutdownReason::FetchError);
                }
            };

            let Some(worker) = workers.get(&message.partition) else {
                error!(topic = %topic, partition = message.partition, "No worker for partition");
                break Err(ConsumeError::UnknownPartition {
                    topic: topic.clone(),
                    partition: message.partition,
                });
            };

            let (partition, offset) = (message.partition, message.offset);
            // Blocks while the partition queue is full.
            if worker.sender.send(message).await.is_err() {
                warn!(
                    topic = %topic,
                    partition = partition,
                    offset = offset,
                    "Partition worker stopped, leaving message uncommitted"
                );
                continue;
            }
            dispatched += 1;
        };

        let mut reports = Vec::with_capacity(workers.len());
        let mut ordered: Vec<i32> = workers.keys().copied().collect();
        ordered.sort_unstable();
        for partition in ordered {
            if let Some(handle) = workers.remove(&partition) {
                let (exit, final_state) = handle.close().await;
                reports.push(PartitionReport {
                    partition,
                    exit,
                    final_state,
                });
            }
        }

        info!(topic = %topic, dispatched = dispatched, "All partition workers stopped");

        let report = TopicReport {
            topic,
            reason: outcome?,
            messages_dispatched: dispatched,
            partitions: reports,
        };
        match fetch_error {
            Some(source) => Err(ConsumeError::FetchAborted {
                source,
                report: Box::new(report),
            }),
            None => Ok(report),
        }
    }

    async fn ensure_topic(&self) -> Result<(), ConsumeError> {
        let (Some(admin), Some(spec)) = (self.admin.as_ref(), self.config.ensure_topic) else {
            return Ok(());
        };
        let topic = &self.config.topic;

        if admin.topic_exists(topic).await.map_err(ConsumeError::Admin)? {
            info!(topic = %topic, "Topic already exists");
            return Ok(());
        }

        admin
            .create_topic(topic, spec)
            .await
            .map_err(ConsumeError::Admin)?;
        info!(
            topic = %topic,
            partitions = spec.partitions,
            replication = spec.replication,
            "Created topic"
        );
        Ok(())
    }
}
