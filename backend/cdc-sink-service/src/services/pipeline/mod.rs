//! Partitioned fetch → dispatch → process → commit pipeline
//!
//! One [`TopicCoordinator`] per topic owns the broker connection and fans
//! messages out to one [`PartitionWorker`] per partition over bounded
//! queues. Workers process strictly in arrival order and commit each offset
//! only after its message was applied.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::error::{CommitError, FetchError};

mod coordinator;
mod handler;
mod readiness;
mod worker;

pub use coordinator::{
    CoordinatorConfig, PartitionReport, ShutdownReason, TopicCoordinator, TopicReport,
};
pub use handler::{CdcHandler, MessageHandler};
pub use readiness::ReadinessCheck;
pub use worker::{PartitionWorker, WorkerExit, WorkerHandle, WorkerState};

/// Owned copy of one broker message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
}

/// Broker fetch and commit for a single subscribed topic
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Wait at most `wait` for the next message.
    async fn fetch(&self, wait: Duration) -> Result<InboundMessage, FetchError>;

    /// Commit the offset following `message`.
    async fn commit(&self, message: &InboundMessage) -> Result<(), CommitError>;

    async fn partition_count(&self) -> Result<i32, FetchError>;
}

/// Consumer group state as reported by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupState {
    Stable,
    Empty,
    Other(String),
}

impl GroupState {
    pub fn from_broker(state: &str) -> Self {
        match state {
            "Stable" => GroupState::Stable,
            "Empty" => GroupState::Empty,
            other => GroupState::Other(other.to_string()),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, GroupState::Stable | GroupState::Empty)
    }
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupState::Stable => f.write_str("Stable"),
            GroupState::Empty => f.write_str("Empty"),
            GroupState::Other(s) => f.write_str(s),
        }
    }
}

#[async_trait]
pub trait GroupStateProbe: Send + Sync {
    async fn group_state(&self, group_id: &str) -> Result<GroupState, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicSpec {
    pub partitions: i32,
    pub replication: i32,
}

#[async_trait]
pub trait TopicAdmin: Send + Sync {
    async fn topic_exists(&self, topic: &str) -> Result<bool, String>;

    async fn create_topic(&self, topic: &str, spec: TopicSpec) -> Result<(), String>;
}
