use idempotent_consumer::IdempotencyError;
use resilience::Retryable;
use std::time::Duration;
use thiserror::Error;

use crate::services::pipeline::TopicReport;

/// Envelope could not be turned into a change event.
///
/// Always fatal to the message; retrying the same bytes yields the same error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Missing 'source' block in envelope payload")]
    MissingSource,

    #[error("Invalid decimal value: {0}")]
    InvalidDecimal(String),

    #[error("Invalid date value: {0}")]
    InvalidDate(String),

    #[error("Invalid timestamp value: {0}")]
    InvalidTimestamp(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Write to {table} failed: {message}")]
    Write { table: String, message: String },

    #[error("Read from {table} failed: {message}")]
    Read { table: String, message: String },

    #[error("Store connection error: {0}")]
    Connection(String),

    #[error("Invalid statement for {table}: {message}")]
    Statement { table: String, message: String },
}

impl StoreError {
    pub fn write(table: &str, err: impl std::fmt::Display) -> Self {
        StoreError::Write {
            table: table.to_string(),
            message: err.to_string(),
        }
    }

    pub fn read(table: &str, err: impl std::fmt::Display) -> Self {
        StoreError::Read {
            table: table.to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::Statement { .. })
    }
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("No entity handler for topic '{0}'")]
    UnknownTopic(String),

    #[error("{entity} row is missing field '{field}'")]
    MissingField {
        entity: &'static str,
        field: String,
    },

    #[error("{entity} row has invalid field '{field}': {reason}")]
    InvalidField {
        entity: &'static str,
        field: String,
        reason: String,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Sink '{sink}': {source}")]
    Store {
        sink: String,
        #[source]
        source: StoreError,
    },

    #[error("Ledger for sink '{sink}': {source}")]
    Ledger {
        sink: String,
        #[source]
        source: IdempotencyError,
    },

    #[error("Event {event_id} is claimed by another consumer on sink '{sink}'")]
    ClaimInFlight { sink: String, event_id: String },
}

impl ApplyError {
    /// Store and ledger failures may clear up on their own; routing and
    /// row-shape failures will not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApplyError::Store { source, .. } => source.is_retryable(),
            ApplyError::Ledger { source, .. } => source.is_retryable(),
            ApplyError::ClaimInFlight { .. } => true,
            ApplyError::UnknownTopic(_)
            | ApplyError::MissingField { .. }
            | ApplyError::InvalidField { .. }
            | ApplyError::Decode(_) => false,
        }
    }
}

/// Failure of a message handler inside a partition worker
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Apply(#[from] ApplyError),
}

impl Retryable for ProcessError {
    fn is_retryable(&self) -> bool {
        match self {
            ProcessError::Decode(_) => false,
            ProcessError::Apply(e) => e.is_retryable(),
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum FetchError {
    /// Nothing arrived within the wait window
    #[error("No message within {0:?}")]
    IdleTimeout(Duration),

    #[error("Broker error: {0}")]
    Broker(String),
}

#[derive(Debug, Error, Clone)]
#[error("Offset commit failed: {0}")]
pub struct CommitError(pub String);

impl Retryable for CommitError {
    fn is_retryable(&self) -> bool {
        true
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Consumer group '{group_id}' not ready after {attempts} attempts (last state: {last_state})")]
pub struct GroupNotReadyError {
    pub group_id: String,
    pub attempts: u32,
    pub last_state: String,
}

/// Fatal error for one topic's consumption
#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error(transparent)]
    GroupNotReady(#[from] GroupNotReadyError),

    #[error("Group state probe failed: {0}")]
    Probe(String),

    #[error("Topic administration failed: {0}")]
    Admin(String),

    #[error(transparent)]
    Fetch(FetchError),

    /// Fetching failed mid-run; the workers were drained first
    #[error("Fetch failed, topic run aborted: {source}")]
    FetchAborted {
        source: FetchError,
        report: Box<TopicReport>,
    },

    #[error("Received message for unknown partition {partition} of {topic}")]
    UnknownPartition { topic: String, partition: i32 },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}
