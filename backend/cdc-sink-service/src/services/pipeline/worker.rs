use resilience::{with_retry, RetryError, RetryPolicy};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{InboundMessage, MessageHandler, MessageSource};
use crate::metrics;
use crate::services::apply::ApplyOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Processing,
    /// About to run the given attempt (2-based) after a backoff
    Retrying { attempt: u32 },
    Committing,
    Stopped,
}

/// Why a worker stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Queue closed by the coordinator; every received message was committed
    InputClosed,
    /// Non-retryable failure (decode, routing, row shape)
    Failed { offset: i64, error: String },
    RetriesExhausted {
        offset: i64,
        attempts: u32,
        error: String,
    },
    CommitFailed { offset: i64, error: String },
    Panicked(String),
}

impl WorkerExit {
    pub fn is_clean(&self) -> bool {
        matches!(self, WorkerExit::InputClosed)
    }
}

/// Coordinator-side handle of a running worker
pub struct WorkerHandle {
    pub partition: i32,
    pub sender: mpsc::Sender<InboundMessage>,
    pub state: watch::Receiver<WorkerState>,
    join: JoinHandle<WorkerExit>,
}

impl WorkerHandle {
    /// Close the queue and wait for the worker to drain it.
    pub async fn close(self) -> (WorkerExit, WorkerState) {
        drop(self.sender);
        let exit = match self.join.await {
            Ok(exit) => exit,
            Err(e) => WorkerExit::Panicked(e.to_string()),
        };
        let state = *self.state.borrow();
        (exit, state)
    }
}

/// Sequential processor for one topic-partition
pub struct PartitionWorker {
    topic: String,
    partition: i32,
    handler: Arc<dyn MessageHandler>,
    source: Arc<dyn MessageSource>,
    policy: RetryPolicy,
    state: watch::Sender<WorkerState>,
}

impl PartitionWorker {
    pub fn spawn(
        topic: &str,
        partition: i32,
        queue_capacity: usize,
        handler: Arc<dyn MessageHandler>,
        source: Arc<dyn MessageSource>,
        policy: RetryPolicy,
    ) -> WorkerHandle {
        let (sender, inbox) = mpsc::channel(queue_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(WorkerState::Idle);

        let worker = PartitionWorker {
            topic: topic.to_string(),
            partition,
            handler,
            source,
            policy,
            state: state_tx,
        };
        let join = tokio::spawn(worker.run(inbox));

        WorkerHandle {
            partition,
            sender,
            state: state_rx,
            join,
        }
    }

    async fn run(self, mut inbox: mpsc::Receiver<InboundMessage>) -> WorkerExit {
        metrics::worker_started(&self.topic);
        info!(topic = %self.topic, partition = self.partition, "Partition worker started");

        let exit = self.drain(&mut inbox).await;
        // Close the queue before reporting Stopped so senders observe both together.
        drop(inbox);

        self.state.send_replace(WorkerState::Stopped);
        metrics::worker_stopped(&self.topic);
        info!(
            topic = %self.topic,
            partition = self.partition,
            exit = ?exit,
            "Partition worker stopped"
        );
        exit
    }

    async fn drain(&self, inbox: &mut mpsc::Receiver<InboundMessage>) -> WorkerExit {
        while let Some(message) = inbox.recv().await {
            self.state.send_replace(WorkerState::Processing);

            let processed = with_retry(&self.policy, |attempt| {
                if attempt > 1 {
                    self.state.send_replace(WorkerState::Retrying { attempt });
                    metrics::record_retry(&self.topic, "process");
                }
                self.handler.handle(&message)
            })
            .await;

            match processed {
                Ok(outcome) => {
                    metrics::record_processed(&self.topic, outcome_label(outcome));
                    debug!(
                        topic = %self.topic,
                        partition = self.partition,
                        offset = message.offset,
                        outcome = ?outcome,
                        "Message processed"
                    );
                }
                Err(RetryError::Permanent(e)) => {
                    metrics::record_failed(&self.topic, self.partition);
                    error!(
                        topic = %self.topic,
                        partition = self.partition,
                        offset = message.offset,
                        error = %e,
                        "Non-retryable failure, stopping partition"
                    );
                    return WorkerExit::Failed {
                        offset: message.offset,
                        error: e.to_string(),
                    };
                }
                Err(RetryError::Exhausted {
                    attempts,
                    last_error,
                }) => {
                    metrics::record_failed(&self.topic, self.partition);
                    error!(
                        topic = %self.topic,
                        partition = self.partition,
                        offset = message.offset,
                        attempts = attempts,
                        error = %last_error,
                        "Retries exhausted, stopping partition"
                    );
                    return WorkerExit::RetriesExhausted {
                        offset: message.offset,
                        attempts,
                        error: last_error.to_string(),
                    };
                }
            }

            self.state.send_replace(WorkerState::Committing);
            let committed = with_retry(&self.policy, |attempt| {
                if attempt > 1 {
                    metrics::record_retry(&self.topic, "commit");
                }
                self.source.commit(&message)
            })
            .await;

            if let Err(e) = committed {
                let e = e.into_inner();
                error!(
                    topic = %self.topic,
                    partition = self.partition,
                    offset = message.offset,
                    error = %e,
                    "Offset commit failed, stopping partition"
                );
                return WorkerExit::CommitFailed {
                    offset: message.offset,
                    error: e.to_string(),
                };
            }

            metrics::record_commit(&self.topic, self.partition);
            self.state.send_replace(WorkerState::Idle);
        }

        WorkerExit::InputClosed
    }
}

fn outcome_label(outcome: ApplyOutcome) -> &'static str {
    match outcome {
        ApplyOutcome::Applied => "applied",
        ApplyOutcome::Duplicate => "duplicate",
        ApplyOutcome::Skipped => "skipped",
    }
}
