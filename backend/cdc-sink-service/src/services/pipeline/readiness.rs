use resilience::{with_retry, RetryError, RetryPolicy, Retryable};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{GroupState, GroupStateProbe};
use crate::error::{ConsumeError, GroupNotReadyError};

/// Gate that holds consumption back until the consumer group settles
pub struct ReadinessCheck {
    probe: Arc<dyn GroupStateProbe>,
    group_id: String,
    policy: RetryPolicy,
    initial_delay: Duration,
}

enum ProbeFault {
    NotReady(GroupState),
    Probe(String),
}

impl fmt::Display for ProbeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeFault::NotReady(state) => write!(f, "group state is {}", state),
            ProbeFault::Probe(e) => write!(f, "probe failed: {}", e),
        }
    }
}

impl Retryable for ProbeFault {
    fn is_retryable(&self) -> bool {
        matches!(self, ProbeFault::NotReady(_))
    }
}

impl ReadinessCheck {
    pub fn new(
        probe: Arc<dyn GroupStateProbe>,
        group_id: impl Into<String>,
        policy: RetryPolicy,
        initial_delay: Duration,
    ) -> Self {
        Self {
            probe,
            group_id: group_id.into(),
            policy,
            initial_delay,
        }
    }

    /// Poll the group state with backoff until it is `Stable` or `Empty`.
    ///
    /// A probe error aborts at once; a group that never settles yields
    /// [`GroupNotReadyError`] after the policy's attempts.
    pub async fn wait_until_ready(&self) -> Result<GroupState, ConsumeError> {
        if !self.initial_delay.is_zero() {
            tokio::time::sleep(self.initial_delay).await;
        }

        let result = with_retry(&self.policy, |attempt| async move {
            let state = self
                .probe
                .group_state(&self.group_id)
                .await
                .map_err(ProbeFault::Probe)?;
            debug!(
                group_id = %self.group_id,
                attempt = attempt,
                state = %state,
                "Consumer group state"
            );

            if state.is_ready() {
                Ok(state)
            } else {
                Err(ProbeFault::NotReady(state))
            }
        })
        .await;

        match result {
            Ok(state) => {
                info!(group_id = %self.group_id, state = %state, "Consumer group ready");
                Ok(state)
            }
            Err(RetryError::Permanent(ProbeFault::Probe(e))) => Err(ConsumeError::Probe(e)),
            Err(RetryError::Permanent(ProbeFault::NotReady(state))) => {
                Err(self.not_ready(1, &state))
            }
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => match last_error {
                ProbeFault::NotReady(state) => Err(self.not_ready(attempts, &state)),
                ProbeFault::Probe(e) => Err(ConsumeError::Probe(e)),
            },
        }
    }

    fn not_ready(&self, attempts: u32, state: &GroupState) -> ConsumeError {
        ConsumeError::GroupNotReady(GroupNotReadyError {
            group_id: self.group_id.clone(),
            attempts,
            last_state: state.to_string(),
        })
    }
}
