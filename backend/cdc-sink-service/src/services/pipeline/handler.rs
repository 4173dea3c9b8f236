use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::InboundMessage;
use crate::error::ProcessError;
use crate::services::apply::{ApplyLayer, ApplyOutcome};
use crate::services::cdc::decode;

/// Processing step run by a partition worker for each message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage) -> Result<ApplyOutcome, ProcessError>;
}

/// Decodes Debezium envelopes and applies them to the configured sinks
pub struct CdcHandler {
    apply: Arc<ApplyLayer>,
}

impl CdcHandler {
    pub fn new(apply: Arc<ApplyLayer>) -> Self {
        Self { apply }
    }
}

#[async_trait]
impl MessageHandler for CdcHandler {
    async fn handle(&self, message: &InboundMessage) -> Result<ApplyOutcome, ProcessError> {
        // Debezium follows every delete with a tombstone carrying no value.
        let Some(payload) = message.payload.as_deref() else {
            debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Skipping tombstone"
            );
            return Ok(ApplyOutcome::Skipped);
        };

        let event = decode(payload)?;
        debug!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            op = %event.op,
            event_id = %event.event_id,
            "Decoded change event"
        );

        Ok(self.apply.apply(&message.topic, &event).await?)
    }
}
