//! Idempotent apply of change events to one or more sinks
//!
//! For every sink the layer claims the event id in that sink's ledger under
//! this process's owner token, runs the entity handler against the sink's
//! store and completes the claim. If the handler fails the claim is released
//! so the worker's retry re-applies the event. A claim whose release failed
//! stays pending under our owner, so our own retry re-claims it and a
//! restarted process takes it over once the lease runs out.

use chrono::{DateTime, NaiveDate, Utc};
use idempotent_consumer::{ClaimOutcome, DedupLedger, IdempotencyError, LedgerEntry};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ApplyError, StoreError};
use crate::metrics;
use crate::services::cdc::codec::{decode_date, decode_decimal, parse_timestamp};
use crate::services::cdc::{ChangeEvent, FieldValue, Row};
use crate::store::TableStore;

mod order;
mod user;

/// Entity a topic's rows belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    User,
    Order,
}

impl Entity {
    /// Route on the table suffix of `<prefix>.<schema>.<table>` topics.
    pub fn from_topic(topic: &str) -> Result<Self, ApplyError> {
        match topic.rsplit('.').next() {
            Some("users") => Ok(Entity::User),
            Some("orders") => Ok(Entity::Order),
            _ => Err(ApplyError::UnknownTopic(topic.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Entity::User => "user",
            Entity::Order => "order",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Writes were issued to at least one sink
    Applied,
    /// Every sink had already claimed the event
    Duplicate,
    /// The op carries nothing to write
    Skipped,
}

/// A store paired with the ledger guarding it
#[derive(Clone)]
pub struct Sink {
    pub name: String,
    pub store: Arc<dyn TableStore>,
    pub ledger: Arc<dyn DedupLedger>,
}

impl Sink {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn TableStore>,
        ledger: Arc<dyn DedupLedger>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            ledger,
        }
    }

    pub(crate) fn store_error(&self, source: StoreError) -> ApplyError {
        ApplyError::Store {
            sink: self.name.clone(),
            source,
        }
    }
}

pub struct ApplyLayer {
    sinks: Vec<Sink>,
    /// Ledger owner token of this process
    owner: String,
}

impl ApplyLayer {
    pub fn new(sinks: Vec<Sink>) -> Self {
        Self::with_owner(sinks, Uuid::new_v4().to_string())
    }

    /// Use a fixed owner token; a restarted process must use a new one
    pub fn with_owner(sinks: Vec<Sink>, owner: impl Into<String>) -> Self {
        Self {
            sinks,
            owner: owner.into(),
        }
    }

    /// Apply one event to every sink in order.
    ///
    /// Stops at the first failing sink; sinks before it keep their completed
    /// claims and will report a duplicate when the event is retried.
    pub async fn apply(
        &self,
        topic: &str,
        event: &ChangeEvent,
    ) -> Result<ApplyOutcome, ApplyError> {
        let entity = Entity::from_topic(topic)?;

        if !event.op.produces_writes() {
            info!(
                topic = %topic,
                op = %event.op,
                event_id = %event.event_id,
                "Nothing to apply for op"
            );
            return Ok(ApplyOutcome::Skipped);
        }

        let mut applied = false;
        for sink in &self.sinks {
            if self.apply_to_sink(sink, entity, topic, event).await? {
                applied = true;
            } else {
                metrics::record_duplicate(topic, &sink.name);
            }
        }

        Ok(if applied {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::Duplicate
        })
    }

    /// Returns false when the sink's ledger already completed the event.
    async fn apply_to_sink(
        &self,
        sink: &Sink,
        entity: Entity,
        topic: &str,
        event: &ChangeEvent,
    ) -> Result<bool, ApplyError> {
        let ledger_error = |source: IdempotencyError| ApplyError::Ledger {
            sink: sink.name.clone(),
            source,
        };

        let entry = LedgerEntry::new(&event.event_id, topic, event.ts_ms, &self.owner);
        match sink.ledger.claim(&entry).await.map_err(ledger_error)? {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::AlreadyProcessed => {
                debug!(
                    sink = %sink.name,
                    event_id = %event.event_id,
                    "Event already applied, skipping"
                );
                return Ok(false);
            }
            ClaimOutcome::InFlight => {
                return Err(ApplyError::ClaimInFlight {
                    sink: sink.name.clone(),
                    event_id: event.event_id.clone(),
                });
            }
        }

        let result = match entity {
            Entity::User => user::apply(sink, event).await,
            Entity::Order => order::apply(sink, event).await,
        };

        if let Err(err) = result {
            self.release_claim(sink, &entry).await;
            return Err(err);
        }

        sink.ledger.complete(&entry).await.map_err(ledger_error)?;
        debug!(
            sink = %sink.name,
            entity = entity.name(),
            event_id = %event.event_id,
            "Change applied"
        );
        Ok(true)
    }

    /// A failed release leaves our pending row behind; this owner may
    /// re-claim it and any other owner takes it over after the lease.
    async fn release_claim(&self, sink: &Sink, entry: &LedgerEntry) {
        if let Err(e) = sink.ledger.release(entry).await {
            warn!(
                sink = %sink.name,
                event_id = %entry.event_id,
                error = %e,
                "Failed to release claim, it stays pending until re-claimed"
            );
        }
    }
}

/// Defensive typed access to a row image
pub(crate) struct RowReader<'a> {
    entity: &'static str,
    row: &'a Row,
}

impl<'a> RowReader<'a> {
    pub(crate) fn new(entity: &'static str, row: &'a Row) -> Self {
        Self { entity, row }
    }

    fn field(&self, field: &str) -> Result<&'a FieldValue, ApplyError> {
        match self.row.get(field) {
            Some(FieldValue::Null) | None => Err(ApplyError::MissingField {
                entity: self.entity,
                field: field.to_string(),
            }),
            Some(value) => Ok(value),
        }
    }

    fn invalid(&self, field: &str, reason: impl Into<String>) -> ApplyError {
        ApplyError::InvalidField {
            entity: self.entity,
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    fn wrong_type(&self, field: &str, expected: &str, value: &FieldValue) -> ApplyError {
        self.invalid(field, format!("expected {}, got {}", expected, value.type_name()))
    }

    pub(crate) fn text(&self, field: &str) -> Result<&'a str, ApplyError> {
        let value = self.field(field)?;
        value
            .as_str()
            .ok_or_else(|| self.wrong_type(field, "string", value))
    }

    pub(crate) fn uuid(&self, field: &str) -> Result<Uuid, ApplyError> {
        let raw = self.text(field)?;
        Uuid::parse_str(raw)
            .map_err(|e| self.invalid(field, format!("invalid UUID '{}': {}", raw, e)))
    }

    pub(crate) fn int(&self, field: &str) -> Result<i32, ApplyError> {
        let value = self.field(field)?;
        let wide = value
            .as_i64()
            .ok_or_else(|| self.wrong_type(field, "integer", value))?;
        i32::try_from(wide)
            .map_err(|_| self.invalid(field, format!("{} does not fit in int", wide)))
    }

    /// Missing or null flags read as `default`
    pub(crate) fn bool_or(&self, field: &str, default: bool) -> Result<bool, ApplyError> {
        match self.row.get(field) {
            Some(FieldValue::Null) | None => Ok(default),
            Some(value) => value
                .as_bool()
                .ok_or_else(|| self.wrong_type(field, "boolean", value)),
        }
    }

    pub(crate) fn date(&self, field: &str) -> Result<NaiveDate, ApplyError> {
        let value = self.field(field)?;
        let days = value
            .as_i64()
            .ok_or_else(|| self.wrong_type(field, "day count", value))?;
        Ok(decode_date(days)?)
    }

    pub(crate) fn timestamp(&self, field: &str) -> Result<DateTime<Utc>, ApplyError> {
        Ok(parse_timestamp(self.text(field)?)?)
    }

    pub(crate) fn decimal(&self, field: &str, scale: u32) -> Result<Decimal, ApplyError> {
        Ok(decode_decimal(self.text(field)?, scale)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_by_table_suffix() {
        assert_eq!(Entity::from_topic("cdc.public.users").unwrap(), Entity::User);
        assert_eq!(Entity::from_topic("orders").unwrap(), Entity::Order);
        assert!(matches!(
            Entity::from_topic("cdc.public.payments"),
            Err(ApplyError::UnknownTopic(_))
        ));
        assert!(Entity::from_topic("cdc.public.users_archive").is_err());
    }

    #[test]
    fn test_row_reader_errors() {
        let mut row = Row::new();
        row.insert("id".into(), FieldValue::Int(5));
        row.insert("quantity".into(), FieldValue::Int(i64::from(i32::MAX) + 1));
        row.insert("is_deleted".into(), FieldValue::Null);
        let reader = RowReader::new("order", &row);

        assert!(matches!(reader.uuid("id"), Err(ApplyError::InvalidField { .. })));
        assert!(matches!(reader.text("status"), Err(ApplyError::MissingField { .. })));
        assert!(matches!(reader.int("quantity"), Err(ApplyError::InvalidField { .. })));
        assert!(!reader.bool_or("is_deleted", false).unwrap());
    }
}
