//! Process-local ledger backed by a concurrent map
//!
//! Gives the same claim semantics as the database ledgers within a single
//! process. Used by tests and by local runs without a ledger store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    lease_expired, validate_event_id, ClaimOutcome, DedupLedger, IdempotencyError,
    IdempotencyResult, LedgerEntry, DEFAULT_CLAIM_LEASE,
};

#[derive(Debug, Clone)]
struct Record {
    entry: LedgerEntry,
    completed: bool,
}

/// Clones share the same map, so a clone stands in for a second process
/// looking at the same durable ledger.
#[derive(Clone)]
pub struct MemoryLedger {
    entries: Arc<DashMap<String, Record>>,
    lease: Duration,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            lease: DEFAULT_CLAIM_LEASE,
        }
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, event_id: &str) -> Option<LedgerEntry> {
        self.entries.get(event_id).map(|r| r.entry.clone())
    }

    /// Whether the row exists but has not been completed
    pub fn is_pending(&self, event_id: &str) -> bool {
        self.entries
            .get(event_id)
            .map(|r| !r.completed)
            .unwrap_or(false)
    }
}

#[async_trait]
impl DedupLedger for MemoryLedger {
    async fn claim(&self, entry: &LedgerEntry) -> IdempotencyResult<ClaimOutcome> {
        validate_event_id(&entry.event_id)?;

        // The shard lock held by `entry` makes check-and-insert atomic.
        match self.entries.entry(entry.event_id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(Record {
                    entry: entry.clone(),
                    completed: false,
                });
                Ok(ClaimOutcome::Claimed)
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                if record.completed {
                    Ok(ClaimOutcome::AlreadyProcessed)
                } else if record.entry.owner == entry.owner
                    || lease_expired(record.entry.processed_at, self.lease)
                {
                    record.entry = entry.clone();
                    Ok(ClaimOutcome::Claimed)
                } else {
                    Ok(ClaimOutcome::InFlight)
                }
            }
        }
    }

    async fn complete(&self, entry: &LedgerEntry) -> IdempotencyResult<()> {
        validate_event_id(&entry.event_id)?;

        match self.entries.get_mut(&entry.event_id) {
            Some(mut record) if record.entry.owner == entry.owner => {
                record.completed = true;
                record.entry.processed_at = chrono::Utc::now();
                Ok(())
            }
            _ => Err(IdempotencyError::ClaimLost(entry.event_id.clone())),
        }
    }

    async fn release(&self, entry: &LedgerEntry) -> IdempotencyResult<()> {
        validate_event_id(&entry.event_id)?;
        self.entries
            .remove_if(&entry.event_id, |_, r| !r.completed && r.entry.owner == entry.owner);
        Ok(())
    }

    async fn is_processed(&self, event_id: &str) -> IdempotencyResult<bool> {
        validate_event_id(event_id)?;
        Ok(self
            .entries
            .get(event_id)
            .map(|r| r.completed)
            .unwrap_or(false))
    }
}
