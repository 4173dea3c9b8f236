//! # Dedup Ledger for Idempotent CDC Apply
//!
//! Guards at-most-once application of change events by recording every
//! claimed event id in a ledger table with insert-if-absent semantics.
//! Redelivered events (consumer restarts, rebalances, retried fetches) find
//! their id already claimed and are skipped.
//!
//! ## Architecture
//!
//! ```text
//! Kafka → Partition Worker → DedupLedger::claim → Apply Layer → Sink tables
//!                                  ↓
//!                        processed_events table
//!                   (Postgres / CQL LWT / in-memory)
//! ```
//!
//! ## Claim protocol
//!
//! 1. `claim(entry)` performs a conditional insert keyed by `event_id`. The
//!    new row is *pending* and records the claimant's `owner` token.
//! 2. Exactly one owner observes [`ClaimOutcome::Claimed`]. A completed row
//!    yields [`ClaimOutcome::AlreadyProcessed`]; a pending row held by
//!    another owner yields [`ClaimOutcome::InFlight`] until its lease
//!    expires, after which the next claimant takes it over.
//! 3. After the apply succeeds the claimant calls `complete(entry)`. If the
//!    apply fails it calls `release(entry)`; a release that fails is
//!    harmless because the same owner may re-claim its own pending row and
//!    any other owner takes it over once the lease runs out.
//!
//! A crash between claim and complete therefore never hides an event: the
//! pending row only delays the redelivery by at most one lease.
//!
//! Ledger errors are never reported as `AlreadyProcessed`; they surface as
//! [`IdempotencyError`] and are retryable unless the id itself is invalid.
//!
//! ## Usage Example
//!
//! ```ignore
//! use idempotent_consumer::{ClaimOutcome, DedupLedger, LedgerEntry, PgLedger};
//! use sqlx::PgPool;
//! use std::time::Duration;
//!
//! # async fn example(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = PgLedger::new(pool, Duration::from_secs(7 * 86400));
//!
//! let entry = LedgerEntry::new("[742,24023928]", "cdc.public.users", 1724860978281, "worker-a");
//! match ledger.claim(&entry).await? {
//!     ClaimOutcome::Claimed => {
//!         if let Err(e) = apply_writes().await {
//!             ledger.release(&entry).await?;
//!             return Err(e);
//!         }
//!         ledger.complete(&entry).await?;
//!     }
//!     ClaimOutcome::AlreadyProcessed => {
//!         println!("Event already applied, skipping");
//!     }
//!     ClaimOutcome::InFlight => {
//!         println!("Another consumer holds the claim, retry later");
//!     }
//! }
//! # Ok(())
//! # }
//! # async fn apply_writes() -> Result<(), Box<dyn std::error::Error>> { Ok(()) }
//! ```
//!
//! ## Database Migration
//!
//! Run `migrations/001_create_processed_events_table.sql` before using
//! [`PgLedger`]. The CQL ledger lives with the wide-column sink and uses a
//! lightweight transaction (`INSERT ... IF NOT EXISTS`) instead.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{debug, info};

mod error;
mod memory;

pub use error::{IdempotencyError, IdempotencyResult};
pub use memory::MemoryLedger;

/// Longest event id accepted by any ledger backend
pub const MAX_EVENT_ID_LEN: usize = 1024;

/// How long a pending claim blocks other owners by default
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(60);

/// Result of a conditional claim on an event id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This owner holds the pending row and owns the apply
    Claimed,

    /// The event was applied and completed before (duplicate delivery)
    AlreadyProcessed,

    /// Another owner holds a live pending claim
    InFlight,
}

/// One row of the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Stable change identifier produced by the envelope decoder
    pub event_id: String,

    /// Topic the change was consumed from
    pub source_topic: String,

    /// Source commit timestamp (epoch millis)
    pub ts_ms: i64,

    /// Token of the claimant; a process uses one token for its lifetime
    pub owner: String,

    /// When the claim (or its completion) was written
    pub processed_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        event_id: impl Into<String>,
        source_topic: impl Into<String>,
        ts_ms: i64,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            source_topic: source_topic.into(),
            ts_ms,
            owner: owner.into(),
            processed_at: Utc::now(),
        }
    }
}

/// Conditional-write-backed idempotency table
///
/// Implementations must make `claim` atomic across processes: two racing
/// callers with different owners may never both see [`ClaimOutcome::Claimed`].
#[async_trait]
pub trait DedupLedger: Send + Sync {
    /// Insert a pending row, re-take our own pending row, or take over a
    /// pending row whose lease expired.
    async fn claim(&self, entry: &LedgerEntry) -> IdempotencyResult<ClaimOutcome>;

    /// Mark our pending claim as applied.
    ///
    /// Fails with [`IdempotencyError::ClaimLost`] when another owner took
    /// the claim over in the meantime.
    async fn complete(&self, entry: &LedgerEntry) -> IdempotencyResult<()>;

    /// Remove our pending claim whose apply did not complete.
    async fn release(&self, entry: &LedgerEntry) -> IdempotencyResult<()>;

    /// Check whether an event id has been applied.
    async fn is_processed(&self, event_id: &str) -> IdempotencyResult<bool>;
}

/// Validate event_id format
pub fn validate_event_id(event_id: &str) -> IdempotencyResult<()> {
    if event_id.is_empty() {
        return Err(IdempotencyError::InvalidEventId(
            "Event ID cannot be empty".to_string(),
        ));
    }

    if event_id.len() > MAX_EVENT_ID_LEN {
        return Err(IdempotencyError::InvalidEventId(format!(
            "Event ID too long: {} characters (max {})",
            event_id.len(),
            MAX_EVENT_ID_LEN
        )));
    }

    Ok(())
}

/// Whether a pending claim written at `claimed_at` has outlived `lease`
pub fn lease_expired(claimed_at: DateTime<Utc>, lease: Duration) -> bool {
    (Utc::now() - claimed_at)
        .to_std()
        .map(|age| age > lease)
        .unwrap_or(false)
}

fn cutoff(window: Duration, what: &str) -> IdempotencyResult<DateTime<Utc>> {
    let window = chrono::Duration::from_std(window)
        .map_err(|e| IdempotencyError::Other(anyhow::anyhow!("Invalid {}: {}", what, e)))?;
    Ok(Utc::now() - window)
}

/// PostgreSQL-backed ledger
///
/// Thread-safe and can be shared across partition workers using
/// `Arc<PgLedger>`; all state lives in the `processed_events` table.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
    retention_duration: Duration,
    lease: Duration,
}

impl PgLedger {
    /// Create a new ledger
    ///
    /// # Arguments
    ///
    /// * `pool` - PostgreSQL connection pool
    /// * `retention_duration` - How long to keep processed event IDs
    ///
    /// Retention must exceed the broker's topic retention, otherwise a
    /// replay from an old offset could re-apply events whose ledger rows
    /// were already cleaned up.
    pub fn new(pool: PgPool, retention_duration: Duration) -> Self {
        Self {
            pool,
            retention_duration,
            lease: DEFAULT_CLAIM_LEASE,
        }
    }

    /// Set how long a pending claim blocks other owners
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Delete old ledger rows to prevent unbounded growth
    ///
    /// Should be called periodically (e.g., hourly via a background task).
    ///
    /// # Returns
    ///
    /// Number of entries deleted
    pub async fn cleanup_old_events(&self) -> IdempotencyResult<u64> {
        let cutoff_time = cutoff(self.retention_duration, "retention duration")?;

        let result = sqlx::query(
            r#"
            DELETE FROM processed_events
            WHERE processed_at < $1
            "#,
        )
        .bind(cutoff_time)
        .execute(&self.pool)
        .await
        .context("Failed to cleanup old events")?;

        let deleted_count = result.rows_affected();

        if deleted_count > 0 {
            info!(
                deleted_count = deleted_count,
                cutoff_time = %cutoff_time,
                "Cleaned up old ledger entries"
            );
        } else {
            debug!("No old ledger entries to cleanup");
        }

        Ok(deleted_count)
    }
}

#[async_trait]
impl DedupLedger for PgLedger {
    /// A single upsert: the conflict branch only fires for a pending row that
    /// is ours or whose lease expired, so the unique index on event_id keeps
    /// the claim atomic.
    async fn claim(&self, entry: &LedgerEntry) -> IdempotencyResult<ClaimOutcome> {
        validate_event_id(&entry.event_id)?;
        let stale_before = cutoff(self.lease, "claim lease")?;

        let claimed = sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, topic, ts_ms, owner, completed, processed_at)
            VALUES ($1, $2, $3, $4, FALSE, $5)
            ON CONFLICT (event_id) DO UPDATE
                SET owner = EXCLUDED.owner, processed_at = EXCLUDED.processed_at
                WHERE processed_events.completed = FALSE
                  AND (processed_events.owner = EXCLUDED.owner
                       OR processed_events.processed_at < $6)
            RETURNING event_id
            "#,
        )
        .bind(&entry.event_id)
        .bind(&entry.source_topic)
        .bind(entry.ts_ms)
        .bind(&entry.owner)
        .bind(entry.processed_at)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            debug!(event_id = %entry.event_id, topic = %entry.source_topic, "Event claimed");
            return Ok(ClaimOutcome::Claimed);
        }

        let completed: Option<bool> =
            sqlx::query("SELECT completed FROM processed_events WHERE event_id = $1")
                .bind(&entry.event_id)
                .fetch_optional(&self.pool)
                .await?
                .map(|row| row.try_get::<bool, _>("completed"))
                .transpose()?;

        if completed == Some(true) {
            debug!(event_id = %entry.event_id, "Event already applied (duplicate)");
            Ok(ClaimOutcome::AlreadyProcessed)
        } else {
            debug!(event_id = %entry.event_id, "Event claim held by another owner");
            Ok(ClaimOutcome::InFlight)
        }
    }

    async fn complete(&self, entry: &LedgerEntry) -> IdempotencyResult<()> {
        validate_event_id(&entry.event_id)?;

        let result = sqlx::query(
            r#"
            UPDATE processed_events
            SET completed = TRUE, processed_at = NOW()
            WHERE event_id = $1 AND owner = $2
            "#,
        )
        .bind(&entry.event_id)
        .bind(&entry.owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IdempotencyError::ClaimLost(entry.event_id.clone()));
        }
        debug!(event_id = %entry.event_id, "Event claim completed");
        Ok(())
    }

    async fn release(&self, entry: &LedgerEntry) -> IdempotencyResult<()> {
        validate_event_id(&entry.event_id)?;

        sqlx::query(
            "DELETE FROM processed_events WHERE event_id = $1 AND owner = $2 AND completed = FALSE",
        )
        .bind(&entry.event_id)
        .bind(&entry.owner)
        .execute(&self.pool)
        .await?;

        debug!(event_id = %entry.event_id, "Event claim released");
        Ok(())
    }

    async fn is_processed(&self, event_id: &str) -> IdempotencyResult<bool> {
        validate_event_id(event_id)?;

        let result = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM processed_events WHERE event_id = $1 AND completed
            ) AS exists
            "#,
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;

        let exists: bool = result.try_get("exists")?;
        Ok(exists)
    }
}
