//! Wide-column sink and ledger over a Cassandra/ScyllaDB session

use ::scylla::frame::response::result::CqlValue;
use ::scylla::frame::value::{CqlDate, CqlDecimal, CqlTimestamp};
use ::scylla::query::Query;
use ::scylla::statement::{Consistency, SerialConsistency};
use ::scylla::{QueryResult, Session, SessionBuilder};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use idempotent_consumer::{
    lease_expired, validate_event_id, ClaimOutcome, DedupLedger, IdempotencyError,
    IdempotencyResult, LedgerEntry, DEFAULT_CLAIM_LEASE,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{column_list, Cell, StoreFamily, TableStore};
use crate::services::cdc::codec::{days_since_epoch, unscaled_to_be_bytes};
use crate::error::StoreError;

/// CQL `date` counts days with the epoch at 2^31
const CQL_DATE_EPOCH: i64 = 1 << 31;

pub async fn connect(hosts: &[String], keyspace: &str) -> Result<Arc<Session>, StoreError> {
    let session = SessionBuilder::new()
        .known_nodes(hosts)
        .connection_timeout(Duration::from_secs(5))
        .use_keyspace(keyspace, false)
        .build()
        .await
        .map_err(|e| StoreError::Connection(e.to_string()))?;

    info!(hosts = ?hosts, keyspace = %keyspace, "Connected to Cassandra");
    Ok(Arc::new(session))
}

fn to_cql(cell: &Cell) -> CqlValue {
    match cell {
        Cell::Bool(v) => CqlValue::Boolean(*v),
        Cell::Int(v) => CqlValue::Int(*v),
        Cell::BigInt(v) => CqlValue::BigInt(*v),
        Cell::Text(v) => CqlValue::Text(v.clone()),
        Cell::Uuid(v) => CqlValue::Uuid(*v),
        Cell::Decimal(v) => CqlValue::Decimal(CqlDecimal::from_signed_be_bytes_and_exponent(
            unscaled_to_be_bytes(v.mantissa()),
            v.scale() as i32,
        )),
        Cell::Date(v) => CqlValue::Date(CqlDate((days_since_epoch(*v) + CQL_DATE_EPOCH) as u32)),
        Cell::Timestamp(v) => CqlValue::Timestamp(CqlTimestamp(v.timestamp_millis())),
    }
}

fn bind(columns: &[&[(&str, Cell)]]) -> Vec<CqlValue> {
    columns
        .iter()
        .flat_map(|cols| cols.iter().map(|(_, cell)| to_cql(cell)))
        .collect()
}

fn where_clause(key: &[&str]) -> String {
    key.iter()
        .map(|name| format!("{} = ?", name))
        .collect::<Vec<_>>()
        .join(" AND ")
}

pub(crate) fn insert_cql(table: &str, key: &[&str], values: &[&str]) -> String {
    let columns: Vec<&str> = key.iter().chain(values.iter()).copied().collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        vec!["?"; columns.len()].join(", ")
    )
}

pub(crate) fn update_cql(table: &str, key: &[&str], values: &[&str]) -> String {
    let assignments: Vec<String> = values.iter().map(|name| format!("{} = ?", name)).collect();
    format!(
        "UPDATE {} SET {} WHERE {}",
        table,
        assignments.join(", "),
        where_clause(key)
    )
}

/// Wide-column sink; every statement runs at QUORUM
#[derive(Clone)]
pub struct ScyllaStore {
    session: Arc<Session>,
}

impl ScyllaStore {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    async fn run(&self, cql: String, values: Vec<CqlValue>) -> Result<QueryResult, String> {
        let mut query = Query::new(cql);
        query.set_consistency(Consistency::Quorum);
        self.session
            .query(query, values)
            .await
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl TableStore for ScyllaStore {
    fn family(&self) -> StoreFamily {
        StoreFamily::WideColumn
    }

    async fn upsert(
        &self,
        table: &str,
        key: &[(&str, Cell)],
        values: &[(&str, Cell)],
    ) -> Result<(), StoreError> {
        let cql = insert_cql(table, &column_list(key), &column_list(values));
        self.run(cql, bind(&[key, values]))
            .await
            .map_err(|e| StoreError::write(table, e))?;
        Ok(())
    }

    async fn update(
        &self,
        table: &str,
        key: &[(&str, Cell)],
        values: &[(&str, Cell)],
    ) -> Result<(), StoreError> {
        if values.is_empty() {
            return Err(StoreError::Statement {
                table: table.to_string(),
                message: "update without columns".to_string(),
            });
        }
        let cql = update_cql(table, &column_list(key), &column_list(values));
        self.run(cql, bind(&[values, key]))
            .await
            .map_err(|e| StoreError::write(table, e))?;
        Ok(())
    }

    async fn delete(&self, table: &str, key: &[(&str, Cell)]) -> Result<(), StoreError> {
        let cql = format!("DELETE FROM {} WHERE {}", table, where_clause(&column_list(key)));
        self.run(cql, bind(&[key]))
            .await
            .map_err(|e| StoreError::write(table, e))?;
        Ok(())
    }

    async fn read_texts(
        &self,
        table: &str,
        key: &[(&str, Cell)],
        column: &str,
    ) -> Result<Vec<String>, StoreError> {
        let cql = format!(
            "SELECT {} FROM {} WHERE {}",
            column,
            table,
            where_clause(&column_list(key))
        );
        let result = self
            .run(cql, bind(&[key]))
            .await
            .map_err(|e| StoreError::read(table, e))?;

        let rows = result.rows.unwrap_or_default();
        let mut texts = Vec::with_capacity(rows.len());
        for row in rows {
            match row.columns.into_iter().next().flatten() {
                Some(CqlValue::Text(s)) | Some(CqlValue::Ascii(s)) => texts.push(s),
                Some(other) => {
                    return Err(StoreError::read(
                        table,
                        format!("column '{}' is not text: {:?}", column, other),
                    ))
                }
                None => {}
            }
        }
        Ok(texts)
    }
}

/// `processed_events` ledger using lightweight transactions
///
/// Every write is conditional and runs at QUORUM with SERIAL consistency for
/// the Paxos round; rows expire after `ttl`. A pending row is only taken over
/// by its own owner or once `lease` has passed since it was written.
#[derive(Clone)]
pub struct ScyllaLedger {
    session: Arc<Session>,
    ttl: Duration,
    lease: Duration,
}

/// Claim state read back from `processed_events`
#[derive(Debug, Default, PartialEq)]
struct ClaimRow {
    owner: String,
    completed: bool,
    processed_at: Option<DateTime<Utc>>,
}

impl ClaimRow {
    /// Columns in `SELECT owner, completed, processed_at` order
    fn from_columns(columns: Vec<Option<CqlValue>>) -> Self {
        let mut columns = columns
            .into_iter()
            .map(|col| col.unwrap_or(CqlValue::Empty));
        let owner = match columns.next() {
            Some(CqlValue::Text(owner)) => owner,
            _ => String::new(),
        };
        let completed = matches!(columns.next(), Some(CqlValue::Boolean(true)));
        let processed_at = match columns.next() {
            Some(CqlValue::Timestamp(CqlTimestamp(ms))) => Utc.timestamp_millis_opt(ms).single(),
            _ => None,
        };
        Self {
            owner,
            completed,
            processed_at,
        }
    }
}

impl ScyllaLedger {
    pub fn new(session: Arc<Session>, ttl: Duration) -> Self {
        Self {
            session,
            ttl,
            lease: DEFAULT_CLAIM_LEASE,
        }
    }

    /// Set how long a pending claim blocks other owners
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn lwt(cql: String) -> Query {
        let mut query = Query::new(cql);
        query.set_consistency(Consistency::Quorum);
        query.set_serial_consistency(Some(SerialConsistency::Serial));
        query
    }

    async fn execute(
        &self,
        query: Query,
        values: Vec<CqlValue>,
    ) -> IdempotencyResult<QueryResult> {
        self.session
            .query(query, values)
            .await
            .map_err(|e| IdempotencyError::Backend(e.to_string()))
    }

    async fn read_claim(&self, event_id: &str) -> IdempotencyResult<Option<ClaimRow>> {
        let mut query = Query::new(
            "SELECT owner, completed, processed_at FROM processed_events WHERE event_id = ?"
                .to_string(),
        );
        query.set_consistency(Consistency::Serial);

        let result = self
            .execute(query, vec![CqlValue::Text(event_id.to_string())])
            .await?;

        Ok(result
            .rows
            .and_then(|rows| rows.into_iter().next())
            .map(|row| ClaimRow::from_columns(row.columns)))
    }

    /// Move a pending row from `previous_owner` to `entry.owner`
    async fn take_over(
        &self,
        entry: &LedgerEntry,
        previous_owner: &str,
    ) -> IdempotencyResult<bool> {
        let cql = format!(
            "UPDATE processed_events USING TTL {} SET owner = ?, processed_at = ? \
             WHERE event_id = ? IF owner = ? AND completed = false",
            self.ttl.as_secs()
        );
        let values = vec![
            CqlValue::Text(entry.owner.clone()),
            CqlValue::Timestamp(CqlTimestamp(entry.processed_at.timestamp_millis())),
            CqlValue::Text(entry.event_id.clone()),
            CqlValue::Text(previous_owner.to_string()),
        ];

        let result = self.execute(Self::lwt(cql), values).await?;
        applied_flag(&result)
    }
}

/// First column of an LWT result is the `[applied]` flag
fn applied_flag(result: &QueryResult) -> IdempotencyResult<bool> {
    let value = result
        .rows
        .as_ref()
        .and_then(|rows| rows.first())
        .and_then(|row| row.columns.first())
        .and_then(|col| col.as_ref());

    match value {
        Some(CqlValue::Boolean(applied)) => Ok(*applied),
        other => Err(IdempotencyError::Backend(format!(
            "LWT result has no [applied] flag: {:?}",
            other
        ))),
    }
}

#[async_trait]
impl DedupLedger for ScyllaLedger {
    async fn claim(&self, entry: &LedgerEntry) -> IdempotencyResult<ClaimOutcome> {
        validate_event_id(&entry.event_id)?;

        let cql = format!(
            "INSERT INTO processed_events (event_id, topic, ts_ms, owner, completed, processed_at) \
             VALUES (?, ?, ?, ?, false, ?) IF NOT EXISTS USING TTL {}",
            self.ttl.as_secs()
        );
        let values = vec![
            CqlValue::Text(entry.event_id.clone()),
            CqlValue::Text(entry.source_topic.clone()),
            CqlValue::BigInt(entry.ts_ms),
            CqlValue::Text(entry.owner.clone()),
            CqlValue::Timestamp(CqlTimestamp(entry.processed_at.timestamp_millis())),
        ];

        let result = self.execute(Self::lwt(cql), values).await?;
        if applied_flag(&result)? {
            debug!(event_id = %entry.event_id, "Event claimed");
            return Ok(ClaimOutcome::Claimed);
        }

        // The row may have expired or been released since the insert lost
        let Some(row) = self.read_claim(&entry.event_id).await? else {
            return Ok(ClaimOutcome::InFlight);
        };

        if row.completed {
            debug!(event_id = %entry.event_id, "Event already applied (duplicate)");
            return Ok(ClaimOutcome::AlreadyProcessed);
        }

        let stale = row
            .processed_at
            .map(|at| lease_expired(at, self.lease))
            .unwrap_or(true);
        if (row.owner == entry.owner || stale) && self.take_over(entry, &row.owner).await? {
            debug!(
                event_id = %entry.event_id,
                previous_owner = %row.owner,
                "Pending claim taken over"
            );
            return Ok(ClaimOutcome::Claimed);
        }

        debug!(event_id = %entry.event_id, owner = %row.owner, "Event claim held by another owner");
        Ok(ClaimOutcome::InFlight)
    }

    async fn complete(&self, entry: &LedgerEntry) -> IdempotencyResult<()> {
        validate_event_id(&entry.event_id)?;

        let cql = format!(
            "UPDATE processed_events USING TTL {} SET completed = true, processed_at = ? \
             WHERE event_id = ? IF owner = ?",
            self.ttl.as_secs()
        );
        let values = vec![
            CqlValue::Timestamp(CqlTimestamp(Utc::now().timestamp_millis())),
            CqlValue::Text(entry.event_id.clone()),
            CqlValue::Text(entry.owner.clone()),
        ];

        let result = self.execute(Self::lwt(cql), values).await?;
        if !applied_flag(&result)? {
            return Err(IdempotencyError::ClaimLost(entry.event_id.clone()));
        }

        debug!(event_id = %entry.event_id, "Event claim completed");
        Ok(())
    }

    async fn release(&self, entry: &LedgerEntry) -> IdempotencyResult<()> {
        validate_event_id(&entry.event_id)?;

        self.execute(
            Self::lwt(
                "DELETE FROM processed_events WHERE event_id = ? IF owner = ? AND completed = false"
                    .to_string(),
            ),
            vec![
                CqlValue::Text(entry.event_id.clone()),
                CqlValue::Text(entry.owner.clone()),
            ],
        )
        .await?;

        debug!(event_id = %entry.event_id, "Event claim released");
        Ok(())
    }

    async fn is_processed(&self, event_id: &str) -> IdempotencyResult<bool> {
        validate_event_id(event_id)?;

        Ok(self
            .read_claim(event_id)
            .await?
            .map(|row| row.completed)
            .unwrap_or(false))
    }
}
