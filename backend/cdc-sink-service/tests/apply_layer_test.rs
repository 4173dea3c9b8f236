//! Apply layer behaviour against in-memory stores and ledgers
mod common;

use async_trait::async_trait;
use cdc_sink_service::error::ApplyError;
use cdc_sink_service::services::apply::{ApplyLayer, ApplyOutcome, Sink};
use cdc_sink_service::services::cdc::decode;
use cdc_sink_service::store::{Cell, MemoryStore, StoreFamily, WriteKind};
use common::{envelope, order_row, user_row, Harness, USER_ID};
use idempotent_consumer::{
    ClaimOutcome, DedupLedger, IdempotencyError, IdempotencyResult, LedgerEntry, MemoryLedger,
};
use mockall::mock;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const USERS_TOPIC: &str = "cdc.public.users";
const ORDERS_TOPIC: &str = "cdc.public.orders";

mock! {
    pub Ledger {}

    #[async_trait]
    impl DedupLedger for Ledger {
        async fn claim(&self, entry: &LedgerEntry) -> IdempotencyResult<ClaimOutcome>;
        async fn complete(&self, entry: &LedgerEntry) -> IdempotencyResult<()>;
        async fn release(&self, entry: &LedgerEntry) -> IdempotencyResult<()>;
        async fn is_processed(&self, event_id: &str) -> IdempotencyResult<bool>;
    }
}

/// Shared ledger whose release always fails, as when the ledger store
/// becomes unreachable right after a failed apply
struct UnreleasableLedger(MemoryLedger);

#[async_trait]
impl DedupLedger for UnreleasableLedger {
    async fn claim(&self, entry: &LedgerEntry) -> IdempotencyResult<ClaimOutcome> {
        self.0.claim(entry).await
    }

    async fn complete(&self, entry: &LedgerEntry) -> IdempotencyResult<()> {
        self.0.complete(entry).await
    }

    async fn release(&self, _entry: &LedgerEntry) -> IdempotencyResult<()> {
        Err(IdempotencyError::Backend("connection reset".into()))
    }

    async fn is_processed(&self, event_id: &str) -> IdempotencyResult<bool> {
        self.0.is_processed(event_id).await
    }
}

#[tokio::test]
async fn test_redelivered_event_is_applied_once() {
    let h = Harness::new(StoreFamily::WideColumn);
    let event = decode(&envelope("c", user_row("Alice"), 501, 9001)).unwrap();

    assert_eq!(
        h.layer.apply(USERS_TOPIC, &event).await.unwrap(),
        ApplyOutcome::Applied
    );
    let writes_after_first = h.store.writes().len();

    // Same bytes delivered again after a crash before commit
    let again = decode(&envelope("c", user_row("Alice"), 501, 9001)).unwrap();
    assert_eq!(again.event_id, event.event_id);
    assert_eq!(
        h.layer.apply(USERS_TOPIC, &again).await.unwrap(),
        ApplyOutcome::Duplicate
    );

    assert_eq!(h.store.writes().len(), writes_after_first);
    assert_eq!(h.store.rows("users").len(), 1);
    assert_eq!(h.ledger.len(), 1);
}

#[tokio::test]
async fn test_rename_moves_wide_column_row() {
    let h = Harness::new(StoreFamily::WideColumn);

    let create = decode(&envelope("c", user_row("Alice"), 501, 9001)).unwrap();
    let rename = decode(&envelope("u", user_row("Bob"), 502, 9002)).unwrap();
    h.layer.apply(USERS_TOPIC, &create).await.unwrap();
    h.layer.apply(USERS_TOPIC, &rename).await.unwrap();

    let rows = h.store.rows("users");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], Cell::Text("Bob".into()));
    assert_eq!(rows[0]["is_deleted"], Cell::Bool(false));

    let deletes = h.store.writes_to("users");
    assert!(deletes
        .iter()
        .any(|w| w.kind == WriteKind::Delete
            && w.key.contains(&("name".to_string(), Cell::Text("Alice".into())))));
}

#[tokio::test]
async fn test_rename_updates_relational_row_in_place() {
    let h = Harness::new(StoreFamily::Relational);

    h.layer
        .apply(USERS_TOPIC, &decode(&envelope("c", user_row("Alice"), 501, 9001)).unwrap())
        .await
        .unwrap();
    h.layer
        .apply(USERS_TOPIC, &decode(&envelope("u", user_row("Bob"), 502, 9002)).unwrap())
        .await
        .unwrap();

    let rows = h.store.rows("users");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], Cell::Text("Bob".into()));
    assert!(h
        .store
        .writes_to("users")
        .iter()
        .all(|w| w.kind != WriteKind::Delete));
}

#[tokio::test]
async fn test_soft_delete_flags_existing_row() {
    let h = Harness::new(StoreFamily::WideColumn);
    h.layer
        .apply(USERS_TOPIC, &decode(&envelope("c", user_row("Alice"), 501, 9001)).unwrap())
        .await
        .unwrap();

    let mut deleted = user_row("Alice");
    deleted["is_deleted"] = true.into();
    let outcome = h
        .layer
        .apply(USERS_TOPIC, &decode(&envelope("u", deleted, 503, 9003)).unwrap())
        .await
        .unwrap();

    assert_eq!(outcome, ApplyOutcome::Applied);
    let rows = h.store.rows("users");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["is_deleted"], Cell::Bool(true));
    // Soft delete never touches the creation fields
    assert_eq!(h.store.writes_to("users").last().unwrap().values.len(), 2);
}

#[tokio::test]
async fn test_order_fans_out_to_both_tables() {
    let h = Harness::new(StoreFamily::WideColumn);
    let total = Decimal::from_str("149.97").unwrap();

    h.layer
        .apply(ORDERS_TOPIC, &decode(&envelope("c", order_row("PLACED", total), 700, 42)).unwrap())
        .await
        .unwrap();

    let by_order = h.store.rows("orders");
    let by_user = h.store.rows("orders_by_user");
    assert_eq!(by_order.len(), 1);
    assert_eq!(by_user.len(), 1);
    assert_eq!(by_order[0], by_user[0]);
    assert_eq!(by_order[0]["total_amount"], Cell::Decimal(total));
    assert_eq!(
        by_user[0]["user_id"],
        Cell::Uuid(uuid::Uuid::parse_str(USER_ID).unwrap())
    );
}

#[tokio::test]
async fn test_failed_secondary_write_releases_claim() {
    let h = Harness::new(StoreFamily::WideColumn);
    h.store.fail_next("orders_by_user", WriteKind::Upsert, 1);
    let event = decode(&envelope(
        "c",
        order_row("PLACED", Decimal::from_str("10.00").unwrap()),
        700,
        42,
    ))
    .unwrap();

    let err = h.layer.apply(ORDERS_TOPIC, &event).await.unwrap_err();
    assert!(matches!(err, ApplyError::Store { ref sink, .. } if sink == "primary"));
    assert!(err.is_retryable());
    assert!(h.ledger.is_empty());

    // The retry re-applies both tables
    assert_eq!(
        h.layer.apply(ORDERS_TOPIC, &event).await.unwrap(),
        ApplyOutcome::Applied
    );
    assert_eq!(h.store.rows("orders").len(), 1);
    assert_eq!(h.store.rows("orders_by_user").len(), 1);
    assert_eq!(h.ledger.len(), 1);
}

#[tokio::test]
async fn test_multi_sink_retry_only_reapplies_failed_sink() {
    let wide = MemoryStore::new(StoreFamily::WideColumn);
    let relational = MemoryStore::new(StoreFamily::Relational);
    let wide_ledger = Arc::new(MemoryLedger::new());
    let relational_ledger = Arc::new(MemoryLedger::new());
    let layer = ApplyLayer::new(vec![
        Sink::new("cassandra", Arc::new(wide.clone()), wide_ledger.clone()),
        Sink::new("postgres", Arc::new(relational.clone()), relational_ledger.clone()),
    ]);

    relational.fail_next("users", WriteKind::Upsert, 1);
    let event = decode(&envelope("c", user_row("Alice"), 501, 9001)).unwrap();

    let err = layer.apply(USERS_TOPIC, &event).await.unwrap_err();
    assert!(matches!(err, ApplyError::Store { ref sink, .. } if sink == "postgres"));
    assert_eq!(wide_ledger.len(), 1);
    assert!(relational_ledger.is_empty());

    assert_eq!(
        layer.apply(USERS_TOPIC, &event).await.unwrap(),
        ApplyOutcome::Applied
    );
    assert_eq!(wide.writes_to("users").len(), 1);
    assert_eq!(relational.rows("users").len(), 1);
    assert_eq!(relational_ledger.len(), 1);

    assert_eq!(
        layer.apply(USERS_TOPIC, &event).await.unwrap(),
        ApplyOutcome::Duplicate
    );
}

#[tokio::test]
async fn test_unroutable_and_read_only_events() {
    let h = Harness::new(StoreFamily::WideColumn);

    let event = decode(&envelope("c", user_row("Alice"), 501, 9001)).unwrap();
    assert!(matches!(
        h.layer.apply("cdc.public.payments", &event).await,
        Err(ApplyError::UnknownTopic(_))
    ));

    let snapshot = decode(&envelope("r", user_row("Alice"), 501, 9001)).unwrap();
    assert_eq!(
        h.layer.apply(USERS_TOPIC, &snapshot).await.unwrap(),
        ApplyOutcome::Skipped
    );

    assert!(h.ledger.is_empty());
    assert!(h.store.writes().is_empty());
}

#[tokio::test]
async fn test_missing_required_field_is_permanent() {
    let h = Harness::new(StoreFamily::WideColumn);
    let mut row = user_row("Alice");
    row.as_object_mut().unwrap().remove("id");

    let err = h
        .layer
        .apply(USERS_TOPIC, &decode(&envelope("c", row, 501, 9001)).unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, ApplyError::MissingField { ref field, .. } if field == "id"));
    assert!(!err.is_retryable());
    assert!(h.ledger.is_empty());
}

#[tokio::test]
async fn test_failed_release_does_not_hide_event_from_retry() {
    let store = MemoryStore::new(StoreFamily::WideColumn);
    store.fail_next("users", WriteKind::Upsert, 1);
    let event = decode(&envelope("c", user_row("Alice"), 501, 9001)).unwrap();

    let mut ledger = MockLedger::new();
    let expected_id = event.event_id.clone();
    ledger
        .expect_claim()
        .withf(move |entry| entry.event_id == expected_id && entry.owner == "process-a")
        .times(2)
        .returning(|_| Ok(ClaimOutcome::Claimed));
    ledger
        .expect_release()
        .times(1)
        .returning(|_| Err(IdempotencyError::Backend("connection reset".into())));
    ledger.expect_complete().times(1).returning(|_| Ok(()));

    let layer = ApplyLayer::with_owner(
        vec![Sink::new("cassandra", Arc::new(store.clone()), Arc::new(ledger))],
        "process-a",
    );

    // The store error surfaces even though the release failed too
    let err = layer.apply(USERS_TOPIC, &event).await.unwrap_err();
    assert!(matches!(err, ApplyError::Store { ref sink, .. } if sink == "cassandra"));
    assert!(err.is_retryable());

    assert_eq!(
        layer.apply(USERS_TOPIC, &event).await.unwrap(),
        ApplyOutcome::Applied
    );
    assert_eq!(store.rows("users").len(), 1);
}

#[tokio::test]
async fn test_abandoned_claim_is_applied_after_restart() {
    let shared = MemoryLedger::new().with_lease(Duration::from_millis(50));
    let event = decode(&envelope("c", user_row("Alice"), 501, 9001)).unwrap();

    // First process: apply fails, release fails, then the process exits
    let failing_store = MemoryStore::new(StoreFamily::WideColumn);
    failing_store.fail_next("users", WriteKind::Upsert, 1);
    let crashed = ApplyLayer::with_owner(
        vec![Sink::new(
            "cassandra",
            Arc::new(failing_store),
            Arc::new(UnreleasableLedger(shared.clone())),
        )],
        "process-a",
    );
    assert!(crashed.apply(USERS_TOPIC, &event).await.is_err());
    drop(crashed);
    assert!(shared.is_pending(&event.event_id));

    // Restarted process gets a fresh owner token
    let store = MemoryStore::new(StoreFamily::WideColumn);
    let restarted = ApplyLayer::new(vec![Sink::new(
        "cassandra",
        Arc::new(store.clone()),
        Arc::new(shared.clone()),
    )]);

    let err = restarted.apply(USERS_TOPIC, &event).await.unwrap_err();
    assert!(matches!(err, ApplyError::ClaimInFlight { .. }));
    assert!(err.is_retryable());
    assert!(store.writes().is_empty());

    tokio::time::sleep(Duration::from_millis(80)).await;

    assert_eq!(
        restarted.apply(USERS_TOPIC, &event).await.unwrap(),
        ApplyOutcome::Applied
    );
    assert_eq!(store.rows("users").len(), 1);
    assert!(shared.is_processed(&event.event_id).await.unwrap());
}
