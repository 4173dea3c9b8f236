//! Shared fixtures for the CDC sink integration tests
#![allow(dead_code)]

use cdc_sink_service::services::apply::{ApplyLayer, Sink};
use cdc_sink_service::services::cdc::codec::encode_decimal;
use cdc_sink_service::services::pipeline::InboundMessage;
use cdc_sink_service::store::{MemoryStore, StoreFamily};
use idempotent_consumer::MemoryLedger;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;

pub const USER_ID: &str = "6f1c1a9e-3a52-4c1e-9d4a-2f8b6c0d1e11";
pub const ORDER_ID: &str = "0b7e4f0e-8a3c-4bb1-9c55-1d2e3f4a5b6c";

/// Debezium envelope with transaction metadata in the source block
pub fn envelope(op: &str, after: Value, tx_id: i64, lsn: i64) -> Vec<u8> {
    json!({
        "schema": {},
        "payload": {
            "before": null,
            "after": after,
            "source": {
                "connector": "postgresql",
                "table": "unused",
                "txId": tx_id,
                "lsn": lsn,
                "ts_us": lsn * 10
            },
            "op": op,
            "ts_ms": 1_724_025_600_000i64 + lsn
        }
    })
    .to_string()
    .into_bytes()
}

pub fn user_row(name: &str) -> Value {
    json!({
        "id": USER_ID,
        "name": name,
        "dob": 7300,
        "created_at": "2024-08-19T10:00:00Z",
        "modified_at": "2024-08-19T11:00:00Z",
        "is_deleted": false
    })
}

pub fn order_row(status: &str, total: Decimal) -> Value {
    json!({
        "id": ORDER_ID,
        "user_id": USER_ID,
        "status": status,
        "quantity": 3,
        "total_amount": encode_decimal(total, 2),
        "placed_at": "2024-08-19T10:05:00Z",
        "modified_at": "2024-08-19T10:30:00Z",
        "is_deleted": false
    })
}

pub fn message(topic: &str, partition: i32, offset: i64, payload: Vec<u8>) -> InboundMessage {
    InboundMessage {
        topic: topic.to_string(),
        partition,
        offset,
        key: None,
        payload: Some(payload),
    }
}

/// A store plus the ledger guarding it, wired as a single-sink apply layer
pub struct Harness {
    pub store: MemoryStore,
    pub ledger: Arc<MemoryLedger>,
    pub layer: Arc<ApplyLayer>,
}

impl Harness {
    pub fn new(family: StoreFamily) -> Self {
        Self::with_store(MemoryStore::new(family))
    }

    pub fn with_store(store: MemoryStore) -> Self {
        let ledger = Arc::new(MemoryLedger::new());
        let layer = Arc::new(ApplyLayer::new(vec![Sink::new(
            "primary",
            Arc::new(store.clone()),
            ledger.clone(),
        )]));
        Self {
            store,
            ledger,
            layer,
        }
    }
}
