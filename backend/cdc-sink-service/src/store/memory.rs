//! In-process store used by tests and dry runs
//!
//! Emulates either key layout, records every write in order and can be told
//! to fail upcoming writes to a table.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Cell, StoreFamily, TableStore};
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    Upsert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub kind: WriteKind,
    pub table: String,
    pub key: Vec<(String, Cell)>,
    pub values: Vec<(String, Cell)>,
}

type StoredRow = BTreeMap<String, Cell>;
type RowKey = Vec<(String, Cell)>;

#[derive(Clone)]
pub struct MemoryStore {
    family: StoreFamily,
    tables: Arc<DashMap<String, HashMap<RowKey, StoredRow>>>,
    writes: Arc<Mutex<Vec<WriteRecord>>>,
    /// Remaining injected failures per (table, kind)
    faults: Arc<DashMap<(String, WriteKind), u32>>,
    latency: Option<Duration>,
}

impl MemoryStore {
    pub fn new(family: StoreFamily) -> Self {
        Self {
            family,
            tables: Arc::new(DashMap::new()),
            writes: Arc::new(Mutex::new(Vec::new())),
            faults: Arc::new(DashMap::new()),
            latency: None,
        }
    }

    /// Sleep before every operation
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next `times` writes of `kind` to `table` fail.
    pub fn fail_next(&self, table: &str, kind: WriteKind, times: u32) {
        self.faults.insert((table.to_string(), kind), times);
    }

    /// All rows currently in `table`, each as a column map
    pub fn rows(&self, table: &str) -> Vec<BTreeMap<String, Cell>> {
        self.tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    pub fn writes_to(&self, table: &str) -> Vec<WriteRecord> {
        self.writes()
            .into_iter()
            .filter(|w| w.table == table)
            .collect()
    }

    async fn before_write(
        &self,
        kind: WriteKind,
        table: &str,
        key: &[(&str, Cell)],
        values: &[(&str, Cell)],
    ) -> Result<(), StoreError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let fault_key = (table.to_string(), kind);
        let injected = match self.faults.get_mut(&fault_key) {
            Some(mut remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        if injected {
            return Err(StoreError::write(table, "injected failure"));
        }

        if let Ok(mut log) = self.writes.lock() {
            log.push(WriteRecord {
                kind,
                table: table.to_string(),
                key: owned(key),
                values: owned(values),
            });
        }
        Ok(())
    }
}

fn owned(columns: &[(&str, Cell)]) -> Vec<(String, Cell)> {
    columns
        .iter()
        .map(|(name, cell)| (name.to_string(), cell.clone()))
        .collect()
}

fn matches_key(row: &StoredRow, key: &[(&str, Cell)]) -> bool {
    key.iter().all(|(name, cell)| row.get(*name) == Some(cell))
}

#[async_trait]
impl TableStore for MemoryStore {
    fn family(&self) -> StoreFamily {
        self.family
    }

    async fn upsert(
        &self,
        table: &str,
        key: &[(&str, Cell)],
        values: &[(&str, Cell)],
    ) -> Result<(), StoreError> {
        self.before_write(WriteKind::Upsert, table, key, values)
            .await?;

        let mut rows = self.tables.entry(table.to_string()).or_default();
        let row = rows.entry(owned(key)).or_default();
        for (name, cell) in key.iter().chain(values.iter()) {
            row.insert(name.to_string(), cell.clone());
        }
        Ok(())
    }

    async fn update(
        &self,
        table: &str,
        key: &[(&str, Cell)],
        values: &[(&str, Cell)],
    ) -> Result<(), StoreError> {
        self.before_write(WriteKind::Update, table, key, values)
            .await?;

        let mut rows = self.tables.entry(table.to_string()).or_default();
        let row = match self.family {
            // CQL UPDATE creates the row when it is missing
            StoreFamily::WideColumn => Some(rows.entry(owned(key)).or_default()),
            StoreFamily::Relational => rows.get_mut(&owned(key)),
        };
        if let Some(row) = row {
            for (name, cell) in key.iter().chain(values.iter()) {
                row.insert(name.to_string(), cell.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, table: &str, key: &[(&str, Cell)]) -> Result<(), StoreError> {
        self.before_write(WriteKind::Delete, table, key, &[])
            .await?;

        if let Some(mut rows) = self.tables.get_mut(table) {
            rows.retain(|_, row| !matches_key(row, key));
        }
        Ok(())
    }

    async fn read_texts(
        &self,
        table: &str,
        key: &[(&str, Cell)],
        column: &str,
    ) -> Result<Vec<String>, StoreError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let Some(rows) = self.tables.get(table) else {
            return Ok(Vec::new());
        };
        let mut texts: Vec<String> = rows
            .values()
            .filter(|row| matches_key(row, key))
            .filter_map(|row| row.get(column).and_then(Cell::as_text).map(str::to_string))
            .collect();
        texts.sort();
        Ok(texts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_merges_by_key() {
        let store = MemoryStore::new(StoreFamily::Relational);
        let key = [("id", Cell::Int(1))];

        store
            .upsert("users", &key, &[("name", Cell::Text("Alice".into()))])
            .await
            .unwrap();
        store
            .upsert("users", &key, &[("name", Cell::Text("Bob".into()))])
            .await
            .unwrap();

        let rows = store.rows("users");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&Cell::Text("Bob".into())));
    }

    #[tokio::test]
    async fn test_update_missing_row_depends_on_family() {
        let key = [("id", Cell::Int(1))];
        let values = [("status", Cell::Text("shipped".into()))];

        let relational = MemoryStore::new(StoreFamily::Relational);
        relational.update("orders", &key, &values).await.unwrap();
        assert!(relational.rows("orders").is_empty());

        let wide = MemoryStore::new(StoreFamily::WideColumn);
        wide.update("orders", &key, &values).await.unwrap();
        assert_eq!(wide.rows("orders").len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed() {
        let store = MemoryStore::new(StoreFamily::WideColumn);
        store.fail_next("orders", WriteKind::Upsert, 1);
        let key = [("order_id", Cell::Int(1))];

        assert!(store.upsert("orders", &key, &[]).await.is_err());
        assert!(store.upsert("orders", &key, &[]).await.is_ok());
        assert_eq!(store.writes_to("orders").len(), 1);
    }

    #[tokio::test]
    async fn test_read_texts_by_partial_key() {
        let store = MemoryStore::new(StoreFamily::WideColumn);
        for name in ["Bob", "Alice"] {
            store
                .upsert(
                    "users",
                    &[("id", Cell::Int(7)), ("name", Cell::Text(name.into()))],
                    &[],
                )
                .await
                .unwrap();
        }

        let names = store
            .read_texts("users", &[("id", Cell::Int(7))], "name")
            .await
            .unwrap();
        assert_eq!(names, vec!["Alice".to_string(), "Bob".to_string()]);

        store
            .delete(
                "users",
                &[("id", Cell::Int(7)), ("name", Cell::Text("Alice".into()))],
            )
            .await
            .unwrap();
        assert_eq!(store.rows("users").len(), 1);
    }
}
