//! Downstream table stores
//!
//! Each store family (wide-column, relational, in-memory) implements the same
//! small capability set so the entity handlers can stay store-agnostic. The
//! one thing handlers must ask about is the key layout: in the wide-column
//! schema the user's mutable `name` is a clustering column, in the relational
//! schema it is a plain column.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::fmt;
use uuid::Uuid;

use crate::error::StoreError;

mod memory;
mod postgres;
mod scylla;

pub use self::memory::{MemoryStore, WriteKind, WriteRecord};
pub use self::postgres::PgStore;
pub use self::scylla::{connect as connect_scylla, ScyllaLedger, ScyllaStore};

/// Typed column value bound into store statements
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Cell {
    Bool(bool),
    Int(i32),
    BigInt(i64),
    Text(String),
    Uuid(Uuid),
    Decimal(Decimal),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl Cell {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Bool(v) => write!(f, "{}", v),
            Cell::Int(v) => write!(f, "{}", v),
            Cell::BigInt(v) => write!(f, "{}", v),
            Cell::Text(v) => write!(f, "{}", v),
            Cell::Uuid(v) => write!(f, "{}", v),
            Cell::Decimal(v) => write!(f, "{}", v),
            Cell::Date(v) => write!(f, "{}", v),
            Cell::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

/// `(column, value)` pairs, in statement order
pub type Columns = Vec<(&'static str, Cell)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFamily {
    WideColumn,
    Relational,
}

impl fmt::Display for StoreFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreFamily::WideColumn => f.write_str("wide-column"),
            StoreFamily::Relational => f.write_str("relational"),
        }
    }
}

/// Parameterized write/read capability every sink store provides
///
/// All writes are upsert-shaped so replaying an event after a partial
/// failure converges to the same rows.
#[async_trait]
pub trait TableStore: Send + Sync {
    fn family(&self) -> StoreFamily;

    /// Whether mutable fields (the user's name) are part of the row key.
    fn keys_include_mutable_fields(&self) -> bool {
        self.family() == StoreFamily::WideColumn
    }

    /// Insert the row, replacing the non-key columns if the key exists.
    async fn upsert(
        &self,
        table: &str,
        key: &[(&str, Cell)],
        values: &[(&str, Cell)],
    ) -> Result<(), StoreError>;

    /// Set the given columns on the row identified by `key`.
    async fn update(
        &self,
        table: &str,
        key: &[(&str, Cell)],
        values: &[(&str, Cell)],
    ) -> Result<(), StoreError>;

    async fn delete(&self, table: &str, key: &[(&str, Cell)]) -> Result<(), StoreError>;

    /// Read a text column from every row matching a (partial) key.
    async fn read_texts(
        &self,
        table: &str,
        key: &[(&str, Cell)],
        column: &str,
    ) -> Result<Vec<String>, StoreError>;
}

pub(crate) fn column_list<'a>(columns: &[(&'a str, Cell)]) -> Vec<&'a str> {
    columns.iter().map(|(name, _)| *name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_display() {
        assert_eq!(Cell::Text("Bob".into()).to_string(), "Bob");
        assert_eq!(Cell::Int(3).to_string(), "3");
        assert_eq!(Cell::Decimal(Decimal::new(30000, 2)).to_string(), "300.00");
        assert_eq!(
            Cell::Date(NaiveDate::from_ymd_opt(2024, 8, 19).unwrap()).to_string(),
            "2024-08-19"
        );
    }

    #[test]
    fn test_key_layout_follows_family() {
        let wide = MemoryStore::new(StoreFamily::WideColumn);
        let relational = MemoryStore::new(StoreFamily::Relational);
        assert!(wide.keys_include_mutable_fields());
        assert!(!relational.keys_include_mutable_fields());
    }
}
