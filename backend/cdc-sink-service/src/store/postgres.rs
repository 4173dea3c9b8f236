use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{Postgres, Row};
use std::time::Duration;
use tracing::{debug, info};

use super::{column_list, Cell, StoreFamily, TableStore};
use crate::config::DbConfig;
use crate::error::StoreError;

/// Relational sink over a PostgreSQL pool
///
/// Table and column names come from the entity handlers, never from event
/// data; only values are bound as parameters.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the pool the way every service in the workspace does
    pub async fn connect(config: &DbConfig) -> Result<PgPool, StoreError> {
        debug!(
            "Creating database pool: max={}, min={}, acquire_timeout={}s",
            config.max_connections, config.min_connections, config.acquire_timeout_secs
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .test_before_acquire(true)
            .connect(&config.database_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!(
            "Database pool created: max_connections={}",
            config.max_connections
        );
        Ok(pool)
    }

    async fn execute(&self, table: &str, sql: &str, cells: &[&Cell]) -> Result<u64, StoreError> {
        let mut query = sqlx::query(sql);
        for cell in cells {
            query = bind_cell(query, cell);
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::write(table, e))?;
        Ok(result.rows_affected())
    }
}

fn bind_cell<'q>(
    query: Query<'q, Postgres, PgArguments>,
    cell: &Cell,
) -> Query<'q, Postgres, PgArguments> {
    match cell.clone() {
        Cell::Bool(v) => query.bind(v),
        Cell::Int(v) => query.bind(v),
        Cell::BigInt(v) => query.bind(v),
        Cell::Text(v) => query.bind(v),
        Cell::Uuid(v) => query.bind(v),
        Cell::Decimal(v) => query.bind(v),
        Cell::Date(v) => query.bind(v),
        Cell::Timestamp(v) => query.bind(v),
    }
}

/// `a = $n AND b = $n+1 ...` starting at placeholder `first`
fn predicate(columns: &[&str], first: usize, separator: &str) -> String {
    columns
        .iter()
        .enumerate()
        .map(|(i, name)| format!("{} = ${}", name, first + i))
        .collect::<Vec<_>>()
        .join(separator)
}

pub(crate) fn upsert_sql(table: &str, key: &[&str], values: &[&str]) -> String {
    let columns: Vec<&str> = key.iter().chain(values.iter()).copied().collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();

    let on_conflict = if values.is_empty() {
        "DO NOTHING".to_string()
    } else {
        let assignments: Vec<String> = values
            .iter()
            .map(|name| format!("{} = EXCLUDED.{}", name, name))
            .collect();
        format!("DO UPDATE SET {}", assignments.join(", "))
    };

    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
        table,
        columns.join(", "),
        placeholders.join(", "),
        key.join(", "),
        on_conflict
    )
}

pub(crate) fn update_sql(table: &str, key: &[&str], values: &[&str]) -> String {
    format!(
        "UPDATE {} SET {} WHERE {}",
        table,
        predicate(values, 1, ", "),
        predicate(key, values.len() + 1, " AND ")
    )
}

pub(crate) fn delete_sql(table: &str, key: &[&str]) -> String {
    format!("DELETE FROM {} WHERE {}", table, predicate(key, 1, " AND "))
}

pub(crate) fn select_sql(table: &str, key: &[&str], column: &str) -> String {
    format!(
        "SELECT {} FROM {} WHERE {}",
        column,
        table,
        predicate(key, 1, " AND ")
    )
}

#[async_trait]
impl TableStore for PgStore {
    fn family(&self) -> StoreFamily {
        StoreFamily::Relational
    }

    async fn upsert(
        &self,
        table: &str,
        key: &[(&str, Cell)],
        values: &[(&str, Cell)],
    ) -> Result<(), StoreError> {
        let sql = upsert_sql(table, &column_list(key), &column_list(values));
        let cells: Vec<&Cell> = key.iter().chain(values.iter()).map(|(_, c)| c).collect();
        self.execute(table, &sql, &cells).await?;
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
        let sql = update_sql(table, &column_list(key), &column_list(values));
        let cells: Vec<&Cell> = values.iter().chain(key.iter()).map(|(_, c)| c).collect();
        let affected = self.execute(table, &sql, &cells).await?;
        if affected == 0 {
            debug!(table = %table, "Update matched no rows");
        }
        Ok(())
    }

    async fn delete(&self, table: &str, key: &[(&str, Cell)]) -> Result<(), StoreError> {
        let sql = delete_sql(table, &column_list(key));
        let cells: Vec<&Cell> = key.iter().map(|(_, c)| c).collect();
        self.execute(table, &sql, &cells).await?;
        Ok(())
    }

    async fn read_texts(
        &self,
        table: &str,
        key: &[(&str, Cell)],
        column: &str,
    ) -> Result<Vec<String>, StoreError> {
        let sql = select_sql(table, &column_list(key), column);
        let mut query = sqlx::query(&sql);
        for (_, cell) in key {
            query = bind_cell(query, cell);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::read(table, e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>(column)
                    .map_err(|e| StoreError::read(table, e))
            })
            .collect()
    }
}
