use tracing::debug;

use super::{RowReader, Sink};
use crate::error::ApplyError;
use crate::services::cdc::{ChangeEvent, ChangeOp};
use crate::store::{Cell, Columns};

const USERS: &str = "users";

/// `(id)` for relational stores, `(id, name)` where name is a clustering column
fn user_key(wide: bool, id: Cell, name: &str) -> Columns {
    let mut key = vec![("id", id)];
    if wide {
        key.push(("name", Cell::Text(name.to_string())));
    }
    key
}

pub(super) async fn apply(sink: &Sink, event: &ChangeEvent) -> Result<(), ApplyError> {
    let store = sink.store.as_ref();
    let wide = store.keys_include_mutable_fields();
    let row = RowReader::new("user", &event.row);

    let id = Cell::Uuid(row.uuid("id")?);
    let name = row.text("name")?;

    match event.op {
        ChangeOp::Create => {
            let mut values = Columns::new();
            if !wide {
                values.push(("name", Cell::Text(name.to_string())));
            }
            values.push(("dob", Cell::Date(row.date("dob")?)));
            values.push(("created_at", Cell::Timestamp(row.timestamp("created_at")?)));
            values.push(("is_deleted", Cell::Bool(false)));

            store
                .upsert(USERS, &user_key(wide, id, name), &values)
                .await
                .map_err(|e| sink.store_error(e))
        }

        ChangeOp::Update => {
            let modified_at = Cell::Timestamp(row.timestamp("modified_at")?);

            // Soft delete touches only the flag and timestamp of the current row.
            if row.bool_or("is_deleted", false)? {
                let values = vec![("modified_at", modified_at), ("is_deleted", Cell::Bool(true))];
                return store
                    .update(USERS, &user_key(wide, id, name), &values)
                    .await
                    .map_err(|e| sink.store_error(e));
            }

            let mut values = Columns::new();
            if !wide {
                values.push(("name", Cell::Text(name.to_string())));
            }
            values.push(("dob", Cell::Date(row.date("dob")?)));
            values.push(("created_at", Cell::Timestamp(row.timestamp("created_at")?)));
            values.push(("modified_at", modified_at));
            values.push(("is_deleted", Cell::Bool(false)));

            if !wide {
                return store
                    .upsert(USERS, &user_key(wide, id, name), &values)
                    .await
                    .map_err(|e| sink.store_error(e));
            }

            // The name is part of the key: write the new row, then drop any
            // row stored under a different name.
            let stored_names = store
                .read_texts(USERS, &[("id", id.clone())], "name")
                .await
                .map_err(|e| sink.store_error(e))?;

            store
                .upsert(USERS, &user_key(wide, id.clone(), name), &values)
                .await
                .map_err(|e| sink.store_error(e))?;

            for old_name in stored_names.iter().filter(|n| n.as_str() != name) {
                debug!(
                    user_id = %id,
                    old_name = %old_name,
                    new_name = %name,
                    "Removing renamed user row"
                );
                store
                    .delete(USERS, &user_key(wide, id.clone(), old_name))
                    .await
                    .map_err(|e| sink.store_error(e))?;
            }
            Ok(())
        }

        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cdc::{FieldValue, Row};
    use crate::store::{MemoryStore, StoreFamily, WriteKind};
    use idempotent_consumer::MemoryLedger;
    use std::sync::Arc;

    const USER_ID: &str = "5b1c3f5e-8d2a-4a7e-9b1e-2f3c4d5e6f70";

    fn sink(store: &MemoryStore) -> Sink {
        Sink::new("memory", Arc::new(store.clone()), Arc::new(MemoryLedger::new()))
    }

    fn event(op: ChangeOp, name: &str, is_deleted: bool) -> ChangeEvent {
        let mut row = Row::new();
        row.insert("id".into(), FieldValue::Text(USER_ID.into()));
        row.insert("name".into(), FieldValue::Text(name.into()));
        row.insert("dob".into(), FieldValue::Int(10957));
        row.insert("created_at".into(), FieldValue::Text("2024-08-28T16:02:58Z".into()));
        row.insert("modified_at".into(), FieldValue::Text("2024-08-29T09:00:00Z".into()));
        row.insert("is_deleted".into(), FieldValue::Bool(is_deleted));
        ChangeEvent {
            op,
            row,
            ts_ms: 1,
            event_id: "[1]".into(),
        }
    }

    #[tokio::test]
    async fn test_rename_on_wide_column_replaces_row() {
        let store = MemoryStore::new(StoreFamily::WideColumn);
        let sink = sink(&store);

        apply(&sink, &event(ChangeOp::Create, "Alice", false)).await.unwrap();
        apply(&sink, &event(ChangeOp::Update, "Bob", false)).await.unwrap();

        let rows = store.rows(USERS);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&Cell::Text("Bob".into())));
        assert_eq!(store.writes_to(USERS).last().map(|w| w.kind), Some(WriteKind::Delete));
    }

    #[tokio::test]
    async fn test_same_name_update_issues_no_delete() {
        let store = MemoryStore::new(StoreFamily::WideColumn);
        let sink = sink(&store);

        apply(&sink, &event(ChangeOp::Create, "Alice", false)).await.unwrap();
        apply(&sink, &event(ChangeOp::Update, "Alice", false)).await.unwrap();

        assert!(store
            .writes_to(USERS)
            .iter()
            .all(|w| w.kind != WriteKind::Delete));
        assert_eq!(store.rows(USERS).len(), 1);
    }

    #[tokio::test]
    async fn test_relational_update_is_single_upsert() {
        let store = MemoryStore::new(StoreFamily::Relational);
        let sink = sink(&store);

        apply(&sink, &event(ChangeOp::Create, "Alice", false)).await.unwrap();
        apply(&sink, &event(ChangeOp::Update, "Bob", false)).await.unwrap();

        let writes = store.writes_to(USERS);
        assert_eq!(writes.len(), 2);
        assert!(writes.iter().all(|w| w.kind == WriteKind::Upsert));
        assert_eq!(store.rows(USERS)[0].get("name"), Some(&Cell::Text("Bob".into())));
    }

    #[tokio::test]
    async fn test_soft_delete_is_single_update() {
        let store = MemoryStore::new(StoreFamily::WideColumn);
        let sink = sink(&store);

        apply(&sink, &event(ChangeOp::Update, "Alice", true)).await.unwrap();

        let writes = store.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].kind, WriteKind::Update);
        let columns: Vec<&str> = writes[0].values.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(columns, vec!["modified_at", "is_deleted"]);
        assert!(writes[0]
            .key
            .contains(&("name".to_string(), Cell::Text("Alice".into()))));
    }

    #[tokio::test]
    async fn test_missing_id_is_field_error() {
        let store = MemoryStore::new(StoreFamily::WideColumn);
        let mut ev = event(ChangeOp::Create, "Alice", false);
        ev.row.remove("id");

        let err = apply(&sink(&store), &ev).await.unwrap_err();
        assert!(matches!(err, ApplyError::MissingField { .. }));
        assert!(!err.is_retryable());
    }
}
