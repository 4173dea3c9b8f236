use super::{RowReader, Sink};
use crate::error::ApplyError;
use crate::services::cdc::{ChangeEvent, ChangeOp};
use crate::store::{Cell, Columns};

const ORDERS: &str = "orders";
const ORDERS_BY_USER: &str = "orders_by_user";

/// Scale of the `total_amount` NUMERIC(10,2) source column
const TOTAL_AMOUNT_SCALE: u32 = 2;

/// Writes `orders` first, then the identical `orders_by_user` row; a failure
/// of either leaves the event unapplied.
pub(super) async fn apply(sink: &Sink, event: &ChangeEvent) -> Result<(), ApplyError> {
    let store = sink.store.as_ref();
    let row = RowReader::new("order", &event.row);

    let order_id = Cell::Uuid(row.uuid("id")?);
    let user_id = Cell::Uuid(row.uuid("user_id")?);
    let by_order: Columns = vec![("order_id", order_id.clone()), ("user_id", user_id.clone())];
    let by_user: Columns = vec![("user_id", user_id), ("order_id", order_id)];

    match event.op {
        ChangeOp::Create => {
            let values: Columns = vec![
                ("status", Cell::Text(row.text("status")?.to_string())),
                ("quantity", Cell::Int(row.int("quantity")?)),
                (
                    "total_amount",
                    Cell::Decimal(row.decimal("total_amount", TOTAL_AMOUNT_SCALE)?),
                ),
                ("placed_at", Cell::Timestamp(row.timestamp("placed_at")?)),
                ("is_deleted", Cell::Bool(false)),
            ];

            store
                .upsert(ORDERS, &by_order, &values)
                .await
                .map_err(|e| sink.store_error(e))?;
            store
                .upsert(ORDERS_BY_USER, &by_user, &values)
                .await
                .map_err(|e| sink.store_error(e))
        }

        ChangeOp::Update => {
            let values: Columns = vec![
                ("status", Cell::Text(row.text("status")?.to_string())),
                ("modified_at", Cell::Timestamp(row.timestamp("modified_at")?)),
                ("is_deleted", Cell::Bool(row.bool_or("is_deleted", false)?)),
            ];

            store
                .update(ORDERS, &by_order, &values)
                .await
                .map_err(|e| sink.store_error(e))?;
            store
                .update(ORDERS_BY_USER, &by_user, &values)
                .await
                .map_err(|e| sink.store_error(e))
        }

        _ => Ok(()),
    }
}
