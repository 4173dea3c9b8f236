use serde_json::{Map, Value};

use super::models::{ChangeEvent, ChangeOp, FieldValue, Row};
use crate::error::DecodeError;

/// Source block fields that identify a change, in id order
const EVENT_ID_FIELDS: [&str; 3] = ["txId", "lsn", "ts_us"];

/// Decode a Debezium JSON envelope into a [`ChangeEvent`].
///
/// Pure and deterministic: the same bytes always produce the same event and
/// the same `event_id`.
pub fn decode(bytes: &[u8]) -> Result<ChangeEvent, DecodeError> {
    let envelope: Value = serde_json::from_slice(bytes)
        .map_err(|e| DecodeError::MalformedEnvelope(format!("invalid JSON: {}", e)))?;

    let payload = match envelope.get("payload") {
        Some(Value::Object(payload)) => payload,
        Some(Value::Null) | None => {
            return Err(DecodeError::MalformedEnvelope(
                "missing payload in envelope".to_string(),
            ))
        }
        Some(other) => {
            return Err(DecodeError::MalformedEnvelope(format!(
                "payload must be an object, got {}",
                json_type(other)
            )))
        }
    };

    let op = match payload.get("op") {
        Some(Value::String(code)) => ChangeOp::from_code(code),
        _ => {
            return Err(DecodeError::MalformedEnvelope(
                "payload has no 'op' code".to_string(),
            ))
        }
    };

    let row = match payload.get("after") {
        Some(Value::Object(after)) => convert_row(after)?,
        Some(Value::Null) | None => Row::new(),
        Some(other) => {
            return Err(DecodeError::MalformedEnvelope(format!(
                "'after' must be an object, got {}",
                json_type(other)
            )))
        }
    };

    let ts_ms = payload
        .get("ts_ms")
        .and_then(number_as_i64)
        .ok_or_else(|| {
            DecodeError::MalformedEnvelope("payload has no numeric 'ts_ms'".to_string())
        })?;

    let event_id = build_event_id(payload, ts_ms)?;

    Ok(ChangeEvent {
        op,
        row,
        ts_ms,
        event_id,
    })
}

/// JSON array of the present `txId`, `lsn`, `ts_us` values, or `[ts_ms]`.
///
/// Without transaction metadata two unrelated changes committed in the same
/// millisecond share an id.
fn build_event_id(payload: &Map<String, Value>, ts_ms: i64) -> Result<String, DecodeError> {
    let source = match payload.get("source") {
        Some(Value::Object(source)) => source,
        _ => return Err(DecodeError::MissingSource),
    };

    let mut parts: Vec<Value> = EVENT_ID_FIELDS
        .iter()
        .filter_map(|field| source.get(*field).cloned())
        .collect();

    if parts.is_empty() {
        parts.push(Value::from(ts_ms));
    }

    serde_json::to_string(&parts)
        .map_err(|e| DecodeError::MalformedEnvelope(format!("event id: {}", e)))
}

fn convert_row(object: &Map<String, Value>) -> Result<Row, DecodeError> {
    object
        .iter()
        .map(|(column, value)| Ok((column.clone(), convert_value(column, value)?)))
        .collect()
}

fn convert_value(column: &str, value: &Value) -> Result<FieldValue, DecodeError> {
    Ok(match value {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => FieldValue::Int(i),
            None => FieldValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => FieldValue::Text(s.clone()),
        Value::Object(nested) => FieldValue::Map(convert_row(nested)?),
        Value::Array(_) => {
            return Err(DecodeError::MalformedEnvelope(format!(
                "column '{}' holds an array, which is not a supported row value",
                column
            )))
        }
    })
}

/// Accept both integer and floating point JSON numbers
fn number_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
