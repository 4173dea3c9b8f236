use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Post-change row image, keyed by column name
pub type Row = BTreeMap<String, FieldValue>;

/// Closed set of values a Debezium JSON row column may carry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Map(Row),
}

impl FieldValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Bool(_) => "boolean",
            FieldValue::Int(_) => "integer",
            FieldValue::Float(_) => "float",
            FieldValue::Text(_) => "string",
            FieldValue::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view; whole floats are accepted since JSON numbers may
    /// arrive in either shape.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(i) => Some(*i),
            FieldValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }
}

/// CDC operation types from Debezium
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOp {
    /// c = create
    Create,
    /// u = update
    Update,
    /// d = delete
    Delete,
    /// r = read, initial snapshot
    Read,
    /// Any other code the connector emits (e.g. `t` for truncate)
    Other(String),
}

impl ChangeOp {
    pub fn from_code(code: &str) -> Self {
        match code {
            "c" => ChangeOp::Create,
            "u" => ChangeOp::Update,
            "d" => ChangeOp::Delete,
            "r" => ChangeOp::Read,
            other => ChangeOp::Other(other.to_string()),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            ChangeOp::Create => "c",
            ChangeOp::Update => "u",
            ChangeOp::Delete => "d",
            ChangeOp::Read => "r",
            ChangeOp::Other(code) => code,
        }
    }

    /// Only creates and updates carry a row image the sinks act on
    pub fn produces_writes(&self) -> bool {
        matches!(self, ChangeOp::Create | ChangeOp::Update)
    }
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Canonical change decoded from one broker message
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub op: ChangeOp,

    /// Post-change image (`after`), empty for deletes
    pub row: Row,

    /// Source commit timestamp in epoch millis
    pub ts_ms: i64,

    /// Stable identifier of the logical change, used as the ledger key
    pub event_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_codes() {
        assert_eq!(ChangeOp::from_code("c"), ChangeOp::Create);
        assert_eq!(ChangeOp::from_code("t"), ChangeOp::Other("t".into()));
        assert_eq!(ChangeOp::from_code("t").code(), "t");
        assert!(ChangeOp::Update.produces_writes());
        assert!(!ChangeOp::Read.produces_writes());
        assert!(!ChangeOp::Delete.produces_writes());
    }

    #[test]
    fn test_field_value_int_view() {
        assert_eq!(FieldValue::Int(7).as_i64(), Some(7));
        assert_eq!(FieldValue::Float(19954.0).as_i64(), Some(19954));
        assert_eq!(FieldValue::Float(1.5).as_i64(), None);
        assert_eq!(FieldValue::Text("1".into()).as_i64(), None);
    }
}
