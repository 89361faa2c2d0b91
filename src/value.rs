//! Driver value model
//!
//! The small set of types that cross the driver boundary: argument
//! values, named arguments, execution results, and the row cursor
//! trait. Vendor drivers convert their native types into these.

use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};

/// A single database value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Json(serde_json::Value),
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

impl Value {
    /// Decodes a nullable text column.
    pub fn as_opt_text(&self) -> GateResult<Option<String>> {
        match self {
            Value::Null => Ok(None),
            Value::Text(s) => Ok(Some(s.clone())),
            Value::Bytes(b) => Ok(Some(String::from_utf8_lossy(b).into_owned())),
            other => Err(GateError::decode(format!("expected text, got {other:?}"))),
        }
    }

    /// Decodes a nullable integer column.
    pub fn as_opt_int(&self) -> GateResult<Option<i64>> {
        match self {
            Value::Null => Ok(None),
            Value::Int(n) => Ok(Some(*n)),
            Value::Text(s) => s
                .parse::<i64>()
                .map(Some)
                .map_err(|e| GateError::decode(format!("non-integer column {s:?}: {e}"))),
            other => Err(GateError::decode(format!("expected integer, got {other:?}"))),
        }
    }

    /// Decodes a nullable float column.
    pub fn as_opt_float(&self) -> GateResult<Option<f64>> {
        match self {
            Value::Null => Ok(None),
            Value::Float(f) => Ok(Some(*f)),
            Value::Int(n) => Ok(Some(*n as f64)),
            Value::Text(s) => s
                .parse::<f64>()
                .map(Some)
                .map_err(|e| GateError::decode(format!("non-numeric column {s:?}: {e}"))),
            other => Err(GateError::decode(format!("expected float, got {other:?}"))),
        }
    }
}

/// An argument with its position and optional name.
///
/// Ordinals are 1-based, matching placeholder numbering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedValue {
    pub name: Option<String>,
    pub ordinal: usize,
    pub value: Value,
}

impl NamedValue {
    pub fn positional(ordinal: usize, value: Value) -> Self {
        Self { name: None, ordinal, value }
    }

    /// Builds a positional argument list from plain values.
    pub fn from_values(values: Vec<Value>) -> Vec<NamedValue> {
        values
            .into_iter()
            .enumerate()
            .map(|(i, value)| NamedValue::positional(i + 1, value))
            .collect()
    }
}

/// Projects named arguments onto positional values, for drivers that
/// only support the legacy value-only calls. Fails if any argument
/// carries a name.
pub fn named_value_to_value(args: &[NamedValue]) -> GateResult<Vec<Value>> {
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        if arg.name.as_deref().is_some_and(|n| !n.is_empty()) {
            return Err(GateError::unsupported(
                "driver does not support the use of named parameters",
            ));
        }
        values.push(arg.value.clone());
    }
    Ok(values)
}

/// Strips names and ordinals, keeping the bare values. Used when
/// capturing an argument sample for the audit cache.
pub fn named_to_values(args: &[NamedValue]) -> Vec<Value> {
    args.iter().map(|a| a.value.clone()).collect()
}

/// Result of an Exec-style statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    pub last_insert_id: Option<i64>,
    pub rows_affected: u64,
}

/// Cursor over a query result.
///
/// `next` returns the following row, or `None` once the result set is
/// exhausted. Implementations hand out owned values; callers may
/// mutate them freely.
pub trait Rows: Send {
    fn columns(&self) -> Vec<String>;
    fn next(&mut self) -> GateResult<Option<Vec<Value>>>;
    fn close(&mut self) -> GateResult<()>;
}

/// A query result with no columns and no rows
pub struct EmptyRows;

impl Rows for EmptyRows {
    fn columns(&self) -> Vec<String> {
        Vec::new()
    }

    fn next(&mut self) -> GateResult<Option<Vec<Value>>> {
        Ok(None)
    }

    fn close(&mut self) -> GateResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_rejects_named_parameters() {
        let args = vec![NamedValue {
            name: Some("id".to_string()),
            ordinal: 1,
            value: Value::Int(1),
        }];
        assert!(named_value_to_value(&args).is_err());
    }

    #[test]
    fn projection_keeps_order() {
        let args = NamedValue::from_values(vec![Value::Int(1), Value::Text("a".into())]);
        let values = named_value_to_value(&args).unwrap();
        assert_eq!(values, vec![Value::Int(1), Value::Text("a".into())]);
    }

    #[test]
    fn nullable_decoding() {
        assert_eq!(Value::Null.as_opt_int().unwrap(), None);
        assert_eq!(Value::Int(3).as_opt_int().unwrap(), Some(3));
        assert_eq!(Value::Text("ALL".into()).as_opt_text().unwrap().as_deref(), Some("ALL"));
        assert!(Value::Bool(true).as_opt_text().is_err());
    }
}
