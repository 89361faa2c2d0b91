//! EXPLAIN plan decoding
//!
//! Runs `EXPLAIN <query>` over the attached database handle and
//! decodes each result row positionally into an [`ExplainRow`]. Also
//! hosts the table-inventory query the administration surface uses.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::driver::Db;
use crate::error::{GateError, GateResult};
use crate::middleware::CallContext;
use crate::value::{NamedValue, Value};

/// Table inventory from `INFORMATION_SCHEMA.TABLES`.
///
/// Provisioned into the audit whitelist so the inventory itself is
/// never audited.
pub const TABLES_QUERY: &str =
    "SELECT table_name, table_rows FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA = ?;";

/// One line of EXPLAIN output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplainRow {
    pub id: i64,
    pub select_type: String,
    pub table: Option<String>,
    pub partitions: Option<String>,
    #[serde(rename = "type")]
    pub access_type: Option<String>,
    pub possible_keys: Option<String>,
    pub key: Option<String>,
    pub key_len: Option<i64>,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
    pub rows: Option<i64>,
    pub filtered: Option<f64>,
    pub extra: Option<String>,
}

impl ExplainRow {
    /// Decodes one positional EXPLAIN result row. The 12 columns are
    /// expected in the order the database emits them.
    fn decode(row: &[Value]) -> GateResult<Self> {
        if row.len() < 12 {
            return Err(GateError::decode(format!(
                "explain row has {} columns, expected 12",
                row.len()
            )));
        }
        Ok(Self {
            id: row[0]
                .as_opt_int()?
                .ok_or_else(|| GateError::decode("explain id is null"))?,
            select_type: row[1]
                .as_opt_text()?
                .ok_or_else(|| GateError::decode("explain select_type is null"))?,
            table: row[2].as_opt_text()?,
            partitions: row[3].as_opt_text()?,
            access_type: row[4].as_opt_text()?,
            possible_keys: row[5].as_opt_text()?,
            key: row[6].as_opt_text()?,
            key_len: row[7].as_opt_int()?,
            reference: row[8].as_opt_text()?,
            rows: row[9].as_opt_int()?,
            filtered: row[10].as_opt_float()?,
            extra: row[11].as_opt_text()?,
        })
    }
}

/// A database table with its approximate row count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub count: i64,
}

/// Runs `EXPLAIN <query>` with the captured arguments.
pub async fn explain(db: &Db, query: &str, args: &[Value]) -> GateResult<Vec<ExplainRow>> {
    let statement = format!("explain {query}");
    let mut rows = db
        .query(
            CallContext::new(),
            &statement,
            NamedValue::from_values(args.to_vec()),
        )
        .await?;
    let mut plan = Vec::new();
    while let Some(row) = rows.next()? {
        plan.push(ExplainRow::decode(&row)?);
    }
    rows.close()?;
    Ok(plan)
}

/// Lists the tables of the given schema keyed by name.
pub async fn tables(db: &Db, database_name: &str) -> GateResult<HashMap<String, Table>> {
    let mut rows = db
        .query(
            CallContext::new(),
            TABLES_QUERY,
            NamedValue::from_values(vec![Value::Text(database_name.to_string())]),
        )
        .await?;
    let mut tables = HashMap::new();
    while let Some(row) = rows.next()? {
        if row.len() < 2 {
            return Err(GateError::decode("table inventory row has fewer than 2 columns"));
        }
        let name = row[0]
            .as_opt_text()?
            .ok_or_else(|| GateError::decode("table name is null"))?;
        let count = row[1].as_opt_int()?.unwrap_or(0);
        tables.insert(name.clone(), Table { name, count });
    }
    rows.close()?;
    Ok(tables)
}
