//! Record/replay middleware
//!
//! Holds canned results keyed by statement text. A mapped statement
//! is answered without touching the inner driver; an unmapped one is
//! executed, recorded, and answered. Useful for fixtures and for
//! cutting a test suite off a live database after one recording run.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{GateError, GateResult};
use crate::middleware::{ExecOp, Middleware, QueryOp};
use crate::sync_map::SyncMap;
use crate::value::{ExecResult, Rows, Value};

/// A stored outcome: either a value or the error the inner op
/// produced.
#[derive(Debug, Clone)]
pub struct MockReturn<T> {
    pub value: Option<T>,
    pub err: Option<GateError>,
}

impl<T> MockReturn<T> {
    pub fn ok(value: T) -> Self {
        Self { value: Some(value), err: None }
    }

    pub fn err(err: GateError) -> Self {
        Self { value: None, err: Some(err) }
    }
}

/// Record/replay middleware
#[derive(Clone, Default)]
pub struct Mock {
    inner: Arc<MockInner>,
}

#[derive(Default)]
struct MockInner {
    exec_returns: SyncMap<String, MockReturn<ExecResult>>,
    query_returns: SyncMap<String, MockReturn<MockRows>>,
}

impl Mock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a statement to a canned Exec outcome.
    pub fn add_exec(&self, query: impl Into<String>, ret: MockReturn<ExecResult>) {
        self.inner.exec_returns.put(query.into(), ret);
    }

    /// Maps a statement to a canned Query outcome.
    pub fn add_query(&self, query: impl Into<String>, ret: MockReturn<MockRows>) {
        self.inner.query_returns.put(query.into(), ret);
    }

    pub fn exec_returns(&self) -> HashMap<String, MockReturn<ExecResult>> {
        self.inner.exec_returns.snapshot()
    }

    pub fn query_returns(&self) -> HashMap<String, MockReturn<MockRows>> {
        self.inner.query_returns.snapshot()
    }
}

fn replay<T: Clone>(ret: &MockReturn<T>) -> GateResult<T> {
    if let Some(err) = &ret.err {
        return Err(err.clone());
    }
    match &ret.value {
        Some(value) => Ok(value.clone()),
        None => Err(GateError::driver("mock entry holds neither value nor error")),
    }
}

impl Middleware for Mock {
    fn wrap_exec(&self, next: ExecOp) -> ExecOp {
        let mock = self.clone();
        Arc::new(move |ctx, query, args| {
            let mock = mock.clone();
            let next = Arc::clone(&next);
            Box::pin(async move {
                if let Some(ret) = mock.inner.exec_returns.get(&query) {
                    return replay(&ret);
                }
                let outcome = next(ctx, query.clone(), args).await;
                let ret = match &outcome {
                    Ok(result) => MockReturn::ok(result.clone()),
                    Err(err) => MockReturn::err(err.clone()),
                };
                mock.inner.exec_returns.put(query, ret);
                outcome
            })
        })
    }

    fn wrap_query(&self, next: QueryOp) -> QueryOp {
        let mock = self.clone();
        Arc::new(move |ctx, query, args| {
            let mock = mock.clone();
            let next = Arc::clone(&next);
            Box::pin(async move {
                if let Some(ret) = mock.inner.query_returns.get(&query) {
                    return replay(&ret).map(|rows| Box::new(rows.rewound()) as Box<dyn Rows>);
                }
                match next(ctx, query.clone(), args).await {
                    Ok(rows) => {
                        // Drain the live cursor into a replayable
                        // snapshot; the caller gets the snapshot.
                        let recorded = MockRows::drain(rows)?;
                        mock.inner
                            .query_returns
                            .put(query, MockReturn::ok(recorded.clone()));
                        Ok(Box::new(recorded) as Box<dyn Rows>)
                    }
                    Err(err) => {
                        mock.inner.query_returns.put(query, MockReturn::err(err.clone()));
                        Err(err)
                    }
                }
            })
        })
    }
}

/// Synthetic result set for mocks and fixtures.
///
/// Values are copied out on every `next` call, so callers scanning
/// into raw byte targets observe the usual copy-on-call semantics.
#[derive(Debug, Clone, Default)]
pub struct MockRows {
    cols: Vec<String>,
    rows: Vec<Vec<Value>>,
    next_errs: HashMap<usize, GateError>,
    close_err: Option<GateError>,
    pos: usize,
}

impl MockRows {
    pub fn new(columns: Vec<String>) -> Self {
        Self { cols: columns, ..Self::default() }
    }

    /// Appends one row. The number of values must match the number
    /// of columns.
    pub fn add_row(mut self, values: Vec<Value>) -> Self {
        assert_eq!(
            values.len(),
            self.cols.len(),
            "expected number of values to match number of columns"
        );
        self.rows.push(values);
        self
    }

    /// Makes reading the given row (0-based) fail with `err`.
    pub fn row_error(mut self, row: usize, err: GateError) -> Self {
        self.next_errs.insert(row, err);
        self
    }

    /// Makes `close` fail with `err`.
    pub fn close_error(mut self, err: GateError) -> Self {
        self.close_err = Some(err);
        self
    }

    /// A copy with the cursor back at the first row.
    pub fn rewound(&self) -> Self {
        let mut copy = self.clone();
        copy.pos = 0;
        copy
    }

    /// Buffers a live cursor into a replayable snapshot.
    fn drain(mut rows: Box<dyn Rows>) -> GateResult<Self> {
        let mut snapshot = MockRows::new(rows.columns());
        while let Some(row) = rows.next()? {
            snapshot.rows.push(row);
        }
        rows.close()?;
        Ok(snapshot)
    }
}

impl Rows for MockRows {
    fn columns(&self) -> Vec<String> {
        self.cols.clone()
    }

    fn next(&mut self) -> GateResult<Option<Vec<Value>>> {
        if self.pos >= self.rows.len() {
            return Ok(None);
        }
        let index = self.pos;
        self.pos += 1;
        if let Some(err) = self.next_errs.get(&index) {
            return Err(err.clone());
        }
        Ok(Some(self.rows[index].clone()))
    }

    fn close(&mut self) -> GateResult<()> {
        match &self.close_err {
            // Close errors only surface while rows remain unread,
            // matching the standard library behaviour.
            Some(err) if self.pos < self.rows.len() => Err(err.clone()),
            _ => Ok(()),
        }
    }
}
