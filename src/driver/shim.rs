//! Capability-preserving driver shim
//!
//! Wraps a vendor driver so that every Exec and Query flows through
//! the installed middleware chain. The wrapped connection answers
//! every capability probe exactly as the vendor connection does, so
//! consumers that type-probe for `ExecerContext`, `QueryerContext`,
//! or `SessionResetter` cannot tell the difference.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{GateError, GateResult};
use crate::middleware::{CallContext, ExecOp, Middleware, QueryOp};
use crate::value::{named_value_to_value, ExecResult, NamedValue, Rows, Value};

use super::{
    ConnBeginTx, Connection, Driver, Execer, ExecerContext, Queryer, QueryerContext,
    SessionResetter, Statement, Transaction, TxOptions,
};

/// Creates an instrumented driver from a vendor driver and a
/// middleware (usually a [`MiddlewareChain`](crate::MiddlewareChain)).
pub fn wrap(driver: Arc<dyn Driver>, middleware: Arc<dyn Middleware>) -> GateDriver {
    GateDriver { inner: driver, middleware }
}

/// A vendor driver wrapped with a middleware chain
pub struct GateDriver {
    inner: Arc<dyn Driver>,
    middleware: Arc<dyn Middleware>,
}

#[async_trait]
impl Driver for GateDriver {
    async fn open(&self, dsn: &str) -> GateResult<Arc<dyn Connection>> {
        let conn = self.inner.open(dsn).await?;

        // Connections without transaction support are not wrappable.
        if conn.begin_tx().is_none() {
            return Err(GateError::unsupported("driver must implement ConnBeginTx"));
        }

        Ok(Arc::new(GateConn::new(conn, Arc::clone(&self.middleware))))
    }
}

/// A wrapped connection.
///
/// Capability probes are answered from the vendor connection; the
/// Exec/Query capabilities route through the middleware chain before
/// reaching the vendor.
pub struct GateConn {
    inner: Arc<dyn Connection>,
    middleware: Arc<dyn Middleware>,
    has_execer: bool,
    has_queryer: bool,
    has_resetter: bool,
}

impl GateConn {
    fn new(inner: Arc<dyn Connection>, middleware: Arc<dyn Middleware>) -> Self {
        let has_execer = inner.execer_context().is_some() || inner.execer().is_some();
        let has_queryer = inner.queryer_context().is_some() || inner.queryer().is_some();
        let has_resetter = inner.session_resetter().is_some();
        Self { inner, middleware, has_execer, has_queryer, has_resetter }
    }

    fn base_exec(&self) -> ExecOp {
        let inner = Arc::clone(&self.inner);
        Arc::new(move |ctx, query, args| {
            let inner = Arc::clone(&inner);
            Box::pin(async move { raw_exec(inner, ctx, query, args).await })
        })
    }

    fn base_query(&self) -> QueryOp {
        let inner = Arc::clone(&self.inner);
        Arc::new(move |ctx, query, args| {
            let inner = Arc::clone(&inner);
            Box::pin(async move { raw_query(inner, ctx, query, args).await })
        })
    }
}

/// Dispatches an Exec to the vendor connection, adapting legacy
/// value-only drivers by ordinal projection.
async fn raw_exec(
    inner: Arc<dyn Connection>,
    ctx: CallContext,
    query: String,
    args: Vec<NamedValue>,
) -> GateResult<ExecResult> {
    if let Some(execer) = inner.execer_context() {
        return execer.exec_context(ctx, &query, args).await;
    }
    if let Some(execer) = inner.execer() {
        let values = named_value_to_value(&args)?;
        return execer.exec(&query, values).await;
    }
    Err(GateError::unsupported("exec issued on a connection without an Execer capability"))
}

/// Dispatches a Query to the vendor connection, adapting legacy
/// value-only drivers by ordinal projection.
async fn raw_query(
    inner: Arc<dyn Connection>,
    ctx: CallContext,
    query: String,
    args: Vec<NamedValue>,
) -> GateResult<Box<dyn Rows>> {
    if let Some(queryer) = inner.queryer_context() {
        return queryer.query_context(ctx, &query, args).await;
    }
    if let Some(queryer) = inner.queryer() {
        let values = named_value_to_value(&args)?;
        return queryer.query(&query, values).await;
    }
    Err(GateError::unsupported("query issued on a connection without a Queryer capability"))
}

#[async_trait]
impl Connection for GateConn {
    async fn prepare(&self, ctx: CallContext, query: &str) -> GateResult<Box<dyn Statement>> {
        let stmt = self.inner.prepare(ctx, query).await?;
        Ok(Box::new(GateStmt {
            inner: Arc::from(stmt),
            query: query.to_string(),
            middleware: Arc::clone(&self.middleware),
        }))
    }

    async fn close(&self) -> GateResult<()> {
        self.inner.close().await
    }

    fn begin_tx(&self) -> Option<&dyn ConnBeginTx> {
        Some(self)
    }

    fn execer(&self) -> Option<&dyn Execer> {
        if self.has_execer {
            Some(self)
        } else {
            None
        }
    }

    fn execer_context(&self) -> Option<&dyn ExecerContext> {
        if self.has_execer {
            Some(self)
        } else {
            None
        }
    }

    fn queryer(&self) -> Option<&dyn Queryer> {
        if self.has_queryer {
            Some(self)
        } else {
            None
        }
    }

    fn queryer_context(&self) -> Option<&dyn QueryerContext> {
        if self.has_queryer {
            Some(self)
        } else {
            None
        }
    }

    fn session_resetter(&self) -> Option<&dyn SessionResetter> {
        if self.has_resetter {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl ConnBeginTx for GateConn {
    async fn begin_tx(&self, ctx: CallContext, opts: TxOptions) -> GateResult<Box<dyn Transaction>> {
        match self.inner.begin_tx() {
            Some(tx) => tx.begin_tx(ctx, opts).await,
            None => Err(GateError::unsupported("driver must implement ConnBeginTx")),
        }
    }
}

#[async_trait]
impl ExecerContext for GateConn {
    async fn exec_context(
        &self,
        ctx: CallContext,
        query: &str,
        args: Vec<NamedValue>,
    ) -> GateResult<ExecResult> {
        let op = self.middleware.wrap_exec(self.base_exec());
        op(ctx, query.to_string(), args).await
    }
}

#[async_trait]
impl Execer for GateConn {
    async fn exec(&self, _query: &str, _args: Vec<Value>) -> GateResult<ExecResult> {
        // The context form is always implemented alongside; callers
        // must not reach the value-only entry point on a wrapped
        // connection.
        Err(GateError::unsupported("Exec was called when ExecContext was implemented"))
    }
}

#[async_trait]
impl QueryerContext for GateConn {
    async fn query_context(
        &self,
        ctx: CallContext,
        query: &str,
        args: Vec<NamedValue>,
    ) -> GateResult<Box<dyn Rows>> {
        let op = self.middleware.wrap_query(self.base_query());
        op(ctx, query.to_string(), args).await
    }
}

#[async_trait]
impl Queryer for GateConn {
    async fn query(&self, _query: &str, _args: Vec<Value>) -> GateResult<Box<dyn Rows>> {
        Err(GateError::unsupported("Query was called when QueryContext was implemented"))
    }
}

#[async_trait]
impl SessionResetter for GateConn {
    async fn reset_session(&self, ctx: CallContext) -> GateResult<()> {
        match self.inner.session_resetter() {
            Some(resetter) => resetter.reset_session(ctx).await,
            None => Ok(()),
        }
    }
}

/// A wrapped prepared statement.
///
/// Keeps the originating query text so execution re-enters the
/// middleware chain with the statement the application wrote.
pub struct GateStmt {
    inner: Arc<dyn Statement>,
    query: String,
    middleware: Arc<dyn Middleware>,
}

#[async_trait]
impl Statement for GateStmt {
    async fn exec(&self, ctx: CallContext, args: Vec<NamedValue>) -> GateResult<ExecResult> {
        let inner = Arc::clone(&self.inner);
        let base: ExecOp = Arc::new(move |ctx, _query, args| {
            let inner = Arc::clone(&inner);
            Box::pin(async move { inner.exec(ctx, args).await })
        });
        let op = self.middleware.wrap_exec(base);
        op(ctx, self.query.clone(), args).await
    }

    async fn query(&self, ctx: CallContext, args: Vec<NamedValue>) -> GateResult<Box<dyn Rows>> {
        let inner = Arc::clone(&self.inner);
        let base: QueryOp = Arc::new(move |ctx, _query, args| {
            let inner = Arc::clone(&inner);
            Box::pin(async move { inner.query(ctx, args).await })
        });
        let op = self.middleware.wrap_query(base);
        op(ctx, self.query.clone(), args).await
    }

    fn num_input(&self) -> Option<usize> {
        self.inner.num_input()
    }

    async fn close(&self) -> GateResult<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::middleware::MiddlewareChain;
    use crate::mock::MockRows;

    /// Which capabilities the fake vendor connection advertises.
    #[derive(Clone, Copy, Default)]
    pub(crate) struct Caps {
        pub begin_tx: bool,
        pub exec_context: bool,
        pub exec_legacy: bool,
        pub query_context: bool,
        pub query_legacy: bool,
        pub resetter: bool,
    }

    impl Caps {
        pub(crate) fn full() -> Self {
            Self {
                begin_tx: true,
                exec_context: true,
                exec_legacy: false,
                query_context: true,
                query_legacy: false,
                resetter: true,
            }
        }
    }

    /// In-memory vendor connection that records every statement.
    pub(crate) struct FakeConn {
        pub caps: Caps,
        pub statements: Mutex<Vec<String>>,
        pub exec_calls: AtomicUsize,
    }

    impl FakeConn {
        pub(crate) fn new(caps: Caps) -> Self {
            Self { caps, statements: Mutex::new(Vec::new()), exec_calls: AtomicUsize::new(0) }
        }

        fn record(&self, query: &str) {
            self.statements.lock().unwrap().push(query.to_string());
        }
    }

    pub(crate) struct FakeTx;

    #[async_trait]
    impl Transaction for FakeTx {
        async fn commit(&self) -> GateResult<()> {
            Ok(())
        }

        async fn rollback(&self) -> GateResult<()> {
            Ok(())
        }
    }

    pub(crate) struct FakeStmt;

    #[async_trait]
    impl Statement for FakeStmt {
        async fn exec(&self, _ctx: CallContext, _args: Vec<NamedValue>) -> GateResult<ExecResult> {
            Ok(ExecResult { last_insert_id: None, rows_affected: 1 })
        }

        async fn query(
            &self,
            _ctx: CallContext,
            _args: Vec<NamedValue>,
        ) -> GateResult<Box<dyn Rows>> {
            Ok(Box::new(MockRows::new(vec!["n".to_string()]).add_row(vec![Value::Int(1)])))
        }

        async fn close(&self) -> GateResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Connection for FakeConn {
        async fn prepare(&self, _ctx: CallContext, query: &str) -> GateResult<Box<dyn Statement>> {
            self.record(query);
            Ok(Box::new(FakeStmt))
        }

        async fn close(&self) -> GateResult<()> {
            Ok(())
        }

        fn begin_tx(&self) -> Option<&dyn ConnBeginTx> {
            if self.caps.begin_tx {
                Some(self)
            } else {
                None
            }
        }

        fn execer(&self) -> Option<&dyn Execer> {
            if self.caps.exec_legacy {
                Some(self)
            } else {
                None
            }
        }

        fn execer_context(&self) -> Option<&dyn ExecerContext> {
            if self.caps.exec_context {
                Some(self)
            } else {
                None
            }
        }

        fn queryer(&self) -> Option<&dyn Queryer> {
            if self.caps.query_legacy {
                Some(self)
            } else {
                None
            }
        }

        fn queryer_context(&self) -> Option<&dyn QueryerContext> {
            if self.caps.query_context {
                Some(self)
            } else {
                None
            }
        }

        fn session_resetter(&self) -> Option<&dyn SessionResetter> {
            if self.caps.resetter {
                Some(self)
            } else {
                None
            }
        }
    }

    #[async_trait]
    impl ConnBeginTx for FakeConn {
        async fn begin_tx(
            &self,
            _ctx: CallContext,
            _opts: TxOptions,
        ) -> GateResult<Box<dyn Transaction>> {
            Ok(Box::new(FakeTx))
        }
    }

    #[async_trait]
    impl ExecerContext for FakeConn {
        async fn exec_context(
            &self,
            _ctx: CallContext,
            query: &str,
            _args: Vec<NamedValue>,
        ) -> GateResult<ExecResult> {
            self.record(query);
            self.exec_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExecResult { last_insert_id: Some(1), rows_affected: 1 })
        }
    }

    #[async_trait]
    impl Execer for FakeConn {
        async fn exec(&self, query: &str, args: Vec<Value>) -> GateResult<ExecResult> {
            self.record(query);
            self.exec_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExecResult { last_insert_id: None, rows_affected: args.len() as u64 })
        }
    }

    #[async_trait]
    impl QueryerContext for FakeConn {
        async fn query_context(
            &self,
            _ctx: CallContext,
            query: &str,
            _args: Vec<NamedValue>,
        ) -> GateResult<Box<dyn Rows>> {
            self.record(query);
            Ok(Box::new(MockRows::new(vec!["n".to_string()]).add_row(vec![Value::Int(1)])))
        }
    }

    #[async_trait]
    impl Queryer for FakeConn {
        async fn query(&self, query: &str, _args: Vec<Value>) -> GateResult<Box<dyn Rows>> {
            self.record(query);
            Ok(Box::new(MockRows::new(vec!["n".to_string()]).add_row(vec![Value::Int(2)])))
        }
    }

    #[async_trait]
    impl SessionResetter for FakeConn {
        async fn reset_session(&self, _ctx: CallContext) -> GateResult<()> {
            Ok(())
        }
    }

    pub(crate) struct FakeDriver {
        pub caps: Caps,
    }

    #[async_trait]
    impl Driver for FakeDriver {
        async fn open(&self, _dsn: &str) -> GateResult<Arc<dyn Connection>> {
            Ok(Arc::new(FakeConn::new(self.caps)))
        }
    }

    fn chain() -> Arc<dyn Middleware> {
        Arc::new(MiddlewareChain::new())
    }

    #[tokio::test]
    async fn open_requires_begin_tx() {
        let driver = wrap(Arc::new(FakeDriver { caps: Caps::default() }), chain());
        let err = driver.open("dsn").await.err().unwrap();
        assert!(matches!(err, GateError::Unsupported { .. }));

        let driver = wrap(Arc::new(FakeDriver { caps: Caps::full() }), chain());
        assert!(driver.open("dsn").await.is_ok());
    }

    #[tokio::test]
    async fn capabilities_are_preserved() {
        let mut caps = Caps::full();
        caps.query_context = false;
        caps.resetter = false;
        let driver = wrap(Arc::new(FakeDriver { caps }), chain());
        let conn = driver.open("dsn").await.unwrap();

        assert!(conn.execer_context().is_some());
        assert!(conn.queryer_context().is_none());
        assert!(conn.queryer().is_none());
        assert!(conn.session_resetter().is_none());
        assert!(conn.begin_tx().is_some());
    }

    #[tokio::test]
    async fn legacy_execer_is_exposed_as_context_capability() {
        let caps = Caps {
            begin_tx: true,
            exec_context: false,
            exec_legacy: true,
            query_context: false,
            query_legacy: true,
            resetter: false,
        };
        let driver = wrap(Arc::new(FakeDriver { caps }), chain());
        let conn = driver.open("dsn").await.unwrap();

        assert!(conn.execer_context().is_some());
        assert!(conn.queryer_context().is_some());

        // Positional arguments project onto the legacy entry point.
        let result = conn
            .execer_context()
            .unwrap()
            .exec_context(
                CallContext::new(),
                "insert into t values (?)",
                NamedValue::from_values(vec![Value::Int(7)]),
            )
            .await
            .unwrap();
        assert_eq!(result.rows_affected, 1);

        // Named arguments cannot.
        let err = conn
            .execer_context()
            .unwrap()
            .exec_context(
                CallContext::new(),
                "insert into t values (:id)",
                vec![NamedValue { name: Some("id".into()), ordinal: 1, value: Value::Int(7) }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn legacy_entry_point_refuses_direct_calls() {
        let driver = wrap(Arc::new(FakeDriver { caps: Caps::full() }), chain());
        let conn = driver.open("dsn").await.unwrap();
        let err = conn.execer().unwrap().exec("select 1", Vec::new()).await.unwrap_err();
        assert!(err.to_string().contains("ExecContext was implemented"));
    }

    #[tokio::test]
    async fn statement_reenters_middleware_with_original_text() {
        struct QueryRecorder(Arc<Mutex<Vec<String>>>);

        impl Middleware for QueryRecorder {
            fn wrap_exec(&self, next: ExecOp) -> ExecOp {
                let seen = Arc::clone(&self.0);
                Arc::new(move |ctx, query, args| {
                    seen.lock().unwrap().push(query.clone());
                    next(ctx, query, args)
                })
            }

            fn wrap_query(&self, next: QueryOp) -> QueryOp {
                let seen = Arc::clone(&self.0);
                Arc::new(move |ctx, query, args| {
                    seen.lock().unwrap().push(query.clone());
                    next(ctx, query, args)
                })
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let driver = wrap(
            Arc::new(FakeDriver { caps: Caps::full() }),
            Arc::new(QueryRecorder(Arc::clone(&seen))),
        );
        let conn = driver.open("dsn").await.unwrap();

        let stmt = conn
            .prepare(CallContext::new(), "select * from t where id = ?")
            .await
            .unwrap();
        stmt.exec(CallContext::new(), NamedValue::from_values(vec![Value::Int(1)]))
            .await
            .unwrap();
        let mut rows = stmt
            .query(CallContext::new(), NamedValue::from_values(vec![Value::Int(2)]))
            .await
            .unwrap();
        assert!(rows.next().unwrap().is_some());

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec!["select * from t where id = ?", "select * from t where id = ?"]
        );
    }
}
