//! Middleware contract
//!
//! A middleware decorates the two driver operations, Exec and Query.
//! Middlewares compose by function composition: the first middleware
//! in a chain sees the call first and the response last.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;

use crate::error::GateResult;
use crate::value::{ExecResult, NamedValue, Rows};

/// Per-call context threaded through the middleware chain.
///
/// Replaces the value-carrying request context of the host
/// application: it carries the request id for log correlation and the
/// start instant the audit pre-phase attaches for rt measurement.
#[derive(Clone, Default)]
pub struct CallContext {
    request_id: Option<String>,
    started_at: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Attaches the current instant as the call's start time.
    pub fn mark_started(&mut self) {
        self.started_at = Some(Instant::now());
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("request_id", &self.request_id)
            .field("started", &self.started_at.is_some())
            .finish()
    }
}

/// The Exec operation: a statement that returns an affected-rows
/// summary.
pub type ExecOp = Arc<
    dyn Fn(CallContext, String, Vec<NamedValue>) -> BoxFuture<'static, GateResult<ExecResult>>
        + Send
        + Sync,
>;

/// The Query operation: a statement that returns a row cursor.
pub type QueryOp = Arc<
    dyn Fn(CallContext, String, Vec<NamedValue>) -> BoxFuture<'static, GateResult<Box<dyn Rows>>>
        + Send
        + Sync,
>;

/// A composable decorator over the Exec and Query operations.
pub trait Middleware: Send + Sync {
    fn wrap_exec(&self, next: ExecOp) -> ExecOp;
    fn wrap_query(&self, next: QueryOp) -> QueryOp;
}

/// An ordered composition of middlewares.
///
/// The first middleware in the list is outermost: it sees the call
/// first and the response last.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self { middlewares: Vec::new() }
    }

    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

impl Middleware for MiddlewareChain {
    fn wrap_exec(&self, next: ExecOp) -> ExecOp {
        let mut op = next;
        for middleware in self.middlewares.iter().rev() {
            op = middleware.wrap_exec(op);
        }
        op
    }

    fn wrap_query(&self, next: QueryOp) -> QueryOp {
        let mut op = next;
        for middleware in self.middlewares.iter().rev() {
            op = middleware.wrap_query(op);
        }
        op
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Middleware that appends its tag on entry and on exit.
    struct Tagger {
        tag: &'static str,
        trace: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Tagger {
        fn wrap_exec(&self, next: ExecOp) -> ExecOp {
            let tag = self.tag;
            let trace = Arc::clone(&self.trace);
            Arc::new(move |ctx, query, args| {
                let next = Arc::clone(&next);
                let trace = Arc::clone(&trace);
                Box::pin(async move {
                    trace.lock().unwrap().push(format!("{tag}:enter"));
                    let out = next(ctx, query, args).await;
                    trace.lock().unwrap().push(format!("{tag}:exit"));
                    out
                })
            })
        }

        fn wrap_query(&self, next: QueryOp) -> QueryOp {
            next
        }
    }

    fn base_exec() -> ExecOp {
        Arc::new(|_ctx, _query, _args| Box::pin(async { Ok(ExecResult::default()) }))
    }

    #[tokio::test]
    async fn first_middleware_is_outermost() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new()
            .with(Arc::new(Tagger { tag: "outer", trace: Arc::clone(&trace) }))
            .with(Arc::new(Tagger { tag: "inner", trace: Arc::clone(&trace) }));

        let op = chain.wrap_exec(base_exec());
        op(CallContext::new(), "select 1".to_string(), Vec::new())
            .await
            .unwrap();

        let trace = trace.lock().unwrap();
        assert_eq!(
            *trace,
            vec!["outer:enter", "inner:enter", "inner:exit", "outer:exit"]
        );
    }

    #[test]
    fn context_start_marking() {
        let mut ctx = CallContext::new().with_request_id("req-1");
        assert_eq!(ctx.request_id(), Some("req-1"));
        assert!(ctx.started_at().is_none());
        ctx.mark_started();
        assert!(ctx.started_at().is_some());
    }
}
