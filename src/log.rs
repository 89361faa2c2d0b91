//! Logging middleware
//!
//! Emits one structured event per statement with the query text,
//! elapsed milliseconds, the request id extracted from the call
//! context, and one rendered field per argument. The skip sentinel
//! from the driver layer is propagated without logging.

use std::sync::Arc;
use std::time::Instant;

use tracing::Level;

use crate::error::GateError;
use crate::middleware::{CallContext, ExecOp, Middleware, QueryOp};
use crate::value::NamedValue;

/// Extracts a correlation id from the call context.
pub type RequestIdFn = Arc<dyn Fn(&CallContext) -> String + Send + Sync>;

/// Statement logging middleware
#[derive(Clone)]
pub struct LogMiddleware {
    level: Level,
    field_size: usize,
    request_id: RequestIdFn,
}

impl Default for LogMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl LogMiddleware {
    pub fn new() -> Self {
        Self {
            level: Level::INFO,
            field_size: 0,
            request_id: Arc::new(|ctx| ctx.request_id().unwrap_or_default().to_string()),
        }
    }

    /// Sets the event level.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Caps the rendered size of each argument field; zero disables
    /// truncation.
    pub fn with_field_size(mut self, field_size: usize) -> Self {
        self.field_size = field_size;
        self
    }

    /// Replaces the request-id extractor.
    pub fn with_request_id_fn(mut self, f: RequestIdFn) -> Self {
        self.request_id = f;
        self
    }

    fn render_args(&self, args: &[NamedValue]) -> String {
        let mut rendered = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            let mut field = format!("arg{}={:?}", i, arg.value);
            if self.field_size > 0 && field.len() > self.field_size {
                let mut end = self.field_size;
                while !field.is_char_boundary(end) {
                    end -= 1;
                }
                field.truncate(end);
            }
            rendered.push(field);
        }
        rendered.join(" ")
    }

    fn log(
        &self,
        ctx: &CallContext,
        query: &str,
        start: Instant,
        args: &[NamedValue],
        err: Option<&GateError>,
    ) {
        let rt = start.elapsed().as_millis() as u64;
        let request_id = (self.request_id)(ctx);
        let args = self.render_args(args);
        if let Some(err) = err {
            tracing::error!(
                target: "sqlgate::log",
                query,
                rt_ms = rt,
                request_id = %request_id,
                args = %args,
                error = %err,
                "sql log"
            );
        } else if self.level == Level::DEBUG || self.level == Level::TRACE {
            tracing::debug!(
                target: "sqlgate::log",
                query,
                rt_ms = rt,
                request_id = %request_id,
                args = %args,
                "sql log"
            );
        } else if self.level == Level::WARN {
            tracing::warn!(
                target: "sqlgate::log",
                query,
                rt_ms = rt,
                request_id = %request_id,
                args = %args,
                "sql log"
            );
        } else {
            tracing::info!(
                target: "sqlgate::log",
                query,
                rt_ms = rt,
                request_id = %request_id,
                args = %args,
                "sql log"
            );
        }
    }
}

impl Middleware for LogMiddleware {
    fn wrap_exec(&self, next: ExecOp) -> ExecOp {
        let logger = self.clone();
        Arc::new(move |ctx, query, args| {
            let logger = logger.clone();
            let next = Arc::clone(&next);
            Box::pin(async move {
                let start = Instant::now();
                let out = next(ctx.clone(), query.clone(), args.clone()).await;
                match &out {
                    Ok(_) => logger.log(&ctx, &query, start, &args, None),
                    Err(GateError::Skip) => {}
                    Err(err) => logger.log(&ctx, &query, start, &args, Some(err)),
                }
                out
            })
        })
    }

    fn wrap_query(&self, next: QueryOp) -> QueryOp {
        let logger = self.clone();
        Arc::new(move |ctx, query, args| {
            let logger = logger.clone();
            let next = Arc::clone(&next);
            Box::pin(async move {
                let start = Instant::now();
                let out = next(ctx.clone(), query.clone(), args.clone()).await;
                match &out {
                    Ok(_) => logger.log(&ctx, &query, start, &args, None),
                    Err(GateError::Skip) => {}
                    Err(err) => logger.log(&ctx, &query, start, &args, Some(err)),
                }
                out
            })
        })
    }
}
