//! SQL driver interception toolkit
//!
//! A middleware layer between an application and its relational
//! database:
//! - **Audit**: classifies every statement into normal/alarm/banned by
//!   asynchronously obtaining its query plan, caches the verdict, and
//!   refuses banned statements before they reach the database.
//! - **Shadow-table rewriting**: parses a statement and redirects
//!   table, alias, and column-qualifier references to shadow tables.
//! - **Mock**: records or replays canned results keyed by statement
//!   text.
//! - **Log**: emits one structured event per statement with latency
//!   and request id.
//!
//! All of them implement the [`Middleware`] contract and compose
//! around a wrapped vendor driver (see [`driver`]).

pub mod audit;
pub mod driver;
pub mod error;
pub mod log;
pub mod metrics;
pub mod middleware;
pub mod mock;
pub mod rewrite;
pub mod sync_map;
pub mod value;

pub use audit::{Audit, AuditConfig, BlacklistRequest, StatementRecord, Verdict};
pub use error::{ErrorKind, GateError, GateResult};
pub use log::LogMiddleware;
pub use middleware::{CallContext, ExecOp, Middleware, MiddlewareChain, QueryOp};
pub use mock::{Mock, MockRows};
pub use rewrite::{ShadowTable, ShadowTableConfig};
pub use sync_map::SyncMap;
pub use value::{ExecResult, NamedValue, Rows, Value};
