//! Vendor driver abstraction
//!
//! The narrow contract a vendor driver implements to be wrapped by
//! this toolkit. It mirrors the standard SQL-driver capability set:
//! a driver opens connections; a connection always supports prepare,
//! and advertises its optional capabilities through probe methods
//! returning `Option<&dyn …>`. The shim preserves those answers on
//! the wrapped connection.

pub mod registry;
pub mod shim;

pub use registry::{Db, DriverRegistry};
pub use shim::{wrap, GateConn, GateDriver, GateStmt};

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::GateResult;
use crate::middleware::CallContext;
use crate::value::{ExecResult, NamedValue, Rows, Value};

/// Opens connections to a database.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn open(&self, dsn: &str) -> GateResult<Arc<dyn Connection>>;
}

/// A single database connection.
///
/// `prepare` and `close` are mandatory. Everything else is an
/// optional capability: a probe returning `None` means the
/// connection does not implement it. Connections are shared behind
/// `Arc` and synchronize internally.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn prepare(&self, ctx: CallContext, query: &str) -> GateResult<Box<dyn Statement>>;

    async fn close(&self) -> GateResult<()>;

    /// Transaction support. The shim refuses to wrap connections
    /// that answer `None`.
    fn begin_tx(&self) -> Option<&dyn ConnBeginTx> {
        None
    }

    /// Legacy value-only Exec.
    fn execer(&self) -> Option<&dyn Execer> {
        None
    }

    /// Context-aware Exec.
    fn execer_context(&self) -> Option<&dyn ExecerContext> {
        None
    }

    /// Legacy value-only Query.
    fn queryer(&self) -> Option<&dyn Queryer> {
        None
    }

    /// Context-aware Query.
    fn queryer_context(&self) -> Option<&dyn QueryerContext> {
        None
    }

    /// Pool reset hook.
    fn session_resetter(&self) -> Option<&dyn SessionResetter> {
        None
    }
}

/// Transaction options forwarded to the vendor driver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

#[async_trait]
pub trait ConnBeginTx: Send + Sync {
    async fn begin_tx(&self, ctx: CallContext, opts: TxOptions) -> GateResult<Box<dyn Transaction>>;
}

#[async_trait]
pub trait Transaction: Send + Sync {
    async fn commit(&self) -> GateResult<()>;
    async fn rollback(&self) -> GateResult<()>;
}

/// Legacy value-only Exec capability
#[async_trait]
pub trait Execer: Send + Sync {
    async fn exec(&self, query: &str, args: Vec<Value>) -> GateResult<ExecResult>;
}

/// Context-aware Exec capability
#[async_trait]
pub trait ExecerContext: Send + Sync {
    async fn exec_context(
        &self,
        ctx: CallContext,
        query: &str,
        args: Vec<NamedValue>,
    ) -> GateResult<ExecResult>;
}

/// Legacy value-only Query capability
#[async_trait]
pub trait Queryer: Send + Sync {
    async fn query(&self, query: &str, args: Vec<Value>) -> GateResult<Box<dyn Rows>>;
}

/// Context-aware Query capability
#[async_trait]
pub trait QueryerContext: Send + Sync {
    async fn query_context(
        &self,
        ctx: CallContext,
        query: &str,
        args: Vec<NamedValue>,
    ) -> GateResult<Box<dyn Rows>>;
}

/// Resets per-session state when a pooled connection is reused
#[async_trait]
pub trait SessionResetter: Send + Sync {
    async fn reset_session(&self, ctx: CallContext) -> GateResult<()>;
}

/// A prepared statement.
///
/// Implementations bind to the query text they were prepared with;
/// the shim keeps that text alongside so statement execution
/// re-enters the middleware chain.
#[async_trait]
pub trait Statement: Send + Sync {
    async fn exec(&self, ctx: CallContext, args: Vec<NamedValue>) -> GateResult<ExecResult>;

    async fn query(&self, ctx: CallContext, args: Vec<NamedValue>) -> GateResult<Box<dyn Rows>>;

    /// Number of placeholder parameters, if the driver knows it.
    fn num_input(&self) -> Option<usize> {
        None
    }

    async fn close(&self) -> GateResult<()>;
}
