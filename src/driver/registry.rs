//! Driver registry and database handle
//!
//! Wrapped drivers are registered under a name and opened like any
//! other driver. The [`Db`] handle returned by `open` is what the
//! audit middleware takes back so its EXPLAIN calls reuse the same
//! wrapped connection.

use std::sync::Arc;

use crate::error::{GateError, GateResult};
use crate::middleware::CallContext;
use crate::sync_map::SyncMap;
use crate::value::{named_value_to_value, ExecResult, NamedValue, Rows};

use super::{Connection, Driver, Statement, Transaction, TxOptions};

/// Registry that holds named drivers
pub struct DriverRegistry {
    drivers: SyncMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self { drivers: SyncMap::new() }
    }

    /// Registers a driver under a name, overriding any previous
    /// registration.
    pub fn register(&self, name: impl Into<String>, driver: Arc<dyn Driver>) {
        self.drivers.put(name.into(), driver);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(&name.to_string())
    }

    /// Lists all registered driver names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.snapshot().into_keys().collect();
        names.sort();
        names
    }

    /// Opens a connection through the named driver.
    pub async fn open(&self, name: &str, dsn: &str) -> GateResult<Db> {
        let driver = self
            .get(name)
            .ok_or_else(|| GateError::config(format!("driver not registered: {name}")))?;
        let conn = driver.open(dsn).await?;
        Ok(Db { conn })
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A cheaply cloneable handle over an open connection.
///
/// Prefers the context-aware capabilities and falls back to the
/// prepared-statement path when the connection lacks one or answers
/// with the skip sentinel.
#[derive(Clone)]
pub struct Db {
    conn: Arc<dyn Connection>,
}

impl Db {
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    pub async fn exec(
        &self,
        ctx: CallContext,
        query: &str,
        args: Vec<NamedValue>,
    ) -> GateResult<ExecResult> {
        if let Some(execer) = self.conn.execer_context() {
            match execer.exec_context(ctx.clone(), query, args.clone()).await {
                Err(GateError::Skip) => {}
                other => return other,
            }
        } else if let Some(execer) = self.conn.execer() {
            let values = named_value_to_value(&args)?;
            match execer.exec(query, values).await {
                Err(GateError::Skip) => {}
                other => return other,
            }
        }

        let stmt = self.conn.prepare(ctx.clone(), query).await?;
        let result = stmt.exec(ctx, args).await;
        stmt.close().await?;
        result
    }

    pub async fn query(
        &self,
        ctx: CallContext,
        query: &str,
        args: Vec<NamedValue>,
    ) -> GateResult<Box<dyn Rows>> {
        if let Some(queryer) = self.conn.queryer_context() {
            match queryer.query_context(ctx.clone(), query, args.clone()).await {
                Err(GateError::Skip) => {}
                other => return other,
            }
        } else if let Some(queryer) = self.conn.queryer() {
            let values = named_value_to_value(&args)?;
            match queryer.query(query, values).await {
                Err(GateError::Skip) => {}
                other => return other,
            }
        }

        let stmt = self.conn.prepare(ctx.clone(), query).await?;
        let result = stmt.query(ctx, args).await;
        stmt.close().await?;
        result
    }

    pub async fn prepare(&self, ctx: CallContext, query: &str) -> GateResult<Box<dyn Statement>> {
        self.conn.prepare(ctx, query).await
    }

    pub async fn begin(&self, ctx: CallContext, opts: TxOptions) -> GateResult<Box<dyn Transaction>> {
        match self.conn.begin_tx() {
            Some(tx) => tx.begin_tx(ctx, opts).await,
            None => Err(GateError::unsupported("driver must implement ConnBeginTx")),
        }
    }

    pub async fn close(&self) -> GateResult<()> {
        self.conn.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::shim::tests::{Caps, FakeDriver};
    use crate::driver::wrap;
    use crate::middleware::MiddlewareChain;
    use crate::value::Value;

    fn registry_with_fake(caps: Caps) -> DriverRegistry {
        let registry = DriverRegistry::new();
        let wrapped = wrap(
            Arc::new(FakeDriver { caps }),
            Arc::new(MiddlewareChain::new()),
        );
        registry.register("audit:fake", Arc::new(wrapped));
        registry
    }

    #[tokio::test]
    async fn open_unknown_driver_fails() {
        let registry = DriverRegistry::new();
        let err = registry.open("nope", "dsn").await.err().unwrap();
        assert!(matches!(err, GateError::Config { .. }));
    }

    #[tokio::test]
    async fn open_and_query_through_capabilities() {
        let registry = registry_with_fake(Caps::full());
        let db = registry.open("audit:fake", "dsn").await.unwrap();
        let mut rows = db
            .query(CallContext::new(), "select 1", Vec::new())
            .await
            .unwrap();
        assert_eq!(rows.next().unwrap(), Some(vec![Value::Int(1)]));
    }

    #[tokio::test]
    async fn query_falls_back_to_prepared_path() {
        let mut caps = Caps::full();
        caps.query_context = false;
        caps.query_legacy = false;
        let registry = registry_with_fake(caps);
        let db = registry.open("audit:fake", "dsn").await.unwrap();
        let mut rows = db
            .query(CallContext::new(), "select 1", Vec::new())
            .await
            .unwrap();
        assert!(rows.next().unwrap().is_some());
    }

    #[tokio::test]
    async fn registry_lists_sorted_names() {
        let registry = registry_with_fake(Caps::full());
        let wrapped = wrap(
            Arc::new(FakeDriver { caps: Caps::full() }),
            Arc::new(MiddlewareChain::new()),
        );
        registry.register("audit:other", Arc::new(wrapped));
        assert_eq!(registry.list(), vec!["audit:fake", "audit:other"]);
    }
}
