//! Statement auditing middleware
//!
//! Classifies every statement flowing through the wrapped driver
//! into normal/alarm/banned by asynchronously obtaining its query
//! plan, caches the verdict keyed by statement text, and on later
//! executions either passes, records a warning, or refuses the
//! statement before it reaches the database.
//!
//! Classification never blocks a caller: the first sight of a
//! statement installs a temporary cache entry and schedules a
//! detached EXPLAIN task with a bounded deadline. Exactly one task
//! runs per statement text; concurrent first-sight callers pass
//! through against the temporary entry.

pub mod explain;

pub use explain::{ExplainRow, Table, TABLES_QUERY};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::driver::Db;
use crate::error::{GateError, GateResult};
use crate::metrics::{self, MetricsSnapshot};
use crate::middleware::{CallContext, ExecOp, Middleware, QueryOp};
use crate::sync_map::SyncMap;
use crate::value::{named_to_values, NamedValue, Value};

/// Default alarm threshold (scanned rows)
pub const DEFAULT_ALARM_THRESHOLD: i64 = 500;

/// Default banned threshold (scanned rows)
pub const DEFAULT_BANNED_THRESHOLD: i64 = 100_000;

/// EXPLAIN substrings that trigger classification even when the
/// access type is index-backed
const DEFAULT_EXPLAIN_EXTRA_TRIGGERS: [&str; 3] = ["Block Nested Loop", "temporary", "filesort"];

/// Reason tag carried by a record whose first EXPLAIN is in flight
pub const TEMPORARY_REASON: &str = "__temporary";

/// Deadline for the detached EXPLAIN task
const EXPLAIN_DEADLINE: Duration = Duration::from_secs(3);

/// Statement risk classification, ordered `Normal < Alarm < Banned`.
///
/// `Alarm` means the statement misses an index but scans few enough
/// rows to let through; `Banned` means it is refused outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Normal,
    Alarm,
    Banned,
}

impl Default for Verdict {
    fn default() -> Self {
        Self::Normal
    }
}

impl Verdict {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// A cached statement with its plan and verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementRecord {
    pub query: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(rename = "explain", default)]
    pub plan: Vec<ExplainRow>,
    #[serde(rename = "alarm_type", default)]
    pub verdict: Verdict,
    #[serde(default)]
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl StatementRecord {
    fn temporary(query: &str, args: Vec<Value>) -> Self {
        Self {
            query: query.to_string(),
            args,
            plan: Vec::new(),
            verdict: Verdict::Normal,
            reason: TEMPORARY_REASON.to_string(),
            created_at: Utc::now(),
        }
    }

    /// True while the record's first EXPLAIN is still in flight.
    pub fn is_temporary(&self) -> bool {
        self.reason == TEMPORARY_REASON
    }
}

/// Decides whether a statement is subject to auditing at all.
pub type ShouldAuditFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Extracts extra log fields (trace ids, tenant, …) from the call
/// context.
pub type ContextFieldsFn = Arc<dyn Fn(&CallContext) -> Vec<(String, String)> + Send + Sync>;

/// Audit middleware configuration.
///
/// Deserializes from the same JSON shape the administration surface
/// renders; the two closures are injected programmatically.
#[derive(Clone, Default, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub app: String,

    #[serde(default)]
    pub database_name: String,

    /// Alarm when scanned rows exceed this, defaults to 500
    #[serde(default)]
    pub alarm_threshold: Option<i64>,

    /// Ban when scanned rows exceed this, defaults to 100 000;
    /// non-positive values take the default
    #[serde(default)]
    pub banned_threshold: i64,

    /// Log already-classified statements at or below this verdict
    /// level, defaults to alarm
    #[serde(default)]
    pub seen_sql_log_level: Option<i32>,

    /// Statements never audited
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// Verdict cache TTL; absent means records live forever
    #[serde(default)]
    pub sql_cache_duration_ms: Option<u64>,

    /// Extra EXPLAIN trigger substrings, merged over the defaults
    #[serde(default)]
    pub explain_extra_alarm_substrs: Vec<String>,

    #[serde(skip)]
    pub should_audit: Option<ShouldAuditFn>,

    #[serde(skip)]
    pub context_fields: Option<ContextFieldsFn>,
}

/// Blacklist injection body for the administration surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlacklistRequest {
    pub query: String,
    #[serde(rename = "alarm_type")]
    pub verdict: Verdict,
    pub reason: String,
}

/// Serializable snapshot of the effective configuration
#[derive(Debug, Clone, Serialize)]
pub struct AuditConfigView {
    pub app: String,
    pub database: String,
    pub alarm_threshold: i64,
    pub banned_threshold: i64,
    pub seen_sql_log_level: i32,
    pub whitelist: Vec<String>,
    pub sql_cache_duration_ms: Option<u64>,
    pub explain_extra_alarm_substrs: Vec<String>,
}

/// Default audit predicate: the first six characters, after leading
/// whitespace, must spell a DML keyword.
pub fn default_should_audit(query: &str) -> bool {
    let query = query.trim_start();
    if query.len() < 6 {
        return false;
    }
    let Some(prefix) = query.get(0..6) else {
        return false;
    };
    ["select", "insert", "update", "delete"]
        .iter()
        .any(|kw| prefix.eq_ignore_ascii_case(kw))
}

/// Statement auditing middleware; cheap to clone, all clones share
/// state.
#[derive(Clone)]
pub struct Audit {
    inner: Arc<AuditInner>,
}

struct AuditInner {
    app: String,
    database_name: String,
    alarm_threshold: i64,
    banned_threshold: i64,
    seen_sql_log_level: AtomicI32,
    sql_cache_duration: Option<Duration>,
    config_whitelist: Vec<String>,
    extra_triggers: HashSet<String>,
    should_audit: ShouldAuditFn,
    context_fields: ContextFieldsFn,
    records: SyncMap<String, Arc<StatementRecord>>,
    whitelist: SyncMap<String, ()>,
    db: RwLock<Option<Db>>,
}

impl Audit {
    pub fn new(config: AuditConfig) -> Self {
        let alarm_threshold = config.alarm_threshold.unwrap_or(DEFAULT_ALARM_THRESHOLD);
        let banned_threshold = if config.banned_threshold <= 0 {
            DEFAULT_BANNED_THRESHOLD
        } else {
            config.banned_threshold
        };
        let seen_sql_log_level = config
            .seen_sql_log_level
            .unwrap_or(Verdict::Alarm.as_i32());

        let mut extra_triggers: HashSet<String> = DEFAULT_EXPLAIN_EXTRA_TRIGGERS
            .iter()
            .map(|s| s.to_string())
            .collect();
        extra_triggers.extend(config.explain_extra_alarm_substrs.iter().cloned());

        let should_audit = config
            .should_audit
            .unwrap_or_else(|| Arc::new(default_should_audit));
        let context_fields = config
            .context_fields
            .unwrap_or_else(|| Arc::new(|_| Vec::new()));

        Self {
            inner: Arc::new(AuditInner {
                app: config.app,
                database_name: config.database_name,
                alarm_threshold,
                banned_threshold,
                seen_sql_log_level: AtomicI32::new(seen_sql_log_level),
                sql_cache_duration: config.sql_cache_duration_ms.map(Duration::from_millis),
                config_whitelist: config.whitelist,
                extra_triggers,
                should_audit,
                context_fields,
                records: SyncMap::new(),
                whitelist: SyncMap::new(),
                db: RwLock::new(None),
            }),
        }
    }

    /// Warms the whitelist and initialises the metric sinks. Safe to
    /// call more than once.
    pub fn provision(&self) -> GateResult<()> {
        self.inner.whitelist.put(TABLES_QUERY.to_string(), ());
        for query in &self.inner.config_whitelist {
            self.inner.whitelist.put(query.clone(), ());
        }
        metrics::init();
        Ok(())
    }

    /// Fails unless a database handle has been attached.
    pub fn validate(&self) -> GateResult<()> {
        if self.inner.db.read().unwrap().is_none() {
            return Err(GateError::config("no database attached"));
        }
        Ok(())
    }

    /// Attaches the database handle EXPLAIN runs against. Callers
    /// pass back the handle opened through the wrapped driver so
    /// classification reuses the same pool.
    pub fn set_db(&self, db: Db) {
        *self.inner.db.write().unwrap() = Some(db);
    }

    /// Adjusts the seen-statement log level at runtime. Lock-free.
    pub fn set_seen_sql_log_level(&self, level: i32) {
        self.inner.seen_sql_log_level.store(level, Ordering::Relaxed);
    }

    pub fn seen_sql_log_level(&self) -> i32 {
        self.inner.seen_sql_log_level.load(Ordering::Relaxed)
    }

    /// True when the statement is subject to auditing: not
    /// whitelisted and accepted by the audit predicate.
    pub fn should_audit(&self, query: &str) -> bool {
        if self.inner.whitelist.get(&query.to_string()).is_some() {
            return false;
        }
        (self.inner.should_audit)(query)
    }

    /// Injects a verdict without waiting for first sight. Not
    /// persisted.
    pub fn add_blacklist_query(&self, query: impl Into<String>, verdict: Verdict, reason: impl Into<String>) {
        let query = query.into();
        let record = StatementRecord {
            query: query.clone(),
            args: Vec::new(),
            plan: Vec::new(),
            verdict,
            reason: reason.into(),
            created_at: Utc::now(),
        };
        self.inner.records.put(query, Arc::new(record));
    }

    /// Exempts a statement from auditing. Not persisted.
    pub fn add_whitelist_query(&self, query: impl Into<String>) {
        self.inner.whitelist.put(query.into(), ());
    }

    pub fn remove_whitelist_query(&self, query: &str) {
        self.inner.whitelist.remove(&query.to_string());
    }

    /// All whitelisted statements, static and dynamic.
    pub fn whitelists(&self) -> Vec<String> {
        let mut whitelist: Vec<String> = self.inner.whitelist.snapshot().into_keys().collect();
        whitelist.sort();
        whitelist
    }

    pub fn get_record(&self, query: &str) -> Option<Arc<StatementRecord>> {
        self.inner.records.get(&query.to_string())
    }

    /// Stores a record directly; used for blacklist injection and
    /// administrative repair.
    pub fn set_record(&self, record: StatementRecord) -> GateResult<()> {
        if record.query.is_empty() {
            return Err(GateError::config("record with empty query"));
        }
        self.inner.records.put(record.query.clone(), Arc::new(record));
        Ok(())
    }

    pub fn delete_record(&self, query: &str) {
        self.inner.records.remove(&query.to_string());
    }

    pub fn clear_records(&self) {
        self.inner.records.clear();
    }

    /// All cached statements keyed by query text.
    pub fn records(&self) -> HashMap<String, Arc<StatementRecord>> {
        self.inner.records.snapshot()
    }

    /// Table inventory of the audited schema, via the attached
    /// handle.
    pub async fn tables(&self) -> GateResult<HashMap<String, Table>> {
        let db = self.db()?;
        explain::tables(&db, &self.inner.database_name).await
    }

    /// Effective configuration for the administration surface.
    pub fn config_view(&self) -> AuditConfigView {
        let mut triggers: Vec<String> = self.inner.extra_triggers.iter().cloned().collect();
        triggers.sort();
        AuditConfigView {
            app: self.inner.app.clone(),
            database: self.inner.database_name.clone(),
            alarm_threshold: self.inner.alarm_threshold,
            banned_threshold: self.inner.banned_threshold,
            seen_sql_log_level: self.seen_sql_log_level(),
            whitelist: self.whitelists(),
            sql_cache_duration_ms: self.inner.sql_cache_duration.map(|d| d.as_millis() as u64),
            explain_extra_alarm_substrs: triggers,
        }
    }

    /// Phase-duration histograms for the administration surface.
    pub fn metrics(&self) -> MetricsSnapshot {
        metrics::snapshot()
    }

    fn db(&self) -> GateResult<Db> {
        self.inner
            .db
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| GateError::config("no database attached"))
    }

    fn render_context(&self, ctx: &CallContext) -> String {
        (self.inner.context_fields)(ctx)
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Pre-phase: whitelist fast path, verdict cache consult,
    /// first-sight placement. Returns the context to run the inner
    /// call with, or the banned refusal.
    pub fn before(
        &self,
        ctx: CallContext,
        query: &str,
        args: &[NamedValue],
    ) -> GateResult<CallContext> {
        if !self.should_audit(query) {
            return Ok(ctx);
        }
        let start = Instant::now();
        let out = self.before_audited(ctx, query, args);
        metrics::observe_before_duration(start.elapsed());
        out
    }

    fn before_audited(
        &self,
        mut ctx: CallContext,
        query: &str,
        args: &[NamedValue],
    ) -> GateResult<CallContext> {
        if let Some(record) = self.inner.records.get(&query.to_string()) {
            if self.is_stale(&record) {
                // Jitter spreads re-EXPLAINs so one TTL does not
                // invalidate everything at once.
                self.inner.records.remove(&query.to_string());
            } else {
                let level = self.seen_sql_log_level();
                let context = self.render_context(&ctx);
                match record.verdict {
                    Verdict::Banned => {
                        if level <= Verdict::Banned.as_i32() {
                            error!(
                                target: "sqlgate::audit",
                                query,
                                context = %context,
                                error = %GateError::banned(query),
                                alarm = true,
                                "seen banned query"
                            );
                        }
                        return Err(GateError::banned(query));
                    }
                    Verdict::Alarm => {
                        if level <= Verdict::Alarm.as_i32() {
                            error!(
                                target: "sqlgate::audit",
                                query,
                                context = %context,
                                error = %GateError::Alarm,
                                alarm = true,
                                "seen alarm query"
                            );
                        }
                        ctx.mark_started();
                        return Ok(ctx);
                    }
                    Verdict::Normal => {
                        if level <= Verdict::Normal.as_i32() {
                            info!(target: "sqlgate::audit", query, context = %context, "seen normal query");
                            ctx.mark_started();
                            return Ok(ctx);
                        }
                        return Ok(ctx);
                    }
                }
            }
        }

        let placeholder = Arc::new(StatementRecord::temporary(query, named_to_values(args)));
        let (_, loaded) = self
            .inner
            .records
            .put_if_absent(query.to_string(), Arc::clone(&placeholder));
        if !loaded {
            // We won first sight; everyone else passes through until
            // the verdict lands.
            self.spawn_explain(&ctx, query.to_string(), placeholder.args.clone());
        }
        Ok(ctx)
    }

    fn is_stale(&self, record: &StatementRecord) -> bool {
        let Some(ttl) = self.inner.sql_cache_duration else {
            return false;
        };
        let age = (Utc::now() - record.created_at).to_std().unwrap_or_default();
        age > ttl + jitter_seconds(30)
    }

    /// Post-phase: emit the rt event if the pre-phase attached a
    /// start instant.
    pub fn after(&self, ctx: &CallContext, query: &str) {
        let start = Instant::now();
        if let Some(call_start) = ctx.started_at() {
            info!(
                target: "sqlgate::audit",
                query,
                rt_ms = call_start.elapsed().as_millis() as u64,
                context = %self.render_context(ctx),
                "query rt"
            );
        }
        metrics::observe_after_duration(start.elapsed());
    }

    /// Schedules the detached EXPLAIN task for a first-sight
    /// statement. The task never inherits caller cancellation and is
    /// bounded by its own deadline; any failure removes the
    /// temporary record so the next caller retries.
    fn spawn_explain(&self, ctx: &CallContext, query: String, args: Vec<Value>) {
        let audit = self.clone();
        let context = self.render_context(ctx);
        tokio::spawn(async move {
            let task =
                std::panic::AssertUnwindSafe(audit.classify(&query, &args, &context)).catch_unwind();
            if let Err(panic) = task.await {
                audit.inner.records.remove(&query);
                let message = panic_message(&*panic);
                error!(
                    target: "sqlgate::audit",
                    query = %query,
                    panic = %message,
                    alarm = true,
                    "audit task panicked"
                );
            }
        });
    }

    async fn classify(&self, query: &str, args: &[Value], context: &str) {
        let db = match self.db() {
            Ok(db) => db,
            Err(err) => {
                self.inner.records.remove(&query.to_string());
                error!(target: "sqlgate::audit", query, error = %err, alarm = true, "async explain failed");
                return;
            }
        };

        let plan = match tokio::time::timeout(EXPLAIN_DEADLINE, explain::explain(&db, query, args))
            .await
        {
            Ok(Ok(plan)) => plan,
            Ok(Err(err)) => {
                self.inner.records.remove(&query.to_string());
                error!(target: "sqlgate::audit", query, error = %err, alarm = true, "async explain failed");
                return;
            }
            Err(_) => {
                self.inner.records.remove(&query.to_string());
                error!(
                    target: "sqlgate::audit",
                    query,
                    timeout_ms = EXPLAIN_DEADLINE.as_millis() as u64,
                    alarm = true,
                    "async explain timed out"
                );
                return;
            }
        };

        let (verdict, reason) = self.detect_verdict(&plan);
        let record = StatementRecord {
            query: query.to_string(),
            args: args.to_vec(),
            plan,
            verdict,
            reason: reason.clone(),
            created_at: Utc::now(),
        };
        self.inner.records.put(query.to_string(), Arc::new(record));

        match verdict {
            Verdict::Banned => {
                error!(
                    target: "sqlgate::audit",
                    query,
                    context = %context,
                    reason = %reason,
                    error = %GateError::banned(query),
                    alarm = true,
                    "new found banned query"
                );
            }
            Verdict::Alarm => {
                error!(
                    target: "sqlgate::audit",
                    query,
                    context = %context,
                    reason = %reason,
                    error = %GateError::Alarm,
                    alarm = true,
                    "new found alarm query"
                );
            }
            Verdict::Normal => {
                info!(target: "sqlgate::audit", query, context = %context, "new found normal query");
            }
        }
    }

    /// Record verdict = maximum over per-row verdicts; the reason is
    /// the one of the row that set the maximum.
    pub fn detect_verdict(&self, plan: &[ExplainRow]) -> (Verdict, String) {
        let mut verdict = Verdict::Normal;
        let mut reason = String::new();
        for row in plan {
            let (row_verdict, row_reason) = self.detect_row_verdict(row);
            if row_verdict > verdict {
                verdict = row_verdict;
                reason = row_reason;
            }
        }
        (verdict, reason)
    }

    fn detect_row_verdict(&self, row: &ExplainRow) -> (Verdict, String) {
        let mut verdict = Verdict::Normal;
        let mut reason = String::new();

        // Planner rows for aggregations and subqueries carry no
        // table or access type; skip them.
        if row.table.is_none() || row.access_type.is_none() {
            return (verdict, reason);
        }
        let rows = row.rows.unwrap_or(0);

        if let Some(access_type) = &row.access_type {
            if access_type == "ALL" || access_type == "index" {
                reason = format!("explain:type:{access_type}");
                if rows > self.inner.banned_threshold {
                    verdict = Verdict::Banned;
                } else if rows > self.inner.alarm_threshold {
                    verdict = Verdict::Alarm;
                }
            }
        }

        if verdict == Verdict::Normal {
            if let Some(extra) = &row.extra {
                for trigger in &self.inner.extra_triggers {
                    if extra.contains(trigger) {
                        reason = format!("explain:extra:{trigger}");
                        if rows > self.inner.banned_threshold {
                            verdict = Verdict::Banned;
                        } else if rows > self.inner.alarm_threshold {
                            verdict = Verdict::Alarm;
                        }
                    }
                }
            }
        }

        (verdict, reason)
    }
}

impl Middleware for Audit {
    fn wrap_exec(&self, next: ExecOp) -> ExecOp {
        let audit = self.clone();
        Arc::new(move |ctx, query, args| {
            let audit = audit.clone();
            let next = Arc::clone(&next);
            Box::pin(async move {
                let ctx = audit.before(ctx, &query, &args)?;
                let result = next(ctx.clone(), query.clone(), args).await?;
                audit.after(&ctx, &query);
                Ok(result)
            })
        })
    }

    fn wrap_query(&self, next: QueryOp) -> QueryOp {
        let audit = self.clone();
        Arc::new(move |ctx, query, args| {
            let audit = audit.clone();
            let next = Arc::clone(&next);
            Box::pin(async move {
                let ctx = audit.before(ctx, &query, &args)?;
                let rows = next(ctx.clone(), query.clone(), args).await?;
                audit.after(&ctx, &query);
                Ok(rows)
            })
        })
    }
}

fn jitter_seconds(n: u64) -> Duration {
    Duration::from_secs(rand::thread_rng().gen_range(0..n))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
