//! Shadow-table statement rewriter
//!
//! Parses a statement and redirects every table reference to its
//! shadow counterpart: table names, table-source aliases, and column
//! qualifiers all get the configured prefix/suffix template. Used to
//! route pre-production test traffic away from production tables.
//!
//! Rewrites are cached by original statement text; non-DML
//! statements pass through unchanged.

use std::collections::HashMap;
use std::sync::Arc;

use sqlparser::ast::{
    Assignment, AssignmentTarget, Expr, FunctionArguments, Ident, ObjectName, ObjectNamePart,
    OrderByKind, Query, Select, SelectItem, SetExpr, Statement, TableAlias, TableFactor,
    TableObject, TableWithJoins,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

use crate::error::{GateError, GateResult};
use crate::middleware::{ExecOp, Middleware, QueryOp};
use crate::sync_map::SyncMap;

/// Shadow-table naming template. At least one of prefix and suffix
/// must be non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ShadowTableConfig {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
}

/// Statement rewriter redirecting table references to shadow tables
#[derive(Clone)]
pub struct ShadowTable {
    inner: Arc<ShadowInner>,
}

struct ShadowInner {
    prefix: String,
    suffix: String,
    cache: SyncMap<String, String>,
}

impl ShadowTable {
    /// Validates the template and builds the rewriter.
    pub fn provision(config: ShadowTableConfig) -> GateResult<Self> {
        if config.prefix.is_empty() && config.suffix.is_empty() {
            return Err(GateError::config(
                "shadow table requires a non-empty prefix or suffix",
            ));
        }
        Ok(Self {
            inner: Arc::new(ShadowInner {
                prefix: config.prefix,
                suffix: config.suffix,
                cache: SyncMap::new(),
            }),
        })
    }

    /// Rewrites a statement, consulting the cache first.
    ///
    /// Non-DML statements are returned unchanged and uncached. Any
    /// parse or serialisation failure surfaces the original text and
    /// leaves the cache untouched.
    pub fn rewrite(&self, sql: &str) -> GateResult<String> {
        if let Some(hit) = self.inner.cache.get(&sql.to_string()) {
            return Ok(hit);
        }

        let mut statements = Parser::parse_sql(&MySqlDialect {}, sql)
            .map_err(|e| GateError::rewrite(sql, e.to_string()))?;
        let Some(statement) = statements.first_mut() else {
            return Err(GateError::rewrite(sql, "no statement found"));
        };

        if !matches!(
            statement,
            Statement::Query(_) | Statement::Insert(_) | Statement::Update { .. } | Statement::Delete(_)
        ) {
            return Ok(sql.to_string());
        }

        self.rewrite_statement(statement);
        let rewritten = statement.to_string();
        self.inner.cache.put(sql.to_string(), rewritten.clone());
        Ok(rewritten)
    }

    /// Snapshot of all cached original → rewritten pairs.
    pub fn rewritten(&self) -> HashMap<String, String> {
        self.inner.cache.snapshot()
    }

    fn shadow_name(&self, name: &str) -> String {
        format!("{}{}{}", self.inner.prefix, name, self.inner.suffix)
    }

    // --- AST walking ---

    fn rewrite_statement(&self, statement: &mut Statement) {
        match statement {
            Statement::Query(query) => self.rewrite_query(query),
            Statement::Insert(insert) => {
                if let TableObject::TableName(name) = &mut insert.table {
                    self.rewrite_object_name(name);
                }
                if let Some(source) = &mut insert.source {
                    self.rewrite_query(source);
                }
                for assignment in &mut insert.assignments {
                    self.rewrite_assignment(assignment);
                }
                if let Some(sqlparser::ast::OnInsert::DuplicateKeyUpdate(assignments)) =
                    &mut insert.on
                {
                    for assignment in assignments {
                        self.rewrite_assignment(assignment);
                    }
                }
            }
            Statement::Update { table, assignments, from, selection, .. } => {
                self.rewrite_table_with_joins(table);
                for assignment in assignments {
                    self.rewrite_assignment(assignment);
                }
                if let Some(from) = from {
                    match from {
                        sqlparser::ast::UpdateTableFromKind::BeforeSet(tables)
                        | sqlparser::ast::UpdateTableFromKind::AfterSet(tables) => {
                            for table in tables {
                                self.rewrite_table_with_joins(table);
                            }
                        }
                    }
                }
                if let Some(selection) = selection {
                    self.rewrite_expr(selection);
                }
            }
            Statement::Delete(delete) => {
                for name in &mut delete.tables {
                    self.rewrite_object_name(name);
                }
                match &mut delete.from {
                    sqlparser::ast::FromTable::WithFromKeyword(tables)
                    | sqlparser::ast::FromTable::WithoutKeyword(tables) => {
                        for table in tables {
                            self.rewrite_table_with_joins(table);
                        }
                    }
                }
                if let Some(using) = &mut delete.using {
                    for table in using {
                        self.rewrite_table_with_joins(table);
                    }
                }
                if let Some(selection) = &mut delete.selection {
                    self.rewrite_expr(selection);
                }
            }
            _ => {}
        }
    }

    fn rewrite_query(&self, query: &mut Query) {
        self.rewrite_set_expr(&mut query.body);

        if let Some(with) = &mut query.with {
            for cte in &mut with.cte_tables {
                self.rewrite_query(&mut cte.query);
            }
        }

        if let Some(order_by) = &mut query.order_by {
            if let OrderByKind::Expressions(exprs) = &mut order_by.kind {
                for order_expr in exprs {
                    self.rewrite_expr(&mut order_expr.expr);
                }
            }
        }
    }

    fn rewrite_set_expr(&self, set_expr: &mut SetExpr) {
        match set_expr {
            SetExpr::Select(select) => self.rewrite_select(select),
            SetExpr::Query(query) => self.rewrite_query(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.rewrite_set_expr(left);
                self.rewrite_set_expr(right);
            }
            SetExpr::Values(values) => {
                for row in &mut values.rows {
                    for expr in row {
                        self.rewrite_expr(expr);
                    }
                }
            }
            _ => {}
        }
    }

    fn rewrite_select(&self, select: &mut Select) {
        for table_with_joins in &mut select.from {
            self.rewrite_table_with_joins(table_with_joins);
        }

        for item in &mut select.projection {
            if let SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } = item {
                self.rewrite_expr(expr);
            }
        }

        if let Some(selection) = &mut select.selection {
            self.rewrite_expr(selection);
        }

        if let sqlparser::ast::GroupByExpr::Expressions(exprs, _) = &mut select.group_by {
            for expr in exprs {
                self.rewrite_expr(expr);
            }
        }

        if let Some(having) = &mut select.having {
            self.rewrite_expr(having);
        }
    }

    fn rewrite_table_with_joins(&self, twj: &mut TableWithJoins) {
        self.rewrite_table_factor(&mut twj.relation);
        for join in &mut twj.joins {
            self.rewrite_table_factor(&mut join.relation);
            match &mut join.join_operator {
                sqlparser::ast::JoinOperator::Inner(constraint)
                | sqlparser::ast::JoinOperator::LeftOuter(constraint)
                | sqlparser::ast::JoinOperator::RightOuter(constraint)
                | sqlparser::ast::JoinOperator::FullOuter(constraint) => {
                    if let sqlparser::ast::JoinConstraint::On(expr) = constraint {
                        self.rewrite_expr(expr);
                    }
                }
                _ => {}
            }
        }
    }

    fn rewrite_table_factor(&self, factor: &mut TableFactor) {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                self.rewrite_object_name(name);
                if let Some(alias) = alias {
                    self.rewrite_alias(alias);
                }
            }
            TableFactor::Derived { subquery, alias, .. } => {
                self.rewrite_query(subquery);
                if let Some(alias) = alias {
                    self.rewrite_alias(alias);
                }
            }
            TableFactor::NestedJoin { table_with_joins, alias } => {
                self.rewrite_table_with_joins(table_with_joins);
                if let Some(alias) = alias {
                    self.rewrite_alias(alias);
                }
            }
            _ => {}
        }
    }

    /// Rewrites the table identifier of a possibly schema-qualified
    /// name; the schema part is untouched.
    fn rewrite_object_name(&self, name: &mut ObjectName) {
        if let Some(ObjectNamePart::Identifier(ident)) = name.0.last_mut() {
            *ident = Ident::new(self.shadow_name(&ident.value));
        }
    }

    fn rewrite_alias(&self, alias: &mut TableAlias) {
        alias.name = Ident::new(self.shadow_name(&alias.name.value));
    }

    fn rewrite_assignment(&self, assignment: &mut Assignment) {
        match &mut assignment.target {
            AssignmentTarget::ColumnName(name) => self.rewrite_column_qualifier(name),
            AssignmentTarget::Tuple(names) => {
                for name in names {
                    self.rewrite_column_qualifier(name);
                }
            }
        }
        self.rewrite_expr(&mut assignment.value);
    }

    /// Rewrites the table qualifier of a qualified column target;
    /// bare column names are untouched.
    fn rewrite_column_qualifier(&self, name: &mut ObjectName) {
        let len = name.0.len();
        if len < 2 {
            return;
        }
        for (i, part) in name.0.iter_mut().enumerate() {
            if let ObjectNamePart::Identifier(ident) = part {
                let value = if i == len - 2 {
                    self.shadow_name(&ident.value)
                } else {
                    ident.value.clone()
                };
                *ident = Ident::new(value);
            }
        }
    }

    fn rewrite_expr(&self, expr: &mut Expr) {
        match expr {
            Expr::CompoundIdentifier(idents) => {
                let len = idents.len();
                if len < 2 {
                    return;
                }
                // table.column or schema.table.column: the table
                // qualifier tracks the rewrite, quotes drop.
                *idents = idents
                    .iter()
                    .enumerate()
                    .map(|(i, ident)| {
                        if i == len - 2 {
                            Ident::new(self.shadow_name(&ident.value))
                        } else {
                            Ident::new(ident.value.clone())
                        }
                    })
                    .collect();
            }
            Expr::BinaryOp { left, right, .. } => {
                self.rewrite_expr(left);
                self.rewrite_expr(right);
            }
            Expr::UnaryOp { expr: inner, .. } => {
                self.rewrite_expr(inner);
            }
            Expr::Nested(inner) => {
                self.rewrite_expr(inner);
            }
            Expr::Function(func) => {
                if let FunctionArguments::List(arg_list) = &mut func.args {
                    for arg in &mut arg_list.args {
                        if let sqlparser::ast::FunctionArg::Unnamed(
                            sqlparser::ast::FunctionArgExpr::Expr(e),
                        ) = arg
                        {
                            self.rewrite_expr(e);
                        }
                    }
                }
            }
            Expr::Cast { expr: inner, .. } => {
                self.rewrite_expr(inner);
            }
            Expr::IsNull(inner)
            | Expr::IsNotNull(inner)
            | Expr::IsTrue(inner)
            | Expr::IsFalse(inner) => {
                self.rewrite_expr(inner);
            }
            Expr::Between { expr: inner, low, high, .. } => {
                self.rewrite_expr(inner);
                self.rewrite_expr(low);
                self.rewrite_expr(high);
            }
            Expr::InList { expr: inner, list, .. } => {
                self.rewrite_expr(inner);
                for item in list {
                    self.rewrite_expr(item);
                }
            }
            Expr::InSubquery { expr: inner, subquery, .. } => {
                self.rewrite_expr(inner);
                self.rewrite_set_expr(subquery);
            }
            Expr::Subquery(subquery) => {
                self.rewrite_query(subquery);
            }
            Expr::Exists { subquery, .. } => {
                self.rewrite_query(subquery);
            }
            Expr::Case { operand, conditions, else_result, .. } => {
                if let Some(operand) = operand {
                    self.rewrite_expr(operand);
                }
                for case_when in conditions {
                    self.rewrite_expr(&mut case_when.condition);
                    self.rewrite_expr(&mut case_when.result);
                }
                if let Some(else_result) = else_result {
                    self.rewrite_expr(else_result);
                }
            }
            Expr::Like { expr: inner, pattern, .. } | Expr::ILike { expr: inner, pattern, .. } => {
                self.rewrite_expr(inner);
                self.rewrite_expr(pattern);
            }
            _ => {}
        }
    }
}

/// The rewriter is also exposable as a statement-transforming
/// middleware: the inner op receives the rewritten text.
impl Middleware for ShadowTable {
    fn wrap_exec(&self, next: ExecOp) -> ExecOp {
        let shadow = self.clone();
        Arc::new(move |ctx, query, args| {
            let shadow = shadow.clone();
            let next = Arc::clone(&next);
            Box::pin(async move {
                let rewritten = shadow.rewrite(&query)?;
                next(ctx, rewritten, args).await
            })
        })
    }

    fn wrap_query(&self, next: QueryOp) -> QueryOp {
        let shadow = self.clone();
        Arc::new(move |ctx, query, args| {
            let shadow = shadow.clone();
            let next = Arc::clone(&next);
            Box::pin(async move {
                let rewritten = shadow.rewrite(&query)?;
                next(ctx, rewritten, args).await
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::CallContext;
    use crate::value::{ExecResult, NamedValue, Value};

    fn suffixed() -> ShadowTable {
        ShadowTable::provision(ShadowTableConfig {
            prefix: String::new(),
            suffix: "_shadow".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn empty_template_is_a_config_error() {
        let err = ShadowTable::provision(ShadowTableConfig::default()).err().unwrap();
        assert!(matches!(err, GateError::Config { .. }));
    }

    #[test]
    fn rewrites_a_simple_select() {
        let shadow = suffixed();
        let out = shadow.rewrite("select * from t where a = ?").unwrap();
        assert_eq!(out, "SELECT * FROM t_shadow WHERE a = ?");
    }

    #[test]
    fn prefix_only_template() {
        let shadow = ShadowTable::provision(ShadowTableConfig {
            prefix: "pre_".to_string(),
            suffix: String::new(),
        })
        .unwrap();
        let out = shadow.rewrite("select * from t where a = ?").unwrap();
        assert_eq!(out, "SELECT * FROM pre_t WHERE a = ?");
    }

    #[test]
    fn backticked_qualifiers_track_the_rewrite() {
        let shadow = suffixed();
        let out = shadow
            .rewrite("SELECT `c`.`id` FROM `c` WHERE `c`.`id` = ?")
            .unwrap();
        assert_eq!(out, "SELECT c_shadow.id FROM c_shadow WHERE c_shadow.id = ?");
    }

    #[test]
    fn join_aliases_and_their_qualifiers_are_suffixed() {
        let shadow = suffixed();
        let sql = "SELECT `t`.`id` FROM `templates` AS `t` INNER JOIN \
                   (SELECT `template_id` FROM `maps` WHERE `id` = ?) AS `t1` \
                   ON `t`.`id` = `t1`.`template_id`";
        let out = shadow.rewrite(sql).unwrap();

        assert!(out.contains("templates_shadow"));
        assert!(out.contains("AS t_shadow"));
        assert!(out.contains("maps_shadow"));
        assert!(out.contains("AS t1_shadow"));
        assert!(out.contains("t_shadow.id"));
        assert!(out.contains("t1_shadow.template_id"));
    }

    #[test]
    fn insert_update_delete_are_rewritten() {
        let shadow = suffixed();

        let out = shadow
            .rewrite("insert into t (a, b) values (?, ?)")
            .unwrap();
        assert!(out.contains("INSERT INTO t_shadow"));

        let out = shadow.rewrite("update t set a = ? where id = ?").unwrap();
        assert_eq!(out, "UPDATE t_shadow SET a = ? WHERE id = ?");

        let out = shadow.rewrite("delete from t where id = ?").unwrap();
        assert_eq!(out, "DELETE FROM t_shadow WHERE id = ?");
    }

    #[test]
    fn subquery_tables_are_rewritten() {
        let shadow = suffixed();
        let out = shadow
            .rewrite("select * from t where id in (select tid from m where k = ?)")
            .unwrap();
        assert!(out.contains("FROM t_shadow"));
        assert!(out.contains("FROM m_shadow"));
    }

    #[test]
    fn non_dml_passes_through_unchanged_and_uncached() {
        let shadow = suffixed();
        let sql = "create table t (a int)";
        assert_eq!(shadow.rewrite(sql).unwrap(), sql);
        assert!(shadow.rewritten().is_empty());
    }

    #[test]
    fn parse_errors_surface_the_original_text() {
        let shadow = suffixed();
        let err = shadow.rewrite("select * from (((").unwrap_err();
        assert!(err.to_string().contains("select * from ((("));
        assert!(shadow.rewritten().is_empty());
    }

    #[test]
    fn rewrites_are_cached_by_original_text() {
        let shadow = suffixed();
        let first = shadow.rewrite("select * from a where x = ?").unwrap();
        let second = shadow.rewrite("select * from a where x = ?").unwrap();
        assert_eq!(first, second);
        shadow.rewrite("select * from b").unwrap();
        shadow.rewrite("update c set v = 1").unwrap();
        assert_eq!(shadow.rewritten().len(), 3);
    }

    #[test]
    fn rewritten_statements_reparse() {
        let shadow = suffixed();
        let statements = [
            "select * from t where a = ?",
            "SELECT `c`.`id` FROM `c` WHERE `c`.`id` = ?",
            "insert into t (a) values (?)",
            "update t set a = ? where id = ?",
            "delete from t where id = ?",
        ];
        for sql in statements {
            let rewritten = shadow.rewrite(sql).unwrap();
            assert!(
                Parser::parse_sql(&MySqlDialect {}, &rewritten).is_ok(),
                "rewritten statement does not reparse: {rewritten}"
            );
        }
    }

    #[tokio::test]
    async fn middleware_hands_the_inner_op_the_rewritten_text() {
        use std::sync::Mutex;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_inner = Arc::clone(&seen);
        let base: ExecOp = Arc::new(move |_ctx, query, _args| {
            let seen = Arc::clone(&seen_inner);
            Box::pin(async move {
                seen.lock().unwrap().push(query);
                Ok(ExecResult::default())
            })
        });

        let shadow = suffixed();
        let op = shadow.wrap_exec(base);
        op(
            CallContext::new(),
            "update t set a = ? where id = ?".to_string(),
            NamedValue::from_values(vec![Value::Int(1), Value::Int(2)]),
        )
        .await
        .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec!["UPDATE t_shadow SET a = ? WHERE id = ?"]);
    }
}
