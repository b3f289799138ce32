//! Traversal helpers over the `sqlparser` AST.
//!
//! The rule everywhere in this module: a scope owns its *own* expressions
//! and relations only. Traversal never descends into a nested query
//! (derived table, scalar/`IN`/`EXISTS` subquery) — those regions belong to
//! the child scope node extracted for them. A subquery expression is
//! visited as an atom so it can carry an anchor of its own.

use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, GroupByExpr, Join, JoinConstraint, JoinOperator, Query,
    Select, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::error::RewriteError;

const DIALECT: GenericDialect = GenericDialect {};

/// Parse exactly one statement.
pub fn parse_one(sql: &str) -> Result<Statement, RewriteError> {
    let mut statements = Parser::parse_sql(&DIALECT, sql)
        .map_err(|e| RewriteError::syntax(e.to_string()))?;
    match statements.len() {
        1 => Ok(statements.remove(0)),
        0 => Err(RewriteError::syntax("empty input")),
        n => Err(RewriteError::syntax(format!(
            "expected a single statement, found {n}"
        ))),
    }
}

/// Parse one statement and require it to be a query.
pub fn parse_query(sql: &str) -> Result<Query, RewriteError> {
    match parse_one(sql)? {
        Statement::Query(q) => Ok(*q),
        other => Err(RewriteError::syntax(format!(
            "only queries can be rewritten, found {}",
            statement_head(&other)
        ))),
    }
}

fn statement_head(stmt: &Statement) -> String {
    stmt.to_string().split_whitespace().take(2).collect::<Vec<_>>().join(" ")
}

/// Parse a bare expression fragment (a predicate, a replacement subtree).
pub fn parse_expr_fragment(sql: &str) -> Result<Expr, RewriteError> {
    Parser::new(&DIALECT)
        .try_with_sql(sql)
        .map_err(|e| RewriteError::syntax(e.to_string()))?
        .parse_expr()
        .map_err(|e| RewriteError::syntax(e.to_string()))
}

/// Parse a FROM-clause fragment by wrapping it in a probe SELECT.
pub fn parse_from_fragment(sql: &str) -> Result<Vec<TableWithJoins>, RewriteError> {
    let query = parse_query(&format!("SELECT * FROM {sql}"))?;
    match *query.body {
        SetExpr::Select(select) => Ok(select.from),
        _ => Err(RewriteError::syntax("FROM fragment did not parse as a FROM clause")),
    }
}

// ============================================================================
// Expression roots of a scope
// ============================================================================

/// Expression roots owned by `query` itself: projection, join conditions,
/// WHERE, GROUP BY, HAVING, ORDER BY. Set-operation sides are descended
/// only when `descend_set_ops` (bodies that have no branch nodes of their
/// own, e.g. a union inside a CTE).
pub fn expr_roots(query: &Query, descend_set_ops: bool) -> Vec<&Expr> {
    let mut roots = Vec::new();
    collect_set_expr_roots(&query.body, descend_set_ops, &mut roots);
    for ob in &query.order_by {
        roots.push(&ob.expr);
    }
    roots
}

fn collect_set_expr_roots<'a>(body: &'a SetExpr, descend: bool, out: &mut Vec<&'a Expr>) {
    match body {
        SetExpr::Select(select) => collect_select_roots(select, out),
        SetExpr::Query(query) => {
            collect_set_expr_roots(&query.body, descend, out);
            for ob in &query.order_by {
                out.push(&ob.expr);
            }
        }
        SetExpr::SetOperation { left, right, .. } if descend => {
            collect_set_expr_roots(left, descend, out);
            collect_set_expr_roots(right, descend, out);
        }
        _ => {}
    }
}

fn collect_select_roots<'a>(select: &'a Select, out: &mut Vec<&'a Expr>) {
    for item in &select.projection {
        match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                out.push(expr)
            }
            _ => {}
        }
    }
    for twj in &select.from {
        for join in &twj.joins {
            if let Some(expr) = join_on_expr(join) {
                out.push(expr);
            }
        }
    }
    if let Some(selection) = &select.selection {
        out.push(selection);
    }
    if let GroupByExpr::Expressions(exprs) = &select.group_by {
        out.extend(exprs.iter());
    }
    if let Some(having) = &select.having {
        out.push(having);
    }
}

pub fn join_on_expr(join: &Join) -> Option<&Expr> {
    let constraint = match &join.join_operator {
        JoinOperator::Inner(c)
        | JoinOperator::LeftOuter(c)
        | JoinOperator::RightOuter(c)
        | JoinOperator::FullOuter(c) => c,
        _ => return None,
    };
    match constraint {
        JoinConstraint::On(expr) => Some(expr),
        _ => None,
    }
}

// ============================================================================
// Expression walking (subqueries are atoms)
// ============================================================================

/// Pre-order visit of `expr` and its sub-expressions.
pub fn walk_expr<'a>(expr: &'a Expr, f: &mut dyn FnMut(&'a Expr)) {
    f(expr);
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            walk_expr(left, f);
            walk_expr(right, f);
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr)
        | Expr::IsTrue(expr)
        | Expr::IsNotTrue(expr)
        | Expr::IsFalse(expr)
        | Expr::IsNotFalse(expr)
        | Expr::Collate { expr, .. } => walk_expr(expr, f),
        Expr::Cast { expr, .. } | Expr::TryCast { expr, .. } => walk_expr(expr, f),
        Expr::InList { expr, list, .. } => {
            walk_expr(expr, f);
            for item in list {
                walk_expr(item, f);
            }
        }
        // The subquery side stays atomic; the probe expression is ours.
        Expr::InSubquery { expr, .. } => walk_expr(expr, f),
        Expr::Between {
            expr, low, high, ..
        } => {
            walk_expr(expr, f);
            walk_expr(low, f);
            walk_expr(high, f);
        }
        Expr::Like { expr, pattern, .. }
        | Expr::ILike { expr, pattern, .. }
        | Expr::SimilarTo { expr, pattern, .. } => {
            walk_expr(expr, f);
            walk_expr(pattern, f);
        }
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            if let Some(operand) = operand {
                walk_expr(operand, f);
            }
            for c in conditions {
                walk_expr(c, f);
            }
            for r in results {
                walk_expr(r, f);
            }
            if let Some(e) = else_result {
                walk_expr(e, f);
            }
        }
        Expr::Function(func) => {
            for arg in &func.args {
                if let FunctionArg::Unnamed(FunctionArgExpr::Expr(e))
                | FunctionArg::Named {
                    arg: FunctionArgExpr::Expr(e),
                    ..
                } = arg
                {
                    walk_expr(e, f);
                }
            }
        }
        Expr::Tuple(items) => {
            for item in items {
                walk_expr(item, f);
            }
        }
        // Exists / Subquery: atomic by design.
        _ => {}
    }
}

/// Replace the first sub-expression for which `matches` holds. Returns
/// whether a replacement happened.
pub fn replace_expr(
    expr: &mut Expr,
    matches: &dyn Fn(&Expr) -> bool,
    replacement: &Expr,
) -> bool {
    if matches(expr) {
        *expr = replacement.clone();
        return true;
    }
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            replace_expr(left, matches, replacement) || replace_expr(right, matches, replacement)
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr)
        | Expr::IsTrue(expr)
        | Expr::IsNotTrue(expr)
        | Expr::IsFalse(expr)
        | Expr::IsNotFalse(expr)
        | Expr::Collate { expr, .. } => replace_expr(expr, matches, replacement),
        Expr::Cast { expr, .. } | Expr::TryCast { expr, .. } => {
            replace_expr(expr, matches, replacement)
        }
        Expr::InList { expr, list, .. } => {
            replace_expr(expr, matches, replacement)
                || list
                    .iter_mut()
                    .any(|item| replace_expr(item, matches, replacement))
        }
        Expr::InSubquery { expr, .. } => replace_expr(expr, matches, replacement),
        Expr::Between {
            expr, low, high, ..
        } => {
            replace_expr(expr, matches, replacement)
                || replace_expr(low, matches, replacement)
                || replace_expr(high, matches, replacement)
        }
        Expr::Like { expr, pattern, .. }
        | Expr::ILike { expr, pattern, .. }
        | Expr::SimilarTo { expr, pattern, .. } => {
            replace_expr(expr, matches, replacement)
                || replace_expr(pattern, matches, replacement)
        }
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            operand
                .as_deref_mut()
                .is_some_and(|o| replace_expr(o, matches, replacement))
                || conditions
                    .iter_mut()
                    .any(|c| replace_expr(c, matches, replacement))
                || results
                    .iter_mut()
                    .any(|r| replace_expr(r, matches, replacement))
                || else_result
                    .as_deref_mut()
                    .is_some_and(|e| replace_expr(e, matches, replacement))
        }
        Expr::Function(func) => func.args.iter_mut().any(|arg| {
            if let FunctionArg::Unnamed(FunctionArgExpr::Expr(e))
            | FunctionArg::Named {
                arg: FunctionArgExpr::Expr(e),
                ..
            } = arg
            {
                replace_expr(e, matches, replacement)
            } else {
                false
            }
        }),
        Expr::Tuple(items) => items
            .iter_mut()
            .any(|item| replace_expr(item, matches, replacement)),
        _ => false,
    }
}

/// Replace the first matching sub-expression anywhere in the query's own
/// expression positions. Returns whether a replacement happened.
pub fn replace_in_query(
    query: &mut Query,
    matches: &dyn Fn(&Expr) -> bool,
    replacement: &Expr,
) -> bool {
    if replace_in_set_expr(&mut query.body, matches, replacement) {
        return true;
    }
    for ob in &mut query.order_by {
        if replace_expr(&mut ob.expr, matches, replacement) {
            return true;
        }
    }
    false
}

fn replace_in_set_expr(
    body: &mut SetExpr,
    matches: &dyn Fn(&Expr) -> bool,
    replacement: &Expr,
) -> bool {
    match body {
        SetExpr::Select(select) => replace_in_select(select, matches, replacement),
        SetExpr::Query(query) => replace_in_query(query, matches, replacement),
        SetExpr::SetOperation { left, right, .. } => {
            replace_in_set_expr(left, matches, replacement)
                || replace_in_set_expr(right, matches, replacement)
        }
        _ => false,
    }
}

fn replace_in_select(
    select: &mut Select,
    matches: &dyn Fn(&Expr) -> bool,
    replacement: &Expr,
) -> bool {
    for item in &mut select.projection {
        if let SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } = item {
            if replace_expr(expr, matches, replacement) {
                return true;
            }
        }
    }
    for twj in &mut select.from {
        for join in &mut twj.joins {
            if let Some(expr) = join_on_expr_mut(join) {
                if replace_expr(expr, matches, replacement) {
                    return true;
                }
            }
        }
    }
    if let Some(selection) = &mut select.selection {
        if replace_expr(selection, matches, replacement) {
            return true;
        }
    }
    if let GroupByExpr::Expressions(exprs) = &mut select.group_by {
        for expr in exprs {
            if replace_expr(expr, matches, replacement) {
                return true;
            }
        }
    }
    if let Some(having) = &mut select.having {
        if replace_expr(having, matches, replacement) {
            return true;
        }
    }
    false
}

pub fn join_on_expr_mut(join: &mut Join) -> Option<&mut Expr> {
    let constraint = match &mut join.join_operator {
        JoinOperator::Inner(c)
        | JoinOperator::LeftOuter(c)
        | JoinOperator::RightOuter(c)
        | JoinOperator::FullOuter(c) => c,
        _ => return None,
    };
    match constraint {
        JoinConstraint::On(expr) => Some(expr),
        _ => None,
    }
}

/// First SELECT of a query body, mutably (leftmost for set operations).
pub fn first_select_mut(query: &mut Query) -> Option<&mut Select> {
    first_select_of_set_expr_mut(&mut query.body)
}

fn first_select_of_set_expr_mut(body: &mut SetExpr) -> Option<&mut Select> {
    match body {
        SetExpr::Select(select) => Some(select),
        SetExpr::Query(query) => first_select_of_set_expr_mut(&mut query.body),
        SetExpr::SetOperation { left, .. } => first_select_of_set_expr_mut(left),
        _ => None,
    }
}

// ============================================================================
// Relations and columns of a scope
// ============================================================================

/// Base relations and CTE references in `query`'s own FROM clauses.
/// Derived tables are skipped (they are child scopes).
pub fn relations_of_query(query: &Query, descend_set_ops: bool) -> Vec<String> {
    let mut out = Vec::new();
    relations_of_set_expr(&query.body, descend_set_ops, &mut out);
    out
}

fn relations_of_set_expr(body: &SetExpr, descend: bool, out: &mut Vec<String>) {
    match body {
        SetExpr::Select(select) => {
            for twj in &select.from {
                relation_name(&twj.relation, out);
                for join in &twj.joins {
                    relation_name(&join.relation, out);
                }
            }
        }
        SetExpr::Query(query) => relations_of_set_expr(&query.body, descend, out),
        SetExpr::SetOperation { left, right, .. } if descend => {
            relations_of_set_expr(left, descend, out);
            relations_of_set_expr(right, descend, out);
        }
        _ => {}
    }
}

fn relation_name(factor: &TableFactor, out: &mut Vec<String>) {
    if let TableFactor::Table { name, .. } = factor {
        out.push(name.to_string());
    }
}

/// Names under which `query`'s own sources can be qualified: the alias when
/// present, else the table name's last segment; derived tables contribute
/// their alias.
pub fn local_sources(query: &Query) -> Vec<String> {
    let mut out = Vec::new();
    local_sources_of_set_expr(&query.body, &mut out);
    out
}

fn local_sources_of_set_expr(body: &SetExpr, out: &mut Vec<String>) {
    match body {
        SetExpr::Select(select) => {
            for twj in &select.from {
                source_name(&twj.relation, out);
                for join in &twj.joins {
                    source_name(&join.relation, out);
                }
            }
        }
        SetExpr::Query(query) => local_sources_of_set_expr(&query.body, out),
        SetExpr::SetOperation { left, right, .. } => {
            local_sources_of_set_expr(left, out);
            local_sources_of_set_expr(right, out);
        }
        _ => {}
    }
}

fn source_name(factor: &TableFactor, out: &mut Vec<String>) {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            if let Some(alias) = alias {
                out.push(alias.name.value.clone());
            } else if let Some(last) = name.0.last() {
                out.push(last.value.clone());
            }
        }
        TableFactor::Derived { alias, .. } => {
            if let Some(alias) = alias {
                out.push(alias.name.value.clone());
            }
        }
        _ => {}
    }
}

/// All qualified column references (`qualifier`, `column`) in the scope's
/// own expressions.
pub fn qualified_columns(query: &Query, descend_set_ops: bool) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for root in expr_roots(query, descend_set_ops) {
        walk_expr(root, &mut |e| {
            if let Expr::CompoundIdentifier(parts) = e {
                if parts.len() >= 2 {
                    out.push((
                        parts[parts.len() - 2].value.clone(),
                        parts[parts.len() - 1].value.clone(),
                    ));
                }
            }
        });
    }
    out
}
