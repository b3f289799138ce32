//! Node contracts: the declared output schema, grain, and required
//! predicates of each scope node, plus which of its columns consumers
//! actually use.
//!
//! Contract checks run purely on parsed structure, never on live data.
//! The invariant enforced here is hard: every column a consumer references
//! must appear in the producer's output list, or the candidate is rejected.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sqlparser::ast::{Expr, GroupByExpr, Query, Select, SelectItem, SetExpr, TableFactor};

use crate::error::RewriteError;
use crate::walk;
use crate::{EdgeKind, EdgeTarget, NodeId, QueryDag};

// ============================================================================
// Catalog (base-table metadata, optional)
// ============================================================================

/// Schema of one base relation, used to seed grain columns and types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<OutputColumn>,
    pub primary_key: Vec<String>,
}

/// Base-table metadata the caller may supply; everything degrades
/// gracefully without it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    tables: BTreeMap<String, TableSchema>,
}

impl Catalog {
    pub fn with_table(mut self, schema: TableSchema) -> Self {
        self.tables.insert(schema.name.to_lowercase(), schema);
        self
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(&name.to_lowercase())
    }
}

// ============================================================================
// Contracts
// ============================================================================

/// One projected output column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputColumn {
    pub name: String,
    pub ty: Option<String>,
}

impl OutputColumn {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: None,
        }
    }
}

/// Columns of a producer that one downstream node actually reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerColumns {
    pub node: NodeId,
    pub columns: Vec<String>,
}

/// The contract attached to one scope node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeContract {
    /// Ordered output columns.
    pub columns: Vec<OutputColumn>,
    /// A wildcard projection exports everything; column checks pass but
    /// the opacity is kept so a catalog-backed pass can tighten it.
    pub opaque: bool,
    /// Columns guaranteeing row uniqueness for this node's result.
    pub grain: Vec<String>,
    /// WHERE conjuncts the node currently enforces. Carried as generator
    /// context; the execution-equivalence gate is the authority on whether
    /// a rewrite may move them.
    pub required_predicates: Vec<String>,
    /// Downstream column usage, one entry per consumer.
    pub consumers: Vec<ConsumerColumns>,
    /// Free qualifiers this node legitimately resolves in an enclosing
    /// scope (correlated subqueries).
    pub correlated_qualifiers: Vec<String>,
}

impl NodeContract {
    pub fn exports(&self, column: &str) -> bool {
        self.opaque
            || self
                .columns
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(column))
    }
}

/// Derived contracts for every node of one DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractStore {
    contracts: BTreeMap<NodeId, NodeContract>,
    cte_names: BTreeSet<String>,
}

impl ContractStore {
    /// Derive contracts for every node: projection, grain, predicates, and
    /// per-consumer column usage.
    pub fn derive(dag: &QueryDag, catalog: Option<&Catalog>) -> Result<Self, RewriteError> {
        let cte_names: BTreeSet<String> = dag
            .nodes()
            .iter()
            .filter_map(|n| n.name.as_ref().map(|s| s.to_lowercase()))
            .collect();

        let mut contracts: BTreeMap<NodeId, NodeContract> = BTreeMap::new();

        for node in dag.nodes() {
            let query = walk::parse_query(&node.body)?;
            let (mut columns, opaque) = projected_columns(&query, catalog);
            if !node.cte_columns.is_empty() {
                // Declared alias columns override projected names.
                columns = node
                    .cte_columns
                    .iter()
                    .map(|c| OutputColumn::named(c.clone()))
                    .collect();
            }
            let grain = derive_grain(&query, &columns, catalog);
            let required_predicates = where_conjuncts(&query);
            let correlated_qualifiers = dag
                .edges()
                .iter()
                .filter(|e| e.kind == EdgeKind::Correlated && e.from == node.id)
                .filter_map(|e| match &e.to {
                    EdgeTarget::Node(outer) => dag.node(outer),
                    _ => None,
                })
                .flat_map(|outer| match walk::parse_query(&outer.body) {
                    Ok(q) => walk::local_sources(&q),
                    Err(_) => Vec::new(),
                })
                .map(|s| s.to_lowercase())
                .collect();

            contracts.insert(
                node.id.clone(),
                NodeContract {
                    columns,
                    opaque,
                    grain,
                    required_predicates,
                    consumers: Vec::new(),
                    correlated_qualifiers,
                },
            );
        }

        let mut store = Self {
            contracts,
            cte_names,
        };
        store.record_consumers(dag)?;
        Ok(store)
    }

    fn record_consumers(&mut self, dag: &QueryDag) -> Result<(), RewriteError> {
        for edge in dag.edges() {
            if edge.kind != EdgeKind::Ref {
                continue;
            }
            let EdgeTarget::Node(producer_id) = &edge.to else {
                continue;
            };
            let Some(producer) = dag.node(producer_id) else {
                continue;
            };
            let Some(producer_name) = producer.name.clone() else {
                continue;
            };
            let Some(consumer) = dag.node(&edge.from) else {
                continue;
            };
            let used = consumer_columns(&consumer.body, &producer_name)?;
            if let Some(contract) = self.contracts.get_mut(producer_id) {
                contract.consumers.push(ConsumerColumns {
                    node: edge.from.clone(),
                    columns: used,
                });
            }
        }
        Ok(())
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeContract> {
        self.contracts.get(node_id)
    }

    pub fn contracts(&self) -> impl Iterator<Item = (&NodeId, &NodeContract)> {
        self.contracts.iter()
    }

    /// JSON rendering for generator requests.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::to_value(&self.contracts).unwrap_or_default()
    }

    /// Structural validation of a replacement body for one node.
    ///
    /// Checks, in order: (a) every consumer-referenced column still appears
    /// in the projected output, (b) every qualifier the new body references
    /// resolves (own sources, sibling CTEs, or recorded correlation), and
    /// (c) no output-name or source-alias collision is introduced.
    pub fn validate_contract(&self, node_id: &str, new_body: &str) -> Result<(), RewriteError> {
        let contract = self.contracts.get(node_id).ok_or_else(|| {
            RewriteError::contract(node_id, "no contract recorded for node")
        })?;
        let query = walk::parse_query(new_body)?;
        let (columns, opaque) = projected_columns(&query, None);

        // (a) consumer columns resolve by name
        if !opaque {
            for consumer in &contract.consumers {
                for column in &consumer.columns {
                    if !columns
                        .iter()
                        .any(|c| c.name.eq_ignore_ascii_case(column))
                    {
                        return Err(RewriteError::contract(
                            node_id,
                            format!(
                                "column `{column}` used by {} is missing from the output list",
                                consumer.node
                            ),
                        ));
                    }
                }
            }
        }

        // (b) no dangling qualifier
        let local: BTreeSet<String> = walk::local_sources(&query)
            .iter()
            .map(|s| s.to_lowercase())
            .collect();
        for (qualifier, column) in walk::qualified_columns(&query, true) {
            let lower = qualifier.to_lowercase();
            if !local.contains(&lower)
                && !self.cte_names.contains(&lower)
                && !contract.correlated_qualifiers.contains(&lower)
            {
                return Err(RewriteError::contract(
                    node_id,
                    format!("reference `{qualifier}.{column}` resolves to no visible source"),
                ));
            }
        }

        // (c) collisions
        let mut seen = BTreeSet::new();
        for column in &columns {
            if !seen.insert(column.name.to_lowercase()) {
                return Err(RewriteError::contract(
                    node_id,
                    format!("output column `{}` is ambiguous", column.name),
                ));
            }
        }
        let mut aliases = BTreeSet::new();
        for source in walk::local_sources(&query) {
            if !aliases.insert(source.to_lowercase()) {
                return Err(RewriteError::contract(
                    node_id,
                    format!("source `{source}` is introduced twice"),
                ));
            }
        }

        Ok(())
    }

    /// Every `Ref` edge of `dag` satisfied: each consumer's used columns
    /// appear in its producer's output. Run against the patched DAG after a
    /// plan applies, and again defensively on the reconstructed statement.
    pub fn check_consistency(dag: &QueryDag, catalog: Option<&Catalog>) -> Result<(), RewriteError> {
        let fresh = Self::derive(dag, catalog)?;
        for (producer_id, contract) in fresh.contracts() {
            if contract.opaque {
                continue;
            }
            for consumer in &contract.consumers {
                for column in &consumer.columns {
                    if !contract.exports(column) {
                        return Err(RewriteError::contract(
                            producer_id.clone(),
                            format!(
                                "column `{column}` used by {} is missing from the output list",
                                consumer.node
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Structural derivation helpers
// ============================================================================

/// Output columns of a query; set operations take the leftmost branch's
/// projection, per SQL naming rules.
fn projected_columns(query: &Query, catalog: Option<&Catalog>) -> (Vec<OutputColumn>, bool) {
    let Some(select) = first_select(&query.body) else {
        return (Vec::new(), true);
    };

    let single_table = single_table_name(select);
    let mut columns = Vec::new();
    let mut opaque = false;

    for item in &select.projection {
        match item {
            SelectItem::ExprWithAlias { alias, .. } => {
                columns.push(OutputColumn::named(alias.value.clone()));
            }
            SelectItem::UnnamedExpr(Expr::Identifier(ident)) => {
                let ty = lookup_type(catalog, single_table.as_deref(), &ident.value);
                columns.push(OutputColumn {
                    name: ident.value.clone(),
                    ty,
                });
            }
            SelectItem::UnnamedExpr(Expr::CompoundIdentifier(parts)) => {
                if let Some(last) = parts.last() {
                    columns.push(OutputColumn::named(last.value.clone()));
                }
            }
            SelectItem::UnnamedExpr(expr) => {
                // Unaliased computed column: consumers cannot reference it
                // by a stable name, keep the printed text as identity.
                columns.push(OutputColumn::named(expr.to_string().to_lowercase()));
            }
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _) => {
                opaque = true;
            }
        }
    }

    (columns, opaque)
}

fn first_select(body: &SetExpr) -> Option<&Select> {
    match body {
        SetExpr::Select(select) => Some(select),
        SetExpr::Query(query) => first_select(&query.body),
        SetExpr::SetOperation { left, .. } => first_select(left),
        _ => None,
    }
}

fn single_table_name(select: &Select) -> Option<String> {
    if select.from.len() != 1 || !select.from[0].joins.is_empty() {
        return None;
    }
    match &select.from[0].relation {
        TableFactor::Table { name, .. } => name.0.last().map(|i| i.value.clone()),
        _ => None,
    }
}

fn lookup_type(
    catalog: Option<&Catalog>,
    table: Option<&str>,
    column: &str,
) -> Option<String> {
    let schema = catalog?.table(table?)?;
    schema
        .columns
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(column))
        .and_then(|c| c.ty.clone())
}

/// Grain: GROUP BY keys when aggregated, else the base table's primary key
/// when the node is a plain single-table scan and a catalog is available.
fn derive_grain(
    query: &Query,
    columns: &[OutputColumn],
    catalog: Option<&Catalog>,
) -> Vec<String> {
    let Some(select) = first_select(&query.body) else {
        return Vec::new();
    };

    if let GroupByExpr::Expressions(exprs) = &select.group_by {
        if !exprs.is_empty() {
            return exprs
                .iter()
                .map(|e| match e {
                    Expr::Identifier(id) => id.value.clone(),
                    Expr::CompoundIdentifier(parts) => parts
                        .last()
                        .map(|i| i.value.clone())
                        .unwrap_or_else(|| e.to_string()),
                    other => other.to_string(),
                })
                .collect();
        }
    }

    if has_aggregate(select) {
        // Aggregate without GROUP BY: a single row, no grain columns.
        return Vec::new();
    }

    if let (Some(table), Some(catalog)) = (single_table_name(select), catalog) {
        if let Some(schema) = catalog.table(&table) {
            let pk = &schema.primary_key;
            let exported = |c: &String| {
                columns.iter().any(|col| col.name.eq_ignore_ascii_case(c))
            };
            if !pk.is_empty() && pk.iter().all(exported) {
                return pk.clone();
            }
        }
    }

    Vec::new()
}

fn has_aggregate(select: &Select) -> bool {
    const AGGREGATES: [&str; 5] = ["sum", "count", "avg", "min", "max"];
    let mut found = false;
    for item in &select.projection {
        if let SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } = item {
            walk::walk_expr(expr, &mut |e| {
                if let Expr::Function(func) = e {
                    if let Some(name) = func.name.0.last() {
                        if AGGREGATES.contains(&name.value.to_lowercase().as_str()) {
                            found = true;
                        }
                    }
                }
            });
        }
    }
    found
}

/// Printed WHERE conjuncts of a query's first SELECT.
fn where_conjuncts(query: &Query) -> Vec<String> {
    let Some(select) = first_select(&query.body) else {
        return Vec::new();
    };
    let Some(selection) = &select.selection else {
        return Vec::new();
    };
    split_conjuncts(selection)
        .into_iter()
        .map(|e| e.to_string())
        .collect()
}

/// Flatten an `AND` chain.
pub(crate) fn split_conjuncts(expr: &Expr) -> Vec<&Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: sqlparser::ast::BinaryOperator::And,
            right,
        } => {
            let mut out = split_conjuncts(left);
            out.extend(split_conjuncts(right));
            out
        }
        other => vec![other],
    }
}

/// Columns of `producer_name` that `consumer_body` reads: references
/// qualified by the producer's name or its alias, plus unqualified
/// references when the producer is the consumer's only source.
fn consumer_columns(consumer_body: &str, producer_name: &str) -> Result<Vec<String>, RewriteError> {
    let query = walk::parse_query(consumer_body)?;
    let Some(select) = first_select(&query.body) else {
        return Ok(Vec::new());
    };

    // Names under which the producer is visible in this scope.
    let mut qualifiers: BTreeSet<String> = BTreeSet::new();
    let mut source_count = 0usize;
    let mut factors: Vec<&TableFactor> = Vec::new();
    for twj in &select.from {
        factors.push(&twj.relation);
        for join in &twj.joins {
            factors.push(&join.relation);
        }
    }
    for factor in factors {
        source_count += 1;
        if let TableFactor::Table { name, alias, .. } = factor {
            let matches = name
                .0
                .last()
                .is_some_and(|i| i.value.eq_ignore_ascii_case(producer_name));
            if matches {
                match alias {
                    Some(alias) => qualifiers.insert(alias.name.value.to_lowercase()),
                    None => qualifiers.insert(producer_name.to_lowercase()),
                };
            }
        }
    }

    let only_source = source_count == 1 && !qualifiers.is_empty();

    let mut used: BTreeSet<String> = BTreeSet::new();
    for root in walk::expr_roots(&query, true) {
        walk::walk_expr(root, &mut |e| match e {
            Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
                let qualifier = parts[parts.len() - 2].value.to_lowercase();
                if qualifiers.contains(&qualifier) {
                    used.insert(parts[parts.len() - 1].value.clone());
                }
            }
            Expr::Identifier(ident) if only_source => {
                used.insert(ident.value.clone());
            }
            _ => {}
        });
    }

    Ok(used.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        Catalog::default().with_table(TableSchema {
            name: "orders".into(),
            columns: vec![
                OutputColumn {
                    name: "id".into(),
                    ty: Some("bigint".into()),
                },
                OutputColumn::named("customer"),
                OutputColumn::named("total"),
            ],
            primary_key: vec!["id".into()],
        })
    }

    #[test]
    fn group_by_keys_become_grain() {
        let dag = QueryDag::build(
            "WITH daily AS (SELECT d, SUM(v) AS total FROM sales GROUP BY d) \
             SELECT d FROM daily WHERE total > 10",
        )
        .unwrap();
        let store = ContractStore::derive(&dag, None).unwrap();
        let contract = store.get("cte:daily").unwrap();
        assert_eq!(contract.grain, vec!["d".to_string()]);
        assert_eq!(
            contract.columns,
            vec![OutputColumn::named("d"), OutputColumn::named("total")]
        );
    }

    #[test]
    fn consumer_usage_is_recorded_on_the_producer() {
        let dag = QueryDag::build(
            "WITH daily AS (SELECT d, SUM(v) AS total FROM sales GROUP BY d) \
             SELECT d FROM daily WHERE total > 10",
        )
        .unwrap();
        let store = ContractStore::derive(&dag, None).unwrap();
        let contract = store.get("cte:daily").unwrap();
        assert_eq!(contract.consumers.len(), 1);
        let used = &contract.consumers[0];
        assert_eq!(used.node, "main");
        assert!(used.columns.contains(&"d".to_string()));
        assert!(used.columns.contains(&"total".to_string()));
    }

    #[test]
    fn primary_key_seeds_grain_for_plain_scans() {
        let dag = QueryDag::build("SELECT id, customer FROM orders").unwrap();
        let store = ContractStore::derive(&dag, Some(&catalog())).unwrap();
        assert_eq!(store.get("main").unwrap().grain, vec!["id".to_string()]);
    }

    #[test]
    fn dropping_a_consumed_column_violates_the_contract() {
        let dag = QueryDag::build(
            "WITH daily AS (SELECT d, SUM(v) AS total FROM sales GROUP BY d) \
             SELECT d FROM daily WHERE total > 10",
        )
        .unwrap();
        let store = ContractStore::derive(&dag, None).unwrap();
        let err = store
            .validate_contract("cte:daily", "SELECT d FROM sales GROUP BY d")
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ContractViolation);
        assert!(err.to_string().contains("total"));
    }

    #[test]
    fn dangling_qualifier_is_rejected() {
        let dag = QueryDag::build("SELECT x FROM t").unwrap();
        let store = ContractStore::derive(&dag, None).unwrap();
        let err = store
            .validate_contract("main", "SELECT x FROM t WHERE ghost.y = 1")
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn duplicate_output_columns_are_ambiguous() {
        let dag = QueryDag::build("SELECT x FROM t").unwrap();
        let store = ContractStore::derive(&dag, None).unwrap();
        assert!(store
            .validate_contract("main", "SELECT a AS x, b AS x FROM t")
            .is_err());
    }

    #[test]
    fn wildcard_projection_is_opaque() {
        let dag = QueryDag::build("SELECT * FROM t").unwrap();
        let store = ContractStore::derive(&dag, None).unwrap();
        assert!(store.get("main").unwrap().opaque);
    }

    #[test]
    fn where_conjuncts_are_required_predicates() {
        let dag =
            QueryDag::build("SELECT x FROM t WHERE t.a = 1 AND t.b > 2").unwrap();
        let store = ContractStore::derive(&dag, None).unwrap();
        let predicates = &store.get("main").unwrap().required_predicates;
        assert_eq!(predicates, &vec!["t.a = 1".to_string(), "t.b > 2".to_string()]);
    }
}
