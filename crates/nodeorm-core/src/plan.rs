//! Compiled query plans handed to the row store.

use crate::node::{Node, codec};
use crate::schema::TableInfo;
use serde::{Deserialize, Serialize};

/// One labelled output column of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub label: String,
    pub node: Node,
}

impl Projection {
    pub fn new(label: impl Into<String>, node: Node) -> Self {
        Self {
            label: label.into(),
            node,
        }
    }
}

/// Ordering term. Built with [`Node::asc`] / [`Node::desc`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub node: Node,
    pub descending: bool,
}

/// A validated, store-ready query over one table.
///
/// Every node in the plan is rooted at `table`. Projections reference only
/// columns of `table` and operations; relationship loading is done by the
/// caller with further plans. A plan is serializable so it can be cached or
/// shipped to another process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub db_key: String,
    pub table: String,
    pub projections: Vec<Projection>,
    pub filter: Option<Node>,
    pub group_by: Vec<Node>,
    pub having: Option<Node>,
    pub order_by: Vec<SortKey>,
    pub distinct: bool,
    pub offset: u64,
    pub limit: Option<u64>,
}

impl QueryPlan {
    /// Empty plan over `table` with no projections.
    pub fn new(table: &TableInfo) -> Self {
        Self {
            db_key: table.db_key.clone(),
            table: table.name.clone(),
            projections: Vec::new(),
            filter: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            distinct: false,
            offset: 0,
            limit: None,
        }
    }

    /// Plan selecting every column of `table`.
    pub fn all_columns(table: &TableInfo) -> Self {
        let mut plan = Self::new(table);
        let root = plan.root();
        plan.projections = table
            .columns
            .iter()
            .map(|c| Projection::new(c.name.clone(), root.column_of(c.name.clone())))
            .collect();
        plan
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Node) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn root(&self) -> Node {
        Node::table(self.db_key.clone(), self.table.clone())
    }

    /// Rows are collapsed into groups: explicit grouping, or a projection
    /// list made only of aggregates (one group over all rows).
    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty()
            || (!self.projections.is_empty()
                && self.projections.iter().all(|p| p.node.contains_aggregate()))
    }

    pub fn labels(&self) -> Vec<String> {
        self.projections.iter().map(|p| p.label.clone()).collect()
    }

    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        codec::encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        codec::decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::count;
    use crate::schema::{Schema, SchemaMetadata, TableDef};
    use crate::types::SqlType;

    fn table() -> std::sync::Arc<TableInfo> {
        Schema::builder("main")
            .table(
                TableDef::new("person")
                    .auto_key("id")
                    .column("first_name", SqlType::Text),
            )
            .build()
            .unwrap()
            .table("person")
            .unwrap()
    }

    #[test]
    fn all_columns_projects_every_column() {
        let plan = QueryPlan::all_columns(&table());
        assert_eq!(plan.labels(), vec!["id", "first_name"]);
        assert!(!plan.is_grouped());
    }

    #[test]
    fn aggregate_only_projection_is_grouped() {
        let mut plan = QueryPlan::new(&table());
        let id = plan.root().column_of("id");
        plan.projections.push(Projection::new("n", count(id)));
        assert!(plan.is_grouped());
    }

    #[test]
    fn plans_survive_encoding() {
        let plan = QueryPlan::all_columns(&table());
        let filter = plan.root().column_of("first_name").eq("Ann");
        let plan = plan.with_filter(filter);
        let decoded = QueryPlan::from_bytes(&plan.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, plan);
    }
}
