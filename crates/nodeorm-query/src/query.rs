//! Query clauses.

use nodeorm_core::{Node, SortKey};
use serde::{Deserialize, Serialize};

/// A named value computed per record of the table `parent` resolves to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calculation {
    /// Table or relationship node the value is computed for.
    pub parent: Node,
    pub alias: String,
    pub node: Node,
}

/// The clauses of a query over one table, before validation.
///
/// Every clause method consumes and returns the query, so queries read as a
/// chain. Nothing is checked until [`Query::compile`](crate::Query::compile).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub(crate) db_key: String,
    pub(crate) table: String,
    pub(crate) filters: Vec<Node>,
    pub(crate) selections: Vec<Node>,
    pub(crate) order_by: Vec<SortKey>,
    pub(crate) group_by: Vec<Node>,
    pub(crate) calculations: Vec<Calculation>,
    pub(crate) having: Vec<Node>,
    pub(crate) offset: u64,
    pub(crate) limit: Option<u64>,
    pub(crate) distinct: bool,
}

impl Query {
    pub fn new(db_key: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            db_key: db_key.into(),
            table: table.into(),
            filters: Vec::new(),
            selections: Vec::new(),
            order_by: Vec::new(),
            group_by: Vec::new(),
            calculations: Vec::new(),
            having: Vec::new(),
            offset: 0,
            limit: None,
            distinct: false,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn db_key(&self) -> &str {
        &self.db_key
    }

    /// Root node of the queried table.
    pub fn root(&self) -> Node {
        Node::table(self.db_key.clone(), self.table.clone())
    }

    /// Add a condition. Conditions accumulate with AND.
    #[must_use]
    pub fn filter(mut self, condition: impl Into<Node>) -> Self {
        self.filters.push(condition.into());
        self
    }

    /// Choose what to load.
    ///
    /// Root columns narrow the loaded fields; relationship nodes (or columns
    /// under them) load related records into the matching link slot.
    /// Operations are computed per row and exposed as aliases labelled by
    /// [`Node::label`].
    #[must_use]
    pub fn select<I, N>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<Node>,
    {
        self.selections.extend(nodes.into_iter().map(Into::into));
        self
    }

    /// Add an ordering term. Earlier terms take priority.
    #[must_use]
    pub fn order_by(mut self, key: SortKey) -> Self {
        self.order_by.push(key);
        self
    }

    #[must_use]
    pub fn group_by<I, N>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<Node>,
    {
        self.group_by.extend(nodes.into_iter().map(Into::into));
        self
    }

    /// Compute `node` for every record `parent` resolves to and expose it as
    /// `alias` on that record.
    #[must_use]
    pub fn calculation(
        mut self,
        parent: impl Into<Node>,
        alias: impl Into<String>,
        node: impl Into<Node>,
    ) -> Self {
        self.calculations.push(Calculation {
            parent: parent.into(),
            alias: alias.into(),
            node: node.into(),
        });
        self
    }

    /// Add a condition on groups. Conditions accumulate with AND.
    #[must_use]
    pub fn having(mut self, condition: impl Into<Node>) -> Self {
        self.having.push(condition.into());
        self
    }

    /// Skip `offset` rows and return at most `count`.
    #[must_use]
    pub fn limit(mut self, offset: u64, count: u64) -> Self {
        self.offset = offset;
        self.limit = Some(count);
        self
    }

    #[must_use]
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn filters(&self) -> &[Node] {
        &self.filters
    }

    pub fn selections(&self) -> &[Node] {
        &self.selections
    }

    pub fn orderings(&self) -> &[SortKey] {
        &self.order_by
    }

    pub fn groupings(&self) -> &[Node] {
        &self.group_by
    }

    pub fn calculations(&self) -> &[Calculation] {
        &self.calculations
    }

    pub fn window(&self) -> (u64, Option<u64>) {
        (self.offset, self.limit)
    }

    pub fn is_distinct(&self) -> bool {
        self.distinct
    }
}

/// Fold conditions into one AND node.
pub(crate) fn conjunction(nodes: &[Node]) -> Option<Node> {
    let mut iter = nodes.iter().cloned();
    let first = iter.next()?;
    Some(iter.fold(first, Node::and))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clauses_accumulate() {
        let root = Node::table("main", "person");
        let age = root.column_of("age");
        let query = Query::new("main", "person")
            .filter(age.clone().gt(18))
            .filter(age.clone().lt(65))
            .order_by(age.clone().desc())
            .limit(10, 5)
            .distinct();
        assert_eq!(query.filters().len(), 2);
        assert_eq!(query.window(), (10, Some(5)));
        assert!(query.is_distinct());

        let combined = conjunction(query.filters()).unwrap();
        assert_eq!(combined, age.clone().gt(18).and(age.lt(65)));
    }

    #[test]
    fn queries_serialize() {
        let root = Node::table("main", "person");
        let query = Query::new("main", "person")
            .select([root.column_of("name")])
            .calculation(root.clone(), "double_age", root.column_of("age").mul(2));
        let json = serde_json::to_string(&query).unwrap();
        let back: Query = serde_json::from_str(&json).unwrap();
        assert_eq!(back, query);
    }
}
