//! Query nodes.
//!
//! A [`Node`] describes one step of a query path: a table, a column, a
//! relationship hop, or an operation computed over other nodes. Path nodes
//! own their parent, so every node carries its full chain back to the root
//! [`TableNode`]. Equality is structural: two nodes match when their kind,
//! tables and parent chain are identical, no matter where they were built
//! or whether they went through [`Node::to_bytes`] in between.
//!
//! Nodes are normally built from schema metadata with [`NodePath`], which
//! resolves relationship names to the right variant and panics on names
//! the schema does not know.

pub(crate) mod codec;
mod op;

pub use op::{
    OperationNode, Operator, all, avg, count, count_distinct, max, min, none, sum,
};

use crate::error::InvalidNodeError;
use crate::plan::SortKey;
use crate::schema::{RelationshipKind, SchemaMetadata, TableInfo};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Root of every path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableNode {
    pub db_key: String,
    pub table: String,
}

/// A scalar field of the table its parent resolves to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnNode {
    pub parent: Box<Node>,
    /// Table owning the column.
    pub table: String,
    pub name: String,
}

/// A relationship hop from the parent's table to `table`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkNode {
    pub parent: Box<Node>,
    /// Relationship name on the parent's table.
    pub name: String,
    /// Target table.
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Table(TableNode),
    Column(ColumnNode),
    /// Forward foreign key.
    Reference(LinkNode),
    /// Inverse of a forward foreign key.
    Reverse(LinkNode),
    /// Link-table association.
    ManyMany(LinkNode),
    Operation(OperationNode),
    Literal(Value),
    /// Reference to a calculation by its alias.
    Alias(String),
}

impl Node {
    pub fn table(db_key: impl Into<String>, table: impl Into<String>) -> Self {
        Node::Table(TableNode {
            db_key: db_key.into(),
            table: table.into(),
        })
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Node::Literal(value.into())
    }

    pub fn alias(name: impl Into<String>) -> Self {
        Node::Alias(name.into())
    }

    /// Column `name` of whatever table `self` resolves to.
    ///
    /// This skips schema validation; prefer [`NodePath::column`] in
    /// application code.
    pub fn column_of(&self, name: impl Into<String>) -> Self {
        let table = self
            .table_name()
            .map(str::to_string)
            .unwrap_or_default();
        Node::Column(ColumnNode {
            parent: Box::new(self.clone()),
            table,
            name: name.into(),
        })
    }

    pub fn parent(&self) -> Option<&Node> {
        match self {
            Node::Column(c) => Some(&c.parent),
            Node::Reference(l) | Node::Reverse(l) | Node::ManyMany(l) => Some(&l.parent),
            _ => None,
        }
    }

    /// Does this node describe a position in the schema (table, column or link).
    pub fn is_path(&self) -> bool {
        matches!(
            self,
            Node::Table(_) | Node::Column(_) | Node::Reference(_) | Node::Reverse(_) | Node::ManyMany(_)
        )
    }

    pub fn is_relationship(&self) -> bool {
        matches!(self, Node::Reference(_) | Node::Reverse(_) | Node::ManyMany(_))
    }

    /// Does the path from the root cross a reverse or many-to-many hop.
    pub fn is_many_valued(&self) -> bool {
        self.path()
            .iter()
            .any(|n| matches!(n, Node::Reverse(_) | Node::ManyMany(_)))
    }

    /// Nodes from the root table down to `self`. Empty for non-path nodes.
    pub fn path(&self) -> Vec<&Node> {
        if !self.is_path() {
            return Vec::new();
        }
        let mut chain = vec![self];
        let mut current = self;
        while let Some(parent) = current.parent() {
            chain.push(parent);
            current = parent;
        }
        chain.reverse();
        chain
    }

    /// The root table of this node. Operations report the root of their
    /// first path operand.
    pub fn root(&self) -> Option<&TableNode> {
        match self {
            Node::Table(t) => Some(t),
            Node::Column(_) | Node::Reference(_) | Node::Reverse(_) | Node::ManyMany(_) => {
                self.parent().and_then(Node::root)
            }
            Node::Operation(op) => op.operands.iter().find_map(Node::root),
            Node::Literal(_) | Node::Alias(_) => None,
        }
    }

    pub fn root_table(&self) -> Option<&str> {
        self.root().map(|t| t.table.as_str())
    }

    /// Table this node resolves to: the owner for columns, the target for links.
    pub fn table_name(&self) -> Option<&str> {
        match self {
            Node::Table(t) => Some(&t.table),
            Node::Column(c) => Some(&c.table),
            Node::Reference(l) | Node::Reverse(l) | Node::ManyMany(l) => Some(&l.table),
            _ => None,
        }
    }

    /// Structural match: same kind, same tables, same chain to the root.
    pub fn matches(&self, other: &Node) -> bool {
        self == other
    }

    /// Does `anchor` appear in this node's chain (including `self`).
    pub fn lies_under(&self, anchor: &Node) -> bool {
        self.path().into_iter().any(|n| n == anchor)
    }

    /// Re-express this node relative to the table `anchor` resolves to.
    ///
    /// `anchor` must be a path node somewhere in `self`'s chain; it is
    /// replaced by a table node for its target. Operations are rerooted
    /// operand by operand. Returns `None` if a path operand does not lie
    /// under `anchor`.
    pub fn reroot(&self, anchor: &Node) -> Option<Node> {
        if self == anchor {
            let root = anchor.root()?;
            return Some(Node::table(root.db_key.clone(), anchor.table_name()?));
        }
        match self {
            Node::Table(_) => None,
            Node::Column(c) => Some(Node::Column(ColumnNode {
                parent: Box::new(c.parent.reroot(anchor)?),
                table: c.table.clone(),
                name: c.name.clone(),
            })),
            Node::Reference(l) => Some(Node::Reference(l.with_parent(l.parent.reroot(anchor)?))),
            Node::Reverse(l) => Some(Node::Reverse(l.with_parent(l.parent.reroot(anchor)?))),
            Node::ManyMany(l) => Some(Node::ManyMany(l.with_parent(l.parent.reroot(anchor)?))),
            Node::Operation(op) => {
                let operands = op
                    .operands
                    .iter()
                    .map(|n| n.reroot(anchor))
                    .collect::<Option<Vec<_>>>()?;
                Some(Node::Operation(OperationNode {
                    op: op.op,
                    operands,
                }))
            }
            Node::Literal(_) | Node::Alias(_) => Some(self.clone()),
        }
    }

    /// Path nodes referenced by this node, descending into operations.
    pub fn leaves(&self) -> Vec<&Node> {
        match self {
            Node::Operation(op) => op.operands.iter().flat_map(Node::leaves).collect(),
            Node::Literal(_) | Node::Alias(_) => Vec::new(),
            _ => vec![self],
        }
    }

    /// Path nodes referenced outside any aggregate.
    pub fn leaves_outside_aggregates(&self) -> Vec<&Node> {
        match self {
            Node::Operation(op) if op.op.is_aggregate() => Vec::new(),
            Node::Operation(op) => op
                .operands
                .iter()
                .flat_map(Node::leaves_outside_aggregates)
                .collect(),
            Node::Literal(_) | Node::Alias(_) => Vec::new(),
            _ => vec![self],
        }
    }

    pub fn contains_aggregate(&self) -> bool {
        match self {
            Node::Operation(op) => {
                op.op.is_aggregate() || op.operands.iter().any(Node::contains_aggregate)
            }
            _ => false,
        }
    }

    pub fn aliases(&self) -> Vec<&str> {
        match self {
            Node::Alias(name) => vec![name.as_str()],
            Node::Operation(op) => op.operands.iter().flat_map(Node::aliases).collect(),
            _ => Vec::new(),
        }
    }

    /// Human-readable label, also used as the default result label.
    pub fn label(&self) -> String {
        match self {
            Node::Table(t) => t.table.clone(),
            Node::Column(c) => match c.parent.as_ref() {
                Node::Table(_) => c.name.clone(),
                parent => format!("{}.{}", parent.label_below_root(), c.name),
            },
            Node::Reference(_) | Node::Reverse(_) | Node::ManyMany(_) => self.label_below_root(),
            Node::Operation(op) => op.label(),
            Node::Literal(v) => v.to_string(),
            Node::Alias(name) => name.clone(),
        }
    }

    fn label_below_root(&self) -> String {
        self.path()
            .into_iter()
            .filter_map(|n| match n {
                Node::Reference(l) | Node::Reverse(l) | Node::ManyMany(l) => Some(l.name.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn asc(self) -> SortKey {
        SortKey {
            node: self,
            descending: false,
        }
    }

    pub fn desc(self) -> SortKey {
        SortKey {
            node: self,
            descending: true,
        }
    }

    /// Encode into the portable byte form.
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        codec::encode(self)
    }

    /// Decode a node produced by [`Node::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Node> {
        codec::decode(bytes)
    }
}

impl LinkNode {
    fn with_parent(&self, parent: Node) -> Self {
        Self {
            parent: Box::new(parent),
            name: self.name.clone(),
            table: self.table.clone(),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.root_table() {
            Some(root) if self.is_path() && !matches!(self, Node::Table(_)) => {
                write!(f, "{}.{}", root, self.label())
            }
            _ => write!(f, "{}", self.label()),
        }
    }
}

impl From<Value> for Node {
    fn from(v: Value) -> Self {
        Node::Literal(v)
    }
}

impl From<TableNode> for Node {
    fn from(t: TableNode) -> Self {
        Node::Table(t)
    }
}

impl From<bool> for Node {
    fn from(v: bool) -> Self {
        Node::Literal(Value::Bool(v))
    }
}

impl From<i32> for Node {
    fn from(v: i32) -> Self {
        Node::Literal(Value::Int(v))
    }
}

impl From<i64> for Node {
    fn from(v: i64) -> Self {
        Node::Literal(Value::BigInt(v))
    }
}

impl From<f64> for Node {
    fn from(v: f64) -> Self {
        Node::Literal(Value::Double(v))
    }
}

impl From<&str> for Node {
    fn from(v: &str) -> Self {
        Node::Literal(Value::Text(v.to_string()))
    }
}

impl From<String> for Node {
    fn from(v: String) -> Self {
        Node::Literal(Value::Text(v))
    }
}

impl From<&Node> for Node {
    fn from(n: &Node) -> Self {
        n.clone()
    }
}

/// Schema-checked node construction.
///
/// ```ignore
/// let name = schema.node("project").link("manager").column("first_name");
/// ```
///
/// Unknown tables, relationships and columns panic: a path the schema does
/// not define is a caller bug, not a runtime condition.
#[derive(Clone)]
pub struct NodePath<'s> {
    schema: &'s dyn SchemaMetadata,
    table: Arc<TableInfo>,
    node: Node,
}

impl fmt::Debug for NodePath<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodePath").field("node", &self.node).finish()
    }
}

impl<'s> NodePath<'s> {
    pub fn new(schema: &'s dyn SchemaMetadata, table: &str) -> Self {
        let Some(info) = schema.table(table) else {
            panic!("{}", InvalidNodeError::new(format!("unknown table '{table}'")));
        };
        Self {
            node: Node::table(schema.db_key(), table),
            table: info,
            schema,
        }
    }

    /// Follow relationship `name` of the current table.
    pub fn link(self, name: &str) -> Self {
        let Some(rel) = self.table.relationship(name) else {
            panic!(
                "{}",
                InvalidNodeError::new(format!(
                    "table '{}' has no relationship '{name}'",
                    self.table.name
                ))
            );
        };
        let Some(target) = self.schema.table(&rel.target_table) else {
            panic!(
                "{}",
                InvalidNodeError::new(format!("unknown table '{}'", rel.target_table))
            );
        };
        let link = LinkNode {
            parent: Box::new(self.node),
            name: rel.name.clone(),
            table: rel.target_table.clone(),
        };
        let node = match rel.kind {
            RelationshipKind::Forward => Node::Reference(link),
            RelationshipKind::Reverse => Node::Reverse(link),
            RelationshipKind::ManyMany => Node::ManyMany(link),
        };
        Self {
            schema: self.schema,
            table: target,
            node,
        }
    }

    /// Finish the path at column `name` of the current table.
    pub fn column(self, name: &str) -> Node {
        if self.table.column(name).is_none() {
            panic!(
                "{}",
                InvalidNodeError::new(format!(
                    "table '{}' has no column '{name}'",
                    self.table.name
                ))
            );
        }
        Node::Column(ColumnNode {
            parent: Box::new(self.node),
            table: self.table.name.clone(),
            name: name.to_string(),
        })
    }

    /// Finish the path at the current table or relationship.
    pub fn node(self) -> Node {
        self.node
    }

    pub fn table_info(&self) -> &Arc<TableInfo> {
        &self.table
    }
}

impl From<NodePath<'_>> for Node {
    fn from(path: NodePath<'_>) -> Self {
        path.node
    }
}
