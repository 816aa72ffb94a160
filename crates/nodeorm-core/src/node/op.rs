//! Operation nodes: comparisons, logic, arithmetic and aggregates.

use super::Node;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    // Comparison
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    Between,
    In,
    NotIn,
    IsNull,
    IsNotNull,

    // Logic
    And,
    Or,
    Xor,
    Not,

    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,

    // Aggregates
    Count,
    CountDistinct,
    Sum,
    Min,
    Max,
    Avg,

    // Constants
    All,
    None,
}

impl Operator {
    pub const fn is_aggregate(&self) -> bool {
        matches!(
            self,
            Operator::Count
                | Operator::CountDistinct
                | Operator::Sum
                | Operator::Min
                | Operator::Max
                | Operator::Avg
        )
    }

    /// Operators producing a boolean.
    pub const fn is_predicate(&self) -> bool {
        matches!(
            self,
            Operator::Eq
                | Operator::Ne
                | Operator::Gt
                | Operator::Ge
                | Operator::Lt
                | Operator::Le
                | Operator::Like
                | Operator::Between
                | Operator::In
                | Operator::NotIn
                | Operator::IsNull
                | Operator::IsNotNull
                | Operator::And
                | Operator::Or
                | Operator::Xor
                | Operator::Not
                | Operator::All
                | Operator::None
        )
    }

    /// Operators comparing a scalar operand against values.
    pub const fn is_comparison(&self) -> bool {
        matches!(
            self,
            Operator::Eq
                | Operator::Ne
                | Operator::Gt
                | Operator::Ge
                | Operator::Lt
                | Operator::Le
                | Operator::Like
                | Operator::Between
                | Operator::In
                | Operator::NotIn
        )
    }

    pub const fn symbol(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "<>",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Like => "LIKE",
            Operator::Between => "BETWEEN",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::IsNull => "IS NULL",
            Operator::IsNotNull => "IS NOT NULL",
            Operator::And => "AND",
            Operator::Or => "OR",
            Operator::Xor => "XOR",
            Operator::Not => "NOT",
            Operator::Add => "+",
            Operator::Sub => "-",
            Operator::Mul => "*",
            Operator::Div => "/",
            Operator::Mod => "%",
            Operator::Count => "count",
            Operator::CountDistinct => "count_distinct",
            Operator::Sum => "sum",
            Operator::Min => "min",
            Operator::Max => "max",
            Operator::Avg => "avg",
            Operator::All => "TRUE",
            Operator::None => "FALSE",
        }
    }
}

/// A computed expression over other nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationNode {
    pub op: Operator,
    pub operands: Vec<Node>,
}

impl OperationNode {
    pub fn new(op: Operator, operands: Vec<Node>) -> Self {
        Self { op, operands }
    }

    pub(super) fn label(&self) -> String {
        let labels: Vec<String> = self.operands.iter().map(Node::label).collect();
        match self.op {
            op if op.is_aggregate() => format!("{}({})", op.symbol(), labels.join(", ")),
            Operator::All | Operator::None => self.op.symbol().to_string(),
            Operator::IsNull | Operator::IsNotNull => {
                format!("{} {}", labels.join(", "), self.op.symbol())
            }
            Operator::Not => format!("NOT ({})", labels.join(", ")),
            Operator::Between if labels.len() == 3 => {
                format!("{} BETWEEN {} AND {}", labels[0], labels[1], labels[2])
            }
            Operator::In | Operator::NotIn => match labels.split_first() {
                Some((first, rest)) => format!("{first} {} ({})", self.op.symbol(), rest.join(", ")),
                None => self.op.symbol().to_string(),
            },
            Operator::And | Operator::Or | Operator::Xor => labels
                .iter()
                .map(|l| format!("({l})"))
                .collect::<Vec<_>>()
                .join(&format!(" {} ", self.op.symbol())),
            _ => labels.join(&format!(" {} ", self.op.symbol())),
        }
    }
}

fn operation(op: Operator, operands: Vec<Node>) -> Node {
    Node::Operation(OperationNode::new(op, operands))
}

impl Node {
    pub fn eq(self, other: impl Into<Node>) -> Node {
        operation(Operator::Eq, vec![self, other.into()])
    }

    pub fn ne(self, other: impl Into<Node>) -> Node {
        operation(Operator::Ne, vec![self, other.into()])
    }

    pub fn gt(self, other: impl Into<Node>) -> Node {
        operation(Operator::Gt, vec![self, other.into()])
    }

    pub fn ge(self, other: impl Into<Node>) -> Node {
        operation(Operator::Ge, vec![self, other.into()])
    }

    pub fn lt(self, other: impl Into<Node>) -> Node {
        operation(Operator::Lt, vec![self, other.into()])
    }

    pub fn le(self, other: impl Into<Node>) -> Node {
        operation(Operator::Le, vec![self, other.into()])
    }

    /// SQL `LIKE`: `%` matches any run, `_` a single character.
    pub fn like(self, pattern: impl Into<Node>) -> Node {
        operation(Operator::Like, vec![self, pattern.into()])
    }

    pub fn between(self, low: impl Into<Node>, high: impl Into<Node>) -> Node {
        operation(Operator::Between, vec![self, low.into(), high.into()])
    }

    pub fn in_list<I, V>(self, values: I) -> Node
    where
        I: IntoIterator<Item = V>,
        V: Into<Node>,
    {
        let mut operands = vec![self];
        operands.extend(values.into_iter().map(Into::into));
        operation(Operator::In, operands)
    }

    pub fn not_in_list<I, V>(self, values: I) -> Node
    where
        I: IntoIterator<Item = V>,
        V: Into<Node>,
    {
        let mut operands = vec![self];
        operands.extend(values.into_iter().map(Into::into));
        operation(Operator::NotIn, operands)
    }

    pub fn is_null(self) -> Node {
        operation(Operator::IsNull, vec![self])
    }

    pub fn is_not_null(self) -> Node {
        operation(Operator::IsNotNull, vec![self])
    }

    pub fn and(self, other: impl Into<Node>) -> Node {
        operation(Operator::And, vec![self, other.into()])
    }

    pub fn or(self, other: impl Into<Node>) -> Node {
        operation(Operator::Or, vec![self, other.into()])
    }

    pub fn xor(self, other: impl Into<Node>) -> Node {
        operation(Operator::Xor, vec![self, other.into()])
    }

    pub fn not(self) -> Node {
        operation(Operator::Not, vec![self])
    }

    pub fn add(self, other: impl Into<Node>) -> Node {
        operation(Operator::Add, vec![self, other.into()])
    }

    pub fn sub(self, other: impl Into<Node>) -> Node {
        operation(Operator::Sub, vec![self, other.into()])
    }

    pub fn mul(self, other: impl Into<Node>) -> Node {
        operation(Operator::Mul, vec![self, other.into()])
    }

    pub fn div(self, other: impl Into<Node>) -> Node {
        operation(Operator::Div, vec![self, other.into()])
    }

    pub fn modulo(self, other: impl Into<Node>) -> Node {
        operation(Operator::Mod, vec![self, other.into()])
    }
}

pub fn count(node: impl Into<Node>) -> Node {
    operation(Operator::Count, vec![node.into()])
}

pub fn count_distinct(node: impl Into<Node>) -> Node {
    operation(Operator::CountDistinct, vec![node.into()])
}

pub fn sum(node: impl Into<Node>) -> Node {
    operation(Operator::Sum, vec![node.into()])
}

pub fn min(node: impl Into<Node>) -> Node {
    operation(Operator::Min, vec![node.into()])
}

pub fn max(node: impl Into<Node>) -> Node {
    operation(Operator::Max, vec![node.into()])
}

pub fn avg(node: impl Into<Node>) -> Node {
    operation(Operator::Avg, vec![node.into()])
}

/// Condition matching every row.
pub fn all() -> Node {
    operation(Operator::All, Vec::new())
}

/// Condition matching no row.
pub fn none() -> Node {
    operation(Operator::None, Vec::new())
}
