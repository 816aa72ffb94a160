//! Plan evaluation over in-memory tables.
//!
//! Paths are resolved by walking relationships row by row, so a node that
//! crosses a reverse or many-to-many hop yields several values. Comparisons
//! over such nodes hold when any value satisfies them.

use crate::table::{RowData, TableData};
use nodeorm_core::error::{QueryError, TypeError};
use nodeorm_core::node::{LinkNode, OperationNode};
use nodeorm_core::row::RowColumns;
use nodeorm_core::{
    Error, InvalidNodeError, Node, Operator, QueryErrorKind, QueryPlan, RelationshipInfo,
    RelationshipKind, Result, Row, SchemaMetadata, Value, ValueKey,
};
use regex::Regex;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub(crate) struct Evaluator<'a> {
    tables: &'a HashMap<String, TableData>,
    schema: &'a dyn SchemaMetadata,
    patterns: RefCell<HashMap<String, Regex>>,
}

/// Rows and calculated values an expression is evaluated against.
#[derive(Clone, Copy)]
struct Env<'a, 'r> {
    row: Option<&'a RowData>,
    /// Rows of the current group, when aggregating.
    group: Option<&'r [&'a RowData]>,
    aliases: Option<&'r HashMap<String, Value>>,
}

impl<'a> Env<'a, '_> {
    fn row(row: &'a RowData) -> Self {
        Env {
            row: Some(row),
            group: None,
            aliases: None,
        }
    }
}

/// One output row before windowing.
struct Output {
    values: Vec<Value>,
    sort: Vec<Value>,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(tables: &'a HashMap<String, TableData>, schema: &'a dyn SchemaMetadata) -> Self {
        Self {
            tables,
            schema,
            patterns: RefCell::new(HashMap::new()),
        }
    }

    /// Run `plan` and return its rows.
    pub(crate) fn select(&self, plan: &QueryPlan) -> Result<Vec<Row>> {
        let outputs = self.evaluate(plan)?;
        let offset = usize::try_from(plan.offset).unwrap_or(usize::MAX);
        let limit = plan
            .limit
            .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
        let columns = Arc::new(RowColumns::new(plan.labels()));
        Ok(outputs
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|out| Row::with_columns(Arc::clone(&columns), out.values))
            .collect())
    }

    /// Number of rows `plan` yields, ignoring offset and limit.
    pub(crate) fn count(&self, plan: &QueryPlan) -> Result<u64> {
        Ok(self.evaluate(plan)?.len() as u64)
    }

    fn evaluate(&self, plan: &QueryPlan) -> Result<Vec<Output>> {
        let table = self.table(&plan.table)?;
        let mut matched = Vec::new();
        for row in table.scan() {
            if let Some(filter) = &plan.filter {
                if !self.scalar(filter, Env::row(row))?.is_truthy() {
                    continue;
                }
            }
            matched.push(row);
        }

        let mut outputs = if plan.is_grouped() {
            self.grouped(plan, &matched)?
        } else {
            let mut outputs = Vec::with_capacity(matched.len());
            for row in matched {
                outputs.push(self.project(plan, Env::row(row))?);
            }
            outputs
        };

        outputs.sort_by(|a, b| {
            for (i, key) in plan.order_by.iter().enumerate() {
                let ord = a.sort[i].sort_cmp(&b.sort[i]);
                let ord = if key.descending { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });

        if plan.distinct {
            let mut seen = HashSet::new();
            outputs.retain(|out| seen.insert(ValueKey(out.values.clone())));
        }
        Ok(outputs)
    }

    fn grouped(&self, plan: &QueryPlan, matched: &[&'a RowData]) -> Result<Vec<Output>> {
        let mut groups: Vec<Vec<&'a RowData>> = Vec::new();
        if plan.group_by.is_empty() {
            groups.push(matched.to_vec());
        } else {
            let mut index: HashMap<ValueKey, usize> = HashMap::new();
            for &row in matched {
                let mut key = Vec::with_capacity(plan.group_by.len());
                for node in &plan.group_by {
                    key.push(self.scalar(node, Env::row(row))?);
                }
                let slot = *index.entry(ValueKey(key)).or_insert_with(|| {
                    groups.push(Vec::new());
                    groups.len() - 1
                });
                groups[slot].push(row);
            }
        }

        let mut outputs = Vec::with_capacity(groups.len());
        for rows in &groups {
            let env = Env {
                row: rows.first().copied(),
                group: Some(rows.as_slice()),
                aliases: None,
            };
            let out = self.project(plan, env)?;
            if let Some(having) = &plan.having {
                let aliases = alias_map(plan, &out.values);
                let env = Env {
                    aliases: Some(&aliases),
                    ..env
                };
                if !self.scalar(having, env)?.is_truthy() {
                    continue;
                }
            }
            outputs.push(out);
        }
        Ok(outputs)
    }

    fn project(&self, plan: &QueryPlan, env: Env<'a, '_>) -> Result<Output> {
        let mut aliases = HashMap::with_capacity(plan.projections.len());
        let mut values = Vec::with_capacity(plan.projections.len());
        for projection in &plan.projections {
            let env = Env {
                aliases: Some(&aliases),
                ..env
            };
            let value = self.scalar(&projection.node, env)?;
            aliases.insert(projection.label.clone(), value.clone());
            values.push(value);
        }

        let env = Env {
            aliases: Some(&aliases),
            ..env
        };
        let mut sort = Vec::with_capacity(plan.order_by.len());
        for key in &plan.order_by {
            let candidates = self.values(&key.node, env)?;
            // Many-valued keys sort by their smallest (ascending) or largest
            // (descending) value.
            let pick = if key.descending {
                candidates.into_iter().max_by(Value::sort_cmp)
            } else {
                candidates.into_iter().min_by(Value::sort_cmp)
            };
            sort.push(pick.unwrap_or(Value::Null));
        }
        Ok(Output { values, sort })
    }

    fn table(&self, name: &str) -> Result<&'a TableData> {
        self.tables.get(name).ok_or_else(|| unknown_table(name))
    }

    fn relationship(&self, link: &LinkNode) -> Result<RelationshipInfo> {
        let owner = link
            .parent
            .table_name()
            .ok_or_else(|| invalid(format!("relationship '{}' has no owning table", link.name)))?;
        let info = self.schema.table(owner).ok_or_else(|| unknown_table(owner))?;
        info.relationship(&link.name).cloned().ok_or_else(|| {
            invalid(format!("table '{owner}' has no relationship '{}'", link.name))
        })
    }

    /// Rows a table or relationship node reaches from `row`.
    fn reach(&self, node: &Node, row: &'a RowData) -> Result<Vec<&'a RowData>> {
        match node {
            Node::Table(_) => Ok(vec![row]),
            Node::Reference(link) | Node::Reverse(link) | Node::ManyMany(link) => {
                let rel = self.relationship(link)?;
                let mut reached = Vec::new();
                for parent in self.reach(&link.parent, row)? {
                    reached.extend(self.follow(&rel, parent)?);
                }
                Ok(reached)
            }
            other => Err(invalid(format!("'{other}' does not resolve to a table"))),
        }
    }

    fn follow(&self, rel: &RelationshipInfo, row: &'a RowData) -> Result<Vec<&'a RowData>> {
        let Some(key) = row.get(&rel.local_column).filter(|v| !v.is_null()) else {
            return Ok(Vec::new());
        };
        let target = self.table(&rel.target_table)?;
        let joins = |candidate: &RowData, column: &str, key: &Value| {
            candidate.get(column).is_some_and(|v| v.sql_eq(key))
        };

        if rel.kind == RelationshipKind::ManyMany {
            let link = rel.link_table.as_ref().ok_or_else(|| {
                invalid(format!("relationship '{}' has no link table", rel.name))
            })?;
            let link_rows = self.table(&link.table_name)?;
            let mut reached = Vec::new();
            for pair in link_rows
                .scan()
                .filter(|l| joins(l, &link.local_column, key))
            {
                let Some(remote) = pair.get(&link.remote_column) else {
                    continue;
                };
                reached.extend(
                    target
                        .scan()
                        .filter(|t| joins(t, &rel.remote_column, remote)),
                );
            }
            return Ok(reached);
        }

        Ok(target
            .scan()
            .filter(|t| joins(t, &rel.remote_column, key))
            .collect())
    }

    /// Every value `node` takes for the current row.
    fn values(&self, node: &Node, env: Env<'a, '_>) -> Result<Vec<Value>> {
        match node {
            Node::Column(col) => {
                let Some(row) = env.row else {
                    return Ok(Vec::new());
                };
                Ok(self
                    .reach(&col.parent, row)?
                    .into_iter()
                    .map(|r| r.get(&col.name).cloned().unwrap_or(Value::Null))
                    .collect())
            }
            Node::Table(_) | Node::Reference(_) | Node::Reverse(_) | Node::ManyMany(_) => {
                // A table used as a value stands for its primary key.
                let name = node.table_name().unwrap_or_default();
                let info = self.schema.table(name).ok_or_else(|| unknown_table(name))?;
                if info.has_composite_key() {
                    return Err(invalid(format!(
                        "table '{name}' has a composite key and cannot be used as a value"
                    )));
                }
                let key = info
                    .single_key()
                    .map(|c| c.name.clone())
                    .ok_or_else(|| invalid(format!("table '{name}' has no primary key")))?;
                let Some(row) = env.row else {
                    return Ok(Vec::new());
                };
                Ok(self
                    .reach(node, row)?
                    .into_iter()
                    .map(|r| r.get(&key).cloned().unwrap_or(Value::Null))
                    .collect())
            }
            Node::Literal(Value::Array(items)) => Ok(items.clone()),
            _ => Ok(vec![self.scalar(node, env)?]),
        }
    }

    fn scalar(&self, node: &Node, env: Env<'a, '_>) -> Result<Value> {
        match node {
            Node::Literal(v) => Ok(v.clone()),
            Node::Alias(name) => env
                .aliases
                .and_then(|a| a.get(name))
                .cloned()
                .ok_or_else(|| invalid(format!("unknown calculation '{name}'"))),
            Node::Operation(op) => self.operation(op, env),
            path => Ok(self
                .values(path, env)?
                .into_iter()
                .next()
                .unwrap_or(Value::Null)),
        }
    }

    fn operation(&self, op: &OperationNode, env: Env<'a, '_>) -> Result<Value> {
        let operand = |i: usize| {
            op.operands.get(i).ok_or_else(|| {
                invalid(format!("'{}' is missing operand {}", op.op.symbol(), i + 1))
            })
        };

        let result = match op.op {
            Operator::All => Value::Bool(true),
            Operator::None => Value::Bool(false),

            Operator::Eq | Operator::Ne | Operator::Gt | Operator::Ge | Operator::Lt | Operator::Le => {
                let lhs = self.values(operand(0)?, env)?;
                let rhs = self.values(operand(1)?, env)?;
                let holds = |ord: Ordering| match op.op {
                    Operator::Eq => ord == Ordering::Equal,
                    Operator::Ne => ord != Ordering::Equal,
                    Operator::Gt => ord == Ordering::Greater,
                    Operator::Ge => ord != Ordering::Less,
                    Operator::Lt => ord == Ordering::Less,
                    _ => ord != Ordering::Greater,
                };
                Value::Bool(lhs.iter().any(|l| {
                    rhs.iter()
                        .any(|r| l.compare(r).is_some_and(holds))
                }))
            }

            Operator::Like => {
                let lhs = self.values(operand(0)?, env)?;
                let pattern = self.scalar(operand(1)?, env)?;
                let Some(pattern) = pattern.as_str() else {
                    return Ok(Value::Bool(false));
                };
                let re = self.like_pattern(pattern)?;
                Value::Bool(
                    lhs.iter()
                        .filter_map(Value::as_str)
                        .any(|s| re.is_match(s)),
                )
            }

            Operator::Between => {
                let lhs = self.values(operand(0)?, env)?;
                let low = self.scalar(operand(1)?, env)?;
                let high = self.scalar(operand(2)?, env)?;
                Value::Bool(lhs.iter().any(|v| {
                    v.compare(&low).is_some_and(|o| o != Ordering::Less)
                        && v.compare(&high).is_some_and(|o| o != Ordering::Greater)
                }))
            }

            Operator::In | Operator::NotIn => {
                let lhs: Vec<Value> = self
                    .values(operand(0)?, env)?
                    .into_iter()
                    .filter(|v| !v.is_null())
                    .collect();
                let mut set = Vec::new();
                for node in op.operands.iter().skip(1) {
                    set.extend(self.values(node, env)?);
                }
                let member = |v: &Value| set.iter().any(|s| v.sql_eq(s));
                if op.op == Operator::In {
                    Value::Bool(lhs.iter().any(member))
                } else {
                    Value::Bool(!lhs.is_empty() && !lhs.iter().any(member))
                }
            }

            Operator::IsNull => Value::Bool(self.values(operand(0)?, env)?.iter().all(Value::is_null)),
            Operator::IsNotNull => {
                Value::Bool(self.values(operand(0)?, env)?.iter().any(|v| !v.is_null()))
            }

            Operator::And => {
                for node in &op.operands {
                    if !self.scalar(node, env)?.is_truthy() {
                        return Ok(Value::Bool(false));
                    }
                }
                Value::Bool(true)
            }
            Operator::Or => {
                for node in &op.operands {
                    if self.scalar(node, env)?.is_truthy() {
                        return Ok(Value::Bool(true));
                    }
                }
                Value::Bool(false)
            }
            Operator::Xor => {
                let mut odd = false;
                for node in &op.operands {
                    odd ^= self.scalar(node, env)?.is_truthy();
                }
                Value::Bool(odd)
            }
            Operator::Not => Value::Bool(!self.scalar(operand(0)?, env)?.is_truthy()),

            Operator::Add | Operator::Sub | Operator::Mul | Operator::Div | Operator::Mod => {
                let lhs = self.scalar(operand(0)?, env)?;
                let rhs = self.scalar(operand(1)?, env)?;
                arithmetic(op.op, &lhs, &rhs)?
            }

            Operator::Count
            | Operator::CountDistinct
            | Operator::Sum
            | Operator::Min
            | Operator::Max
            | Operator::Avg => {
                let target = operand(0)?;
                let rows: Vec<&'a RowData> = match env.group {
                    Some(group) => group.to_vec(),
                    None => env.row.into_iter().collect(),
                };
                let mut collected = Vec::new();
                for row in rows {
                    let inner = Env {
                        row: Some(row),
                        group: None,
                        aliases: env.aliases,
                    };
                    collected.extend(self.values(target, inner)?);
                }
                collected.retain(|v| !v.is_null());
                aggregate(op.op, collected)?
            }
        };
        Ok(result)
    }

    fn like_pattern(&self, pattern: &str) -> Result<Regex> {
        if let Some(re) = self.patterns.borrow().get(pattern) {
            return Ok(re.clone());
        }
        let mut source = String::from("(?s)^");
        let mut buf = [0u8; 4];
        for ch in pattern.chars() {
            match ch {
                '%' => source.push_str(".*"),
                '_' => source.push('.'),
                c => source.push_str(&regex::escape(c.encode_utf8(&mut buf))),
            }
        }
        source.push('$');
        let re = Regex::new(&source)
            .map_err(|e| Error::Custom(format!("invalid LIKE pattern '{pattern}': {e}")))?;
        self.patterns
            .borrow_mut()
            .insert(pattern.to_string(), re.clone());
        Ok(re)
    }
}

fn alias_map(plan: &QueryPlan, values: &[Value]) -> HashMap<String, Value> {
    plan.projections
        .iter()
        .zip(values)
        .map(|(p, v)| (p.label.clone(), v.clone()))
        .collect()
}

fn arithmetic(op: Operator, lhs: &Value, rhs: &Value) -> Result<Value> {
    if lhs.is_null() || rhs.is_null() {
        return Ok(Value::Null);
    }
    for v in [lhs, rhs] {
        if !v.is_numeric() {
            return Err(Error::Type(TypeError {
                expected: "numeric",
                actual: v.type_name().to_string(),
                column: None,
                rust_type: None,
            }));
        }
    }

    let integral = !matches!(lhs, Value::Double(_)) && !matches!(rhs, Value::Double(_));
    if let (true, Some(a), Some(b)) = (integral, lhs.as_i64(), rhs.as_i64()) {
        let result = match op {
            Operator::Add => a.checked_add(b),
            Operator::Sub => a.checked_sub(b),
            Operator::Mul => a.checked_mul(b),
            Operator::Div if b == 0 => return Ok(Value::Null),
            Operator::Div => a.checked_div(b),
            Operator::Mod if b == 0 => return Ok(Value::Null),
            _ => a.checked_rem(b),
        };
        return result.map(Value::BigInt).ok_or_else(|| {
            Error::query(QueryErrorKind::Database, format!("integer overflow in {a} {} {b}", op.symbol()))
        });
    }

    let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) else {
        return Ok(Value::Null);
    };
    let result = match op {
        Operator::Add => a + b,
        Operator::Sub => a - b,
        Operator::Mul => a * b,
        Operator::Div | Operator::Mod if b == 0.0 => return Ok(Value::Null),
        Operator::Div => a / b,
        _ => a % b,
    };
    Ok(Value::Double(result))
}

/// Fold non-null `values` with an aggregate operator.
fn aggregate(op: Operator, values: Vec<Value>) -> Result<Value> {
    let result = match op {
        Operator::Count => Value::BigInt(values.len() as i64),
        Operator::CountDistinct => {
            let distinct: HashSet<ValueKey> = values.into_iter().map(ValueKey::single).collect();
            Value::BigInt(distinct.len() as i64)
        }
        Operator::Min => values
            .into_iter()
            .min_by(Value::sort_cmp)
            .unwrap_or(Value::Null),
        Operator::Max => values
            .into_iter()
            .max_by(Value::sort_cmp)
            .unwrap_or(Value::Null),
        Operator::Sum => {
            if values.is_empty() {
                return Ok(Value::Null);
            }
            let mut total = Value::BigInt(0);
            for v in &values {
                total = arithmetic(Operator::Add, &total, v)?;
            }
            total
        }
        Operator::Avg => {
            if values.is_empty() {
                return Ok(Value::Null);
            }
            let mut total = 0.0;
            for v in &values {
                total += v.as_f64().ok_or_else(|| {
                    Error::Type(TypeError {
                        expected: "numeric",
                        actual: v.type_name().to_string(),
                        column: None,
                        rust_type: None,
                    })
                })?;
            }
            Value::Double(total / values.len() as f64)
        }
        other => return Err(invalid(format!("'{}' is not an aggregate", other.symbol()))),
    };
    Ok(result)
}

fn invalid(reason: String) -> Error {
    Error::InvalidNode(InvalidNodeError::new(reason))
}

fn unknown_table(name: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::NotFound,
        table: Some(name.to_string()),
        column: None,
        sqlstate: Some("42P01".to_string()),
        message: format!("unknown table '{name}'"),
        source: None,
    })
}
