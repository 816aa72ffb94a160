//! Validation and compilation of queries into store plans.
//!
//! A [`Query`] compiles into one [`QueryPlan`] over its own table plus a
//! tree of [`LinkLoad`]s, one per selected relationship level. Each level is
//! fetched with a follow-up plan keyed on the parent level's join column.

use crate::query::{Calculation, Query, conjunction};
use nodeorm_core::node::LinkNode;
use nodeorm_core::{
    InvalidNodeError, Node, Projection, QueryPlan, RelationshipInfo, RelationshipKind,
    SchemaMetadata, SortKey, TableInfo, TableNode, UnloadedFieldPolicy,
};
use std::collections::HashSet;
use std::sync::Arc;

type Result<T> = std::result::Result<T, InvalidNodeError>;

/// Knobs applied when compiling and hydrating a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// Also fetch primary-key and lock columns when the selection is narrowed.
    /// Ignored for distinct and grouped queries.
    pub auto_select_keys: bool,
    pub unloaded_fields: UnloadedFieldPolicy,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            auto_select_keys: true,
            unloaded_fields: UnloadedFieldPolicy::default(),
        }
    }
}

/// A validated query: the root plan plus relationship loads.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub table: Arc<TableInfo>,
    pub plan: QueryPlan,
    pub links: Vec<LinkLoad>,
}

/// Loading of one relationship for a batch of parent records.
#[derive(Debug, Clone)]
pub struct LinkLoad {
    pub relationship: RelationshipInfo,
    pub target: Arc<TableInfo>,
    /// Plan over the target table; the join filter is added per batch.
    pub plan: QueryPlan,
    /// Plan over the link table of a many-to-many relationship.
    pub link_plan: Option<QueryPlan>,
    pub children: Vec<LinkLoad>,
}

impl LinkLoad {
    /// Load every column of relationship `name` of `table`, nothing nested.
    pub fn relationship(
        schema: &dyn SchemaMetadata,
        table: &TableInfo,
        name: &str,
    ) -> Result<Self> {
        let rel = table.relationship(name).cloned().ok_or_else(|| {
            InvalidNodeError::new(format!("table '{}' has no relationship '{name}'", table.name))
        })?;
        let target = lookup(schema, &rel.target_table)?;
        let mut plan = QueryPlan::all_columns(&target);
        ensure_column(&mut plan, &rel.remote_column);
        let link_plan = link_plan(schema, &rel)?;
        Ok(Self {
            relationship: rel,
            target,
            plan,
            link_plan,
            children: Vec::new(),
        })
    }
}

/// One relationship level collected from the selections.
struct Level {
    anchor: Node,
    rel: RelationshipInfo,
    target: Arc<TableInfo>,
    all_columns: bool,
    columns: Vec<String>,
    calculations: Vec<(String, Node)>,
    children: Vec<Level>,
}

impl Query {
    /// Validate the query against `schema` and build its plans.
    pub fn compile(
        &self,
        schema: &dyn SchemaMetadata,
        options: QueryOptions,
    ) -> Result<CompiledQuery> {
        Compiler::new(self, schema, options)?.run()
    }
}

struct Compiler<'q> {
    query: &'q Query,
    schema: &'q dyn SchemaMetadata,
    options: QueryOptions,
    table: Arc<TableInfo>,
    root: Node,
}

impl<'q> Compiler<'q> {
    fn new(query: &'q Query, schema: &'q dyn SchemaMetadata, options: QueryOptions) -> Result<Self> {
        if query.db_key != schema.db_key() {
            return Err(InvalidNodeError::new(format!(
                "query targets database '{}' but the schema describes '{}'",
                query.db_key,
                schema.db_key()
            )));
        }
        let table = lookup(schema, &query.table)?;
        Ok(Self {
            root: query.root(),
            query,
            schema,
            options,
            table,
        })
    }

    #[tracing::instrument(level = "trace", skip(self), fields(table = %self.query.table))]
    fn run(self) -> Result<CompiledQuery> {
        let q = self.query;
        let all_nodes = q
            .filters
            .iter()
            .chain(&q.selections)
            .chain(&q.group_by)
            .chain(&q.having)
            .chain(q.order_by.iter().map(|k| &k.node))
            .chain(q.calculations.iter().flat_map(|c| [&c.parent, &c.node]));
        for node in all_nodes {
            self.check_rooted(node)?;
        }

        let scalar_nodes = q
            .filters
            .iter()
            .chain(&q.group_by)
            .chain(&q.having)
            .chain(q.order_by.iter().map(|k| &k.node))
            .chain(q.calculations.iter().map(|c| &c.node))
            .chain(
                q.selections
                    .iter()
                    .filter(|n| matches!(n, Node::Operation(_))),
            );
        for node in scalar_nodes {
            self.check_scalar(node)?;
        }

        let aliases = self.check_aliases()?;

        // Classify selections.
        let mut root_columns: Vec<String> = Vec::new();
        let mut link_selections: Vec<&Node> = Vec::new();
        let mut link_columns: Vec<&Node> = Vec::new();
        let mut computed: Vec<&Node> = Vec::new();
        for node in &q.selections {
            match node {
                Node::Table(_) => {}
                Node::Column(c) if matches!(*c.parent, Node::Table(_)) => {
                    root_columns.push(c.name.clone());
                }
                Node::Column(_) => link_columns.push(node),
                Node::Reference(_) | Node::Reverse(_) | Node::ManyMany(_) => {
                    link_selections.push(node);
                }
                Node::Operation(_) | Node::Literal(_) => computed.push(node),
                Node::Alias(name) => {
                    return Err(InvalidNodeError::new(format!(
                        "calculation '{name}' is added with calculation(), not selected"
                    )));
                }
            }
        }

        let (root_calcs, link_calcs): (Vec<_>, Vec<_>) = q
            .calculations
            .iter()
            .partition(|c| matches!(c.parent, Node::Table(_)));
        for calc in &link_calcs {
            if !calc.parent.is_relationship() {
                return Err(InvalidNodeError::new(format!(
                    "calculation '{}' must hang off a table or relationship, not '{}'",
                    calc.alias, calc.parent
                )));
            }
        }

        let grouped = !q.group_by.is_empty()
            || computed.iter().any(|n| n.contains_aggregate())
            || root_calcs.iter().any(|c| c.node.contains_aggregate());

        if grouped {
            if let Some(node) = link_selections.first().or(link_columns.first()) {
                return Err(InvalidNodeError::new(format!(
                    "'{node}' cannot be loaded by a grouped query"
                )));
            }
            if let Some(calc) = link_calcs.first() {
                return Err(InvalidNodeError::new(format!(
                    "calculation '{}' on a relationship cannot be used in a grouped query",
                    calc.alias
                )));
            }
            self.check_grouping(&root_columns, &computed, &root_calcs)?;
        } else if !q.having.is_empty() {
            return Err(InvalidNodeError::new(
                "having requires group_by or aggregate selections",
            ));
        }

        // Relationship levels.
        let mut levels: Vec<Level> = Vec::new();
        for node in &link_selections {
            self.level_mut(&mut levels, &link_chain(node))?.all_columns = true;
        }
        for node in &link_columns {
            if let Node::Column(c) = node {
                let level = self.level_mut(&mut levels, &link_chain(&c.parent))?;
                if !level.columns.contains(&c.name) {
                    level.columns.push(c.name.clone());
                }
            }
        }
        for calc in &link_calcs {
            let rerooted = calc.node.reroot(&calc.parent).ok_or_else(|| {
                InvalidNodeError::new(format!(
                    "calculation '{}' uses nodes outside '{}'",
                    calc.alias, calc.parent
                ))
            })?;
            let level = self.level_mut(&mut levels, &link_chain(&calc.parent))?;
            level.calculations.push((calc.alias.clone(), rerooted));
        }

        // Root plan.
        let mut plan = QueryPlan::new(&self.table);
        if grouped {
            for node in &q.group_by {
                add_projection(&mut plan, node.label(), node.clone());
            }
        } else {
            let narrowed = !root_columns.is_empty();
            let names: Vec<String> = if narrowed {
                root_columns.clone()
            } else {
                self.table.columns.iter().map(|c| c.name.clone()).collect()
            };
            for name in names {
                add_projection(&mut plan, name.clone(), self.root.column_of(name));
            }
            if narrowed && self.options.auto_select_keys && !q.distinct {
                for name in key_columns(&self.table) {
                    add_projection(&mut plan, name.clone(), self.root.column_of(name));
                }
            }
            for level in &levels {
                let local = level.rel.local_column.clone();
                add_projection(&mut plan, local.clone(), self.root.column_of(local));
            }
        }
        for node in &computed {
            add_projection(&mut plan, node.label(), (*node).clone());
        }
        for calc in &root_calcs {
            add_projection(&mut plan, calc.alias.clone(), calc.node.clone());
        }
        plan.filter = conjunction(&q.filters);
        plan.group_by.clone_from(&q.group_by);
        plan.having = conjunction(&q.having);
        plan.order_by.clone_from(&q.order_by);
        plan.distinct = q.distinct;
        plan.offset = q.offset;
        plan.limit = q.limit;

        if grouped && !plan.is_grouped() {
            // Grouping by nothing with only constant selections; keep the
            // store's notion of grouping in line with ours.
            return Err(InvalidNodeError::new(
                "a grouped query must select aggregates or group_by columns",
            ));
        }

        let links = levels
            .into_iter()
            .map(|level| self.finish(level))
            .collect::<Result<Vec<_>>>()?;

        tracing::trace!(
            projections = plan.projections.len(),
            links = links.len(),
            aliases = aliases.len(),
            "query compiled"
        );
        Ok(CompiledQuery {
            table: Arc::clone(&self.table),
            plan,
            links,
        })
    }

    /// Every path leaf must start at the query table and follow the schema.
    fn check_rooted(&self, node: &Node) -> Result<()> {
        let root = TableNode {
            db_key: self.query.db_key.clone(),
            table: self.query.table.clone(),
        };
        for leaf in node.leaves() {
            if leaf.root() != Some(&root) {
                let found = leaf
                    .root()
                    .map_or_else(|| "nothing".to_string(), |t| format!("'{}'", t.table));
                return Err(InvalidNodeError::new(format!(
                    "'{leaf}' is rooted at {found}, not at the queried table '{}'",
                    self.query.table
                )));
            }
            self.check_path(leaf)?;
        }
        Ok(())
    }

    fn check_path(&self, leaf: &Node) -> Result<()> {
        for step in leaf.path() {
            match step {
                Node::Column(c) => {
                    let owner = c.parent.table_name().unwrap_or_default();
                    let info = lookup(self.schema, owner)?;
                    if c.table != owner || info.column(&c.name).is_none() {
                        return Err(InvalidNodeError::new(format!(
                            "table '{owner}' has no column '{}'",
                            c.name
                        )));
                    }
                }
                Node::Reference(l) | Node::Reverse(l) | Node::ManyMany(l) => {
                    let rel = self.relationship_of(l)?;
                    let kind_matches = matches!(
                        (step, rel.kind),
                        (Node::Reference(_), RelationshipKind::Forward)
                            | (Node::Reverse(_), RelationshipKind::Reverse)
                            | (Node::ManyMany(_), RelationshipKind::ManyMany)
                    );
                    if !kind_matches || rel.target_table != l.table {
                        return Err(InvalidNodeError::new(format!(
                            "'{step}' does not match relationship '{}' of the schema",
                            rel.name
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// A table or relationship used as a value stands for its primary key,
    /// which must be a single column.
    fn check_scalar(&self, node: &Node) -> Result<()> {
        for leaf in node.leaves() {
            if matches!(leaf, Node::Column(_)) {
                continue;
            }
            let name = leaf.table_name().unwrap_or_default();
            if lookup(self.schema, name)?.has_composite_key() {
                return Err(InvalidNodeError::new(format!(
                    "table '{name}' has a composite primary key and cannot be used as a value"
                )));
            }
        }
        Ok(())
    }

    fn check_aliases(&self) -> Result<HashSet<&'q str>> {
        let q = self.query;
        let mut aliases = HashSet::new();
        for calc in &q.calculations {
            let owner = calc.parent.table_name().unwrap_or_default();
            if lookup(self.schema, owner)?.column(&calc.alias).is_some() {
                return Err(InvalidNodeError::new(format!(
                    "calculation '{}' shadows a column of '{owner}'",
                    calc.alias
                )));
            }
            if !aliases.insert(calc.alias.as_str()) {
                return Err(InvalidNodeError::new(format!(
                    "calculation '{}' is defined twice",
                    calc.alias
                )));
            }
        }
        if let Some(name) = q.filters.iter().flat_map(Node::aliases).next() {
            return Err(InvalidNodeError::new(format!(
                "calculation '{name}' cannot be used in a filter"
            )));
        }
        let referenced = q
            .having
            .iter()
            .chain(q.order_by.iter().map(|k| &k.node))
            .chain(q.calculations.iter().map(|c| &c.node))
            .flat_map(Node::aliases);
        for name in referenced {
            if !aliases.contains(name) {
                return Err(InvalidNodeError::new(format!("unknown calculation '{name}'")));
            }
        }
        Ok(aliases)
    }

    fn check_grouping(
        &self,
        root_columns: &[String],
        computed: &[&Node],
        root_calcs: &[&Calculation],
    ) -> Result<()> {
        let q = self.query;
        for node in &q.group_by {
            let is_root_column =
                matches!(node, Node::Column(c) if matches!(*c.parent, Node::Table(_)));
            if !is_root_column {
                return Err(InvalidNodeError::new(format!(
                    "group_by accepts columns of '{}' only, got '{node}'",
                    q.table
                )));
            }
        }
        let grouped = |node: &Node| q.group_by.iter().any(|g| g.matches(node));

        if q.selections.iter().any(|n| matches!(n, Node::Table(_))) {
            return Err(InvalidNodeError::new(
                "a grouped query cannot select whole records",
            ));
        }
        if !q.selections.is_empty() {
            for name in root_columns {
                if !grouped(&self.root.column_of(name.clone())) {
                    return Err(InvalidNodeError::new(format!(
                        "column '{name}' is selected but not grouped"
                    )));
                }
            }
            for node in &q.group_by {
                let selected = q.selections.iter().any(|s| s.matches(node));
                if !selected {
                    return Err(InvalidNodeError::new(format!(
                        "grouped column '{node}' must be selected"
                    )));
                }
            }
        }

        let outside = computed
            .iter()
            .copied()
            .chain(root_calcs.iter().map(|c| &c.node))
            .chain(&q.having)
            .chain(q.order_by.iter().map(|k| &k.node))
            .flat_map(Node::leaves_outside_aggregates);
        for leaf in outside {
            if !grouped(leaf) {
                return Err(InvalidNodeError::new(format!(
                    "'{leaf}' must be grouped or aggregated"
                )));
            }
        }
        Ok(())
    }

    fn relationship_of(&self, link: &LinkNode) -> Result<RelationshipInfo> {
        let owner = link.parent.table_name().unwrap_or_default();
        lookup(self.schema, owner)?
            .relationship(&link.name)
            .cloned()
            .ok_or_else(|| {
                InvalidNodeError::new(format!(
                    "table '{owner}' has no relationship '{}'",
                    link.name
                ))
            })
    }

    /// Find or create the level for a chain of relationship nodes.
    fn level_mut<'l>(&self, levels: &'l mut Vec<Level>, chain: &[&Node]) -> Result<&'l mut Level> {
        let Some((first, rest)) = chain.split_first() else {
            return Err(InvalidNodeError::new("empty relationship path"));
        };
        let index = match levels.iter().position(|l| l.anchor.matches(first)) {
            Some(index) => index,
            None => {
                let (Node::Reference(link) | Node::Reverse(link) | Node::ManyMany(link)) = first
                else {
                    return Err(InvalidNodeError::new(format!(
                        "'{first}' is not a relationship"
                    )));
                };
                let rel = self.relationship_of(link)?;
                let target = lookup(self.schema, &rel.target_table)?;
                levels.push(Level {
                    anchor: (*first).clone(),
                    rel,
                    target,
                    all_columns: false,
                    columns: Vec::new(),
                    calculations: Vec::new(),
                    children: Vec::new(),
                });
                levels.len() - 1
            }
        };
        let level = &mut levels[index];
        if rest.is_empty() {
            Ok(level)
        } else {
            self.level_mut(&mut level.children, rest)
        }
    }

    fn finish(&self, level: Level) -> Result<LinkLoad> {
        let target_root = Node::table(self.query.db_key.clone(), level.target.name.clone());
        let mut plan = QueryPlan::new(&level.target);

        let narrowed = !level.all_columns && !level.columns.is_empty();
        let names: Vec<String> = if narrowed {
            let mut names = level.columns.clone();
            if self.options.auto_select_keys {
                names.extend(key_columns(&level.target));
            }
            names
        } else {
            level.target.columns.iter().map(|c| c.name.clone()).collect()
        };
        for name in names {
            add_projection(&mut plan, name.clone(), target_root.column_of(name));
        }
        ensure_column(&mut plan, &level.rel.remote_column);
        for child in &level.children {
            ensure_column(&mut plan, &child.rel.local_column);
        }
        for (alias, node) in level.calculations {
            add_projection(&mut plan, alias, node);
        }
        plan.order_by = self
            .query
            .order_by
            .iter()
            .filter_map(|key| {
                key.node.reroot(&level.anchor).map(|node| SortKey {
                    node,
                    descending: key.descending,
                })
            })
            .collect();

        let link_plan = link_plan(self.schema, &level.rel)?;
        let children = level
            .children
            .into_iter()
            .map(|child| self.finish(child))
            .collect::<Result<Vec<_>>>()?;
        Ok(LinkLoad {
            relationship: level.rel,
            target: level.target,
            plan,
            link_plan,
            children,
        })
    }
}

fn lookup(schema: &dyn SchemaMetadata, table: &str) -> Result<Arc<TableInfo>> {
    schema
        .table(table)
        .ok_or_else(|| InvalidNodeError::new(format!("unknown table '{table}'")))
}

/// Relationship nodes from the root down to `node`.
fn link_chain(node: &Node) -> Vec<&Node> {
    node.path()
        .into_iter()
        .filter(|n| n.is_relationship())
        .collect()
}

fn key_columns(table: &TableInfo) -> Vec<String> {
    let mut names: Vec<String> = table
        .primary_key_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    names.extend(table.lock_column.clone());
    names
}

fn add_projection(plan: &mut QueryPlan, label: String, node: Node) {
    if !plan.projections.iter().any(|p| p.label == label) {
        plan.projections.push(Projection::new(label, node));
    }
}

fn ensure_column(plan: &mut QueryPlan, column: &str) {
    let node = plan.root().column_of(column);
    add_projection(plan, column.to_string(), node);
}

fn link_plan(schema: &dyn SchemaMetadata, rel: &RelationshipInfo) -> Result<Option<QueryPlan>> {
    let Some(link) = &rel.link_table else {
        return Ok(None);
    };
    let info = lookup(schema, &link.table_name)?;
    let mut plan = QueryPlan::new(&info);
    ensure_column(&mut plan, &link.local_column);
    ensure_column(&mut plan, &link.remote_column);
    Ok(Some(plan))
}
