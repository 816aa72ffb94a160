//! Schema metadata: tables, columns and the relationship descriptors.
//!
//! The persistence engine and the query builder never hard-code table
//! shapes; they ask a [`SchemaMetadata`] implementation. [`Schema`] is the
//! in-process implementation, assembled with [`SchemaBuilder`]:
//!
//! ```ignore
//! let schema = Schema::builder("main")
//!     .table(TableDef::new("root_n").auto_key("id").column("name", SqlType::Text))
//!     .table(
//!         TableDef::new("leaf_n")
//!             .auto_key("id")
//!             .column("name", SqlType::Text)
//!             .reference(ReferenceDef::new("root_n", "root_n").nullable().unique()),
//!     )
//!     .build()?;
//! ```
//!
//! Every forward reference produces the matching reverse relationship on its
//! target table, and every many-to-many association produces a link table
//! plus one relationship on each side.

use crate::error::{Error, Result, SchemaError, SchemaErrorKind};
use crate::node::NodePath;
use crate::types::SqlType;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub primary_key: bool,
    pub auto_generated: bool,
    pub unique: bool,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            nullable: false,
            primary_key: false,
            auto_generated: false,
            unique: false,
        }
    }
}

/// The shape of a relationship, seen from the table that declares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    /// This table holds the foreign key.
    Forward,
    /// The target table holds a foreign key pointing here.
    Reverse,
    /// A link table holds both keys.
    ManyMany,
}

/// Link table backing a many-to-many relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTableInfo {
    pub table_name: String,
    /// Link column holding this side's key.
    pub local_column: String,
    /// Link column holding the target's key.
    pub remote_column: String,
}

/// Relationship descriptor.
///
/// Rows are related when `this.local_column == target.remote_column`. For
/// forward links `local_column` is the foreign key; for reverse links
/// `remote_column` is. Many-to-many links join both key columns through
/// `link_table`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipInfo {
    pub name: String,
    pub kind: RelationshipKind,
    pub target_table: String,
    pub local_column: String,
    pub remote_column: String,
    /// May the foreign key be NULL.
    pub nullable: bool,
    /// Is the foreign key constrained to a single owner.
    pub unique: bool,
    /// Is the key on the referenced side (the target of a reference or an
    /// association, the parent of a reverse link) assigned by the
    /// application rather than generated.
    pub manual_key_target: bool,
    /// Name of the inverse relationship on the target table.
    pub back_populates: String,
    pub link_table: Option<LinkTableInfo>,
}

impl RelationshipInfo {
    /// The foreign-key column backing a forward or reverse link.
    pub fn foreign_key(&self) -> Option<&str> {
        match self.kind {
            RelationshipKind::Forward => Some(&self.local_column),
            RelationshipKind::Reverse => Some(&self.remote_column),
            RelationshipKind::ManyMany => None,
        }
    }

    /// Does this relationship attach at most one record.
    pub fn is_single(&self) -> bool {
        match self.kind {
            RelationshipKind::Forward => true,
            RelationshipKind::Reverse => self.unique,
            RelationshipKind::ManyMany => false,
        }
    }
}

/// A table as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub db_key: String,
    pub columns: Vec<ColumnInfo>,
    pub relationships: Vec<RelationshipInfo>,
    /// Column carrying the optimistic lock token, if locking is enabled.
    pub lock_column: Option<String>,
    /// Table exists only to back a many-to-many association.
    pub link_table: bool,
}

impl TableInfo {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipInfo> {
        self.relationships.iter().find(|r| r.name == name)
    }

    pub fn primary_key(&self) -> Vec<&ColumnInfo> {
        self.columns.iter().filter(|c| c.primary_key).collect()
    }

    pub fn primary_key_names(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn has_composite_key(&self) -> bool {
        self.columns.iter().filter(|c| c.primary_key).count() > 1
    }

    /// The single primary-key column, if the key is not composite.
    pub fn single_key(&self) -> Option<&ColumnInfo> {
        let mut keys = self.columns.iter().filter(|c| c.primary_key);
        match (keys.next(), keys.next()) {
            (Some(key), None) => Some(key),
            _ => None,
        }
    }

    /// The generated primary-key column, if the key is generated by the store.
    pub fn auto_key(&self) -> Option<&ColumnInfo> {
        self.single_key().filter(|c| c.auto_generated)
    }

    pub fn is_locked(&self) -> bool {
        self.lock_column.is_some()
    }

    pub fn unique_columns(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns.iter().filter(|c| c.unique && !c.primary_key)
    }
}

/// Schema lookups consumed by the query builder, the engine and row stores.
pub trait SchemaMetadata: Send + Sync + fmt::Debug {
    /// Database key every table of this schema belongs to.
    fn db_key(&self) -> &str;

    fn table(&self, name: &str) -> Option<Arc<TableInfo>>;

    fn table_names(&self) -> Vec<String>;

    fn columns(&self, table: &str) -> Vec<ColumnInfo> {
        self.table(table)
            .map(|t| t.columns.clone())
            .unwrap_or_default()
    }

    fn relationships(&self, table: &str) -> Vec<RelationshipInfo> {
        self.table(table)
            .map(|t| t.relationships.clone())
            .unwrap_or_default()
    }

    fn lock_column(&self, table: &str) -> Option<String> {
        self.table(table).and_then(|t| t.lock_column.clone())
    }
}

impl dyn SchemaMetadata + '_ {
    /// Start a node path at `table`.
    ///
    /// Panics if the table is unknown.
    pub fn node(&self, table: &str) -> NodePath<'_> {
        NodePath::new(self, table)
    }
}

/// In-process schema registry.
#[derive(Debug, Clone)]
pub struct Schema {
    db_key: String,
    tables: Vec<Arc<TableInfo>>,
    by_name: HashMap<String, usize>,
}

impl Schema {
    pub fn builder(db_key: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            db_key: db_key.into(),
            tables: Vec::new(),
            many_many: Vec::new(),
        }
    }

    /// Start a node path at `table`.
    ///
    /// Panics if the table is unknown.
    pub fn node(&self, table: &str) -> NodePath<'_> {
        NodePath::new(self, table)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<TableInfo>> {
        self.tables.iter()
    }
}

impl SchemaMetadata for Schema {
    fn db_key(&self) -> &str {
        &self.db_key
    }

    fn table(&self, name: &str) -> Option<Arc<TableInfo>> {
        self.by_name
            .get(name)
            .map(|&idx| Arc::clone(&self.tables[idx]))
    }

    fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }
}

/// Table declaration for [`SchemaBuilder`].
#[derive(Debug, Clone)]
pub struct TableDef {
    name: String,
    columns: Vec<ColumnInfo>,
    references: Vec<ReferenceDef>,
    lock_column: Option<String>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            references: Vec::new(),
            lock_column: None,
        }
    }

    /// Generated BIGINT primary key.
    pub fn auto_key(mut self, name: impl Into<String>) -> Self {
        let mut col = ColumnInfo::new(name, SqlType::BigInt);
        col.primary_key = true;
        col.auto_generated = true;
        self.columns.push(col);
        self
    }

    /// Application-assigned primary-key column. Declare several for a composite key.
    pub fn key(mut self, name: impl Into<String>, sql_type: SqlType) -> Self {
        let mut col = ColumnInfo::new(name, sql_type);
        col.primary_key = true;
        self.columns.push(col);
        self
    }

    pub fn column(mut self, name: impl Into<String>, sql_type: SqlType) -> Self {
        self.columns.push(ColumnInfo::new(name, sql_type));
        self
    }

    pub fn nullable_column(mut self, name: impl Into<String>, sql_type: SqlType) -> Self {
        let mut col = ColumnInfo::new(name, sql_type);
        col.nullable = true;
        self.columns.push(col);
        self
    }

    pub fn unique_column(mut self, name: impl Into<String>, sql_type: SqlType) -> Self {
        let mut col = ColumnInfo::new(name, sql_type);
        col.unique = true;
        self.columns.push(col);
        self
    }

    /// Add a fully specified column.
    pub fn column_info(mut self, col: ColumnInfo) -> Self {
        self.columns.push(col);
        self
    }

    /// Enable optimistic locking with the token stored in `column`.
    pub fn locked(mut self, column: impl Into<String>) -> Self {
        let column = column.into();
        self.columns.push(ColumnInfo::new(column.clone(), SqlType::BigInt));
        self.lock_column = Some(column);
        self
    }

    pub fn reference(mut self, def: ReferenceDef) -> Self {
        self.references.push(def);
        self
    }
}

/// Forward reference declaration; the reverse side is derived from it.
#[derive(Debug, Clone)]
pub struct ReferenceDef {
    name: String,
    target: String,
    column: Option<String>,
    reverse: Option<String>,
    nullable: bool,
    unique: bool,
}

impl ReferenceDef {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            column: None,
            reverse: None,
            nullable: false,
            unique: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Foreign-key column name. Defaults to `<name>_id`.
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    /// Name of the reverse relationship on the target. Defaults to the owning table's name.
    pub fn reverse(mut self, name: impl Into<String>) -> Self {
        self.reverse = Some(name.into());
        self
    }
}

/// Many-to-many association declaration.
#[derive(Debug, Clone)]
pub struct ManyManyDef {
    link_table: String,
    left: String,
    right: String,
    left_name: Option<String>,
    right_name: Option<String>,
}

impl ManyManyDef {
    /// Associate `left` and `right` through a link table named `link_table`.
    pub fn new(
        link_table: impl Into<String>,
        left: impl Into<String>,
        right: impl Into<String>,
    ) -> Self {
        Self {
            link_table: link_table.into(),
            left: left.into(),
            right: right.into(),
            left_name: None,
            right_name: None,
        }
    }

    /// Relationship name on the left table. Defaults to the right table's name.
    pub fn left_name(mut self, name: impl Into<String>) -> Self {
        self.left_name = Some(name.into());
        self
    }

    /// Relationship name on the right table. Defaults to the left table's name.
    pub fn right_name(mut self, name: impl Into<String>) -> Self {
        self.right_name = Some(name.into());
        self
    }
}

/// Assembles and validates a [`Schema`].
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    db_key: String,
    tables: Vec<TableDef>,
    many_many: Vec<ManyManyDef>,
}

fn schema_error(kind: SchemaErrorKind, message: String) -> Error {
    Error::Schema(SchemaError { kind, message })
}

impl SchemaBuilder {
    pub fn table(mut self, def: TableDef) -> Self {
        self.tables.push(def);
        self
    }

    pub fn many_many(mut self, def: ManyManyDef) -> Self {
        self.many_many.push(def);
        self
    }

    #[tracing::instrument(level = "debug", skip(self), fields(db_key = %self.db_key))]
    pub fn build(self) -> Result<Schema> {
        let mut tables: Vec<TableInfo> = Vec::with_capacity(self.tables.len());
        let mut by_name: HashMap<String, usize> = HashMap::new();
        let mut pending = Vec::new();

        for def in self.tables {
            if by_name.contains_key(&def.name) {
                return Err(schema_error(
                    SchemaErrorKind::TableExists,
                    format!("table '{}' declared twice", def.name),
                ));
            }
            if !def.columns.iter().any(|c| c.primary_key) {
                return Err(schema_error(
                    SchemaErrorKind::Invalid,
                    format!("table '{}' has no primary key", def.name),
                ));
            }
            let mut table = TableInfo {
                name: def.name.clone(),
                db_key: self.db_key.clone(),
                columns: Vec::new(),
                relationships: Vec::new(),
                lock_column: def.lock_column,
                link_table: false,
            };
            for col in def.columns {
                add_column(&mut table, col)?;
            }
            by_name.insert(def.name.clone(), tables.len());
            tables.push(table);
            for reference in def.references {
                pending.push((def.name.clone(), reference));
            }
        }

        for (owner, def) in pending {
            link_reference(&mut tables, &by_name, &owner, def)?;
        }

        for def in self.many_many {
            link_many_many(&mut tables, &mut by_name, &self.db_key, def)?;
        }

        tracing::debug!(tables = tables.len(), "schema built");

        Ok(Schema {
            db_key: self.db_key,
            tables: tables.into_iter().map(Arc::new).collect(),
            by_name,
        })
    }
}

fn add_column(table: &mut TableInfo, col: ColumnInfo) -> Result<()> {
    if table.column(&col.name).is_some() || table.relationship(&col.name).is_some() {
        return Err(schema_error(
            SchemaErrorKind::DuplicateName,
            format!("'{}.{}' declared twice", table.name, col.name),
        ));
    }
    table.columns.push(col);
    Ok(())
}

fn add_relationship(table: &mut TableInfo, rel: RelationshipInfo) -> Result<()> {
    if table.relationship(&rel.name).is_some() || table.column(&rel.name).is_some() {
        return Err(schema_error(
            SchemaErrorKind::DuplicateName,
            format!("'{}.{}' declared twice", table.name, rel.name),
        ));
    }
    table.relationships.push(rel);
    Ok(())
}

fn lookup(by_name: &HashMap<String, usize>, name: &str) -> Result<usize> {
    by_name.get(name).copied().ok_or_else(|| {
        schema_error(
            SchemaErrorKind::TableNotFound,
            format!("unknown table '{name}'"),
        )
    })
}

fn single_key_of(table: &TableInfo) -> Result<ColumnInfo> {
    table.single_key().cloned().ok_or_else(|| {
        schema_error(
            SchemaErrorKind::Invalid,
            format!(
                "table '{}' has a composite key and cannot be referenced",
                table.name
            ),
        )
    })
}

fn link_reference(
    tables: &mut [TableInfo],
    by_name: &HashMap<String, usize>,
    owner: &str,
    def: ReferenceDef,
) -> Result<()> {
    let owner_idx = lookup(by_name, owner)?;
    let target_idx = lookup(by_name, &def.target)?;
    let target_key = single_key_of(&tables[target_idx])?;
    let column = def.column.unwrap_or_else(|| format!("{}_id", def.name));
    let reverse = def.reverse.unwrap_or_else(|| owner.to_string());

    let mut fk = ColumnInfo::new(column.clone(), target_key.sql_type);
    fk.nullable = def.nullable;
    fk.unique = def.unique;
    add_column(&mut tables[owner_idx], fk)?;

    let manual_key_target = !target_key.auto_generated;

    add_relationship(
        &mut tables[owner_idx],
        RelationshipInfo {
            name: def.name.clone(),
            kind: RelationshipKind::Forward,
            target_table: def.target.clone(),
            local_column: column.clone(),
            remote_column: target_key.name.clone(),
            nullable: def.nullable,
            unique: def.unique,
            manual_key_target,
            back_populates: reverse.clone(),
            link_table: None,
        },
    )?;

    add_relationship(
        &mut tables[target_idx],
        RelationshipInfo {
            name: reverse,
            kind: RelationshipKind::Reverse,
            target_table: owner.to_string(),
            local_column: target_key.name,
            remote_column: column,
            nullable: def.nullable,
            unique: def.unique,
            manual_key_target,
            back_populates: def.name,
            link_table: None,
        },
    )
}

fn link_many_many(
    tables: &mut Vec<TableInfo>,
    by_name: &mut HashMap<String, usize>,
    db_key: &str,
    def: ManyManyDef,
) -> Result<()> {
    if by_name.contains_key(&def.link_table) {
        return Err(schema_error(
            SchemaErrorKind::TableExists,
            format!("link table '{}' collides with a table", def.link_table),
        ));
    }
    let left_idx = lookup(by_name, &def.left)?;
    let right_idx = lookup(by_name, &def.right)?;
    let left_key = single_key_of(&tables[left_idx])?;
    let right_key = single_key_of(&tables[right_idx])?;
    let left_name = def.left_name.unwrap_or_else(|| def.right.clone());
    let right_name = def.right_name.unwrap_or_else(|| def.left.clone());

    let (left_col, right_col) = if def.left == def.right {
        ("left_id".to_string(), "right_id".to_string())
    } else {
        (format!("{}_id", def.left), format!("{}_id", def.right))
    };

    let mut link = TableInfo {
        name: def.link_table.clone(),
        db_key: db_key.to_string(),
        columns: Vec::new(),
        relationships: Vec::new(),
        lock_column: None,
        link_table: true,
    };
    for (name, key) in [(&left_col, &left_key), (&right_col, &right_key)] {
        let mut col = ColumnInfo::new(name.clone(), key.sql_type);
        col.primary_key = true;
        add_column(&mut link, col)?;
    }

    add_relationship(
        &mut tables[left_idx],
        RelationshipInfo {
            name: left_name.clone(),
            kind: RelationshipKind::ManyMany,
            target_table: def.right.clone(),
            local_column: left_key.name.clone(),
            remote_column: right_key.name.clone(),
            nullable: true,
            unique: false,
            manual_key_target: !right_key.auto_generated,
            back_populates: right_name.clone(),
            link_table: Some(LinkTableInfo {
                table_name: def.link_table.clone(),
                local_column: left_col.clone(),
                remote_column: right_col.clone(),
            }),
        },
    )?;
    add_relationship(
        &mut tables[right_idx],
        RelationshipInfo {
            name: right_name,
            kind: RelationshipKind::ManyMany,
            target_table: def.left.clone(),
            local_column: right_key.name,
            remote_column: left_key.name,
            nullable: true,
            unique: false,
            manual_key_target: !left_key.auto_generated,
            back_populates: left_name,
            link_table: Some(LinkTableInfo {
                table_name: def.link_table.clone(),
                local_column: right_col,
                remote_column: left_col,
            }),
        },
    )?;

    by_name.insert(def.link_table, tables.len());
    tables.push(link);
    Ok(())
}
