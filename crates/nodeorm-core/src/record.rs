//! Mutable, schema-typed rows.
//!
//! A [`Record`] wraps one row of one table. It remembers the values last
//! loaded from or written to the store, which columns the loading query
//! actually selected, which columns changed since, and which related
//! records are attached to it. Accessors never touch the store; relationship
//! loading is an explicit call on the session.

use crate::error::{Error, NotLoadedError, Result};
use crate::row::Row;
use crate::schema::{RelationshipInfo, RelationshipKind, TableInfo};
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// What reading a column the query did not select does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnloadedFieldPolicy {
    /// Return [`Error::NotLoaded`].
    #[default]
    Error,
    /// Return the column type's zero value (NULL for nullable columns).
    ZeroValue,
}

/// Records attached under one relationship name.
#[derive(Debug, Clone)]
pub enum Link {
    /// Forward reference or unique reverse link.
    One {
        record: Option<Box<Record>>,
        /// Assigned by the caller since the last save.
        changed: bool,
    },
    /// Non-unique reverse link or many-to-many association.
    Many {
        records: Vec<Record>,
        /// The whole set was assigned; anything not in it is detached on save.
        replaced: bool,
        /// Trailing records added with [`Record::add_link`] since the last save.
        appended: usize,
    },
}

impl Link {
    /// A link as loaded from the store, with no pending changes.
    pub fn loaded_one(record: Option<Record>) -> Self {
        Link::One {
            record: record.map(Box::new),
            changed: false,
        }
    }

    pub fn loaded_many(records: Vec<Record>) -> Self {
        Link::Many {
            records,
            replaced: false,
            appended: 0,
        }
    }

    pub fn is_changed(&self) -> bool {
        match self {
            Link::One { changed, .. } => *changed,
            Link::Many {
                replaced, appended, ..
            } => *replaced || *appended > 0,
        }
    }

    pub fn records(&self) -> Vec<&Record> {
        match self {
            Link::One { record, .. } => record.iter().map(|r| &**r).collect(),
            Link::Many { records, .. } => records.iter().collect(),
        }
    }

    fn settle(&mut self) {
        match self {
            Link::One { changed, .. } => *changed = false,
            Link::Many {
                replaced, appended, ..
            } => {
                *replaced = false;
                *appended = 0;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Record {
    table: Arc<TableInfo>,
    values: HashMap<String, Value>,
    original: HashMap<String, Value>,
    loaded: HashSet<String>,
    dirty: BTreeSet<String>,
    persisted: bool,
    links: BTreeMap<String, Link>,
    aliases: BTreeMap<String, Value>,
    policy: UnloadedFieldPolicy,
}

impl Record {
    /// A new, unsaved record with every column at its default.
    ///
    /// Nullable columns, foreign keys, generated keys and the lock column
    /// start NULL; everything else starts at its type's zero value.
    pub fn new(table: Arc<TableInfo>) -> Self {
        let foreign_keys: HashSet<&str> = table
            .relationships
            .iter()
            .filter(|r| r.kind == RelationshipKind::Forward)
            .map(|r| r.local_column.as_str())
            .collect();
        let mut values = HashMap::with_capacity(table.columns.len());
        for col in &table.columns {
            let starts_null = col.nullable
                || col.auto_generated
                || foreign_keys.contains(col.name.as_str())
                || table.lock_column.as_deref() == Some(col.name.as_str());
            let value = if starts_null {
                Value::Null
            } else {
                col.sql_type.zero_value()
            };
            values.insert(col.name.clone(), value);
        }
        Self {
            loaded: values.keys().cloned().collect(),
            values,
            original: HashMap::new(),
            dirty: BTreeSet::new(),
            persisted: false,
            links: BTreeMap::new(),
            aliases: BTreeMap::new(),
            policy: UnloadedFieldPolicy::default(),
            table,
        }
    }

    /// Hydrate a record from a store row.
    ///
    /// Labels naming a column of `table` become loaded fields; any other
    /// label is kept as a calculation alias.
    pub fn from_row(table: Arc<TableInfo>, row: &Row, policy: UnloadedFieldPolicy) -> Self {
        let mut values = HashMap::new();
        let mut aliases = BTreeMap::new();
        for (label, value) in row.iter() {
            if table.column(label).is_some() {
                values.insert(label.to_string(), value.clone());
            } else {
                aliases.insert(label.to_string(), value.clone());
            }
        }
        Self {
            loaded: values.keys().cloned().collect(),
            original: values.clone(),
            values,
            dirty: BTreeSet::new(),
            persisted: true,
            links: BTreeMap::new(),
            aliases,
            policy,
            table,
        }
    }

    pub fn table(&self) -> &Arc<TableInfo> {
        &self.table
    }

    pub fn table_name(&self) -> &str {
        &self.table.name
    }

    pub fn policy(&self) -> UnloadedFieldPolicy {
        self.policy
    }

    /// Read a column.
    ///
    /// Panics if the table has no such column.
    pub fn get(&self, column: &str) -> Result<Value> {
        let Some(info) = self.table.column(column) else {
            panic!("table '{}' has no column '{column}'", self.table.name);
        };
        if let Some(value) = self.values.get(column) {
            return Ok(value.clone());
        }
        match self.policy {
            UnloadedFieldPolicy::Error => Err(Error::NotLoaded(NotLoadedError {
                table: self.table.name.clone(),
                column: column.to_string(),
            })),
            UnloadedFieldPolicy::ZeroValue if info.nullable => Ok(Value::Null),
            UnloadedFieldPolicy::ZeroValue => Ok(info.sql_type.zero_value()),
        }
    }

    pub fn get_as<T>(&self, column: &str) -> Result<T>
    where
        T: TryFrom<Value, Error = Error>,
    {
        T::try_from(self.get(column)?)
    }

    pub fn is_loaded(&self, column: &str) -> bool {
        self.loaded.contains(column)
    }

    /// Assign a column.
    ///
    /// Panics on unknown columns, generated keys, the lock column, and on
    /// primary-key columns of a record that was already saved.
    pub fn set(&mut self, column: &str, value: impl Into<Value>) {
        let Some(info) = self.table.column(column) else {
            panic!("table '{}' has no column '{column}'", self.table.name);
        };
        if info.primary_key && info.auto_generated {
            panic!(
                "primary key '{}.{column}' is generated by the store and cannot be set",
                self.table.name
            );
        }
        if info.primary_key && self.persisted {
            panic!(
                "primary key '{}.{column}' cannot change after the first save",
                self.table.name
            );
        }
        if self.table.lock_column.as_deref() == Some(column) {
            panic!(
                "lock column '{}.{column}' is managed by the engine",
                self.table.name
            );
        }
        self.assign(column, value.into());
    }

    /// Engine-side assignment without the key and lock guards of [`Record::set`].
    pub fn assign(&mut self, column: &str, value: Value) {
        let changed = match self.original.get(column) {
            Some(original) => original != &value,
            None => true,
        };
        if changed {
            self.dirty.insert(column.to_string());
        } else {
            self.dirty.remove(column);
        }
        self.loaded.insert(column.to_string());
        self.values.insert(column.to_string(), value);
    }

    /// Mark a loaded column dirty so the next save writes it even when the
    /// value looks unchanged.
    pub fn touch(&mut self, column: &str) {
        if self.values.contains_key(column) {
            self.dirty.insert(column.to_string());
        }
    }

    fn relationship(&self, name: &str) -> RelationshipInfo {
        match self.table.relationship(name) {
            Some(rel) => rel.clone(),
            None => panic!("table '{}' has no relationship '{name}'", self.table.name),
        }
    }

    fn check_target(&self, rel: &RelationshipInfo, record: &Record) {
        if record.table_name() != rel.target_table {
            panic!(
                "relationship '{}.{}' links to '{}', got a '{}' record",
                self.table.name,
                rel.name,
                rel.target_table,
                record.table_name()
            );
        }
    }

    /// Attach (or with `None`, detach) the record of a single-valued relationship.
    ///
    /// Panics if the relationship is many-valued, if `target` belongs to the
    /// wrong table, or when clearing a required forward reference.
    pub fn set_link(&mut self, name: &str, target: Option<Record>) {
        let rel = self.relationship(name);
        if !rel.is_single() {
            panic!(
                "relationship '{}.{name}' is many-valued; use set_links",
                self.table.name
            );
        }
        if let Some(t) = &target {
            self.check_target(&rel, t);
        }
        if rel.kind == RelationshipKind::Forward {
            match &target {
                None if !rel.nullable => panic!(
                    "required reference '{}.{name}' cannot be cleared",
                    self.table.name
                ),
                None => self.assign(&rel.local_column, Value::Null),
                Some(t) if t.persisted => {
                    if let Some(key) = t.values.get(&rel.remote_column) {
                        self.assign(&rel.local_column, key.clone());
                    }
                }
                Some(_) => {}
            }
        }
        self.links.insert(
            name.to_string(),
            Link::One {
                record: target.map(Box::new),
                changed: true,
            },
        );
    }

    /// Replace the full set of a many-valued relationship.
    pub fn set_links(&mut self, name: &str, targets: Vec<Record>) {
        let rel = self.relationship(name);
        if rel.is_single() {
            panic!(
                "relationship '{}.{name}' is single-valued; use set_link",
                self.table.name
            );
        }
        for t in &targets {
            self.check_target(&rel, t);
        }
        self.links.insert(
            name.to_string(),
            Link::Many {
                records: targets,
                replaced: true,
                appended: 0,
            },
        );
    }

    /// Add one record to a many-valued relationship, keeping existing links.
    pub fn add_link(&mut self, name: &str, target: Record) {
        let rel = self.relationship(name);
        if rel.is_single() {
            panic!(
                "relationship '{}.{name}' is single-valued; use set_link",
                self.table.name
            );
        }
        self.check_target(&rel, &target);
        match self.links.get_mut(name) {
            Some(Link::Many {
                records,
                replaced,
                appended,
            }) => {
                records.push(target);
                if !*replaced {
                    *appended += 1;
                }
            }
            _ => {
                self.links.insert(
                    name.to_string(),
                    Link::Many {
                        records: vec![target],
                        replaced: false,
                        appended: 1,
                    },
                );
            }
        }
    }

    /// The attached record of a single-valued relationship.
    ///
    /// `None` when nothing is attached or the link was never loaded; see
    /// [`Record::is_link_loaded`].
    pub fn link(&self, name: &str) -> Option<&Record> {
        match self.links.get(name) {
            Some(Link::One { record, .. }) => record.as_deref(),
            _ => None,
        }
    }

    pub fn link_mut(&mut self, name: &str) -> Option<&mut Record> {
        match self.links.get_mut(name) {
            Some(Link::One { record, .. }) => record.as_deref_mut(),
            _ => None,
        }
    }

    /// The attached records of a many-valued relationship.
    pub fn links(&self, name: &str) -> &[Record] {
        match self.links.get(name) {
            Some(Link::Many { records, .. }) => records,
            _ => &[],
        }
    }

    pub fn links_mut(&mut self, name: &str) -> &mut [Record] {
        match self.links.get_mut(name) {
            Some(Link::Many { records, .. }) => records,
            _ => &mut [],
        }
    }

    pub fn is_link_loaded(&self, name: &str) -> bool {
        self.links.contains_key(name)
    }

    /// Value of calculation `alias`, if the loading query computed it.
    pub fn alias(&self, alias: &str) -> Option<&Value> {
        self.aliases.get(alias)
    }

    /// Primary-key columns with their current values.
    pub fn key_values(&self) -> Vec<(String, Value)> {
        self.table
            .primary_key()
            .into_iter()
            .map(|c| {
                let v = self.values.get(&c.name).cloned().unwrap_or(Value::Null);
                (c.name.clone(), v)
            })
            .collect()
    }

    /// The column's value when it holds one: loaded and not NULL. Unlike
    /// [`Record::get`] this never falls back to a zero value.
    pub fn present(&self, column: &str) -> Option<&Value> {
        self.values.get(column).filter(|v| !v.is_null())
    }

    /// Primary-key filter for writing this record back.
    ///
    /// Fails with [`Error::NotLoaded`] naming the first key column that is
    /// NULL or was not selected by the loading query.
    pub fn require_key(&self) -> Result<Vec<(String, Value)>> {
        let key = self.key_values();
        match key.iter().find(|(_, v)| v.is_null()) {
            Some((column, _)) => Err(Error::NotLoaded(NotLoadedError {
                table: self.table.name.clone(),
                column: column.clone(),
            })),
            None => Ok(key),
        }
    }

    /// The primary key, or `None` while any key column is NULL or unloaded.
    ///
    /// Composite keys are returned as [`Value::Array`].
    pub fn primary_key(&self) -> Option<Value> {
        let mut parts: Vec<Value> = self.key_values().into_iter().map(|(_, v)| v).collect();
        if parts.is_empty() || parts.iter().any(Value::is_null) {
            return None;
        }
        if parts.len() == 1 {
            parts.pop()
        } else {
            Some(Value::Array(parts))
        }
    }

    pub fn lock_token(&self) -> Option<&Value> {
        self.table
            .lock_column
            .as_deref()
            .and_then(|c| self.values.get(c))
            .filter(|v| !v.is_null())
    }

    /// Never written to (or already deleted from) the store.
    pub fn is_new(&self) -> bool {
        !self.persisted
    }

    /// Any own column differs from its stored value.
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// This record or anything attached to it needs writing.
    pub fn has_changes(&self) -> bool {
        self.is_new()
            || self.is_dirty()
            || self.links.values().any(|link| {
                link.is_changed() || link.records().into_iter().any(Record::has_changes)
            })
    }

    pub fn dirty_columns(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(String::as_str)
    }

    /// Value as last loaded from or written to the store.
    pub fn original(&self, column: &str) -> Option<&Value> {
        self.original.get(column)
    }

    /// Loaded columns with their current values, in schema order.
    pub fn loaded_values(&self) -> Vec<(String, Value)> {
        self.table
            .columns
            .iter()
            .filter_map(|c| {
                self.values
                    .get(&c.name)
                    .map(|v| (c.name.clone(), v.clone()))
            })
            .collect()
    }

    /// Dirty columns with their current values, in schema order.
    pub fn dirty_values(&self) -> Vec<(String, Value)> {
        self.table
            .columns
            .iter()
            .filter(|c| self.dirty.contains(&c.name))
            .filter_map(|c| {
                self.values
                    .get(&c.name)
                    .map(|v| (c.name.clone(), v.clone()))
            })
            .collect()
    }

    /// Record that the current values are what the store holds.
    pub fn mark_persisted(&mut self) {
        self.original = self.values.clone();
        self.dirty.clear();
        self.persisted = true;
    }

    /// Record that the row is gone; a later save inserts it again.
    pub fn mark_deleted(&mut self) {
        self.persisted = false;
        self.original.clear();
        self.dirty = self.values.keys().cloned().collect();
        if let Some(key) = self.table.auto_key() {
            self.values.insert(key.name.clone(), Value::Null);
        }
        if let Some(lock) = &self.table.lock_column {
            self.values.insert(lock.clone(), Value::Null);
        }
    }

    /// Attach related records as loaded, without marking a change.
    pub fn attach(&mut self, name: &str, link: Link) {
        self.links.insert(name.to_string(), link);
    }

    /// Detach and return the link slot.
    pub fn take_link(&mut self, name: &str) -> Option<Link> {
        self.links.remove(name)
    }

    pub fn link_slot_mut(&mut self, name: &str) -> Option<&mut Link> {
        self.links.get_mut(name)
    }

    /// Clear pending link changes after they were written.
    pub fn settle_links(&mut self) {
        for link in self.links.values_mut() {
            link.settle();
        }
    }

    /// Render the primary key for error messages.
    pub fn key_display(&self) -> String {
        self.key_values()
            .iter()
            .map(|(c, v)| format!("{c}={v}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ReferenceDef, Schema, SchemaMetadata, TableDef};
    use crate::types::SqlType;

    fn schema() -> Schema {
        Schema::builder("main")
            .table(
                TableDef::new("root_n")
                    .auto_key("id")
                    .column("name", SqlType::Text),
            )
            .table(
                TableDef::new("leaf_n")
                    .auto_key("id")
                    .column("name", SqlType::Text)
                    .nullable_column("note", SqlType::Text)
                    .reference(ReferenceDef::new("root_n", "root_n").nullable().unique()),
            )
            .table(
                TableDef::new("root_u")
                    .auto_key("id")
                    .column("name", SqlType::Text),
            )
            .table(
                TableDef::new("leaf_u")
                    .auto_key("id")
                    .reference(ReferenceDef::new("root_u", "root_u").unique())
                    .locked("lock"),
            )
            .table(TableDef::new("code").key("code", SqlType::Text))
            .table(
                TableDef::new("tag")
                    .auto_key("id")
                    .reference(ReferenceDef::new("root_n", "root_n").reverse("tags")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn new_records_start_at_defaults() {
        let schema = schema();
        let leaf = Record::new(schema.table("leaf_n").unwrap());
        assert!(leaf.is_new());
        assert!(!leaf.is_dirty());
        assert_eq!(leaf.get("name").unwrap(), Value::Text(String::new()));
        assert_eq!(leaf.get("note").unwrap(), Value::Null);
        assert_eq!(leaf.get("root_n_id").unwrap(), Value::Null);
        assert_eq!(leaf.primary_key(), None);
    }

    #[test]
    fn dirty_tracking_follows_original_values() {
        let schema = schema();
        let table = schema.table("root_n").unwrap();
        let row = Row::new(
            vec!["id".to_string(), "name".to_string()],
            vec![Value::BigInt(1), Value::Text("root".to_string())],
        );
        let mut root = Record::from_row(table, &row, UnloadedFieldPolicy::Error);
        assert!(!root.is_new());
        root.set("name", "other");
        assert!(root.is_dirty());
        assert_eq!(root.dirty_columns().collect::<Vec<_>>(), vec!["name"]);
        root.set("name", "root");
        assert!(!root.is_dirty());
        assert!(!root.has_changes());

        root.touch("name");
        assert_eq!(root.dirty_values(), vec![("name".to_string(), Value::Text("root".to_string()))]);
        root.touch("missing");
        assert_eq!(root.dirty_columns().count(), 1);
    }

    #[test]
    fn unloaded_fields_follow_policy() {
        let schema = schema();
        let table = schema.table("leaf_n").unwrap();
        let row = Row::new(
            vec!["id".to_string(), "total".to_string()],
            vec![Value::BigInt(3), Value::BigInt(9)],
        );
        let strict = Record::from_row(Arc::clone(&table), &row, UnloadedFieldPolicy::Error);
        assert!(matches!(strict.get("name"), Err(Error::NotLoaded(_))));
        assert_eq!(strict.alias("total"), Some(&Value::BigInt(9)));

        let lenient = Record::from_row(table, &row, UnloadedFieldPolicy::ZeroValue);
        assert_eq!(lenient.get("name").unwrap(), Value::Text(String::new()));
        assert_eq!(lenient.get("note").unwrap(), Value::Null);
    }

    #[test]
    fn key_filter_requires_loaded_key() {
        let schema = schema();
        let table = schema.table("root_n").unwrap();
        let row = Row::new(vec!["name".to_string()], vec![Value::Text("root".to_string())]);
        let partial = Record::from_row(Arc::clone(&table), &row, UnloadedFieldPolicy::ZeroValue);
        match partial.require_key() {
            Err(Error::NotLoaded(e)) => {
                assert_eq!((e.table.as_str(), e.column.as_str()), ("root_n", "id"));
            }
            other => panic!("expected NotLoaded, got {other:?}"),
        }

        assert_eq!(partial.get("id").unwrap(), Value::BigInt(0));
        assert_eq!(partial.present("id"), None);

        let row = Row::new(vec!["id".to_string()], vec![Value::BigInt(4)]);
        let keyed = Record::from_row(table, &row, UnloadedFieldPolicy::ZeroValue);
        assert_eq!(keyed.present("id"), Some(&Value::BigInt(4)));
        assert_eq!(keyed.require_key().unwrap(), vec![("id".to_string(), Value::BigInt(4))]);
    }

    #[test]
    fn nullable_forward_link_can_be_cleared() {
        let schema = schema();
        let mut leaf = Record::new(schema.table("leaf_n").unwrap());
        let root = Record::new(schema.table("root_n").unwrap());
        leaf.set_link("root_n", Some(root));
        assert!(leaf.link("root_n").is_some());
        assert!(leaf.has_changes());
        leaf.set_link("root_n", None);
        assert!(leaf.link("root_n").is_none());
        assert!(leaf.is_link_loaded("root_n"));
        assert_eq!(leaf.get("root_n_id").unwrap(), Value::Null);
    }

    #[test]
    #[should_panic(expected = "required reference 'leaf_u.root_u' cannot be cleared")]
    fn required_forward_link_cannot_be_cleared() {
        let schema = schema();
        let mut leaf = Record::new(schema.table("leaf_u").unwrap());
        leaf.set_link("root_u", None);
    }

    #[test]
    #[should_panic(expected = "generated by the store")]
    fn generated_keys_cannot_be_set() {
        let schema = schema();
        let mut root = Record::new(schema.table("root_n").unwrap());
        root.set("id", 5_i64);
    }

    #[test]
    #[should_panic(expected = "cannot change after the first save")]
    fn manual_keys_freeze_after_save() {
        let schema = schema();
        let mut code = Record::new(schema.table("code").unwrap());
        code.set("code", "a");
        code.mark_persisted();
        code.set("code", "b");
    }

    #[test]
    #[should_panic(expected = "links to 'root_n'")]
    fn links_check_target_table() {
        let schema = schema();
        let mut leaf = Record::new(schema.table("leaf_n").unwrap());
        leaf.set_link("root_n", Some(Record::new(schema.table("root_u").unwrap())));
    }

    #[test]
    fn add_link_counts_appended_records() {
        let schema = schema();
        let mut root = Record::new(schema.table("root_n").unwrap());
        root.add_link("tags", Record::new(schema.table("tag").unwrap()));
        root.add_link("tags", Record::new(schema.table("tag").unwrap()));
        assert_eq!(root.links("tags").len(), 2);
        match root.link_slot_mut("tags") {
            Some(Link::Many { appended, replaced, .. }) => {
                assert_eq!(*appended, 2);
                assert!(!*replaced);
            }
            other => panic!("unexpected slot {other:?}"),
        }
        root.settle_links();
        assert!(!root.link_slot_mut("tags").unwrap().is_changed());
    }

    #[test]
    #[should_panic(expected = "is single-valued")]
    fn add_link_rejects_single_relationships() {
        let schema = schema();
        let mut root = Record::new(schema.table("root_n").unwrap());
        root.add_link("leaf_n", Record::new(schema.table("leaf_n").unwrap()));
    }

    #[test]
    fn mark_deleted_resets_generated_key() {
        let schema = schema();
        let table = schema.table("leaf_u").unwrap();
        let row = Row::new(
            vec!["id".to_string(), "root_u_id".to_string(), "lock".to_string()],
            vec![Value::BigInt(2), Value::BigInt(1), Value::BigInt(77)],
        );
        let mut leaf = Record::from_row(table, &row, UnloadedFieldPolicy::Error);
        assert_eq!(leaf.lock_token(), Some(&Value::BigInt(77)));
        assert_eq!(leaf.key_display(), "id=2");
        leaf.mark_deleted();
        assert!(leaf.is_new());
        assert_eq!(leaf.primary_key(), None);
        assert_eq!(leaf.lock_token(), None);
    }
}
