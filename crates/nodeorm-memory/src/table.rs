//! Row storage and constraint enforcement for one table.

use nodeorm_core::error::QueryError;
use nodeorm_core::{
    Error, KeyFilter, LockCheck, QueryErrorKind, Result, SqlType, TableInfo, Value, ValueKey,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

pub(crate) type RowData = HashMap<String, Value>;

#[derive(Debug, Clone)]
pub(crate) struct TableData {
    pub(crate) info: Arc<TableInfo>,
    /// Rows in insertion order.
    pub(crate) rows: BTreeMap<u64, RowData>,
    next_row_id: u64,
    /// Shared by every copy of the table so keys stay unique across
    /// transactions.
    next_key: Arc<AtomicI64>,
}

impl TableData {
    pub(crate) fn new(info: Arc<TableInfo>) -> Self {
        Self {
            info,
            rows: BTreeMap::new(),
            next_row_id: 1,
            next_key: Arc::new(AtomicI64::new(1)),
        }
    }

    pub(crate) fn scan(&self) -> impl Iterator<Item = &RowData> {
        self.rows.values()
    }

    pub(crate) fn insert(&mut self, values: &[(String, Value)]) -> Result<Option<Value>> {
        let mut row = RowData::with_capacity(self.info.columns.len());
        for (name, value) in values {
            self.check_column(name)?;
            row.insert(name.clone(), value.clone());
        }

        let mut generated = None;
        for col in &self.info.columns {
            let current = row.get(&col.name).cloned().unwrap_or(Value::Null);
            if col.primary_key && col.auto_generated && current.is_null() {
                let next = self.next_key.fetch_add(1, Ordering::SeqCst);
                let key = match col.sql_type {
                    SqlType::Text => Value::Text(next.to_string()),
                    SqlType::Integer => Value::Int(i32::try_from(next).map_err(|_| {
                        Error::query(QueryErrorKind::Database, "key space exhausted")
                    })?),
                    _ => Value::BigInt(next),
                };
                row.insert(col.name.clone(), key.clone());
                generated = Some(key);
            } else if !row.contains_key(&col.name) {
                row.insert(col.name.clone(), Value::Null);
            }
        }

        self.check_not_null(&row)?;
        self.check_unique(&row, None)?;

        let id = self.next_row_id;
        self.next_row_id += 1;
        self.rows.insert(id, row);
        Ok(generated)
    }

    pub(crate) fn update(
        &mut self,
        values: &[(String, Value)],
        filter: &KeyFilter,
        lock: Option<LockCheck<'_>>,
    ) -> Result<u64> {
        for (name, _) in values {
            self.check_column(name)?;
        }
        let ids = self.matching(filter, lock)?;

        // Validate every new row before touching any of them.
        let mut updated = Vec::with_capacity(ids.len());
        for id in &ids {
            let Some(current) = self.rows.get(id) else {
                continue;
            };
            let mut row = current.clone();
            for (name, value) in values {
                row.insert(name.clone(), value.clone());
            }
            self.check_not_null(&row)?;
            self.check_unique(&row, Some(ids.as_slice()))?;
            updated.push((*id, row));
        }
        if updated.len() > 1 {
            self.check_unique_among(updated.iter().map(|(_, row)| row))?;
        }

        let count = updated.len() as u64;
        for (id, row) in updated {
            self.rows.insert(id, row);
        }
        Ok(count)
    }

    pub(crate) fn delete(&mut self, filter: &KeyFilter, lock: Option<LockCheck<'_>>) -> Result<u64> {
        let ids = self.matching(filter, lock)?;
        for id in &ids {
            self.rows.remove(id);
        }
        Ok(ids.len() as u64)
    }

    fn matching(&self, filter: &KeyFilter, lock: Option<LockCheck<'_>>) -> Result<Vec<u64>> {
        for (name, _) in filter {
            self.check_column(name)?;
        }
        if let Some(lock) = lock {
            self.check_column(lock.column)?;
        }
        Ok(self
            .rows
            .iter()
            .filter(|(_, row)| {
                filter
                    .iter()
                    .all(|(name, value)| row.get(name).is_some_and(|v| v.sql_eq(value)))
                    && lock.is_none_or(|lock| {
                        row.get(lock.column).is_some_and(|v| v.sql_eq(lock.expected))
                    })
            })
            .map(|(id, _)| *id)
            .collect())
    }

    fn check_column(&self, name: &str) -> Result<()> {
        if self.info.column(name).is_none() {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::NotFound,
                table: Some(self.info.name.clone()),
                column: Some(name.to_string()),
                sqlstate: Some("42703".to_string()),
                message: format!("table '{}' has no column '{name}'", self.info.name),
                source: None,
            }));
        }
        Ok(())
    }

    fn check_not_null(&self, row: &RowData) -> Result<()> {
        for col in &self.info.columns {
            if !col.nullable && row.get(&col.name).is_none_or(Value::is_null) {
                return Err(Error::Query(QueryError {
                    kind: QueryErrorKind::Constraint,
                    table: Some(self.info.name.clone()),
                    column: Some(col.name.clone()),
                    sqlstate: Some("23502".to_string()),
                    message: format!(
                        "null value in column {}.{} violates not-null constraint",
                        self.info.name, col.name
                    ),
                    source: None,
                }));
            }
        }
        Ok(())
    }

    /// Checks `row` against stored rows, skipping the ids in `except`.
    fn check_unique(&self, row: &RowData, except: Option<&[u64]>) -> Result<()> {
        let others = || {
            self.rows
                .iter()
                .filter(move |(id, _)| except.is_none_or(|ids| !ids.contains(*id)))
                .map(|(_, r)| r)
        };

        let pk = self.info.primary_key_names();
        if !pk.is_empty() {
            let key = key_of(row, &pk);
            if others().any(|other| key_of(other, &pk) == key) {
                let column = pk.join(", ");
                return Err(QueryError::unique_violation(&self.info.name, &column).into());
            }
        }

        for col in self.info.unique_columns() {
            let Some(value) = row.get(&col.name).filter(|v| !v.is_null()) else {
                continue;
            };
            if others().any(|other| other.get(&col.name).is_some_and(|v| v.sql_eq(value))) {
                return Err(QueryError::unique_violation(&self.info.name, &col.name).into());
            }
        }
        Ok(())
    }

    /// Checks a batch of rewritten rows against each other.
    fn check_unique_among<'r>(&self, rows: impl Iterator<Item = &'r RowData>) -> Result<()> {
        let rows: Vec<_> = rows.collect();
        let pk = self.info.primary_key_names();
        let mut checks: Vec<(String, Vec<&str>)> = Vec::new();
        if !pk.is_empty() {
            checks.push((pk.join(", "), pk.clone()));
        }
        for col in self.info.unique_columns() {
            checks.push((col.name.clone(), vec![col.name.as_str()]));
        }
        for (label, columns) in checks {
            let mut seen = HashSet::new();
            for row in &rows {
                let key = key_of(row, &columns);
                if key.0.iter().any(Value::is_null) {
                    continue;
                }
                if !seen.insert(key) {
                    return Err(QueryError::unique_violation(&self.info.name, &label).into());
                }
            }
        }
        Ok(())
    }
}

fn key_of(row: &RowData, columns: &[&str]) -> ValueKey {
    ValueKey(
        columns
            .iter()
            .map(|c| row.get(*c).cloned().unwrap_or(Value::Null))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeorm_core::{Schema, SchemaMetadata, TableDef};

    fn table() -> TableData {
        let schema = Schema::builder("main")
            .table(
                TableDef::new("person")
                    .auto_key("id")
                    .unique_column("email", SqlType::Text)
                    .nullable_column("nick", SqlType::Text),
            )
            .build()
            .unwrap();
        TableData::new(schema.table("person").unwrap())
    }

    fn person(email: &str) -> Vec<(String, Value)> {
        vec![("email".to_string(), Value::from(email))]
    }

    #[test]
    fn insert_generates_sequential_keys() {
        let mut t = table();
        assert_eq!(t.insert(&person("a")).unwrap(), Some(Value::BigInt(1)));
        assert_eq!(t.insert(&person("b")).unwrap(), Some(Value::BigInt(2)));
        assert_eq!(t.rows.len(), 2);
        let first = t.scan().next().unwrap();
        assert_eq!(first.get("nick"), Some(&Value::Null));
    }

    #[test]
    fn copies_share_the_key_sequence() {
        let mut live = table();
        let mut copy = live.clone();
        assert_eq!(copy.insert(&person("a")).unwrap(), Some(Value::BigInt(1)));
        assert_eq!(live.insert(&person("b")).unwrap(), Some(Value::BigInt(2)));
        assert_eq!(live.rows.len(), 1);
    }

    #[test]
    fn unique_column_rejects_duplicates() {
        let mut t = table();
        t.insert(&person("a")).unwrap();
        let Err(Error::Query(e)) = t.insert(&person("a")) else {
            panic!("expected unique violation");
        };
        assert!(e.is_unique_violation());
        assert_eq!(e.column.as_deref(), Some("email"));
        assert_eq!(t.rows.len(), 1);
    }

    #[test]
    fn not_null_is_enforced() {
        let mut t = table();
        let err = t.insert(&[]).unwrap_err();
        assert_eq!(err.sqlstate(), Some("23502"));
    }

    #[test]
    fn update_respects_lock_and_uniqueness() {
        let mut t = table();
        t.insert(&person("a")).unwrap();
        t.insert(&person("b")).unwrap();
        let filter = vec![("id".to_string(), Value::BigInt(2))];

        let err = t.update(&person("a"), &filter, None).unwrap_err();
        assert!(matches!(err, Error::Query(ref q) if q.is_unique_violation()));

        let stale = Value::from("x");
        let lock = LockCheck {
            column: "nick",
            expected: &stale,
        };
        assert_eq!(t.update(&person("c"), &filter, Some(lock)).unwrap(), 0);
        assert_eq!(t.update(&person("c"), &filter, None).unwrap(), 1);
        // Rewriting a row with its own unique value is not a conflict.
        assert_eq!(t.update(&person("c"), &filter, None).unwrap(), 1);
    }

    #[test]
    fn delete_by_filter() {
        let mut t = table();
        t.insert(&person("a")).unwrap();
        t.insert(&person("b")).unwrap();
        let filter = vec![("email".to_string(), Value::from("a"))];
        assert_eq!(t.delete(&filter, None).unwrap(), 1);
        assert_eq!(t.delete(&filter, None).unwrap(), 0);
        assert_eq!(t.rows.len(), 1);
    }

    #[test]
    fn unknown_column_is_reported() {
        let mut t = table();
        let err = t
            .insert(&[("shoe_size".to_string(), Value::Int(9))])
            .unwrap_err();
        assert!(matches!(err, Error::Query(ref q) if q.kind == QueryErrorKind::NotFound));
    }
}
