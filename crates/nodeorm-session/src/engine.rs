//! Shared state and row-level steps of the persistence engine.

use crate::lock::next_token;
use crate::write::{WriteOp, Written};
use nodeorm_core::{
    Cx, Error, Node, Outcome, QueryPlan, Record, RowStore, SchemaMetadata, TableInfo,
    UnloadedFieldPolicy, Value, try_outcome,
};
use std::pin::Pin;
use std::sync::Arc;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Borrowed view of a session used while one save or delete runs.
pub(crate) struct Engine<'a, S: RowStore> {
    pub(crate) store: &'a S,
    pub(crate) schema: &'a dyn SchemaMetadata,
    pub(crate) policy: UnloadedFieldPolicy,
}

impl<'a, S: RowStore> Engine<'a, S> {
    pub(crate) fn table(&self, name: &str) -> Arc<TableInfo> {
        match self.schema.table(name) {
            Some(info) => info,
            None => panic!("unknown table '{name}'"),
        }
    }

    /// Every row of `table` whose columns equal `filter`, as records.
    pub(crate) async fn fetch_where(
        &self,
        cx: &Cx,
        table: &Arc<TableInfo>,
        filter: &[(String, Value)],
    ) -> Outcome<Vec<Record>, Error> {
        let mut plan = QueryPlan::all_columns(table);
        let root = plan.root();
        plan.filter = filter
            .iter()
            .map(|(column, value)| root.column_of(column.clone()).eq(value.clone()))
            .reduce(Node::and);
        let rows = try_outcome!(self.store.select(cx, &plan).await);
        Outcome::Ok(
            rows.iter()
                .map(|row| Record::from_row(Arc::clone(table), row, self.policy))
                .collect(),
        )
    }

    /// Insert or update the record's own row.
    pub(crate) async fn write_row(&self, cx: &Cx, record: &mut Record) -> Outcome<(), Error> {
        if record.is_new() {
            self.insert_row(cx, record).await
        } else {
            self.update_row(cx, record).await
        }
    }

    async fn insert_row(&self, cx: &Cx, record: &mut Record) -> Outcome<(), Error> {
        let table = Arc::clone(record.table());
        let mut values = Vec::with_capacity(table.columns.len());
        for (name, value) in record.loaded_values() {
            let Some(info) = table.column(&name) else {
                continue;
            };
            if info.auto_generated && value.is_null() {
                continue;
            }
            if info.primary_key
                && !info.auto_generated
                && (value.is_null() || !record.dirty_columns().any(|c| c == name))
            {
                panic!(
                    "primary key '{}.{name}' must be set before the first save",
                    table.name
                );
            }
            if table.lock_column.as_deref() == Some(name.as_str()) {
                continue;
            }
            values.push((name, value));
        }
        let token = table.lock_column.as_ref().map(|column| {
            let token = next_token();
            values.push((column.clone(), token.clone()));
            (column.clone(), token)
        });

        let op = WriteOp::Insert {
            table: table.name.clone(),
            values,
        };
        let written = try_outcome!(op.execute(cx, self.store).await);
        if let (Written::Inserted(Some(key)), Some(auto)) = (written, table.auto_key()) {
            record.assign(&auto.name, key);
        }
        if let Some((column, token)) = token {
            record.assign(&column, token);
        }
        record.mark_persisted();
        tracing::debug!(table = %table.name, key = %record.key_display(), "inserted");
        Outcome::Ok(())
    }

    async fn update_row(&self, cx: &Cx, record: &mut Record) -> Outcome<(), Error> {
        let table = Arc::clone(record.table());
        let mut values = record.dirty_values();
        if values.is_empty() {
            tracing::trace!(table = %table.name, "nothing to update");
            return Outcome::Ok(());
        }
        let filter = match record.require_key() {
            Ok(filter) => filter,
            Err(e) => return Outcome::Err(e),
        };
        let lock = table.lock_column.as_ref().map(|column| {
            let expected = record.original(column).cloned().unwrap_or(Value::Null);
            let token = next_token();
            values.retain(|(c, _)| c != column);
            values.push((column.clone(), token.clone()));
            (column.clone(), expected, token)
        });

        let op = WriteOp::Update {
            table: table.name.clone(),
            values,
            filter,
            lock: lock
                .as_ref()
                .map(|(column, expected, _)| (column.clone(), expected.clone())),
        };
        let written = try_outcome!(op.execute(cx, self.store).await);
        if written == Written::Rows(0) {
            tracing::warn!(
                table = %table.name,
                key = %record.key_display(),
                "update matched no row"
            );
        }
        if let Some((column, _, token)) = lock {
            record.assign(&column, token);
        }
        record.mark_persisted();
        tracing::debug!(table = %table.name, key = %record.key_display(), "updated");
        Outcome::Ok(())
    }
}
