//! In-process row store for nodeorm.
//!
//! `MemoryStore` keeps every table of a schema in memory and implements
//! [`RowStore`] the way a SQL driver would: generated keys, not-null and
//! unique constraints, lock-token compare-and-swap on update and delete,
//! path-following filters, grouping, ordering and windowing.
//!
//! Clones share the same data, so one store can back several sessions.
//! Each [`begin`](RowStore::begin) hands out a [`MemoryTransaction`] owned
//! by its caller; concurrent transactions never block or undo each other.
//!
//! # Example
//!
//! ```rust,ignore
//! let store = MemoryStore::new(Arc::new(schema));
//! let session = Session::new(store.clone(), schema);
//! ```

mod cursor;
mod eval;
mod table;
mod transaction;

pub use cursor::MemoryCursor;
pub use transaction::MemoryTransaction;

use eval::Evaluator;
use nodeorm_core::{
    Cx, Error, KeyFilter, LockCheck, Outcome, QueryErrorKind, QueryPlan, Result, Row, RowStore,
    SchemaMetadata, Value, bail_if_cancelled,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use table::TableData;

/// Shared in-memory row store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    schema: Arc<dyn SchemaMetadata>,
    state: Mutex<State>,
    open_cursors: Arc<AtomicUsize>,
    open_transactions: AtomicUsize,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, TableData>,
    /// Writes left before an injected failure.
    fail_after: Option<usize>,
}

pub(crate) fn table_mut<'t>(
    tables: &'t mut HashMap<String, TableData>,
    name: &str,
) -> Result<&'t mut TableData> {
    tables
        .get_mut(name)
        .ok_or_else(|| Error::query(QueryErrorKind::NotFound, format!("unknown table '{name}'")))
}

impl State {

    /// Count down an injected failure; `Err` once it fires.
    fn tick_write(&mut self) -> Result<()> {
        match self.fail_after {
            Some(0) => {
                self.fail_after = None;
                Err(Error::query(
                    QueryErrorKind::Database,
                    "injected write failure",
                ))
            }
            Some(n) => {
                self.fail_after = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl MemoryStore {
    /// Create an empty store with one table per schema table.
    pub fn new(schema: Arc<dyn SchemaMetadata>) -> Self {
        let tables = schema
            .table_names()
            .into_iter()
            .filter_map(|name| schema.table(&name).map(|info| (name, TableData::new(info))))
            .collect();
        tracing::debug!(db_key = schema.db_key(), "memory store created");
        Self {
            inner: Arc::new(Inner {
                schema,
                state: Mutex::new(State {
                    tables,
                    ..State::default()
                }),
                open_cursors: Arc::new(AtomicUsize::new(0)),
                open_transactions: AtomicUsize::new(0),
            }),
        }
    }

    pub fn schema(&self) -> &Arc<dyn SchemaMetadata> {
        &self.inner.schema
    }

    /// Make the write after the next `writes` successful ones fail.
    ///
    /// Used to exercise rollback of multi-record saves.
    pub fn fail_after(&self, writes: usize) {
        self.lock().fail_after = Some(writes);
    }

    /// Number of rows currently stored in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Every stored row of `table`, in insertion order, with columns in
    /// schema order.
    pub fn dump(&self, table: &str) -> Vec<Row> {
        let state = self.lock();
        let Some(data) = state.tables.get(table) else {
            return Vec::new();
        };
        let names: Vec<String> = data.info.columns.iter().map(|c| c.name.clone()).collect();
        let columns = Arc::new(nodeorm_core::row::RowColumns::new(names.clone()));
        data.scan()
            .map(|row| {
                let values = names
                    .iter()
                    .map(|n| row.get(n).cloned().unwrap_or(Value::Null))
                    .collect();
                Row::with_columns(Arc::clone(&columns), values)
            })
            .collect()
    }

    /// Cursors opened and not yet dropped.
    pub fn open_cursors(&self) -> usize {
        self.inner.open_cursors.load(Ordering::SeqCst)
    }

    /// Transactions begun and not yet committed, rolled back or dropped.
    pub fn open_transactions(&self) -> usize {
        self.inner.open_transactions.load(Ordering::SeqCst)
    }

    pub(crate) fn tick_write(&self) -> Result<()> {
        self.lock().tick_write()
    }

    pub(crate) fn cursor_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.inner.open_cursors)
    }

    pub(crate) fn transaction_counter(&self) -> &AtomicUsize {
        &self.inner.open_transactions
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `op` against the locked state unless `cx` is cancelled.
    fn run<T>(&self, cx: &Cx, op: impl FnOnce(&mut State) -> Result<T>) -> Outcome<T, Error> {
        bail_if_cancelled!(cx);
        let mut state = self.lock();
        op(&mut state).map_or_else(Outcome::Err, Outcome::Ok)
    }

    fn read<T>(&self, cx: &Cx, op: impl FnOnce(&Evaluator<'_>) -> Result<T>) -> Outcome<T, Error> {
        let schema = Arc::clone(&self.inner.schema);
        self.run(cx, |state| op(&Evaluator::new(&state.tables, schema.as_ref())))
    }
}

impl RowStore for MemoryStore {
    type Cursor = MemoryCursor;
    type Tx<'s> = MemoryTransaction<'s>;

    fn insert(
        &self,
        cx: &Cx,
        table: &str,
        values: &[(String, Value)],
    ) -> impl Future<Output = Outcome<Option<Value>, Error>> + Send {
        tracing::trace!(table, columns = values.len(), "insert");
        let result = self.run(cx, |state| {
            state.tick_write()?;
            table_mut(&mut state.tables, table)?.insert(values)
        });
        async move { result }
    }

    fn update(
        &self,
        cx: &Cx,
        table: &str,
        values: &[(String, Value)],
        filter: &KeyFilter,
        lock: Option<LockCheck<'_>>,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        tracing::trace!(table, columns = values.len(), locked = lock.is_some(), "update");
        let result = self.run(cx, |state| {
            state.tick_write()?;
            table_mut(&mut state.tables, table)?.update(values, filter, lock)
        });
        async move { result }
    }

    fn delete(
        &self,
        cx: &Cx,
        table: &str,
        filter: &KeyFilter,
        lock: Option<LockCheck<'_>>,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        tracing::trace!(table, locked = lock.is_some(), "delete");
        let result = self.run(cx, |state| {
            state.tick_write()?;
            table_mut(&mut state.tables, table)?.delete(filter, lock)
        });
        async move { result }
    }

    fn select(
        &self,
        cx: &Cx,
        plan: &QueryPlan,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        tracing::trace!(table = %plan.table, "select");
        let result = self.read(cx, |eval| eval.select(plan));
        async move { result }
    }

    fn select_cursor(
        &self,
        cx: &Cx,
        plan: &QueryPlan,
    ) -> impl Future<Output = Outcome<MemoryCursor, Error>> + Send {
        tracing::trace!(table = %plan.table, "select cursor");
        let result = match self.read(cx, |eval| eval.select(plan)) {
            Outcome::Ok(rows) => {
                Outcome::Ok(MemoryCursor::new(rows, Arc::clone(&self.inner.open_cursors)))
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        };
        async move { result }
    }

    fn count(&self, cx: &Cx, plan: &QueryPlan) -> impl Future<Output = Outcome<u64, Error>> + Send {
        tracing::trace!(table = %plan.table, "count");
        let result = self.read(cx, |eval| eval.count(plan));
        async move { result }
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    /// Copies the tables as they are now; the copy is the transaction's
    /// private working set.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<MemoryTransaction<'_>, Error>> + Send {
        let result = match self.run(cx, |state| Ok(state.tables.clone())) {
            Outcome::Ok(tables) => {
                tracing::debug!("transaction started");
                Outcome::Ok(MemoryTransaction::new(self, tables))
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        };
        async move { result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use nodeorm_core::{QueryError, RowCursor, Schema, SqlType, TableDef, TransactionOps};

    fn store() -> MemoryStore {
        let schema = Schema::builder("main")
            .table(
                TableDef::new("account")
                    .auto_key("id")
                    .unique_column("email", SqlType::Text)
                    .locked("version"),
            )
            .build()
            .unwrap();
        MemoryStore::new(Arc::new(schema))
    }

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn account(email: &str, version: i64) -> Vec<(String, Value)> {
        vec![
            ("email".to_string(), Value::from(email)),
            ("version".to_string(), Value::BigInt(version)),
        ]
    }

    fn all_rows(store: &MemoryStore) -> QueryPlan {
        let info = store.schema().table("account").unwrap();
        QueryPlan::all_columns(&info)
    }

    #[test]
    fn insert_and_select() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = store();

        rt.block_on(async {
            let key = unwrap_outcome(store.insert(&cx, "account", &account("a@x", 1)).await);
            assert_eq!(key, Some(Value::BigInt(1)));
            let rows = unwrap_outcome(store.select(&cx, &all_rows(&store)).await);
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].get_named::<String>("email").unwrap(), "a@x");
            assert_eq!(unwrap_outcome(store.count(&cx, &all_rows(&store)).await), 1);
        });
    }

    #[test]
    fn duplicate_unique_value_is_a_unique_violation() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = store();

        rt.block_on(async {
            unwrap_outcome(store.insert(&cx, "account", &account("a@x", 1)).await);
            match store.insert(&cx, "account", &account("a@x", 2)).await {
                Outcome::Err(Error::Query(QueryError { column, .. })) => {
                    assert_eq!(column.as_deref(), Some("email"));
                }
                other => panic!("expected unique violation, got {other:?}"),
            }
        });
    }

    #[test]
    fn lock_token_compare_and_swap() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = store();

        rt.block_on(async {
            unwrap_outcome(store.insert(&cx, "account", &account("a@x", 1)).await);
            let filter = vec![("id".to_string(), Value::BigInt(1))];
            let stale = Value::BigInt(0);
            let current = Value::BigInt(1);
            let values = vec![("version".to_string(), Value::BigInt(2))];

            let stale_lock = LockCheck {
                column: "version",
                expected: &stale,
            };
            let changed =
                unwrap_outcome(store.update(&cx, "account", &values, &filter, Some(stale_lock)).await);
            assert_eq!(changed, 0);

            let lock = LockCheck {
                column: "version",
                expected: &current,
            };
            let changed = unwrap_outcome(store.update(&cx, "account", &values, &filter, Some(lock)).await);
            assert_eq!(changed, 1);

            let deleted = unwrap_outcome(store.delete(&cx, "account", &filter, Some(lock)).await);
            assert_eq!(deleted, 0);
            assert_eq!(store.row_count("account"), 1);
        });
    }

    #[test]
    fn transaction_writes_stay_private_until_commit() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = store();

        rt.block_on(async {
            unwrap_outcome(store.insert(&cx, "account", &account("a@x", 1)).await);
            let tx = unwrap_outcome(store.begin(&cx).await);
            assert_eq!(store.open_transactions(), 1);
            let key = unwrap_outcome(tx.insert(&cx, "account", &account("b@x", 1)).await);
            assert_eq!(key, Some(Value::BigInt(2)));
            assert_eq!(unwrap_outcome(tx.count(&cx, &all_rows(&store)).await), 2);
            assert_eq!(store.row_count("account"), 1);

            assert!(matches!(tx.begin(&cx).await, Outcome::Err(Error::Transaction(_))));
            unwrap_outcome(tx.commit(&cx).await);
            assert_eq!(store.row_count("account"), 2);
            assert_eq!(store.open_transactions(), 0);
        });
    }

    #[test]
    fn rollback_keeps_other_callers_writes() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = store();

        rt.block_on(async {
            unwrap_outcome(store.insert(&cx, "account", &account("a@x", 1)).await);
            let tx = unwrap_outcome(store.begin(&cx).await);
            unwrap_outcome(tx.insert(&cx, "account", &account("b@x", 1)).await);
            unwrap_outcome(store.insert(&cx, "account", &account("c@x", 1)).await);
            let other = unwrap_outcome(store.begin(&cx).await);
            unwrap_outcome(other.insert(&cx, "account", &account("d@x", 1)).await);
            unwrap_outcome(other.commit(&cx).await);

            unwrap_outcome(tx.rollback(&cx).await);
            let emails: Vec<String> = store
                .dump("account")
                .iter()
                .map(|row| row.get_named::<String>("email").unwrap())
                .collect();
            assert_eq!(emails, vec!["a@x", "c@x", "d@x"]);
            assert_eq!(store.open_transactions(), 0);
        });
    }

    #[test]
    fn commit_fails_when_a_locked_row_moved() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = store();

        rt.block_on(async {
            unwrap_outcome(store.insert(&cx, "account", &account("a@x", 1)).await);
            let filter = vec![("id".to_string(), Value::BigInt(1))];
            let current = Value::BigInt(1);
            let lock = LockCheck {
                column: "version",
                expected: &current,
            };

            let tx = unwrap_outcome(store.begin(&cx).await);
            let mine = vec![("version".to_string(), Value::BigInt(2))];
            assert_eq!(
                unwrap_outcome(tx.update(&cx, "account", &mine, &filter, Some(lock)).await),
                1
            );
            let theirs = vec![("version".to_string(), Value::BigInt(5))];
            assert_eq!(
                unwrap_outcome(store.update(&cx, "account", &theirs, &filter, Some(lock)).await),
                1
            );

            assert!(matches!(
                tx.commit(&cx).await,
                Outcome::Err(Error::OptimisticLock(_))
            ));
            let rows = store.dump("account");
            assert_eq!(rows[0].get_named::<i64>("version").unwrap(), 5);
        });
    }

    #[test]
    fn second_commit_of_a_unique_value_is_rejected() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = store();

        rt.block_on(async {
            let first = unwrap_outcome(store.begin(&cx).await);
            let second = unwrap_outcome(store.begin(&cx).await);
            unwrap_outcome(first.insert(&cx, "account", &account("a@x", 1)).await);
            unwrap_outcome(second.insert(&cx, "account", &account("a@x", 1)).await);
            unwrap_outcome(first.commit(&cx).await);
            match second.commit(&cx).await {
                Outcome::Err(Error::Query(q)) => assert!(q.is_unique_violation()),
                other => panic!("expected unique violation, got {other:?}"),
            }
            assert_eq!(store.row_count("account"), 1);
        });
    }

    #[test]
    fn unlocked_update_of_a_removed_row_is_a_serialization_failure() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = store();

        rt.block_on(async {
            unwrap_outcome(store.insert(&cx, "account", &account("a@x", 1)).await);
            let filter = vec![("id".to_string(), Value::BigInt(1))];
            let tx = unwrap_outcome(store.begin(&cx).await);
            let values = vec![("email".to_string(), Value::from("b@x"))];
            unwrap_outcome(tx.update(&cx, "account", &values, &filter, None).await);
            unwrap_outcome(store.delete(&cx, "account", &filter, None).await);

            match tx.commit(&cx).await {
                Outcome::Err(err) => {
                    assert!(err.is_retryable());
                    assert_eq!(err.sqlstate(), Some("40001"));
                }
                other => panic!("expected serialization failure, got {other:?}"),
            }
            assert_eq!(store.row_count("account"), 0);
        });
    }

    #[test]
    fn injected_failure_fires_once() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = store();

        rt.block_on(async {
            store.fail_after(1);
            unwrap_outcome(store.insert(&cx, "account", &account("a@x", 1)).await);
            assert!(matches!(
                store.insert(&cx, "account", &account("b@x", 1)).await,
                Outcome::Err(Error::Query(_))
            ));
            unwrap_outcome(store.insert(&cx, "account", &account("c@x", 1)).await);
            assert_eq!(store.row_count("account"), 2);
        });
    }

    #[test]
    fn dropping_a_cursor_releases_it() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = store();

        rt.block_on(async {
            for email in ["a@x", "b@x", "c@x"] {
                unwrap_outcome(store.insert(&cx, "account", &account(email, 1)).await);
            }
            let mut cursor = unwrap_outcome(store.select_cursor(&cx, &all_rows(&store)).await);
            assert_eq!(store.open_cursors(), 1);
            let first = unwrap_outcome(cursor.next_row(&cx).await).unwrap();
            assert_eq!(first.get_named::<String>("email").unwrap(), "a@x");
            drop(cursor);
            assert_eq!(store.open_cursors(), 0);
        });
    }
}
