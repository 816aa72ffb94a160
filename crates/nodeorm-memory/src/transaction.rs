//! Caller-owned transactions.
//!
//! A transaction works on a private copy of the tables taken at `begin`
//! and logs every write it makes there. Commit replays the log against the
//! live tables under the store lock. When a write no longer lands the way
//! it did in the copy (a row another caller changed or removed, a unique
//! value another caller claimed) nothing is applied and the commit fails.
//! Rollback, or dropping the handle, discards the copy; the live tables are
//! never touched.

use crate::cursor::MemoryCursor;
use crate::eval::Evaluator;
use crate::table::TableData;
use crate::{MemoryStore, table_mut};
use nodeorm_core::error::{QueryError, TransactionError, TransactionErrorKind};
use nodeorm_core::{
    Cx, Error, KeyFilter, LockCheck, OptimisticLockError, Outcome, QueryPlan, Result, Row,
    RowStore, TransactionOps, Value, bail_if_cancelled,
};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A transaction over a [`MemoryStore`], returned by `begin`.
#[derive(Debug)]
pub struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    work: Mutex<Work>,
}

#[derive(Debug)]
struct Work {
    tables: HashMap<String, TableData>,
    log: Vec<Logged>,
}

#[derive(Debug)]
enum Logged {
    Insert {
        table: String,
        values: Vec<(String, Value)>,
    },
    Update {
        table: String,
        values: Vec<(String, Value)>,
        filter: Vec<(String, Value)>,
        lock: Option<(String, Value)>,
        rows: u64,
    },
    Delete {
        table: String,
        filter: Vec<(String, Value)>,
        lock: Option<(String, Value)>,
        rows: u64,
    },
}

impl<'a> MemoryTransaction<'a> {
    pub(crate) fn new(store: &'a MemoryStore, tables: HashMap<String, TableData>) -> Self {
        store.transaction_counter().fetch_add(1, Ordering::SeqCst);
        Self {
            store,
            work: Mutex::new(Work {
                tables,
                log: Vec::new(),
            }),
        }
    }

    /// Writes made so far and not yet committed.
    pub fn pending_writes(&self) -> usize {
        self.work().log.len()
    }

    fn work(&self) -> MutexGuard<'_, Work> {
        self.work.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write<T>(&self, cx: &Cx, op: impl FnOnce(&mut Work) -> Result<T>) -> Outcome<T, Error> {
        bail_if_cancelled!(cx);
        if let Err(e) = self.store.tick_write() {
            return Outcome::Err(e);
        }
        op(&mut self.work()).map_or_else(Outcome::Err, Outcome::Ok)
    }

    fn read<T>(&self, cx: &Cx, op: impl FnOnce(&Evaluator<'_>) -> Result<T>) -> Outcome<T, Error> {
        bail_if_cancelled!(cx);
        let work = self.work();
        let schema = self.store.schema();
        op(&Evaluator::new(&work.tables, schema.as_ref())).map_or_else(Outcome::Err, Outcome::Ok)
    }

    fn apply(&self, cx: &Cx) -> Outcome<(), Error> {
        bail_if_cancelled!(cx);
        let work = self.work();
        if work.log.is_empty() {
            return Outcome::Ok(());
        }
        let mut state = self.store.lock();
        let mut tables = state.tables.clone();
        match replay(&work.log, &mut tables) {
            Ok(()) => {
                state.tables = tables;
                tracing::debug!(writes = work.log.len(), "transaction committed");
                Outcome::Ok(())
            }
            Err(e) => {
                tracing::debug!(error = %e, "transaction commit rejected");
                Outcome::Err(e)
            }
        }
    }
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        self.store
            .transaction_counter()
            .fetch_sub(1, Ordering::SeqCst);
    }
}

fn owned_lock(lock: Option<LockCheck<'_>>) -> Option<(String, Value)> {
    lock.map(|l| (l.column.to_string(), l.expected.clone()))
}

fn borrowed_lock(lock: Option<&(String, Value)>) -> Option<LockCheck<'_>> {
    lock.map(|(column, expected)| LockCheck { column, expected })
}

/// Apply `log` to `tables`; any write that lands differently is an error.
fn replay(log: &[Logged], tables: &mut HashMap<String, TableData>) -> Result<()> {
    for entry in log {
        match entry {
            Logged::Insert { table, values } => {
                table_mut(tables, table)?.insert(values)?;
            }
            Logged::Update {
                table,
                values,
                filter,
                lock,
                rows,
            } => {
                let changed =
                    table_mut(tables, table)?.update(values, filter, borrowed_lock(lock.as_ref()))?;
                if changed != *rows {
                    return Err(stale(table, filter, lock.is_some()));
                }
            }
            Logged::Delete {
                table,
                filter,
                lock,
                rows,
            } => {
                let removed = table_mut(tables, table)?.delete(filter, borrowed_lock(lock.as_ref()))?;
                if removed != *rows {
                    return Err(stale(table, filter, lock.is_some()));
                }
            }
        }
    }
    Ok(())
}

fn stale(table: &str, filter: &KeyFilter, locked: bool) -> Error {
    let key = filter
        .iter()
        .map(|(c, v)| format!("{c}={v}"))
        .collect::<Vec<_>>()
        .join(", ");
    if locked {
        return Error::OptimisticLock(OptimisticLockError {
            table: table.to_string(),
            key,
        });
    }
    QueryError::serialization_failure(
        table,
        format!("rows of {table} matching {key} were changed by a concurrent commit"),
    )
    .into()
}

impl<'a> RowStore for MemoryTransaction<'a> {
    type Cursor = MemoryCursor;
    type Tx<'s>
        = MemoryTransaction<'a>
    where
        Self: 's;

    fn insert(
        &self,
        cx: &Cx,
        table: &str,
        values: &[(String, Value)],
    ) -> impl Future<Output = Outcome<Option<Value>, Error>> + Send {
        tracing::trace!(table, columns = values.len(), "insert in transaction");
        let result = self.write(cx, |work| {
            let data = table_mut(&mut work.tables, table)?;
            let key = data.insert(values)?;
            let mut logged = values.to_vec();
            if let (Some(key), Some(col)) = (&key, data.info.auto_key()) {
                logged.retain(|(c, _)| *c != col.name);
                logged.push((col.name.clone(), key.clone()));
            }
            work.log.push(Logged::Insert {
                table: table.to_string(),
                values: logged,
            });
            Ok(key)
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
        tracing::trace!(table, columns = values.len(), locked = lock.is_some(), "update in transaction");
        let result = self.write(cx, |work| {
            let rows = table_mut(&mut work.tables, table)?.update(values, filter, lock)?;
            work.log.push(Logged::Update {
                table: table.to_string(),
                values: values.to_vec(),
                filter: filter.to_vec(),
                lock: owned_lock(lock),
                rows,
            });
            Ok(rows)
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
        tracing::trace!(table, locked = lock.is_some(), "delete in transaction");
        let result = self.write(cx, |work| {
            let rows = table_mut(&mut work.tables, table)?.delete(filter, lock)?;
            work.log.push(Logged::Delete {
                table: table.to_string(),
                filter: filter.to_vec(),
                lock: owned_lock(lock),
                rows,
            });
            Ok(rows)
        });
        async move { result }
    }

    fn select(
        &self,
        cx: &Cx,
        plan: &QueryPlan,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.read(cx, |eval| eval.select(plan));
        async move { result }
    }

    fn select_cursor(
        &self,
        cx: &Cx,
        plan: &QueryPlan,
    ) -> impl Future<Output = Outcome<MemoryCursor, Error>> + Send {
        let result = match self.read(cx, |eval| eval.select(plan)) {
            Outcome::Ok(rows) => Outcome::Ok(MemoryCursor::new(rows, self.store.cursor_counter())),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        };
        async move { result }
    }

    fn count(&self, cx: &Cx, plan: &QueryPlan) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.read(cx, |eval| eval.count(plan));
        async move { result }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<MemoryTransaction<'a>, Error>> + Send {
        async {
            Outcome::Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::NestedNotSupported,
                message: "a transaction is already open on this handle".to_string(),
            }))
        }
    }
}

impl TransactionOps for MemoryTransaction<'_> {
    fn commit(self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.apply(cx);
        async move { result }
    }

    fn rollback(self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        tracing::debug!(writes = self.pending_writes(), "transaction rolled back");
        drop(self);
        async { Outcome::Ok(()) }
    }
}
