//! Row-store interface.
//!
//! The engine never builds SQL; it hands table names, column/value lists
//! and compiled [`QueryPlan`]s to a [`RowStore`]. Drivers translate these to
//! their own dialect. All operations take a `Cx` so a cancelled or expired
//! context aborts the call, and report through asupersync's `Outcome`.
//!
//! Conflicts must be reported in a recognizable form: a unique-constraint
//! violation as an [`Error::Query`](crate::Error::Query) whose
//! [`QueryError::is_unique_violation`](crate::error::QueryError::is_unique_violation)
//! is true and whose `column` names the offending column.

use crate::error::Error;
use crate::plan::QueryPlan;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};

/// Column equality filter: every listed column must equal its value.
pub type KeyFilter = [(String, Value)];

/// Optimistic-lock predicate added to an update or delete.
#[derive(Debug, Clone, Copy)]
pub struct LockCheck<'a> {
    pub column: &'a str,
    /// Token the row must still hold.
    pub expected: &'a Value,
}

/// A storage backend the engine reads and writes rows through.
///
/// Implementations must be `Send + Sync`; the engine holds no locks of its
/// own, so any concurrency control lives here.
pub trait RowStore: Send + Sync {
    /// Cursor type returned by [`RowStore::select_cursor`].
    type Cursor: RowCursor;

    /// Transaction handle returned by [`RowStore::begin`].
    type Tx<'s>: TransactionOps
    where
        Self: 's;

    /// Insert one row. Returns the generated key when the table's key is
    /// generated by the store.
    fn insert(
        &self,
        cx: &Cx,
        table: &str,
        values: &[(String, Value)],
    ) -> impl Future<Output = Outcome<Option<Value>, Error>> + Send;

    /// Update rows matching `filter` (and `lock`, when given). Returns the
    /// number of rows changed.
    fn update(
        &self,
        cx: &Cx,
        table: &str,
        values: &[(String, Value)],
        filter: &KeyFilter,
        lock: Option<LockCheck<'_>>,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Delete rows matching `filter` (and `lock`, when given). Returns the
    /// number of rows removed.
    fn delete(
        &self,
        cx: &Cx,
        table: &str,
        filter: &KeyFilter,
        lock: Option<LockCheck<'_>>,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Run a plan and return every row.
    fn select(
        &self,
        cx: &Cx,
        plan: &QueryPlan,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Run a plan and return a forward-only cursor over its rows.
    fn select_cursor(
        &self,
        cx: &Cx,
        plan: &QueryPlan,
    ) -> impl Future<Output = Outcome<Self::Cursor, Error>> + Send;

    /// Number of rows the plan yields, ignoring its offset and limit.
    fn count(&self, cx: &Cx, plan: &QueryPlan) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Whether [`begin`](RowStore::begin) opens a real transaction.
    fn supports_transactions(&self) -> bool {
        false
    }

    /// Open a transaction owned by the caller.
    ///
    /// Every write made through the returned handle belongs to that caller
    /// alone: other callers of the same store neither see it before
    /// [`commit`](TransactionOps::commit) nor lose their own writes when it
    /// is rolled back. Dropping the handle without committing discards it.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send;
}

/// A transaction handle returned by [`RowStore::begin`].
///
/// It is itself a [`RowStore`]: reads see the caller's own uncommitted
/// writes. Nested transactions are up to the driver.
pub trait TransactionOps: RowStore {
    /// Make the transaction's writes visible to everyone, or fail without
    /// applying any of them.
    fn commit(self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Discard the transaction's writes. Runs even when `cx` is cancelled.
    fn rollback(self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;
}

/// Forward-only, single-pass row source.
///
/// Dropping a cursor must release whatever it holds (statement, connection
/// slot), whether or not it was exhausted.
pub trait RowCursor: Send {
    /// Next row, or `None` once exhausted.
    fn next_row(&mut self, cx: &Cx) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send;
}
