//! Row writes issued by the persistence engine.
//!
//! Every write the engine performs goes through [`WriteOp::execute`], which
//! is where store errors become conflict errors: a unique violation turns
//! into [`UniqueValueError`] and a locked write matching no row into
//! [`OptimisticLockError`].

use nodeorm_core::{
    Cx, Error, LockCheck, OptimisticLockError, Outcome, RowStore, UniqueValueError, Value,
    bail_if_cancelled,
};

/// One row-store write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert {
        table: String,
        values: Vec<(String, Value)>,
    },
    Update {
        table: String,
        values: Vec<(String, Value)>,
        /// Column equality filter, usually the primary key.
        filter: Vec<(String, Value)>,
        /// Lock column and the token the row must still hold.
        lock: Option<(String, Value)>,
    },
    Delete {
        table: String,
        filter: Vec<(String, Value)>,
        lock: Option<(String, Value)>,
    },
}

/// Result of a [`WriteOp`].
#[derive(Debug, Clone, PartialEq)]
pub enum Written {
    /// Row inserted; carries the generated key, if the store made one.
    Inserted(Option<Value>),
    /// Rows changed by an update or delete.
    Rows(u64),
}

impl WriteOp {
    pub fn table(&self) -> &str {
        match self {
            WriteOp::Insert { table, .. }
            | WriteOp::Update { table, .. }
            | WriteOp::Delete { table, .. } => table,
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(
            self,
            WriteOp::Update { lock: Some(_), .. } | WriteOp::Delete { lock: Some(_), .. }
        )
    }

    /// Run the write.
    #[tracing::instrument(level = "trace", skip(self, cx, store), fields(table = %self.table()))]
    pub async fn execute<S: RowStore>(&self, cx: &Cx, store: &S) -> Outcome<Written, Error> {
        bail_if_cancelled!(cx);
        let outcome = match self {
            WriteOp::Insert { table, values } => match store.insert(cx, table, values).await {
                Outcome::Ok(key) => Outcome::Ok(Written::Inserted(key)),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            },
            WriteOp::Update {
                table,
                values,
                filter,
                lock,
            } => {
                let check = lock.as_ref().map(|(column, expected)| LockCheck {
                    column,
                    expected,
                });
                match store.update(cx, table, values, filter, check).await {
                    Outcome::Ok(n) => Outcome::Ok(Written::Rows(n)),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            }
            WriteOp::Delete {
                table,
                filter,
                lock,
            } => {
                let check = lock.as_ref().map(|(column, expected)| LockCheck {
                    column,
                    expected,
                });
                match store.delete(cx, table, filter, check).await {
                    Outcome::Ok(n) => Outcome::Ok(Written::Rows(n)),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            }
        };
        match outcome {
            Outcome::Ok(Written::Rows(0)) if self.is_locked() => {
                Outcome::Err(Error::OptimisticLock(OptimisticLockError {
                    table: self.table().to_string(),
                    key: self.key_display(),
                }))
            }
            Outcome::Err(e) => Outcome::Err(conflict(e)),
            other => other,
        }
    }

    fn key_display(&self) -> String {
        let filter = match self {
            WriteOp::Insert { .. } => return String::new(),
            WriteOp::Update { filter, .. } | WriteOp::Delete { filter, .. } => filter,
        };
        filter
            .iter()
            .map(|(c, v)| format!("{c}={v}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// One change to a many-to-many link table.
#[derive(Debug, Clone, PartialEq)]
pub enum AssociationOp {
    /// Insert a pair.
    Link {
        table: String,
        local_column: String,
        local_value: Value,
        remote_column: String,
        remote_value: Value,
    },
    /// Remove a pair.
    Unlink {
        table: String,
        local_column: String,
        local_value: Value,
        remote_column: String,
        remote_value: Value,
    },
    /// Remove every pair of one owner.
    Clear {
        table: String,
        column: String,
        value: Value,
    },
}

impl AssociationOp {
    /// The row write this change amounts to.
    pub fn to_write(&self) -> WriteOp {
        match self {
            AssociationOp::Link {
                table,
                local_column,
                local_value,
                remote_column,
                remote_value,
            } => WriteOp::Insert {
                table: table.clone(),
                values: vec![
                    (local_column.clone(), local_value.clone()),
                    (remote_column.clone(), remote_value.clone()),
                ],
            },
            AssociationOp::Unlink {
                table,
                local_column,
                local_value,
                remote_column,
                remote_value,
            } => WriteOp::Delete {
                table: table.clone(),
                filter: vec![
                    (local_column.clone(), local_value.clone()),
                    (remote_column.clone(), remote_value.clone()),
                ],
                lock: None,
            },
            AssociationOp::Clear {
                table,
                column,
                value,
            } => WriteOp::Delete {
                table: table.clone(),
                filter: vec![(column.clone(), value.clone())],
                lock: None,
            },
        }
    }

    /// Run the change; returns the number of link rows written or removed.
    #[tracing::instrument(level = "debug", skip(cx, store))]
    pub async fn execute<S: RowStore>(&self, cx: &Cx, store: &S) -> Outcome<u64, Error> {
        match self.to_write().execute(cx, store).await {
            Outcome::Ok(Written::Inserted(_)) => Outcome::Ok(1),
            Outcome::Ok(Written::Rows(n)) => Outcome::Ok(n),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }
}

/// Turn a store-level unique violation into the caller-facing conflict.
pub(crate) fn conflict(err: Error) -> Error {
    match err {
        Error::Query(q) if q.is_unique_violation() => Error::UniqueValue(UniqueValueError {
            table: q.table.unwrap_or_default(),
            field: q.column.unwrap_or_default(),
        }),
        other => other,
    }
}
