//! Core types for nodeorm.
//!
//! This crate provides the foundations shared by the query builder, the
//! persistence engine and row-store drivers:
//!
//! - `Value` / `Row` for dynamically typed column data
//! - `SchemaMetadata` and the relationship descriptors it returns
//! - `Node`, the composable query-path graph, and its portable encoding
//! - `QueryPlan`, the compiled form a row store executes
//! - `Record`, a mutable row with dirty tracking and attached links
//! - `RowStore` / `RowCursor`, the storage seam
//! - `Outcome` and `Cx` re-exported from asupersync

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod error;
pub mod node;
pub mod plan;
pub mod record;
pub mod row;
pub mod schema;
pub mod store;
pub mod types;
pub mod value;

pub use error::{
    Error, InvalidNodeError, OptimisticLockError, QueryError, QueryErrorKind, Result,
    UniqueValueError,
};
pub use node::{Node, NodePath, OperationNode, Operator, TableNode};
pub use plan::{Projection, QueryPlan, SortKey};
pub use record::{Link, Record, UnloadedFieldPolicy};
pub use row::Row;
pub use schema::{
    ColumnInfo, LinkTableInfo, ManyManyDef, ReferenceDef, RelationshipInfo, RelationshipKind,
    Schema, SchemaBuilder, SchemaMetadata, TableDef, TableInfo,
};
pub use store::{KeyFilter, LockCheck, RowCursor, RowStore, TransactionOps};
pub use types::SqlType;
pub use value::{Value, ValueKey};

/// Unwrap an `Outcome`, returning early from the enclosing function on
/// anything but `Ok`.
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(value) => value,
            $crate::Outcome::Err(e) => return $crate::Outcome::Err(e),
            $crate::Outcome::Cancelled(r) => return $crate::Outcome::Cancelled(r),
            $crate::Outcome::Panicked(p) => return $crate::Outcome::Panicked(p),
        }
    };
}

/// Return `Outcome::Cancelled` from the enclosing function if `cx` was cancelled.
///
/// A bare cancel request carries no reason; it is reported as a user cancel.
#[macro_export]
macro_rules! bail_if_cancelled {
    ($cx:expr) => {
        if $cx.is_cancel_requested() {
            return $crate::Outcome::Cancelled($cx.cancel_reason().unwrap_or_default());
        }
    };
}
