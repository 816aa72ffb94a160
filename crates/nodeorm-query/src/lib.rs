//! Node-graph queries for nodeorm.
//!
//! `nodeorm-query` turns clause lists over [`Node`](nodeorm_core::Node)s into
//! store-ready [`QueryPlan`](nodeorm_core::QueryPlan)s and hydrates the
//! resulting rows into [`Record`](nodeorm_core::Record)s.
//!
//! # Role In The Architecture
//!
//! - **Clauses**: [`Query`] accumulates filter, selection, ordering,
//!   grouping, calculations and windowing. It is serializable.
//! - **Validation**: [`Query::compile`] checks every node against the schema
//!   and the query shape, returning [`InvalidNodeError`](nodeorm_core::InvalidNodeError)
//!   on misuse.
//! - **Relationship loading**: selected relationships are fetched with one
//!   follow-up plan per level and attached to the parents' link slots.
//! - **Execution**: [`QueryBuilder`] runs queries against any
//!   [`RowStore`](nodeorm_core::RowStore), eagerly or through a
//!   [`RecordCursor`].
//!
//! Most users reach these types through `Session::query` in the `nodeorm`
//! facade crate.

pub mod builder;
pub mod compile;
pub mod cursor;
pub mod hook;
pub mod hydrate;
pub mod query;

pub use builder::QueryBuilder;
pub use compile::{CompiledQuery, LinkLoad, QueryOptions};
pub use cursor::RecordCursor;
pub use hook::QueryHook;
pub use hydrate::{load_links, load_relationship};
pub use query::{Calculation, Query};
