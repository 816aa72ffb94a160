//! nodeorm - node-graph queries and cascading persistence for relational
//! records.
//!
//! nodeorm describes tables, references and many-to-many associations once,
//! as runtime schema metadata, and then works with rows as [`Record`]s:
//!
//! - Composable query paths ([`Node`]) built from the schema, usable in
//!   filters, selections, ordering, grouping and calculations
//! - Relationship selections loaded with one follow-up query per level
//! - Cascading save and delete that keep references, reverse links and link
//!   tables consistent
//! - Conflict detection through unique constraints and optimistic lock
//!   tokens
//! - Pluggable storage through [`RowStore`], with [`MemoryStore`] built in
//!
//! # Quick Start
//!
//! ```ignore
//! use nodeorm::prelude::*;
//!
//! let schema: Arc<dyn SchemaMetadata> = Arc::new(
//!     Schema::builder("main")
//!         .table(TableDef::new("root_n").auto_key("id").column("name", SqlType::Text))
//!         .table(
//!             TableDef::new("leaf_n")
//!                 .auto_key("id")
//!                 .column("name", SqlType::Text)
//!                 .reference(ReferenceDef::new("root_n", "root_n").nullable().unique()),
//!         )
//!         .build()?,
//! );
//! let session = Session::new(MemoryStore::new(Arc::clone(&schema)), schema);
//!
//! let mut root = session.new_record("root_n");
//! root.set("name", "root");
//! let mut leaf = session.new_record("leaf_n");
//! leaf.set("name", "leaf");
//! leaf.set_link("root_n", Some(root));
//! session.save(&cx, &mut leaf).await;
//!
//! let loaded = session
//!     .query("leaf_n")
//!     .filter(session.node("leaf_n").column("name").eq("leaf"))
//!     .select([session.node("leaf_n").link("root_n").node()])
//!     .get(&cx)
//!     .await;
//! ```
//!
//! # Crates
//!
//! - `nodeorm-core`: values, schema metadata, nodes, records, the store seam
//! - `nodeorm-query`: query building, validation and relationship loading
//! - `nodeorm-session`: cascading save and delete
//! - `nodeorm-memory`: the in-process row store

pub use nodeorm_core::node;
pub use nodeorm_core::{
    ColumnInfo, Cx, Error, InvalidNodeError, KeyFilter, Link, LinkTableInfo, LockCheck,
    ManyManyDef, Node, NodePath, OptimisticLockError, Outcome, QueryError, QueryPlan, Record,
    ReferenceDef, RelationshipInfo, RelationshipKind, Result, Row, RowCursor, RowStore, Schema,
    SchemaBuilder, SchemaMetadata, SortKey, SqlType, TableDef, TableInfo, TransactionOps,
    UniqueValueError, UnloadedFieldPolicy, Value,
};

pub use nodeorm_query::{
    Calculation, CompiledQuery, Query, QueryBuilder, QueryHook, QueryOptions, RecordCursor,
};

pub use nodeorm_session::{
    AssociationOp, Displacement, Session, SessionConfig, WriteOp, Written, next_token,
};

pub use nodeorm_memory::{MemoryCursor, MemoryStore, MemoryTransaction};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        Cx, Error, ManyManyDef, MemoryStore, Node, Outcome, Record, ReferenceDef, RowStore,
        Schema, SchemaMetadata, Session, SessionConfig, SqlType, TableDef, TransactionOps,
        UnloadedFieldPolicy, Value,
    };
    pub use std::sync::Arc;
}
