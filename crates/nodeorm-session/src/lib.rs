//! Persistence engine for nodeorm.
//!
//! `nodeorm-session` writes [`Record`]s back to a [`RowStore`] and keeps
//! related rows consistent while doing so.
//!
//! # Role In The Architecture
//!
//! - **Save**: inserts new records, updates dirty ones, and cascades into
//!   attached references, children and associations.
//! - **Delete**: removes a row after checking its lock token, deleting or
//!   detaching the children that depend on it.
//! - **Resolver**: decides what happens to a child that loses its parent
//!   (see [`Displacement`]).
//! - **Conflicts**: unique violations and stale lock tokens come back as
//!   [`Error::UniqueValue`] and [`Error::OptimisticLock`]; misuse of the API
//!   panics.
//!
//! # Transactions
//!
//! With [`SessionConfig::transactional_cascade`] set (the default) and a
//! store that supports transactions, every top-level save or delete runs in
//! its own transaction, opened with [`RowStore::begin`] and owned by that
//! call alone. Sessions sharing a store do not see or undo each other's
//! open cascades. On failure, including a rejected commit, the transaction
//! is discarded and the record is restored to its state before the call.
//! Without transactions a cascade that fails halfway leaves the rows it
//! already wrote.
//!
//! # Example
//!
//! ```ignore
//! let session = Session::new(store, schema);
//! let mut leaf = session.new_record("leaf_n");
//! leaf.set("name", "leaf");
//! let mut root = session.new_record("root_n");
//! root.set("name", "root");
//! leaf.set_link("root_n", Some(root));
//! session.save(&cx, &mut leaf).await?;
//! ```

mod delete;
mod engine;
pub mod lock;
pub mod resolver;
mod save;
pub mod write;

pub use lock::next_token;
pub use resolver::Displacement;
pub use write::{AssociationOp, WriteOp, Written};

use engine::Engine;
use nodeorm_core::{
    Cx, Error, NodePath, Outcome, Record, RowStore, SchemaMetadata, TransactionOps,
    UnloadedFieldPolicy, try_outcome,
};
use nodeorm_query::{QueryBuilder, QueryHook, QueryOptions, load_relationship};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Run each top-level save and delete in a store transaction, when the
    /// store supports them.
    pub transactional_cascade: bool,
    /// What reading a column the query did not select does.
    pub unloaded_fields: UnloadedFieldPolicy,
    /// Queries with an explicit selection also fetch key and lock columns.
    pub auto_select_keys: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transactional_cascade: true,
            unloaded_fields: UnloadedFieldPolicy::Error,
            auto_select_keys: true,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn transactional_cascade(mut self, value: bool) -> Self {
        self.transactional_cascade = value;
        self
    }

    #[must_use]
    pub fn unloaded_fields(mut self, policy: UnloadedFieldPolicy) -> Self {
        self.unloaded_fields = policy;
        self
    }

    #[must_use]
    pub fn auto_select_keys(mut self, value: bool) -> Self {
        self.auto_select_keys = value;
        self
    }

    fn query_options(self) -> QueryOptions {
        QueryOptions {
            auto_select_keys: self.auto_select_keys,
            unloaded_fields: self.unloaded_fields,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Entry point for querying and persisting records of one schema.
///
/// A session holds no per-record state between calls; any number of
/// sessions may share one store.
pub struct Session<S: RowStore> {
    store: S,
    schema: Arc<dyn SchemaMetadata>,
    config: SessionConfig,
    hook: Option<Arc<dyn QueryHook>>,
}

impl<S: RowStore> fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("db_key", &self.schema.db_key())
            .field("config", &self.config)
            .field("hook", &self.hook.is_some())
            .finish_non_exhaustive()
    }
}

impl<S: RowStore> Session<S> {
    pub fn new(store: S, schema: Arc<dyn SchemaMetadata>) -> Self {
        Self::with_config(store, schema, SessionConfig::default())
    }

    pub fn with_config(store: S, schema: Arc<dyn SchemaMetadata>, config: SessionConfig) -> Self {
        Self {
            store,
            schema,
            config,
            hook: None,
        }
    }

    /// Route every query built by this session through `hook` first.
    #[must_use]
    pub fn with_query_hook(mut self, hook: impl QueryHook + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn schema(&self) -> &Arc<dyn SchemaMetadata> {
        &self.schema
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Path builder rooted at `table`.
    pub fn node(&self, table: &str) -> NodePath<'_> {
        self.schema.node(table)
    }

    /// A new, unsaved record of `table`.
    ///
    /// Panics if the schema has no such table.
    pub fn new_record(&self, table: &str) -> Record {
        match self.schema.table(table) {
            Some(info) => Record::new(info),
            None => panic!("unknown table '{table}'"),
        }
    }

    /// Start a query over `table`, with the session hook already applied.
    pub fn query(&self, table: &str) -> QueryBuilder<'_, S> {
        let builder = QueryBuilder::new(
            &self.store,
            self.schema.as_ref(),
            table,
            self.config.query_options(),
        );
        match &self.hook {
            Some(hook) => builder.intercept(hook.as_ref()),
            None => builder,
        }
    }

    /// Load relationship `name` into `record`, replacing what it held.
    pub async fn load_link(&self, cx: &Cx, record: &mut Record, name: &str) -> Outcome<(), Error> {
        load_relationship(
            cx,
            &self.store,
            self.schema.as_ref(),
            self.config.unloaded_fields,
            record,
            name,
        )
        .await
    }

    /// Insert or update `record` and everything attached to it.
    #[tracing::instrument(level = "debug", skip(self, cx, record), fields(table = %record.table_name()))]
    pub async fn save(&self, cx: &Cx, record: &mut Record) -> Outcome<(), Error> {
        if !self.transactional() {
            return self.engine(&self.store).save(cx, record, None).await;
        }
        let snapshot = record.clone();
        let tx = try_outcome!(self.store.begin(cx).await);
        let outcome = self.engine(&tx).save(cx, record, None).await;
        finish(cx, tx, outcome, record, snapshot).await
    }

    /// Delete `record`, cascading into the rows that depend on it.
    #[tracing::instrument(level = "debug", skip(self, cx, record), fields(table = %record.table_name()))]
    pub async fn delete(&self, cx: &Cx, record: &mut Record) -> Outcome<(), Error> {
        if !self.transactional() {
            return self.engine(&self.store).delete(cx, record).await;
        }
        let snapshot = record.clone();
        let tx = try_outcome!(self.store.begin(cx).await);
        let outcome = self.engine(&tx).delete(cx, record).await;
        finish(cx, tx, outcome, record, snapshot).await
    }

    /// Engine writing through `store`: the session's own store, or a
    /// transaction opened on it.
    fn engine<'e, T: RowStore>(&'e self, store: &'e T) -> Engine<'e, T> {
        Engine {
            store,
            schema: self.schema.as_ref(),
            policy: self.config.unloaded_fields,
        }
    }

    fn transactional(&self) -> bool {
        self.config.transactional_cascade && self.store.supports_transactions()
    }
}

/// Commit on success; otherwise roll back and restore `record`.
async fn finish<T: TransactionOps>(
    cx: &Cx,
    tx: T,
    outcome: Outcome<(), Error>,
    record: &mut Record,
    snapshot: Record,
) -> Outcome<(), Error> {
    if let Outcome::Ok(()) = outcome {
        return match tx.commit(cx).await {
            Outcome::Ok(()) => Outcome::Ok(()),
            Outcome::Err(e) => {
                *record = snapshot;
                Outcome::Err(write::conflict(e))
            }
            other => {
                *record = snapshot;
                other
            }
        };
    }
    *record = snapshot;
    if let Outcome::Err(e) = tx.rollback(cx).await {
        tracing::warn!(error = %e, "rollback failed");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use nodeorm_core::{ReferenceDef, Schema, SqlType, TableDef, Value};
    use nodeorm_memory::MemoryStore;

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn schema() -> Arc<dyn SchemaMetadata> {
        Arc::new(
            Schema::builder("main")
                .table(
                    TableDef::new("author")
                        .auto_key("id")
                        .column("name", SqlType::Text)
                        .locked("version"),
                )
                .table(
                    TableDef::new("book")
                        .auto_key("id")
                        .column("title", SqlType::Text)
                        .reference(ReferenceDef::new("author", "author").reverse("books")),
                )
                .table(
                    TableDef::new("review")
                        .auto_key("id")
                        .column("stars", SqlType::Integer)
                        .reference(
                            ReferenceDef::new("book", "book")
                                .nullable()
                                .reverse("reviews"),
                        ),
                )
                .build()
                .unwrap(),
        )
    }

    fn session(config: SessionConfig) -> Session<MemoryStore> {
        let schema = schema();
        Session::with_config(MemoryStore::new(Arc::clone(&schema)), schema, config)
    }

    fn book(session: &Session<MemoryStore>, title: &str) -> Record {
        let mut book = session.new_record("book");
        book.set("title", title);
        book
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert!(config.transactional_cascade);
        assert!(config.auto_select_keys);
        assert_eq!(config.unloaded_fields, UnloadedFieldPolicy::Error);

        let config = SessionConfig::new()
            .transactional_cascade(false)
            .unloaded_fields(UnloadedFieldPolicy::ZeroValue);
        assert!(!config.transactional_cascade);
        assert_eq!(config.unloaded_fields, UnloadedFieldPolicy::ZeroValue);
    }

    #[test]
    fn save_cascades_and_assigns_keys() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let session = session(SessionConfig::default());

        rt.block_on(async {
            let mut author = session.new_record("author");
            author.set("name", "Le Guin");
            author.set_links("books", vec![book(&session, "Earthsea"), book(&session, "Lathe")]);
            unwrap_outcome(session.save(&cx, &mut author).await);

            let author_id = author.primary_key().unwrap();
            assert!(!author.has_changes());
            assert!(author.lock_token().is_some());
            for child in author.links("books") {
                assert!(!child.is_new());
                assert_eq!(child.get("author_id").unwrap(), author_id);
            }
            assert_eq!(session.store().row_count("book"), 2);
            assert_eq!(session.store().open_transactions(), 0);
        });
    }

    #[test]
    fn failed_cascade_rolls_back_store_and_record() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let session = session(SessionConfig::default());

        rt.block_on(async {
            let mut author = session.new_record("author");
            author.set("name", "Le Guin");
            author.set_links("books", vec![book(&session, "Earthsea"), book(&session, "Lathe")]);

            // Author and first book go through; the second book fails.
            session.store().fail_after(2);
            match session.save(&cx, &mut author).await {
                Outcome::Err(Error::Query(_)) => {}
                other => panic!("expected injected failure, got {other:?}"),
            }
            assert_eq!(session.store().row_count("author"), 0);
            assert_eq!(session.store().row_count("book"), 0);
            assert_eq!(session.store().open_transactions(), 0);
            assert!(author.is_new());
            assert!(author.links("books").iter().all(Record::is_new));

            unwrap_outcome(session.save(&cx, &mut author).await);
            assert_eq!(session.store().row_count("book"), 2);
        });
    }

    #[test]
    fn without_transactions_partial_writes_remain() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let session = session(SessionConfig::new().transactional_cascade(false));

        rt.block_on(async {
            let mut author = session.new_record("author");
            author.set("name", "Le Guin");
            author.set_links("books", vec![book(&session, "Earthsea"), book(&session, "Lathe")]);

            session.store().fail_after(2);
            assert!(matches!(
                session.save(&cx, &mut author).await,
                Outcome::Err(Error::Query(_))
            ));
            assert_eq!(session.store().row_count("author"), 1);
            assert_eq!(session.store().row_count("book"), 1);
            assert!(!author.is_new());
        });
    }

    #[test]
    fn delete_removes_required_children_and_detaches_optional_ones() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let session = session(SessionConfig::default());

        rt.block_on(async {
            let mut author = session.new_record("author");
            author.set("name", "Le Guin");
            let mut earthsea = book(&session, "Earthsea");
            let mut review = session.new_record("review");
            review.set("stars", 5);
            earthsea.set_links("reviews", vec![review]);
            author.set_links("books", vec![earthsea]);
            unwrap_outcome(session.save(&cx, &mut author).await);
            assert_eq!(session.store().row_count("review"), 1);

            unwrap_outcome(session.delete(&cx, &mut author).await);
            assert!(author.is_new());
            assert_eq!(session.store().row_count("author"), 0);
            assert_eq!(session.store().row_count("book"), 0);

            let reviews = unwrap_outcome(session.query("review").load(&cx).await);
            assert_eq!(reviews.len(), 1);
            assert_eq!(reviews[0].get("book_id").unwrap(), Value::Null);
        });
    }

    #[test]
    fn explicit_link_loading() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let session = session(SessionConfig::default());

        rt.block_on(async {
            let mut author = session.new_record("author");
            author.set("name", "Le Guin");
            author.set_links("books", vec![book(&session, "Earthsea")]);
            unwrap_outcome(session.save(&cx, &mut author).await);

            let mut loaded = unwrap_outcome(session.query("author").get(&cx).await).unwrap();
            assert!(!loaded.is_link_loaded("books"));
            unwrap_outcome(session.load_link(&cx, &mut loaded, "books").await);
            assert_eq!(loaded.links("books").len(), 1);
            assert_eq!(
                loaded.links("books")[0].get("title").unwrap(),
                Value::Text("Earthsea".to_string())
            );
        });
    }

    #[test]
    fn query_hook_is_applied() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let schema = schema();
        let store = MemoryStore::new(Arc::clone(&schema));
        let plain = Session::new(store.clone(), Arc::clone(&schema));
        let title = schema.node("book").column("title");
        let hooked = Session::new(store, Arc::clone(&schema))
            .with_query_hook(move |q: nodeorm_query::Query| q.filter(title.clone().ne("Lathe")));

        rt.block_on(async {
            let mut author = plain.new_record("author");
            author.set("name", "Le Guin");
            author.set_links("books", vec![book(&plain, "Earthsea"), book(&plain, "Lathe")]);
            unwrap_outcome(plain.save(&cx, &mut author).await);

            assert_eq!(unwrap_outcome(plain.query("book").count(&cx).await), 2);
            assert_eq!(unwrap_outcome(hooked.query("book").count(&cx).await), 1);
        });
    }
}
