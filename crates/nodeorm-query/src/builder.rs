//! Query builder bound to a row store.

use crate::compile::{CompiledQuery, QueryOptions};
use crate::cursor::RecordCursor;
use crate::hook::QueryHook;
use crate::hydrate::load_links;
use crate::query::Query;
use nodeorm_core::{
    Cx, Error, InvalidNodeError, Node, Outcome, Record, RowStore, SchemaMetadata, SortKey,
    bail_if_cancelled, try_outcome,
};
use std::fmt;
use std::sync::Arc;

/// Accumulates clauses for one table and runs them against a store.
///
/// Clause methods consume and return the builder. Terminal operations
/// validate the query first; an invalid query is a programming error and
/// panics with the [`InvalidNodeError`] reason. Use
/// [`compile`](QueryBuilder::compile) to validate without panicking.
pub struct QueryBuilder<'a, S: RowStore> {
    store: &'a S,
    schema: &'a dyn SchemaMetadata,
    options: QueryOptions,
    query: Query,
}

impl<'a, S: RowStore> QueryBuilder<'a, S> {
    pub fn new(
        store: &'a S,
        schema: &'a dyn SchemaMetadata,
        table: &str,
        options: QueryOptions,
    ) -> Self {
        Self::from_query(store, schema, Query::new(schema.db_key(), table), options)
    }

    /// Wrap an existing query, e.g. one decoded from another process.
    pub fn from_query(
        store: &'a S,
        schema: &'a dyn SchemaMetadata,
        query: Query,
        options: QueryOptions,
    ) -> Self {
        Self {
            store,
            schema,
            options,
            query,
        }
    }

    /// Let `hook` rewrite the query as built so far.
    #[must_use]
    pub fn intercept(mut self, hook: &dyn QueryHook) -> Self {
        self.query = hook.intercept(self.query);
        self
    }

    #[must_use]
    pub fn filter(mut self, condition: impl Into<Node>) -> Self {
        self.query = self.query.filter(condition);
        self
    }

    #[must_use]
    pub fn select<I, N>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<Node>,
    {
        self.query = self.query.select(nodes);
        self
    }

    #[must_use]
    pub fn order_by(mut self, key: SortKey) -> Self {
        self.query = self.query.order_by(key);
        self
    }

    #[must_use]
    pub fn group_by<I, N>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<Node>,
    {
        self.query = self.query.group_by(nodes);
        self
    }

    #[must_use]
    pub fn calculation(
        mut self,
        parent: impl Into<Node>,
        alias: impl Into<String>,
        node: impl Into<Node>,
    ) -> Self {
        self.query = self.query.calculation(parent, alias, node);
        self
    }

    #[must_use]
    pub fn having(mut self, condition: impl Into<Node>) -> Self {
        self.query = self.query.having(condition);
        self
    }

    #[must_use]
    pub fn limit(mut self, offset: u64, count: u64) -> Self {
        self.query = self.query.limit(offset, count);
        self
    }

    #[must_use]
    pub fn distinct(mut self) -> Self {
        self.query = self.query.distinct();
        self
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn into_query(self) -> Query {
        self.query
    }

    /// Validate and compile without running anything.
    pub fn compile(&self) -> Result<CompiledQuery, InvalidNodeError> {
        self.query.compile(self.schema, self.options)
    }

    fn compiled(&self) -> CompiledQuery {
        match self.compile() {
            Ok(compiled) => compiled,
            Err(err) => panic!("{err}"),
        }
    }

    /// Run the query and return every matching record with its selected
    /// relationships attached.
    ///
    /// # Panics
    ///
    /// Panics if the query does not fit the schema.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(table = %self.query.table))]
    pub async fn load(self, cx: &Cx) -> Outcome<Vec<Record>, Error> {
        let compiled = self.compiled();
        bail_if_cancelled!(cx);
        let rows = try_outcome!(self.store.select(cx, &compiled.plan).await);
        tracing::debug!(rows = rows.len(), links = compiled.links.len(), "query loaded");

        let mut records: Vec<Record> = rows
            .iter()
            .map(|row| {
                Record::from_row(
                    Arc::clone(&compiled.table),
                    row,
                    self.options.unloaded_fields,
                )
            })
            .collect();
        try_outcome!(
            load_links(
                cx,
                self.store,
                self.options.unloaded_fields,
                &mut records,
                &compiled.links,
            )
            .await
        );
        Outcome::Ok(records)
    }

    /// First matching record, if any. Keeps the query's offset.
    ///
    /// # Panics
    ///
    /// Panics if the query does not fit the schema.
    pub async fn get(mut self, cx: &Cx) -> Outcome<Option<Record>, Error> {
        self.query.limit = Some(1);
        let records = try_outcome!(self.load(cx).await);
        Outcome::Ok(records.into_iter().next())
    }

    /// Number of rows (or groups) the query matches, ignoring its limit.
    ///
    /// # Panics
    ///
    /// Panics if the query does not fit the schema.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(table = %self.query.table))]
    pub async fn count(self, cx: &Cx) -> Outcome<u64, Error> {
        let compiled = self.compiled();
        bail_if_cancelled!(cx);
        self.store.count(cx, &compiled.plan).await
    }

    /// Open a cursor over the matching records.
    ///
    /// # Panics
    ///
    /// Panics if the query does not fit the schema.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(table = %self.query.table))]
    pub async fn load_cursor(self, cx: &Cx) -> Outcome<RecordCursor<'a, S>, Error> {
        let compiled = self.compiled();
        bail_if_cancelled!(cx);
        let rows = try_outcome!(self.store.select_cursor(cx, &compiled.plan).await);
        Outcome::Ok(RecordCursor::new(
            rows,
            self.store,
            compiled.table,
            compiled.links,
            self.options.unloaded_fields,
        ))
    }
}

impl<S: RowStore> fmt::Debug for QueryBuilder<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryBuilder")
            .field("query", &self.query)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
