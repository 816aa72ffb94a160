use crate::compile::LinkLoad;
use crate::hydrate::load_links;
use nodeorm_core::{
    Cx, Error, Outcome, Record, RowCursor, RowStore, TableInfo, UnloadedFieldPolicy, try_outcome,
};
use std::fmt;
use std::sync::Arc;

/// Lazy, forward-only sequence of records.
///
/// Each call to [`next`](RecordCursor::next) pulls one row from the store
/// cursor and loads its selected relationships. Once exhausted the cursor
/// stays exhausted. Dropping it releases the store cursor.
pub struct RecordCursor<'a, S: RowStore> {
    rows: S::Cursor,
    store: &'a S,
    table: Arc<TableInfo>,
    links: Vec<LinkLoad>,
    policy: UnloadedFieldPolicy,
    done: bool,
}

impl<'a, S: RowStore> RecordCursor<'a, S> {
    pub(crate) fn new(
        rows: S::Cursor,
        store: &'a S,
        table: Arc<TableInfo>,
        links: Vec<LinkLoad>,
        policy: UnloadedFieldPolicy,
    ) -> Self {
        Self {
            rows,
            store,
            table,
            links,
            policy,
            done: false,
        }
    }

    /// Next record, or `None` once the result set is exhausted.
    pub async fn next(&mut self, cx: &Cx) -> Outcome<Option<Record>, Error> {
        if self.done {
            return Outcome::Ok(None);
        }
        let next = try_outcome!(self.rows.next_row(cx).await);
        let Some(row) = next else {
            self.done = true;
            return Outcome::Ok(None);
        };
        let mut record = Record::from_row(Arc::clone(&self.table), &row, self.policy);
        try_outcome!(
            load_links(
                cx,
                self.store,
                self.policy,
                std::slice::from_mut(&mut record),
                &self.links,
            )
            .await
        );
        Outcome::Ok(Some(record))
    }
}

impl<S: RowStore> fmt::Debug for RecordCursor<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordCursor")
            .field("table", &self.table.name)
            .field("links", &self.links.len())
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
