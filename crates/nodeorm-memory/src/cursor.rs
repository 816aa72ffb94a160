use nodeorm_core::{Cx, Error, Outcome, Row, RowCursor, bail_if_cancelled};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Forward-only cursor over a materialized result set.
///
/// The store counts open cursors; the count drops when the cursor is
/// dropped, exhausted or not.
#[derive(Debug)]
pub struct MemoryCursor {
    rows: std::vec::IntoIter<Row>,
    open: Arc<AtomicUsize>,
}

impl MemoryCursor {
    pub(crate) fn new(rows: Vec<Row>, open: Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self {
            rows: rows.into_iter(),
            open,
        }
    }

    /// Rows not yet returned.
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }

    fn advance(&mut self, cx: &Cx) -> Outcome<Option<Row>, Error> {
        bail_if_cancelled!(cx);
        Outcome::Ok(self.rows.next())
    }
}

impl RowCursor for MemoryCursor {
    fn next_row(&mut self, cx: &Cx) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let next = self.advance(cx);
        async move { next }
    }
}

impl Drop for MemoryCursor {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(unread = self.rows.len(), "cursor released");
    }
}
