//! Cascading delete.

use crate::engine::{BoxFuture, Engine};
use crate::write::{AssociationOp, WriteOp};
use nodeorm_core::{
    Cx, Error, Node, OptimisticLockError, Outcome, QueryPlan, Record, RelationshipKind, RowStore,
    Value, bail_if_cancelled, try_outcome,
};

impl<S: RowStore> Engine<'_, S> {
    pub(crate) fn delete<'b>(
        &'b self,
        cx: &'b Cx,
        record: &'b mut Record,
    ) -> BoxFuture<'b, Outcome<(), Error>> {
        Box::pin(async move {
            bail_if_cancelled!(cx);
            let table = std::sync::Arc::clone(record.table());
            if record.is_new() {
                tracing::warn!(table = %table.name, "delete of an unsaved record ignored");
                return Outcome::Ok(());
            }
            let filter = match record.require_key() {
                Ok(filter) => filter,
                Err(e) => return Outcome::Err(e),
            };

            let lock = table.lock_column.as_ref().map(|column| {
                let token = record.lock_token().cloned().unwrap_or(Value::Null);
                (column.clone(), token)
            });
            if let Some((column, token)) = &lock {
                try_outcome!(self.verify_token(cx, record, column, token).await);
            }

            for rel in &table.relationships {
                let Some(key) = record.present(&rel.local_column).cloned() else {
                    continue;
                };
                match rel.kind {
                    RelationshipKind::Forward => {}
                    RelationshipKind::Reverse => {
                        try_outcome!(self.displace_all(cx, rel, &key, &[]).await);
                    }
                    RelationshipKind::ManyMany => {
                        let Some(link_table) = &rel.link_table else {
                            continue;
                        };
                        let clear = AssociationOp::Clear {
                            table: link_table.table_name.clone(),
                            column: link_table.local_column.clone(),
                            value: key,
                        };
                        try_outcome!(clear.execute(cx, self.store).await);
                    }
                }
            }

            let op = WriteOp::Delete {
                table: table.name.clone(),
                filter,
                lock,
            };
            try_outcome!(op.execute(cx, self.store).await);
            tracing::debug!(table = %table.name, key = %record.key_display(), "deleted");
            record.mark_deleted();
            Outcome::Ok(())
        })
    }

    /// Fail before touching any child when the row no longer holds `token`.
    async fn verify_token(
        &self,
        cx: &Cx,
        record: &Record,
        column: &str,
        token: &Value,
    ) -> Outcome<(), Error> {
        let mut plan = QueryPlan::new(record.table());
        let root = plan.root();
        plan.filter = record
            .key_values()
            .into_iter()
            .map(|(c, v)| root.column_of(c).eq(v))
            .chain(std::iter::once(root.column_of(column).eq(token.clone())))
            .reduce(Node::and);
        let matched = try_outcome!(self.store.count(cx, &plan).await);
        if matched == 0 {
            return Outcome::Err(Error::OptimisticLock(OptimisticLockError {
                table: record.table_name().to_string(),
                key: record.key_display(),
            }));
        }
        Outcome::Ok(())
    }
}
