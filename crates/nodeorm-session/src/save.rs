//! Cascading save.
//!
//! A save writes the record's referenced targets first (so their keys can be
//! copied into foreign keys), then the record's own row, then its reverse
//! children and many-to-many associations. `via` names the relationship the
//! cascade arrived through; it is skipped so the parent is not saved twice.

use crate::engine::{BoxFuture, Engine};
use crate::write::AssociationOp;
use nodeorm_core::error::NotLoadedError;
use nodeorm_core::{
    Cx, Error, Link, Outcome, Record, RelationshipInfo, RelationshipKind, RowStore, TableInfo,
    Value, ValueKey, bail_if_cancelled, try_outcome,
};
use std::collections::HashSet;

impl<S: RowStore> Engine<'_, S> {
    pub(crate) fn save<'b>(
        &'b self,
        cx: &'b Cx,
        record: &'b mut Record,
        via: Option<&'b str>,
    ) -> BoxFuture<'b, Outcome<(), Error>> {
        Box::pin(async move {
            bail_if_cancelled!(cx);
            let table = std::sync::Arc::clone(record.table());
            let skip = |rel: &&RelationshipInfo| via != Some(rel.name.as_str());

            for rel in table.relationships.iter().filter(skip) {
                if rel.kind == RelationshipKind::Forward {
                    try_outcome!(self.save_reference(cx, record, rel).await);
                }
            }
            check_required(record, &table);
            for rel in &table.relationships {
                if rel.kind == RelationshipKind::Forward && rel.nullable && rel.unique {
                    try_outcome!(self.release_target(cx, record, rel).await);
                }
            }

            try_outcome!(self.write_row(cx, record).await);

            for rel in table.relationships.iter().filter(skip) {
                match rel.kind {
                    RelationshipKind::Forward => {}
                    RelationshipKind::Reverse => {
                        try_outcome!(self.save_children(cx, record, rel).await);
                    }
                    RelationshipKind::ManyMany => {
                        try_outcome!(self.save_associations(cx, record, rel).await);
                    }
                }
            }
            record.settle_links();
            Outcome::Ok(())
        })
    }

    /// Save the target of a forward reference and copy its key into the
    /// foreign key.
    async fn save_reference(
        &self,
        cx: &Cx,
        record: &mut Record,
        rel: &RelationshipInfo,
    ) -> Outcome<(), Error> {
        let Some(mut link) = record.take_link(&rel.name) else {
            return Outcome::Ok(());
        };
        let outcome = match &mut link {
            Link::One {
                record: Some(target),
                changed,
            } => {
                check_manual_target(rel, target);
                let saved = if target.has_changes() {
                    self.save(cx, target, Some(rel.back_populates.as_str())).await
                } else {
                    Outcome::Ok(())
                };
                match saved {
                    Outcome::Ok(()) => match target.present(&rel.remote_column) {
                        Some(key) => Outcome::Ok(Some(key.clone())),
                        None if *changed => Outcome::Err(unloaded(target, &rel.remote_column)),
                        None => Outcome::Ok(None),
                    },
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            }
            _ => Outcome::Ok(None),
        };
        record.attach(&rel.name, link);
        if let Some(key) = try_outcome!(outcome) {
            record.assign(&rel.local_column, key);
        }
        Outcome::Ok(())
    }

    /// Null the foreign key of any other row holding the same unique target.
    async fn release_target(
        &self,
        cx: &Cx,
        record: &Record,
        rel: &RelationshipInfo,
    ) -> Outcome<(), Error> {
        if !record.dirty_columns().any(|c| c == rel.local_column) {
            return Outcome::Ok(());
        }
        let target_key = match record.get(&rel.local_column) {
            Ok(Value::Null) | Err(_) => return Outcome::Ok(()),
            Ok(v) => v,
        };
        let own_key = record.primary_key();
        let holders = try_outcome!(
            self.fetch_where(
                cx,
                record.table(),
                &[(rel.local_column.clone(), target_key)]
            )
            .await
        );
        for mut holder in holders {
            if own_key.is_some() && holder.primary_key() == own_key {
                continue;
            }
            tracing::debug!(
                relationship = %rel.name,
                holder = %holder.key_display(),
                "releasing unique target from previous holder"
            );
            holder.assign(&rel.local_column, Value::Null);
            try_outcome!(self.write_row(cx, &mut holder).await);
        }
        Outcome::Ok(())
    }

    /// Point every attached child at this record, displacing children the
    /// caller replaced, and save the ones with changes.
    async fn save_children(
        &self,
        cx: &Cx,
        record: &mut Record,
        rel: &RelationshipInfo,
    ) -> Outcome<(), Error> {
        let Some(mut link) = record.take_link(&rel.name) else {
            return Outcome::Ok(());
        };
        let outcome = match record.present(&rel.local_column).cloned() {
            Some(key) => self.save_child_link(cx, rel, &key, &mut link).await,
            None if is_pending(&link) => Outcome::Err(unloaded(record, &rel.local_column)),
            None => Outcome::Ok(()),
        };
        record.attach(&rel.name, link);
        outcome
    }

    async fn save_child_link(
        &self,
        cx: &Cx,
        rel: &RelationshipInfo,
        key: &Value,
        link: &mut Link,
    ) -> Outcome<(), Error> {
        let (children, replaced): (Vec<&mut Record>, bool) = match link {
            Link::One { record, changed } => (record.iter_mut().map(|r| &mut **r).collect(), *changed),
            Link::Many {
                records, replaced, ..
            } => (records.iter_mut().collect(), *replaced),
        };
        if replaced {
            let keep: Vec<Value> = children.iter().filter_map(|c| c.primary_key()).collect();
            try_outcome!(self.displace_all(cx, rel, key, &keep).await);
        }
        for child in children {
            child.assign(&rel.remote_column, key.clone());
            if replaced && !child.is_new() {
                // The copy may predate a detach; write the key regardless.
                child.touch(&rel.remote_column);
            }
            if child.has_changes() {
                try_outcome!(self.save(cx, child, Some(rel.back_populates.as_str())).await);
            }
        }
        Outcome::Ok(())
    }

    /// Save associated targets, then bring the link table in line with the
    /// attached set.
    async fn save_associations(
        &self,
        cx: &Cx,
        record: &mut Record,
        rel: &RelationshipInfo,
    ) -> Outcome<(), Error> {
        let Some(mut link) = record.take_link(&rel.name) else {
            return Outcome::Ok(());
        };
        let outcome = match record.present(&rel.local_column).cloned() {
            Some(key) => self.save_association_link(cx, rel, &key, &mut link).await,
            None if is_pending(&link) => Outcome::Err(unloaded(record, &rel.local_column)),
            None => Outcome::Ok(()),
        };
        record.attach(&rel.name, link);
        outcome
    }

    async fn save_association_link(
        &self,
        cx: &Cx,
        rel: &RelationshipInfo,
        key: &Value,
        link: &mut Link,
    ) -> Outcome<(), Error> {
        let Some(link_table) = &rel.link_table else {
            return Outcome::Err(Error::Custom(format!(
                "relationship '{}' has no link table",
                rel.name
            )));
        };
        let Link::Many {
            records,
            replaced,
            appended,
        } = link
        else {
            return Outcome::Ok(());
        };
        for target in records.iter_mut() {
            check_manual_target(rel, target);
            if target.has_changes() {
                try_outcome!(self.save(cx, target, Some(rel.back_populates.as_str())).await);
            }
        }

        let start = if *replaced {
            let clear = AssociationOp::Clear {
                table: link_table.table_name.clone(),
                column: link_table.local_column.clone(),
                value: key.clone(),
            };
            try_outcome!(clear.execute(cx, self.store).await);
            0
        } else {
            records.len().saturating_sub(*appended)
        };

        let mut seen = HashSet::new();
        for target in &records[start..] {
            let Some(remote) = target.present(&rel.remote_column).cloned() else {
                return Outcome::Err(unloaded(target, &rel.remote_column));
            };
            if !seen.insert(ValueKey::single(remote.clone())) {
                continue;
            }
            let op = AssociationOp::Link {
                table: link_table.table_name.clone(),
                local_column: link_table.local_column.clone(),
                local_value: key.clone(),
                remote_column: link_table.remote_column.clone(),
                remote_value: remote,
            };
            try_outcome!(op.execute(cx, self.store).await);
        }
        Outcome::Ok(())
    }
}

/// A required reference must hold a key before the row is written.
fn check_required(record: &Record, table: &TableInfo) {
    for rel in &table.relationships {
        if rel.kind != RelationshipKind::Forward || rel.nullable {
            continue;
        }
        if matches!(record.get(&rel.local_column), Ok(Value::Null)) {
            panic!("required reference '{}.{}' is not set", table.name, rel.name);
        }
    }
}

/// A target whose key the application assigns must carry it before the
/// cascade inserts it.
fn check_manual_target(rel: &RelationshipInfo, target: &Record) {
    if rel.manual_key_target && target.is_new() && target.primary_key().is_none() {
        panic!(
            "'{}' targets '{}' by an assigned key; set it before the first save",
            rel.name, rel.target_table
        );
    }
}

/// Anything under `link` the cascade would have to write.
fn is_pending(link: &Link) -> bool {
    link.is_changed() || link.records().into_iter().any(Record::has_changes)
}

fn unloaded(record: &Record, column: &str) -> Error {
    Error::NotLoaded(NotLoadedError {
        table: record.table_name().to_string(),
        column: column.to_string(),
    })
}
