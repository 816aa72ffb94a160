//! What happens to a child row that loses its parent.
//!
//! A reverse relationship owns the rows that point at it. When such a row
//! is dropped from the link, replaced by another one, or its parent is
//! deleted, the shape of the child's foreign key decides its fate:
//!
//! | child foreign key | displaced child |
//! |---|---|
//! | nullable | foreign key set to NULL, row kept |
//! | required | row deleted, cascading further |
//!
//! Forward references never own their target and many-to-many links only
//! own link-table rows, so neither goes through here.

use crate::engine::Engine;
use nodeorm_core::{Cx, Error, Outcome, Record, RelationshipInfo, RowStore, Value, try_outcome};

/// Fate of a child displaced from a reverse relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Displacement {
    /// Null the child's foreign key.
    Detach,
    /// Delete the child.
    Delete,
}

impl Displacement {
    pub fn for_relationship(rel: &RelationshipInfo) -> Self {
        if rel.nullable {
            Displacement::Detach
        } else {
            Displacement::Delete
        }
    }
}

impl<S: RowStore> Engine<'_, S> {
    /// Displace every child of `rel` pointing at `key`, except those whose
    /// primary key is in `keep`.
    pub(crate) async fn displace_all(
        &self,
        cx: &Cx,
        rel: &RelationshipInfo,
        key: &Value,
        keep: &[Value],
    ) -> Outcome<(), Error> {
        let target = self.table(&rel.target_table);
        let holders = try_outcome!(
            self.fetch_where(cx, &target, &[(rel.remote_column.clone(), key.clone())])
                .await
        );
        for mut orphan in holders {
            if orphan.primary_key().is_some_and(|k| keep.contains(&k)) {
                continue;
            }
            try_outcome!(self.displace(cx, rel, &mut orphan).await);
        }
        Outcome::Ok(())
    }

    pub(crate) async fn displace(
        &self,
        cx: &Cx,
        rel: &RelationshipInfo,
        orphan: &mut Record,
    ) -> Outcome<(), Error> {
        let action = Displacement::for_relationship(rel);
        tracing::debug!(
            relationship = %rel.name,
            table = %orphan.table_name(),
            key = %orphan.key_display(),
            ?action,
            "displacing child"
        );
        match action {
            Displacement::Detach => {
                orphan.assign(&rel.remote_column, Value::Null);
                self.write_row(cx, orphan).await
            }
            Displacement::Delete => self.delete(cx, orphan).await,
        }
    }
}
