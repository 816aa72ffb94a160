//! Select-in loading of relationships.
//!
//! Every relationship level costs one plan per batch of parents (two for
//! many-to-many: the link table, then the targets). Targets are hydrated,
//! their own levels loaded recursively, and clones distributed to the
//! parents' link slots.

use crate::compile::LinkLoad;
use nodeorm_core::{
    Cx, Error, Link, Outcome, Record, RelationshipKind, RowStore, SchemaMetadata,
    UnloadedFieldPolicy, Value, ValueKey, bail_if_cancelled, try_outcome,
};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Load `loads` into every record of `records`.
pub fn load_links<'a, S: RowStore>(
    cx: &'a Cx,
    store: &'a S,
    policy: UnloadedFieldPolicy,
    records: &'a mut [Record],
    loads: &'a [LinkLoad],
) -> BoxFuture<'a, Outcome<(), Error>> {
    Box::pin(async move {
        for load in loads {
            try_outcome!(load_level(cx, store, policy, records, load).await);
        }
        Outcome::Ok(())
    })
}

/// Load relationship `name` of a single record, replacing whatever the slot
/// held.
#[tracing::instrument(level = "debug", skip(cx, store, schema, record), fields(table = %record.table_name()))]
pub async fn load_relationship<S: RowStore>(
    cx: &Cx,
    store: &S,
    schema: &dyn SchemaMetadata,
    policy: UnloadedFieldPolicy,
    record: &mut Record,
    name: &str,
) -> Outcome<(), Error> {
    let load = match LinkLoad::relationship(schema, record.table(), name) {
        Ok(load) => load,
        Err(err) => return Outcome::Err(err.into()),
    };
    load_links(
        cx,
        store,
        policy,
        std::slice::from_mut(record),
        std::slice::from_ref(&load),
    )
    .await
}

async fn load_level<S: RowStore>(
    cx: &Cx,
    store: &S,
    policy: UnloadedFieldPolicy,
    parents: &mut [Record],
    load: &LinkLoad,
) -> Outcome<(), Error> {
    bail_if_cancelled!(cx);
    let rel = &load.relationship;
    let keys = distinct_keys(parents.iter().map(|p| join_value(p, &rel.local_column)));
    tracing::trace!(
        relationship = %rel.name,
        parents = parents.len(),
        keys = keys.len(),
        "loading relationship"
    );
    if keys.is_empty() {
        for parent in parents.iter_mut() {
            parent.attach(&rel.name, empty_link(load));
        }
        return Outcome::Ok(());
    }

    if rel.kind == RelationshipKind::ManyMany {
        return load_associated(cx, store, policy, parents, load, keys).await;
    }

    let mut targets = try_outcome!(fetch(cx, store, policy, load, &rel.remote_column, keys).await);
    try_outcome!(load_links(cx, store, policy, &mut targets, &load.children).await);

    let mut by_key: HashMap<ValueKey, Vec<usize>> = HashMap::new();
    for (index, target) in targets.iter().enumerate() {
        if let Some(value) = join_value(target, &rel.remote_column) {
            by_key.entry(ValueKey::single(value)).or_default().push(index);
        }
    }
    for parent in parents.iter_mut() {
        let matched: Vec<Record> = join_value(parent, &rel.local_column)
            .and_then(|value| by_key.get(&ValueKey::single(value)))
            .map(|indices| indices.iter().map(|&i| targets[i].clone()).collect())
            .unwrap_or_default();
        let link = if rel.is_single() {
            Link::loaded_one(matched.into_iter().next())
        } else {
            Link::loaded_many(matched)
        };
        parent.attach(&rel.name, link);
    }
    Outcome::Ok(())
}

/// Many-to-many: read the link table, then the targets, then pair them up
/// in target order. A pair stored twice yields the target twice.
async fn load_associated<S: RowStore>(
    cx: &Cx,
    store: &S,
    policy: UnloadedFieldPolicy,
    parents: &mut [Record],
    load: &LinkLoad,
    keys: Vec<Value>,
) -> Outcome<(), Error> {
    let rel = &load.relationship;
    let (Some(link), Some(link_plan)) = (&rel.link_table, &load.link_plan) else {
        return Outcome::Err(Error::Custom(format!(
            "relationship '{}' has no link table",
            rel.name
        )));
    };
    let filter = link_plan.root().column_of(link.local_column.clone()).in_list(keys);
    let rows = try_outcome!(store.select(cx, &link_plan.clone().with_filter(filter)).await);

    let mut pairs: HashMap<ValueKey, HashMap<ValueKey, usize>> = HashMap::new();
    let mut remote_keys = Vec::new();
    for row in &rows {
        let (Some(local), Some(remote)) = (
            row.get_by_name(&link.local_column),
            row.get_by_name(&link.remote_column),
        ) else {
            continue;
        };
        if local.is_null() || remote.is_null() {
            continue;
        }
        remote_keys.push(remote.clone());
        *pairs
            .entry(ValueKey::single(local.clone()))
            .or_default()
            .entry(ValueKey::single(remote.clone()))
            .or_default() += 1;
    }
    let remote_keys = distinct_keys(remote_keys.into_iter().map(Some));

    let mut targets = if remote_keys.is_empty() {
        Vec::new()
    } else {
        try_outcome!(fetch(cx, store, policy, load, &rel.remote_column, remote_keys).await)
    };
    try_outcome!(load_links(cx, store, policy, &mut targets, &load.children).await);

    for parent in parents.iter_mut() {
        let counts = join_value(parent, &rel.local_column)
            .and_then(|value| pairs.get(&ValueKey::single(value)));
        let mut matched = Vec::new();
        if let Some(counts) = counts {
            for target in &targets {
                let multiplicity = join_value(target, &rel.remote_column)
                    .and_then(|value| counts.get(&ValueKey::single(value)))
                    .copied()
                    .unwrap_or(0);
                matched.extend(std::iter::repeat_n(target, multiplicity).cloned());
            }
        }
        parent.attach(&rel.name, Link::loaded_many(matched));
    }
    Outcome::Ok(())
}

/// Run the level's plan restricted to rows whose `column` is in `keys`.
async fn fetch<S: RowStore>(
    cx: &Cx,
    store: &S,
    policy: UnloadedFieldPolicy,
    load: &LinkLoad,
    column: &str,
    keys: Vec<Value>,
) -> Outcome<Vec<Record>, Error> {
    let filter = load.plan.root().column_of(column).in_list(keys);
    let rows = try_outcome!(store.select(cx, &load.plan.clone().with_filter(filter)).await);
    Outcome::Ok(
        rows.iter()
            .map(|row| Record::from_row(Arc::clone(&load.target), row, policy))
            .collect(),
    )
}

fn join_value(record: &Record, column: &str) -> Option<Value> {
    record.get(column).ok().filter(|v| !v.is_null())
}

fn distinct_keys(values: impl Iterator<Item = Option<Value>>) -> Vec<Value> {
    let mut seen = HashSet::new();
    values
        .flatten()
        .filter(|v| seen.insert(ValueKey::single(v.clone())))
        .collect()
}

fn empty_link(load: &LinkLoad) -> Link {
    if load.relationship.is_single() {
        Link::loaded_one(None)
    } else {
        Link::loaded_many(Vec::new())
    }
}
