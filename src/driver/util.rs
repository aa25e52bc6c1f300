//! Query evaluation shared by the storage backends.
//!
//! A backend enumerates candidate documents (bounded by path where its index
//! allows) and hands them to [`evaluate`]. Everything else is identical
//! across backends and lives here: expiry, the history fold, the selector
//! predicate, ordering and truncation.

use std::collections::{btree_map, BTreeMap, BTreeSet};

use crate::{
    document::{cmp_history_order, Document},
    keys::AuthorId,
    query::{truncate_by_bytes, History, Query},
};

/// Run the full query pipeline over `docs`.
///
/// Pipeline: drop expired, fold to the latest version per path (unless the
/// query asks for full history), apply the selector predicate, sort in
/// history order, then apply cursor, `limit` and `limit_bytes`.
pub(crate) fn evaluate(docs: impl IntoIterator<Item = Document>, query: &Query, now: u64) -> Vec<Document> {
    let clean = query.clone().clean_up();
    if clean.matches_nothing {
        return Vec::new();
    }
    let query = clean.query;

    let live = docs.into_iter().filter(|doc| !doc.is_expired(now));
    let mut docs: Vec<Document> = match query.history {
        Some(History::All) => live.collect(),
        _ => fold_latest(live),
    };

    docs.retain(|doc| query.matches(doc));
    docs.sort_by(cmp_history_order);

    if let Some(cursor) = &query.continue_after {
        docs.retain(|doc| cursor.precedes(doc));
    }
    if let Some(limit) = query.limit {
        docs.truncate(limit as usize);
    }
    if let Some(limit_bytes) = query.limit_bytes {
        truncate_by_bytes(&mut docs, limit_bytes);
    }
    docs
}

/// The paths variant: unique ascending paths of the matching documents.
///
/// `limit` counts paths; `limit_bytes` and the cursor do not apply.
pub(crate) fn evaluate_paths(
    docs: impl IntoIterator<Item = Document>,
    query: &Query,
    now: u64,
) -> Vec<String> {
    let mut unlimited = query.clone();
    unlimited.limit = None;
    unlimited.limit_bytes = None;
    unlimited.continue_after = None;

    let mut paths: Vec<String> = evaluate(docs, &unlimited, now)
        .into_iter()
        .map(|doc| doc.path)
        .collect();
    paths.sort();
    paths.dedup();
    if let Some(limit) = query.limit {
        paths.truncate(limit as usize);
    }
    paths
}

/// Sorted unique authors over the live documents.
pub(crate) fn collect_authors(docs: impl IntoIterator<Item = Document>, now: u64) -> Vec<AuthorId> {
    let authors: BTreeSet<AuthorId> = docs
        .into_iter()
        .filter(|doc| !doc.is_expired(now))
        .map(|doc| doc.author)
        .collect();
    authors.into_iter().collect()
}

/// Keep only the `(timestamp, signature)`-maximum document per path.
fn fold_latest(docs: impl Iterator<Item = Document>) -> Vec<Document> {
    let mut latest: BTreeMap<String, Document> = BTreeMap::new();
    for doc in docs {
        match latest.entry(doc.path.clone()) {
            btree_map::Entry::Vacant(entry) => {
                entry.insert(doc);
            }
            btree_map::Entry::Occupied(mut entry) => {
                if doc.supersedes(entry.get()) {
                    entry.insert(doc);
                }
            }
        }
    }
    latest.into_values().collect()
}
