//! Recursive tree mutation.
//!
//! Given a base tree and a sparse set of path→blob updates, this module
//! computes the id of a new tree that differs from the base only in the
//! subtrees on the path to each change. The base tree is never mutated;
//! the object store is content-addressed, so every rebuilt level gets a
//! fresh id and an unchanged input reproduces the original root id
//! bit-for-bit.
//!
//! # Entry ordering
//!
//! Tree entries are written in the object store's canonical order: sorted
//! by name, except that a directory whose name is a strict prefix of
//! another entry's name is compared as if its name had a trailing
//! separator, so it sorts *after* a file it prefixes (`libexec` before
//! `lib/`). [`canonical_entry_cmp`] is the single implementation of this
//! rule.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;

use super::client::Client;
use super::error::{ObjdError, ObjdResult};
use super::types::{Oid, RawTreeEntry, MODE_DIR, MODE_FILE};

/// Sparse update set: full path → new blob id, or `None` to delete.
pub type TreeUpdates = BTreeMap<String, Option<Oid>>;

/// The two tree operations the mutation engine needs.
///
/// [`Client`] implements this against the real object daemon; tests use an
/// in-memory store.
#[async_trait]
pub trait TreeStore {
    /// Lists the raw entries of a tree object.
    async fn tree_list(&mut self, repo: &Path, tree: &Oid) -> ObjdResult<Vec<RawTreeEntry>>;

    /// Writes a tree from an explicit, canonically ordered entry list.
    async fn write_tree(&mut self, repo: &Path, entries: &[RawTreeEntry]) -> ObjdResult<Oid>;
}

#[async_trait]
impl TreeStore for Client {
    async fn tree_list(&mut self, repo: &Path, tree: &Oid) -> ObjdResult<Vec<RawTreeEntry>> {
        Self::tree_list(self, repo, tree).await
    }

    async fn write_tree(&mut self, repo: &Path, entries: &[RawTreeEntry]) -> ObjdResult<Oid> {
        Self::write_tree(self, repo, entries).await
    }
}

/// Compares two tree entries in canonical object-store order.
///
/// Ties on equal names should not occur (names are unique within a tree);
/// if they do, a non-directory entry precedes a directory entry.
#[must_use]
pub fn canonical_entry_cmp(
    a_name: &str,
    a_is_dir: bool,
    b_name: &str,
    b_is_dir: bool,
) -> Ordering {
    if a_name == b_name {
        return match (a_is_dir, b_is_dir) {
            (false, true) => Ordering::Less,
            (true, false) => Ordering::Greater,
            _ => Ordering::Equal,
        };
    }
    if b_name.starts_with(a_name) {
        // `a` prefixes `b`: a directory `a` compares as "a/" which sorts
        // after the longer name.
        return if a_is_dir {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    if a_name.starts_with(b_name) {
        return if b_is_dir {
            Ordering::Less
        } else {
            Ordering::Greater
        };
    }
    a_name.cmp(b_name)
}

/// Working entry during a rebuild; `oid` of `None` marks a deleted leaf.
#[derive(Debug, Clone)]
struct WorkEntry {
    mode: u64,
    name: String,
    oid: Option<Oid>,
}

impl WorkEntry {
    fn is_dir(&self) -> bool {
        self.mode == MODE_DIR
    }
}

fn join_prefix(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}/{name}")
    }
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((dir, leaf)) => (dir, leaf),
        None => ("", path),
    }
}

/// Applies `updates` to the tree `base_tree` and returns the new root id.
///
/// The algorithm walks the whole base tree once, caching each subtree's
/// entry list by its path prefix, splices the updates into the affected
/// lists, then rebuilds bottom-up with memoization so each level is
/// written exactly once.
///
/// Updates may add files to existing directories, replace blob ids, or
/// delete entries (`None`); deleting an absent entry is a no-op. Creating
/// a directory that does not exist in the base tree is not supported.
///
/// # Errors
///
/// Propagates any [`ObjdError`] from the underlying store.
pub async fn build_tree<S: TreeStore + Send>(
    store: &mut S,
    repo: &Path,
    base_tree: &Oid,
    updates: &TreeUpdates,
) -> ObjdResult<Oid> {
    // Phase 1: walk the base tree, caching every level's entries.
    let mut cache: HashMap<String, Vec<WorkEntry>> = HashMap::new();
    let mut pending = vec![(String::new(), *base_tree)];
    while let Some((prefix, oid)) = pending.pop() {
        let entries = store.tree_list(repo, &oid).await?;
        let work: Vec<WorkEntry> = entries
            .into_iter()
            .map(|e| WorkEntry {
                mode: e.mode,
                name: e.name,
                oid: Some(e.oid),
            })
            .collect();
        for entry in &work {
            if entry.is_dir() {
                let sub = join_prefix(&prefix, &entry.name);
                let sub_oid = entry.oid.expect("walked entries always carry an id");
                pending.push((sub, sub_oid));
            }
        }
        cache.insert(prefix, work);
    }

    // Phase 2: splice the updates into the affected entry lists.
    for (path, update) in updates {
        let (dir, leaf) = split_path(path);
        let Some(entries) = cache.get_mut(dir) else {
            return Err(ObjdError::InvalidUpdate {
                reason: format!("path {path:?} names a directory absent from the base tree"),
            });
        };
        let position = entries.iter().position(|e| e.name == leaf);
        match (position, update) {
            (Some(i), Some(blob)) => {
                entries[i].mode = MODE_FILE;
                entries[i].oid = Some(*blob);
            }
            (Some(i), None) => {
                entries.remove(i);
            }
            (None, Some(blob)) => entries.push(WorkEntry {
                mode: MODE_FILE,
                name: leaf.to_owned(),
                oid: Some(*blob),
            }),
            (None, None) => {} // deleting an absent entry is a no-op
        }
    }

    // Phase 3: rebuild bottom-up. Sorting prefixes by depth (descending)
    // guarantees every subtree is written before the level that links it.
    let mut prefixes: Vec<String> = cache.keys().cloned().collect();
    prefixes.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count() + usize::from(!p.is_empty())));

    let mut built: HashMap<String, Oid> = HashMap::new();
    for prefix in prefixes {
        let mut entries = cache
            .remove(&prefix)
            .expect("every cached prefix is visited once");
        for entry in &mut entries {
            if entry.is_dir() {
                let sub = join_prefix(&prefix, &entry.name);
                entry.oid = Some(
                    *built
                        .get(&sub)
                        .expect("child level built before its parent"),
                );
            }
        }
        entries.retain(|e| e.oid.is_some());
        entries.sort_by(|a, b| canonical_entry_cmp(&a.name, a.is_dir(), &b.name, b.is_dir()));
        let raw: Vec<RawTreeEntry> = entries
            .into_iter()
            .map(|e| RawTreeEntry {
                mode: e.mode,
                name: e.name,
                oid: e.oid.expect("entries without an id were dropped"),
            })
            .collect();
        let id = store.write_tree(repo, &raw).await?;
        built.insert(prefix, id);
    }

    Ok(*built
        .get("")
        .expect("the root prefix is always present in the walk"))
}
