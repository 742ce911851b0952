//! ListMerger: combine a fetched page into the materialized list.

#![forbid(unsafe_code)]

use std::hash::Hash;

use rustc_hash::FxHashSet;
use tabula_core::{FetchMode, Identified, PageResult};

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome<I> {
    pub items: Vec<I>,
    pub total_count: u64,
    /// Incoming rows skipped because their identity was already present.
    pub duplicates_dropped: usize,
}

/// Reset replaces the list; append keeps `current` and adds only rows whose
/// identity is not already present. The total always comes from the server.
pub fn merge_by<I, K, F>(current: &[I], result: PageResult<I>, mode: FetchMode, id_of: F) -> MergeOutcome<I>
where
    I: Clone,
    K: Eq + Hash,
    F: Fn(&I) -> K,
{
    let (mut items, mut seen) = match mode {
        FetchMode::Reset => (Vec::with_capacity(result.items.len()), FxHashSet::default()),
        FetchMode::Append => {
            let seen: FxHashSet<K> = current.iter().map(&id_of).collect();
            let mut v = Vec::with_capacity(current.len() + result.items.len());
            v.extend_from_slice(current);
            (v, seen)
        }
    };
    let mut duplicates_dropped = 0usize;
    for it in result.items {
        // A page is expected to be duplicate-free already; checking it too keeps
        // the uniqueness invariant whatever the server sends.
        if seen.insert(id_of(&it)) {
            items.push(it);
        } else {
            duplicates_dropped += 1;
        }
    }
    MergeOutcome { items, total_count: result.total_count, duplicates_dropped }
}

pub fn merge<I: Identified + Clone>(current: &[I], result: PageResult<I>, mode: FetchMode) -> MergeOutcome<I> {
    merge_by(current, result, mode, I::id)
}
