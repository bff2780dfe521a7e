//! Join primitives
//!
//! Every primitive takes key-extraction closures instead of hard-coding the
//! identifier format. A key that is absent or blank is never indexed and never
//! matches anything.
//!
//! | Primitive                | Cost          | Output order                     |
//! |--------------------------|---------------|----------------------------------|
//! | `MatchIndex::build`      | O(n)          | -                                |
//! | `match_with_index`       | O(n + k)      | source order, then bucket order  |
//! | `set_intersection_match` | O(n + m)      | input order                      |
//! | `sorted_merge_join`      | O(n + m + k)  | key order, then source/target    |
//! | `hash_partitioned_join`  | O(n + m + k)  | (source index, target index)     |
//!
//! `k` is the number of emitted pairs.

use std::hash::{BuildHasher, Hash, Hasher};

use ahash::{AHashMap, AHashSet, RandomState};
use rayon::prelude::*;

use super::record::MatchRecord;

/// Blank keys are treated as absent
fn usable(key: Option<String>) -> Option<String> {
    key.filter(|k| !k.trim().is_empty())
}

// ═══════════════════════════════════════════════════════════════════════════
// Index
// ═══════════════════════════════════════════════════════════════════════════

/// Key → positions of the items carrying that key
///
/// Positions within a bucket keep insertion order.
#[derive(Debug, Clone)]
pub struct MatchIndex<'a, T> {
    items: &'a [T],
    buckets: AHashMap<String, Vec<usize>>,
    indexed: usize,
}

impl<'a, T> MatchIndex<'a, T> {
    pub fn build<F>(items: &'a [T], key_fn: F) -> Self
    where
        F: Fn(&T) -> Option<String>,
    {
        let mut buckets: AHashMap<String, Vec<usize>> = AHashMap::with_capacity(items.len());
        let mut indexed = 0;
        for (pos, item) in items.iter().enumerate() {
            if let Some(key) = usable(key_fn(item)) {
                buckets.entry(key).or_default().push(pos);
                indexed += 1;
            }
        }
        Self {
            items,
            buckets,
            indexed,
        }
    }

    /// Positions of items with `key` (empty for unknown keys)
    pub fn positions(&self, key: &str) -> &[usize] {
        self.buckets.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get(&self, key: &str) -> impl Iterator<Item = &'a T> + '_ {
        let items = self.items;
        self.positions(key).iter().map(move |&pos| &items[pos])
    }

    pub fn contains(&self, key: &str) -> bool {
        self.buckets.contains_key(key)
    }

    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }

    /// Items that carried a usable key
    pub fn indexed_count(&self) -> usize {
        self.indexed
    }

    pub fn items(&self) -> &'a [T] {
        self.items
    }
}

pub fn build_index<T, F>(items: &[T], key_fn: F) -> MatchIndex<'_, T>
where
    F: Fn(&T) -> Option<String>,
{
    MatchIndex::build(items, key_fn)
}

// ═══════════════════════════════════════════════════════════════════════════
// Hash join
// ═══════════════════════════════════════════════════════════════════════════

/// One exact match per (source item, colliding target item)
pub fn match_with_index<S, T, F>(
    source: &[S],
    index: &MatchIndex<'_, T>,
    source_key: F,
) -> Vec<MatchRecord<S, T>>
where
    S: Clone,
    T: Clone,
    F: Fn(&S) -> Option<String>,
{
    let mut matches = Vec::new();
    for item in source {
        let Some(key) = usable(source_key(item)) else {
            continue;
        };
        for target in index.get(&key) {
            matches.push(MatchRecord::exact(item.clone(), target.clone(), key.clone()));
        }
    }
    matches
}

/// Result of `set_intersection_match`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetMatch {
    pub matched: Vec<String>,
    pub source_only: Vec<String>,
    pub target_only: Vec<String>,
}

/// Partition two key sets into shared and one-sided keys
///
/// Meant for unique-key inputs; repeated keys are reported once.
pub fn set_intersection_match(source_keys: &[String], target_keys: &[String]) -> SetMatch {
    let targets: AHashSet<&str> = target_keys
        .iter()
        .map(String::as_str)
        .filter(|k| !k.trim().is_empty())
        .collect();
    let mut seen_source: AHashSet<&str> = AHashSet::with_capacity(source_keys.len());
    let mut result = SetMatch::default();

    for key in source_keys {
        if key.trim().is_empty() || !seen_source.insert(key.as_str()) {
            continue;
        }
        if targets.contains(key.as_str()) {
            result.matched.push(key.clone());
        } else {
            result.source_only.push(key.clone());
        }
    }

    let mut seen_target: AHashSet<&str> = AHashSet::with_capacity(target_keys.len());
    for key in target_keys {
        if key.trim().is_empty() || !seen_target.insert(key.as_str()) {
            continue;
        }
        if !seen_source.contains(key.as_str()) {
            result.target_only.push(key.clone());
        }
    }
    result
}

// ═══════════════════════════════════════════════════════════════════════════
// Merge join
// ═══════════════════════════════════════════════════════════════════════════

/// (key, position) pairs with unusable keys dropped
fn keyed<T, F>(items: &[T], key_fn: F) -> Vec<(String, usize)>
where
    F: Fn(&T) -> Option<String>,
{
    items
        .iter()
        .enumerate()
        .filter_map(|(pos, item)| usable(key_fn(item)).map(|k| (k, pos)))
        .collect()
}

/// Merge two key-sorted lists, emitting the cartesian product of every run of equal keys
fn merge_keyed(left: &[(String, usize)], right: &[(String, usize)]) -> Vec<(usize, usize, String)> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);

    while i < left.len() && j < right.len() {
        match left[i].0.cmp(&right[j].0) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                let key = &left[i].0;
                let i_end = i + left[i..].iter().take_while(|(k, _)| k == key).count();
                let j_end = j + right[j..].iter().take_while(|(k, _)| k == key).count();

                for (_, s) in &left[i..i_end] {
                    for (_, t) in &right[j..j_end] {
                        out.push((*s, *t, key.clone()));
                    }
                }
                i = i_end;
                j = j_end;
            }
        }
    }
    out
}

fn to_records<S: Clone, T: Clone>(
    source: &[S],
    target: &[T],
    pairs: Vec<(usize, usize, String)>,
) -> Vec<MatchRecord<S, T>> {
    pairs
        .into_iter()
        .map(|(s, t, key)| MatchRecord::exact(source[s].clone(), target[t].clone(), key))
        .collect()
}

/// Merge-join of two inputs already sorted by key
///
/// Items with absent keys may appear anywhere; they are skipped.
pub fn sorted_merge_join<S, T, FS, FT>(
    source: &[S],
    target: &[T],
    source_key: FS,
    target_key: FT,
) -> Vec<MatchRecord<S, T>>
where
    S: Clone,
    T: Clone,
    FS: Fn(&S) -> Option<String>,
    FT: Fn(&T) -> Option<String>,
{
    let left = keyed(source, source_key);
    let right = keyed(target, target_key);
    debug_assert!(left.windows(2).all(|w| w[0].0 <= w[1].0), "source not sorted");
    debug_assert!(right.windows(2).all(|w| w[0].0 <= w[1].0), "target not sorted");

    to_records(source, target, merge_keyed(&left, &right))
}

/// Stable-sort both inputs by key, then merge-join them
pub fn merge_join<S, T, FS, FT>(
    source: &[S],
    target: &[T],
    source_key: FS,
    target_key: FT,
) -> Vec<MatchRecord<S, T>>
where
    S: Clone,
    T: Clone,
    FS: Fn(&S) -> Option<String>,
    FT: Fn(&T) -> Option<String>,
{
    let mut left = keyed(source, source_key);
    let mut right = keyed(target, target_key);
    left.sort_by(|a, b| a.0.cmp(&b.0));
    right.sort_by(|a, b| a.0.cmp(&b.0));

    to_records(source, target, merge_keyed(&left, &right))
}

// ═══════════════════════════════════════════════════════════════════════════
// Partitioned join
// ═══════════════════════════════════════════════════════════════════════════

/// Fixed seeds keep partition assignment stable across runs and processes
fn partition_hasher() -> RandomState {
    RandomState::with_seeds(
        0x243f_6a88_85a3_08d3,
        0x1319_8a2e_0370_7344,
        0xa409_3822_299f_31d0,
        0x082e_fa98_ec4e_6c89,
    )
}

fn partition_of(state: &RandomState, key: &str, partitions: usize) -> usize {
    let mut hasher = state.build_hasher();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

/// Hash-partition both sides and join within each partition only
///
/// Partitions are joined in parallel. Output is ordered by
/// (source position, target position) so it does not depend on scheduling.
pub fn hash_partitioned_join<S, T, FS, FT>(
    source: &[S],
    target: &[T],
    source_key: FS,
    target_key: FT,
    partitions: usize,
) -> Vec<MatchRecord<S, T>>
where
    S: Clone,
    T: Clone,
    FS: Fn(&S) -> Option<String>,
    FT: Fn(&T) -> Option<String>,
{
    let partitions = partitions.max(1);
    let state = partition_hasher();

    let mut source_parts: Vec<Vec<(String, usize)>> = vec![Vec::new(); partitions];
    for (key, pos) in keyed(source, source_key) {
        source_parts[partition_of(&state, &key, partitions)].push((key, pos));
    }
    let mut target_parts: Vec<Vec<(String, usize)>> = vec![Vec::new(); partitions];
    for (key, pos) in keyed(target, target_key) {
        target_parts[partition_of(&state, &key, partitions)].push((key, pos));
    }

    let mut pairs: Vec<(usize, usize, String)> = source_parts
        .into_par_iter()
        .zip(target_parts.into_par_iter())
        .flat_map_iter(|(src, tgt)| {
            let mut index: AHashMap<&str, Vec<usize>> = AHashMap::with_capacity(tgt.len());
            for (key, pos) in &tgt {
                index.entry(key.as_str()).or_default().push(*pos);
            }
            let mut out = Vec::new();
            for (key, s) in &src {
                if let Some(bucket) = index.get(key.as_str()) {
                    out.extend(bucket.iter().map(|t| (*s, *t, key.clone())));
                }
            }
            out
        })
        .collect();

    pairs.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    to_records(source, target, pairs)
}

// ═══════════════════════════════════════════════════════════════════════════
// Chunked processing
// ═══════════════════════════════════════════════════════════════════════════

/// Apply `f` to successive slices of at most `chunk_size` items and concatenate the results
pub fn chunked_process<T, R, F>(items: &[T], chunk_size: usize, mut f: F) -> Vec<R>
where
    F: FnMut(&[T]) -> Vec<R>,
{
    let mut out = Vec::with_capacity(items.len());
    for chunk in items.chunks(chunk_size.max(1)) {
        out.extend(f(chunk));
    }
    out
}
