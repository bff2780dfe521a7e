//! Property-based tests for the matching and checkpoint layers
//!
//! Invariants that should hold for ALL inputs:
//! - Join equivalence: hash, merge and partitioned joins emit the same pairs
//!   as a nested loop over non-blank keys
//! - Index linearity: every usable item lands in exactly one bucket
//! - Checkpoint roundtrip: decode(create(ctx)) == ctx
//! - Aggregation completeness: one entry per distinct input, statuses add up

use std::collections::BTreeMap;
use std::sync::Arc;

use biomapper_engine::matching::{
    build_index, hash_partitioned_join, match_with_index, merge_join, MatchRecord,
};
use biomapper_engine::{CheckpointStore, ExecutionContext, IdMatch, ResultAggregator, ResultStatus};
use biomapper_storage::{CheckpointKind, InMemoryJobStore};
use proptest::prelude::*;
use serde_json::json;
use uuid::Uuid;

type Item = (usize, String);

fn items(keys: &[String]) -> Vec<Item> {
    keys.iter().cloned().enumerate().collect()
}

fn key(item: &Item) -> Option<String> {
    Some(item.1.clone())
}

fn pairs(records: Vec<MatchRecord<Item, Item>>) -> Vec<(usize, usize)> {
    let mut out: Vec<(usize, usize)> = records.into_iter().map(|m| (m.source.0, m.target.0)).collect();
    out.sort_unstable();
    out
}

fn nested_loop(source: &[Item], target: &[Item]) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    for s in source {
        if s.1.trim().is_empty() {
            continue;
        }
        for t in target {
            if s.1 == t.1 {
                out.push((s.0, t.0));
            }
        }
    }
    out.sort_unstable();
    out
}

// Small alphabet so that collisions and blanks are common
fn keys() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[ab ]{0,2}", 0..40)
}

// ============================================================================
// Joins
// ============================================================================

proptest! {
    #[test]
    fn prop_joins_match_nested_loop(source in keys(), target in keys(), partitions in 1usize..8) {
        let source = items(&source);
        let target = items(&target);
        let expected = nested_loop(&source, &target);

        let index = build_index(&target, key);
        prop_assert_eq!(pairs(match_with_index(&source, &index, key)), expected.clone());
        prop_assert_eq!(pairs(merge_join(&source, &target, key, key)), expected.clone());
        prop_assert_eq!(
            pairs(hash_partitioned_join(&source, &target, key, key, partitions)),
            expected
        );
    }

    #[test]
    fn prop_partitioned_output_is_position_ordered(source in keys(), target in keys(), partitions in 1usize..8) {
        let source = items(&source);
        let target = items(&target);
        let joined: Vec<(usize, usize)> = hash_partitioned_join(&source, &target, key, key, partitions)
            .into_iter()
            .map(|m| (m.source.0, m.target.0))
            .collect();
        prop_assert!(joined.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn prop_index_holds_every_usable_item_once(values in keys()) {
        let values = items(&values);
        let index = build_index(&values, key);
        let usable = values.iter().filter(|v| !v.1.trim().is_empty()).count();

        prop_assert_eq!(index.indexed_count(), usable);
        let mut seen: Vec<usize> = values
            .iter()
            .filter(|v| !v.1.trim().is_empty())
            .flat_map(|v| index.positions(&v.1).to_vec())
            .collect();
        seen.sort_unstable();
        seen.dedup();
        prop_assert_eq!(seen.len(), usable);
    }
}

// ============================================================================
// Checkpoints
// ============================================================================

fn contexts() -> impl Strategy<Value = ExecutionContext> {
    let rows = prop::collection::vec(("[a-z]{1,6}", "[A-Z0-9_:]{0,10}", any::<i64>()), 0..6);
    let datasets = prop::collection::btree_map("[a-z]{1,8}", rows, 0..4);
    let statistics = prop::collection::btree_map("[a-z_]{1,10}", any::<i64>(), 0..4);
    (datasets, statistics).prop_map(|(datasets, statistics)| {
        let mut context = ExecutionContext::new();
        for (name, rows) in datasets {
            let rows = rows
                .into_iter()
                .map(|(column, id, n)| {
                    let mut row = biomapper_engine::Record::new();
                    row.insert(column, json!(id));
                    row.insert("n".into(), json!(n));
                    row
                })
                .collect();
            context.insert_dataset(name, rows);
        }
        for (key, value) in statistics {
            context.set_statistic(key, json!(value));
        }
        context
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_checkpoint_roundtrip(context in contexts(), step_index in 0usize..50) {
        let store = CheckpointStore::new(Arc::new(InMemoryJobStore::new()));
        let job_id = Uuid::new_v4();

        let (decoded, restored_index) = tokio_test::block_on(async {
            let id = store
                .create(job_id, step_index, "step", &context, CheckpointKind::Automatic)
                .await
                .unwrap();
            store.restore(id).await.unwrap()
        });
        prop_assert_eq!(decoded, context);
        prop_assert_eq!(restored_index, step_index);
    }
}

// ============================================================================
// Aggregation
// ============================================================================

proptest! {
    #[test]
    fn prop_every_input_has_exactly_one_entry(
        inputs in prop::collection::vec("[A-E]", 0..20),
        matched in prop::collection::vec(("[A-G]", "[X-Z]"), 0..20),
        errored in prop::collection::vec("[A-G]", 0..5),
    ) {
        let mut aggregator = ResultAggregator::new(inputs.clone());
        for (source, target) in &matched {
            aggregator.record_match(&IdMatch::exact(source.clone(), target.clone(), target.clone()));
        }
        for id in &errored {
            aggregator.record_error(id, "resolver", "boom");
        }
        let result = aggregator.finish(None);

        let mut distinct = inputs.clone();
        distinct.sort();
        distinct.dedup();
        prop_assert_eq!(result.total(), distinct.len());
        prop_assert_eq!(result.matched + result.unmapped + result.errored, result.total());

        let mut order: BTreeMap<&str, usize> = BTreeMap::new();
        for (pos, entry) in result.entries.iter().enumerate() {
            prop_assert!(order.insert(entry.input_id.as_str(), pos).is_none());
        }
        // A match wins over a recorded error
        for entry in &result.entries {
            let has_match = matched.iter().any(|(s, _)| *s == entry.input_id);
            prop_assert_eq!(has_match, entry.status == ResultStatus::Matched);
        }
    }
}
