use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use proptest::prelude::*;
use runledger_runs::{ComparisonRow, RunStore, compare_evaluations};
use runledger_store::KvStore;
use serde_json::{Value, json};

fn memory_store() -> RunStore {
    let kv = KvStore::open_in_memory(Duration::from_secs(5)).expect("open in-memory store");
    RunStore::new(kv)
}

fn evaluations() -> impl Strategy<Value = Vec<Value>> {
    prop::collection::vec((1_i64..20, 0_u32..40), 0..12).prop_map(|items| {
        items
            .into_iter()
            .map(|(pr_number, quarter)| {
                json!({"pr_number": pr_number, "final_score": f64::from(quarter) / 4.0})
            })
            .collect()
    })
}

fn deltas(rows: &[ComparisonRow]) -> BTreeMap<i64, Option<f64>> {
    rows.iter().map(|row| (row.pr_number, row.delta)).collect()
}

type SidePair<T> = (Option<T>, Option<T>);

fn ranks(rows: &[ComparisonRow]) -> BTreeMap<i64, SidePair<usize>> {
    rows.iter()
        .map(|row| (row.pr_number, (row.run_a_rank, row.run_b_rank)))
        .collect()
}

fn scores(rows: &[ComparisonRow]) -> BTreeMap<i64, SidePair<f64>> {
    rows.iter()
        .map(|row| (row.pr_number, (row.run_a_score, row.run_b_score)))
        .collect()
}

fn pr_numbers(evaluations: &[Value]) -> BTreeSet<i64> {
    evaluations
        .iter()
        .filter_map(|evaluation| evaluation["pr_number"].as_i64())
        .collect()
}

proptest! {
    #[test]
    fn ensure_run_registers_each_id_once(
        ids in prop::collection::vec("[a-z0-9]{1,8}", 1..6),
        repeats in 1_usize..4,
    ) {
        let store = memory_store();
        for _ in 0..repeats {
            for id in &ids {
                store.ensure_run(id).expect("ensure run");
            }
        }

        let registered = store.list_run_ids();
        for id in &ids {
            prop_assert_eq!(registered.iter().filter(|entry| *entry == id).count(), 1);
        }
        let distinct: BTreeSet<&String> = ids.iter().collect();
        prop_assert_eq!(registered.len(), distinct.len());
    }

    #[test]
    fn comparison_is_antisymmetric_and_complete(run_a in evaluations(), run_b in evaluations()) {
        let (forward, side_a, side_b) = compare_evaluations(&run_a, &run_b);
        let (backward, back_a, back_b) = compare_evaluations(&run_b, &run_a);

        let expected: BTreeSet<i64> = pr_numbers(&run_a).union(&pr_numbers(&run_b)).copied().collect();
        let seen: BTreeSet<i64> = forward.iter().map(|row| row.pr_number).collect();
        prop_assert_eq!(forward.len(), expected.len());
        prop_assert_eq!(seen, expected);

        let backward_deltas = deltas(&backward);
        for (pr_number, delta) in deltas(&forward) {
            prop_assert_eq!(backward_deltas[&pr_number], delta.map(|value| -value));
        }
        let backward_ranks = ranks(&backward);
        for (pr_number, (rank_a, rank_b)) in ranks(&forward) {
            prop_assert_eq!(backward_ranks[&pr_number], (rank_b, rank_a));
        }
        let backward_scores = scores(&backward);
        for (pr_number, (score_a, score_b)) in scores(&forward) {
            prop_assert_eq!(backward_scores[&pr_number], (score_b, score_a));
        }
        prop_assert_eq!(side_a, back_b);
        prop_assert_eq!(side_b, back_a);
    }
}
