use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use runledger_core::{RunId, RunMeta};
use serde::Serialize;
use serde_json::Value;

use crate::RunStore;
use crate::collections::evaluation_key;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonRow {
    pub pr_number: i64,
    pub title: String,
    pub run_a_score: Option<f64>,
    pub run_b_score: Option<f64>,
    pub delta: Option<f64>,
    pub run_a_rank: Option<usize>,
    pub run_b_rank: Option<usize>,
    pub run_a_justification: String,
    pub run_b_justification: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSide {
    pub run_id: RunId,
    pub meta: Option<RunMeta>,
    pub scored_count: usize,
    pub average_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunComparison {
    pub run_a: RunSide,
    pub run_b: RunSide,
    pub rows: Vec<ComparisonRow>,
}

#[derive(Debug, Clone)]
struct RankedItem {
    score: f64,
    rank: usize,
    title: Option<String>,
    justification: String,
}

/// `final_score`, else `final_rank_score`, else `score`, else 0.
pub fn comparison_score(evaluation: &Value) -> f64 {
    ["final_score", "final_rank_score", "score"]
        .into_iter()
        .find_map(|field| numeric(evaluation.get(field)?))
        .unwrap_or(0.0)
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }
}

fn text_field(evaluation: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| {
        evaluation
            .get(*field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_owned)
    })
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Ranks one run's evaluations by descending score, 1-based. The first record
/// seen for a `pr_number` is the one that counts.
fn rank_evaluations(evaluations: &[Value]) -> BTreeMap<i64, RankedItem> {
    let mut seen = BTreeSet::new();
    let mut scored: Vec<(i64, &Value, f64)> = evaluations
        .iter()
        .filter_map(|evaluation| {
            let pr_number = evaluation_key(evaluation)?;
            seen.insert(pr_number)
                .then(|| (pr_number, evaluation, comparison_score(evaluation)))
        })
        .collect();
    scored.sort_by(|left, right| right.2.total_cmp(&left.2));

    scored
        .into_iter()
        .enumerate()
        .map(|(index, (pr_number, evaluation, score))| {
            let item = RankedItem {
                score,
                rank: index + 1,
                title: text_field(evaluation, &["title"]),
                justification: text_field(evaluation, &["justification", "review_summary"])
                    .unwrap_or_default(),
            };
            (pr_number, item)
        })
        .collect()
}

fn average(ranked: &BTreeMap<i64, RankedItem>) -> f64 {
    if ranked.is_empty() {
        return 0.0;
    }
    let total: f64 = ranked.values().map(|item| item.score).sum();
    round4(total / ranked.len() as f64)
}

/// Rows with a one-sided item come first, then by descending |delta|.
fn row_order(left: &ComparisonRow, right: &ComparisonRow) -> Ordering {
    match (left.delta, right.delta) {
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(left_delta), Some(right_delta)) => right_delta.abs().total_cmp(&left_delta.abs()),
        (None, None) => Ordering::Equal,
    }
    .then_with(|| left.pr_number.cmp(&right.pr_number))
}

/// Joins two runs' evaluations by `pr_number`. Returns the rows plus each
/// side's `(scored count, average score)`.
pub fn compare_evaluations(
    run_a: &[Value],
    run_b: &[Value],
) -> (Vec<ComparisonRow>, (usize, f64), (usize, f64)) {
    let ranked_a = rank_evaluations(run_a);
    let ranked_b = rank_evaluations(run_b);

    let keys: BTreeSet<i64> = ranked_a.keys().chain(ranked_b.keys()).copied().collect();
    let mut rows: Vec<ComparisonRow> = keys
        .into_iter()
        .map(|pr_number| {
            let a = ranked_a.get(&pr_number);
            let b = ranked_b.get(&pr_number);
            let delta = match (a, b) {
                (Some(a), Some(b)) => Some(round4(b.score - a.score)),
                _ => None,
            };
            let title = a
                .and_then(|item| item.title.clone())
                .or_else(|| b.and_then(|item| item.title.clone()))
                .unwrap_or_default();

            ComparisonRow {
                pr_number,
                title,
                run_a_score: a.map(|item| item.score),
                run_b_score: b.map(|item| item.score),
                delta,
                run_a_rank: a.map(|item| item.rank),
                run_b_rank: b.map(|item| item.rank),
                run_a_justification: a.map(|item| item.justification.clone()).unwrap_or_default(),
                run_b_justification: b.map(|item| item.justification.clone()).unwrap_or_default(),
            }
        })
        .collect();
    rows.sort_by(row_order);

    (
        rows,
        (ranked_a.len(), average(&ranked_a)),
        (ranked_b.len(), average(&ranked_b)),
    )
}

impl RunStore {
    /// Unknown runs compare as empty rather than failing.
    pub fn compare_runs(&self, run_a: &str, run_b: &str) -> RunComparison {
        let evaluations_a = self.evaluations(run_a).unwrap_or_default();
        let evaluations_b = self.evaluations(run_b).unwrap_or_default();
        let (rows, (count_a, average_a), (count_b, average_b)) =
            compare_evaluations(&evaluations_a, &evaluations_b);

        RunComparison {
            run_a: RunSide {
                run_id: run_a.to_owned(),
                meta: self.run_meta(run_a).found(),
                scored_count: count_a,
                average_score: average_a,
            },
            run_b: RunSide {
                run_id: run_b.to_owned(),
                meta: self.run_meta(run_b).found(),
                scored_count: count_b,
                average_score: average_b,
            },
            rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn comparison_score_falls_back_through_fields() {
        assert_eq!(comparison_score(&json!({"final_score": 8.5, "score": 1})), 8.5);
        assert_eq!(comparison_score(&json!({"final_rank_score": "6.25"})), 6.25);
        assert_eq!(comparison_score(&json!({"score": 3})), 3.0);
        assert_eq!(comparison_score(&json!({"final_score": null, "score": 2})), 2.0);
        assert_eq!(comparison_score(&json!({"title": "none"})), 0.0);
    }

    #[test]
    fn rows_join_by_pr_number_with_ranks_and_delta() {
        let run_a = vec![
            json!({"pr_number": 5, "final_score": 6.0, "title": "A title", "justification": "meh"}),
            json!({"pr_number": 9, "final_score": 9.0, "review_summary": "solid"}),
        ];
        let run_b = vec![
            json!({"pr_number": 5, "final_score": 8.0, "title": "B title"}),
            json!({"pr_number": 11, "final_score": 1.0, "title": "only in b"}),
        ];

        let (rows, (count_a, average_a), (count_b, average_b)) =
            compare_evaluations(&run_a, &run_b);

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].pr_number, 9);
        assert_eq!(rows[0].delta, None);
        assert_eq!(rows[0].run_a_justification, "solid");
        assert_eq!(rows[1].pr_number, 11);
        assert_eq!(rows[1].title, "only in b");
        assert_eq!(rows[1].run_a_rank, None);

        let pr5 = &rows[2];
        assert_eq!(pr5.pr_number, 5);
        assert_eq!(pr5.run_a_score, Some(6.0));
        assert_eq!(pr5.run_b_score, Some(8.0));
        assert_eq!(pr5.delta, Some(2.0));
        assert_eq!(pr5.run_a_rank, Some(2));
        assert_eq!(pr5.run_b_rank, Some(1));
        assert_eq!(pr5.title, "A title");
        assert_eq!(pr5.run_a_justification, "meh");
        assert_eq!(pr5.run_b_justification, "");

        assert_eq!((count_a, average_a), (2, 7.5));
        assert_eq!((count_b, average_b), (2, 4.5));
    }

    #[test]
    fn delta_is_rounded_to_four_places() {
        let (rows, _, _) = compare_evaluations(
            &[json!({"pr_number": 1, "final_score": 0.1})],
            &[json!({"pr_number": 1, "final_score": 0.30004})],
        );
        assert_eq!(rows[0].delta, Some(0.2));
    }

    #[test]
    fn empty_runs_average_zero() {
        let (rows, side_a, side_b) = compare_evaluations(&[], &[]);
        assert!(rows.is_empty());
        assert_eq!(side_a, (0, 0.0));
        assert_eq!(side_b, (0, 0.0));
    }
}
