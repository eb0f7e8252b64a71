use runledger_core::{LEGACY_RUN_ID, RunId};

use crate::RunStore;

impl RunStore {
    /// Run shown by default: the most populated run, not the most recently
    /// created one. Empty stores fall back to `legacy` when it is registered.
    pub fn latest_run_id(&self) -> Option<RunId> {
        let counts = self.evaluation_counts();
        choose_latest(&counts)
    }

    /// `(run id, evaluation count)` for every registered run, newest first.
    pub(crate) fn evaluation_counts(&self) -> Vec<(RunId, usize)> {
        self.runs_by_recency()
            .unwrap_or_default()
            .into_iter()
            .map(|meta| {
                let count = self.evaluation_count(&meta.id);
                (meta.id, count)
            })
            .collect()
    }
}

/// Entry with the highest count; the first one wins ties.
pub(crate) fn most_populated(counts: &[(RunId, usize)]) -> Option<(&RunId, usize)> {
    let mut best: Option<(&RunId, usize)> = None;
    for (run_id, count) in counts {
        if best.is_none_or(|(_, best_count)| *count > best_count) {
            best = Some((run_id, *count));
        }
    }
    best
}

pub(crate) fn choose_latest(counts: &[(RunId, usize)]) -> Option<RunId> {
    let (best, best_count) = most_populated(counts)?;
    if best_count > 0 {
        return Some(best.clone());
    }

    if counts.iter().any(|(run_id, _)| run_id == LEGACY_RUN_ID) {
        return Some(LEGACY_RUN_ID.to_owned());
    }
    counts.first().map(|(run_id, _)| run_id.clone())
}
