use std::collections::HashSet;

use runledger_core::{
    CURRENT_RUN_KEY, LEGACY_RUN_ID, REGISTRY_KEY, RunEvent, RunEventKind, RunId, RunKind,
    RunStatus, legacy_collection_keys, run_prefix,
};
use runledger_store::{Lookup, Unavailable};
use serde::Serialize;
use serde_json::Value;

use crate::latest::{choose_latest, most_populated};
use crate::registry::decode_ids;
use crate::{RunStore, RunsError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetentionPolicy {
    /// Keep the most populated run and the latest run; delete the rest.
    #[default]
    KeepBest,
    /// Also keep every baseline run and the `keep_experimental` most recent
    /// others. Runs outside that set lose their collections but stay listed
    /// as archived.
    Tiered { keep_experimental: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub protected: Vec<RunId>,
    pub legacy_data_run: Option<RunId>,
    pub best_run: Option<RunId>,
    pub deleted: Vec<RunId>,
    pub archived: Vec<RunId>,
    pub current_run: Option<RunId>,
}

impl RunStore {
    pub fn cleanup(&self, policy: RetentionPolicy) -> Result<CleanupReport, RunsError> {
        let runs = match self.runs_by_recency() {
            Lookup::Found(runs) => runs,
            Lookup::NotFound => Vec::new(),
            Lookup::Unavailable => return Err(Unavailable.into()),
        };
        let counts: Vec<(RunId, usize)> = runs
            .iter()
            .map(|meta| (meta.id.clone(), self.evaluation_count(&meta.id)))
            .collect();

        let legacy_data_run = most_populated(&counts).map(|(run_id, _)| run_id.clone());
        let best_run = choose_latest(&counts);

        let mut protected: Vec<RunId> = Vec::new();
        for run_id in legacy_data_run.iter().chain(best_run.iter()) {
            if !protected.contains(run_id) {
                protected.push(run_id.clone());
            }
        }

        let mut report = CleanupReport {
            legacy_data_run,
            best_run,
            ..CleanupReport::default()
        };

        match policy {
            RetentionPolicy::KeepBest => {
                let doomed: Vec<RunId> = counts
                    .iter()
                    .map(|(run_id, _)| run_id.clone())
                    .filter(|run_id| !protected.contains(run_id))
                    .collect();
                self.delete_runs(&doomed)?;
                report.deleted = doomed;
            }
            RetentionPolicy::Tiered { keep_experimental } => {
                let mut recent_kept = 0;
                for meta in &runs {
                    if protected.contains(&meta.id) || meta.status == Some(RunStatus::Archived) {
                        continue;
                    }
                    if meta.kind == Some(RunKind::Baseline) {
                        protected.push(meta.id.clone());
                        continue;
                    }
                    if recent_kept < keep_experimental {
                        recent_kept += 1;
                        protected.push(meta.id.clone());
                        continue;
                    }

                    self.archive_run(&meta.id)?;
                    report.archived.push(meta.id.clone());
                }
            }
        }

        self.repoint_current(&report.deleted, report.best_run.as_deref())?;
        report.protected = protected;
        report.current_run = self.current_run_id();
        Ok(report)
    }

    /// Drops the ids from the registry first, so a half-finished deletion
    /// leaves orphaned keys rather than a listed run with missing data.
    fn delete_runs(&self, doomed: &[RunId]) -> Result<(), RunsError> {
        if doomed.is_empty() {
            return Ok(());
        }

        let doomed_set: HashSet<&str> = doomed.iter().map(String::as_str).collect();
        self.kv.update(REGISTRY_KEY, |current| {
            let ids: Vec<RunId> = decode_ids(current)
                .into_iter()
                .filter(|run_id| !doomed_set.contains(run_id.as_str()))
                .collect();
            Some(Value::from(ids))
        })?;

        for run_id in doomed {
            let removed = self.kv.delete_prefix(&run_prefix(run_id))?;
            if run_id == LEGACY_RUN_ID {
                for (_, key) in legacy_collection_keys() {
                    self.kv.delete(key)?;
                }
            }
            tracing::info!(run_id = %run_id, keys = removed, "deleted run during cleanup");
        }
        Ok(())
    }

    fn archive_run(&self, run_id: &str) -> Result<(), RunsError> {
        self.prune_collections(run_id)?;
        self.append_run_event(
            run_id,
            &RunEvent {
                event: RunEventKind::Archived,
                at: None,
            },
        )?;
        tracing::info!(run_id, "archived run during cleanup");
        Ok(())
    }

    fn repoint_current(&self, deleted: &[RunId], best_run: Option<&str>) -> Result<(), RunsError> {
        let Some(pointer) = self.kv.lookup_as::<String>(CURRENT_RUN_KEY).found() else {
            return Ok(());
        };
        if !deleted.contains(&pointer) {
            return Ok(());
        }

        match best_run {
            Some(best) => {
                self.kv.update(CURRENT_RUN_KEY, |current| {
                    (current.as_ref().and_then(Value::as_str) == Some(pointer.as_str()))
                        .then(|| Value::String(best.to_owned()))
                })?;
            }
            None => {
                self.kv.delete_if(CURRENT_RUN_KEY, &pointer)?;
            }
        }
        tracing::info!(from = %pointer, to = ?best_run, "moved current run pointer off deleted run");
        Ok(())
    }
}
