use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use runledger_core::{
    EVALUATION_COUNT_FIELD, REGISTRY_KEY, RunEvent, RunId, RunMeta, meta_key, now_millis,
};
use runledger_store::{Lookup, Unavailable};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{RunStore, RunsError, invalid};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    #[serde(flatten)]
    pub meta: RunMeta,
    pub evaluation_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunListing {
    pub runs: Vec<RunSummary>,
    pub current_run: Option<RunId>,
    pub latest_run: Option<RunId>,
    pub degraded: bool,
}

impl RunStore {
    /// Registered run ids, adopting legacy data first when the registry is empty.
    pub fn list_run_ids(&self) -> Vec<RunId> {
        self.list_run_ids_lookup().unwrap_or_default()
    }

    pub fn list_run_ids_lookup(&self) -> Lookup<Vec<RunId>> {
        match self.registered_ids() {
            Lookup::Found(ids) if !ids.is_empty() => return Lookup::Found(ids),
            Lookup::Unavailable => return Lookup::Unavailable,
            Lookup::Found(_) | Lookup::NotFound => {}
        }

        self.migrate_legacy_if_needed();
        match self.registered_ids() {
            Lookup::NotFound => Lookup::Found(Vec::new()),
            other => other,
        }
    }

    pub(crate) fn registered_ids(&self) -> Lookup<Vec<RunId>> {
        self.kv
            .lookup(REGISTRY_KEY)
            .map(|value| decode_ids(Some(value)))
    }

    /// Registers `run_id` with a minimal metadata record if it is unknown.
    /// Metadata is written before the registry entry, so a listed run always
    /// has a record.
    pub fn ensure_run(&self, run_id: &str) -> Result<(), RunsError> {
        if self.list_run_ids().iter().any(|id| id == run_id) {
            return Ok(());
        }

        let fresh = serde_json::to_value(RunMeta::new(run_id))
            .map_err(|err| invalid(format!("run metadata failed to serialize: {err}")))?;
        self.kv.update(&meta_key(run_id), |current| match current {
            Some(_) => None,
            None => Some(fresh.clone()),
        })?;

        let mut added = false;
        self.kv.update(REGISTRY_KEY, |current| {
            let mut ids = decode_ids(current);
            if ids.iter().any(|id| id == run_id) {
                return None;
            }
            ids.push(run_id.to_owned());
            added = true;
            Some(Value::from(ids))
        })?;

        if added {
            tracing::info!(run_id, "registered run");
        }
        Ok(())
    }

    pub fn run_meta(&self, run_id: &str) -> Lookup<RunMeta> {
        self.kv.lookup_as(&meta_key(run_id))
    }

    /// Merges `patch` into the run's metadata, creating the run if needed.
    /// A patch that would not produce a valid record is rejected before any
    /// write happens.
    pub fn set_run_meta(
        &self,
        run_id: &str,
        patch: &Map<String, Value>,
    ) -> Result<RunMeta, RunsError> {
        RunMeta::new(run_id)
            .merge_patch(patch)
            .map_err(|err| invalid(format!("invalid run metadata: {err}")))?;

        self.ensure_run(run_id)?;

        let mut merged: Option<RunMeta> = None;
        self.kv.update(&meta_key(run_id), |current| {
            let mut base = current
                .and_then(|value| serde_json::from_value::<RunMeta>(value).ok())
                .unwrap_or_else(|| RunMeta::new(run_id));
            base.id = run_id.to_owned();

            let next = base.merge_patch(patch).ok()?;
            let value = serde_json::to_value(&next).ok()?;
            merged = Some(next);
            Some(value)
        })?;

        merged.ok_or(RunsError::Unavailable(Unavailable))
    }

    pub fn append_run_event(&self, run_id: &str, event: &RunEvent) -> Result<RunMeta, RunsError> {
        self.set_run_meta(run_id, &event.to_patch())
    }

    /// Metadata of every registered run, newest first.
    pub(crate) fn runs_by_recency(&self) -> Lookup<Vec<RunMeta>> {
        self.list_run_ids_lookup().map(|ids| {
            let mut runs: Vec<RunMeta> = ids
                .iter()
                .map(|id| self.run_meta(id).found().unwrap_or_else(|| RunMeta::new(id.as_str())))
                .collect();
            runs.sort_by(newest_first);
            runs
        })
    }

    pub fn list_runs(&self) -> RunListing {
        let runs = self.runs_by_recency();
        let degraded = runs.is_unavailable();
        let runs = runs
            .unwrap_or_default()
            .into_iter()
            .map(|mut meta| {
                meta.extra.remove(EVALUATION_COUNT_FIELD);
                let evaluation_count = self.evaluation_count(&meta.id);
                RunSummary {
                    meta,
                    evaluation_count,
                }
            })
            .collect();

        RunListing {
            runs,
            current_run: self.current_run_id(),
            latest_run: self.latest_run_id(),
            degraded,
        }
    }

    /// Millisecond-timestamp id not yet registered.
    pub(crate) fn allocate_run_id(&self) -> RunId {
        let taken: HashSet<RunId> = self.list_run_ids().into_iter().collect();
        let mut candidate = now_millis();
        while taken.contains(&candidate.to_string()) {
            candidate += 1;
        }
        candidate.to_string()
    }
}

pub(crate) fn decode_ids(value: Option<Value>) -> Vec<RunId> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(id) => Some(id),
            _ => None,
        })
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|instant| instant.with_timezone(&Utc))
}

fn newest_first(left: &RunMeta, right: &RunMeta) -> Ordering {
    let left_at = parse_timestamp(&left.timestamp);
    let right_at = parse_timestamp(&right.timestamp);
    right_at
        .cmp(&left_at)
        .then_with(|| right.id.cmp(&left.id))
}
