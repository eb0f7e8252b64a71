use runledger_core::{CollectionKind, LEGACY_RUN_ID, collection_key, item_key, item_prefix};
use runledger_store::Lookup;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{RunStore, RunsError, invalid};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub replaced: usize,
}

impl UpsertSummary {
    pub(crate) fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Replaced => self.replaced += 1,
        }
    }
}

/// `pr_number` of an evaluation, accepting integral floats and numeric strings.
pub fn evaluation_key(evaluation: &Value) -> Option<i64> {
    match evaluation.get("pr_number")? {
        Value::Number(number) => integer_from_number(number),
        Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }
}

/// Exact integer value of a JSON number. Fractional floats and floats outside
/// the `i64` range are rejected rather than rounded or saturated.
pub(crate) fn integer_from_number(number: &serde_json::Number) -> Option<i64> {
    if let Some(value) = number.as_i64() {
        return Some(value);
    }
    // 2^63 is exactly representable; every float below it fits in an i64.
    const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;
    number
        .as_f64()
        .filter(|value| value.fract() == 0.0 && *value >= -I64_BOUND && *value < I64_BOUND)
        .map(|value| value as i64)
}

/// Identity of a cluster: `cluster_id`, `id`, or `name`; otherwise a content
/// fingerprint so re-pushing an identical cluster is a replace.
pub fn cluster_key(cluster: &Value) -> String {
    for field in ["cluster_id", "id", "name"] {
        match cluster.get(field) {
            Some(Value::String(raw)) if !raw.trim().is_empty() => return raw.trim().to_owned(),
            Some(Value::Number(number)) => return number.to_string(),
            _ => {}
        }
    }

    let canonical = serde_json::to_string(cluster).unwrap_or_default();
    let digest = format!("{:x}", Sha256::digest(canonical.as_bytes()));
    format!("fp-{}", &digest[..16])
}

fn single_outcome(summary: UpsertSummary) -> UpsertOutcome {
    if summary.replaced > 0 {
        UpsertOutcome::Replaced
    } else {
        UpsertOutcome::Inserted
    }
}

fn is_legacy(run_id: &str) -> bool {
    run_id == LEGACY_RUN_ID
}

fn document_key(run_id: &str, kind: CollectionKind) -> Result<String, RunsError> {
    collection_key(run_id, kind).ok_or_else(|| {
        invalid(format!(
            "run '{run_id}' has no {} collection",
            kind.as_str()
        ))
    })
}

impl RunStore {
    pub fn write_summary(&self, run_id: &str, summary: &Value) -> Result<(), RunsError> {
        self.write_document(run_id, CollectionKind::Summary, summary)
    }

    pub fn write_ranking(&self, run_id: &str, ranking: &Value) -> Result<(), RunsError> {
        self.write_document(run_id, CollectionKind::Ranking, ranking)
    }

    /// Replaces the whole trace; producers resend the full step list.
    pub fn write_trace(&self, run_id: &str, steps: &[Value]) -> Result<(), RunsError> {
        self.write_document(run_id, CollectionKind::Trace, &Value::from(steps.to_vec()))
    }

    pub fn write_prompt_bundle(&self, run_id: &str, bundle: &Value) -> Result<(), RunsError> {
        self.write_document(run_id, CollectionKind::PromptBundle, bundle)
    }

    fn write_document(
        &self,
        run_id: &str,
        kind: CollectionKind,
        document: &Value,
    ) -> Result<(), RunsError> {
        let key = document_key(run_id, kind)?;
        self.ensure_run(run_id)?;
        self.kv.set(&key, document)?;
        Ok(())
    }

    pub fn upsert_evaluation(
        &self,
        run_id: &str,
        evaluation: Value,
    ) -> Result<UpsertOutcome, RunsError> {
        let summary = self.upsert_evaluations(run_id, vec![evaluation])?;
        Ok(single_outcome(summary))
    }

    /// Upserts a batch atomically. Every item must carry a `pr_number`;
    /// otherwise nothing is written.
    pub fn upsert_evaluations(
        &self,
        run_id: &str,
        evaluations: Vec<Value>,
    ) -> Result<UpsertSummary, RunsError> {
        let items = evaluations
            .into_iter()
            .map(|evaluation| {
                let pr_number = evaluation_key(&evaluation)
                    .ok_or_else(|| invalid("evaluation requires an integer pr_number"))?;
                Ok((pr_number.to_string(), evaluation))
            })
            .collect::<Result<Vec<_>, RunsError>>()?;

        self.upsert_items(run_id, CollectionKind::Evaluations, items, |existing| {
            evaluation_key(existing).map(|pr_number| pr_number.to_string())
        })
    }

    pub fn upsert_cluster(&self, run_id: &str, cluster: Value) -> Result<UpsertOutcome, RunsError> {
        let summary = self.upsert_clusters(run_id, vec![cluster])?;
        Ok(single_outcome(summary))
    }

    pub fn upsert_clusters(
        &self,
        run_id: &str,
        clusters: Vec<Value>,
    ) -> Result<UpsertSummary, RunsError> {
        let items = clusters
            .into_iter()
            .map(|cluster| (cluster_key(&cluster), cluster))
            .collect();

        self.upsert_items(run_id, CollectionKind::Clusters, items, |existing| {
            Some(cluster_key(existing))
        })
    }

    /// Namespaced runs keep one row per item and write the whole batch in one
    /// transaction. The legacy scope still holds one document per collection
    /// and is rewritten whole inside an atomic update.
    fn upsert_items(
        &self,
        run_id: &str,
        kind: CollectionKind,
        items: Vec<(String, Value)>,
        identity: impl Fn(&Value) -> Option<String>,
    ) -> Result<UpsertSummary, RunsError> {
        let mut summary = UpsertSummary::default();
        if items.is_empty() {
            return Ok(summary);
        }
        self.ensure_run(run_id)?;

        if is_legacy(run_id) {
            let key = document_key(run_id, kind)?;
            self.kv.update(&key, |current| {
                summary = UpsertSummary::default();
                let mut stored = match current {
                    Some(Value::Array(stored)) => stored,
                    _ => Vec::new(),
                };
                for (item, value) in &items {
                    let position = stored
                        .iter()
                        .position(|existing| identity(existing).as_deref() == Some(item.as_str()));
                    match position {
                        Some(index) => {
                            stored[index] = value.clone();
                            summary.record(UpsertOutcome::Replaced);
                        }
                        None => {
                            stored.push(value.clone());
                            summary.record(UpsertOutcome::Inserted);
                        }
                    }
                }
                Some(Value::Array(stored))
            })?;
            return Ok(summary);
        }

        let rows = items
            .into_iter()
            .map(|(item, value)| {
                item_key(run_id, kind, &item)
                    .map(|key| (key, value))
                    .ok_or_else(|| invalid(format!("{} is not a keyed collection", kind.as_str())))
            })
            .collect::<Result<Vec<_>, RunsError>>()?;

        for existed in self.kv.set_many(&rows)? {
            summary.record(if existed {
                UpsertOutcome::Replaced
            } else {
                UpsertOutcome::Inserted
            });
        }
        Ok(summary)
    }

    pub fn summary(&self, run_id: &str) -> Lookup<Value> {
        self.read_document(run_id, CollectionKind::Summary)
    }

    pub fn ranking(&self, run_id: &str) -> Lookup<Value> {
        self.read_document(run_id, CollectionKind::Ranking)
    }

    pub fn prompt_bundle(&self, run_id: &str) -> Lookup<Value> {
        self.read_document(run_id, CollectionKind::PromptBundle)
    }

    pub fn trace(&self, run_id: &str) -> Lookup<Vec<Value>> {
        self.read_sequence(run_id, CollectionKind::Trace)
    }

    pub fn evaluations(&self, run_id: &str) -> Lookup<Vec<Value>> {
        self.read_items(run_id, CollectionKind::Evaluations)
    }

    pub fn clusters(&self, run_id: &str) -> Lookup<Vec<Value>> {
        self.read_items(run_id, CollectionKind::Clusters)
    }

    /// Reads any collection as a single JSON value; sequences come back as arrays.
    pub fn read_collection(&self, run_id: &str, kind: CollectionKind) -> Lookup<Value> {
        match kind {
            CollectionKind::Summary | CollectionKind::Ranking | CollectionKind::PromptBundle => {
                self.read_document(run_id, kind)
            }
            CollectionKind::Trace => self.trace(run_id).map(Value::from),
            CollectionKind::Evaluations | CollectionKind::Clusters => {
                self.read_items(run_id, kind).map(Value::from)
            }
        }
    }

    pub fn evaluation_count(&self, run_id: &str) -> usize {
        if is_legacy(run_id) {
            return self
                .evaluations(run_id)
                .found()
                .map_or(0, |items| items.len());
        }

        item_prefix(run_id, CollectionKind::Evaluations)
            .map_or(0, |prefix| self.kv.count(&prefix).unwrap_or(0))
    }

    fn read_document(&self, run_id: &str, kind: CollectionKind) -> Lookup<Value> {
        match collection_key(run_id, kind) {
            Some(key) => self.kv.lookup(&key),
            None => Lookup::NotFound,
        }
    }

    fn read_sequence(&self, run_id: &str, kind: CollectionKind) -> Lookup<Vec<Value>> {
        match self.read_document(run_id, kind) {
            Lookup::Found(Value::Array(items)) => Lookup::Found(items),
            Lookup::Found(_) | Lookup::NotFound => Lookup::NotFound,
            Lookup::Unavailable => Lookup::Unavailable,
        }
    }

    fn read_items(&self, run_id: &str, kind: CollectionKind) -> Lookup<Vec<Value>> {
        if is_legacy(run_id) {
            return self.read_sequence(run_id, kind);
        }

        match item_prefix(run_id, kind) {
            Some(prefix) => self
                .kv
                .scan(&prefix)
                .map(|rows| rows.into_iter().map(|row| row.value).collect()),
            None => Lookup::NotFound,
        }
    }

    /// Removes every collection of a run but keeps its metadata and registry entry.
    pub(crate) fn prune_collections(&self, run_id: &str) -> Result<(), RunsError> {
        for kind in CollectionKind::ALL {
            if !is_legacy(run_id) {
                if let Some(prefix) = item_prefix(run_id, kind) {
                    self.kv.delete_prefix(&prefix)?;
                }
            }
            if let Some(key) = collection_key(run_id, kind) {
                self.kv.delete(&key)?;
            }
        }
        Ok(())
    }
}
