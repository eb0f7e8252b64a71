use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

mod keys;
mod secret;

pub use keys::{
    CURRENT_RUN_KEY, REGISTRY_KEY, collection_key, item_key, item_prefix, legacy_collection_keys,
    meta_key, run_prefix,
};
pub use secret::Secret;

pub type RunId = String;

/// Reserved id of the pseudo-run holding data written before runs were namespaced.
pub const LEGACY_RUN_ID: &str = "legacy";
pub const LATEST_ALIAS: &str = "latest";
pub const MAX_RUN_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("run id must not be empty")]
    EmptyRunId,
    #[error("run id is longer than {MAX_RUN_ID_LEN} characters")]
    RunIdTooLong,
    #[error("run id '{0}' contains characters outside [A-Za-z0-9._-]")]
    InvalidRunId(String),
}

/// Validates an externally supplied run id.
///
/// Ids end up inside `run:{id}:` key prefixes, so `:` and whitespace are
/// rejected; otherwise one run's prefix could cover another run's keys.
pub fn validate_run_id(raw: &str) -> Result<RunId, CoreError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CoreError::EmptyRunId);
    }
    if trimmed.chars().count() > MAX_RUN_ID_LEN {
        return Err(CoreError::RunIdTooLong);
    }
    let valid = trimmed
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'));
    if !valid {
        return Err(CoreError::InvalidRunId(trimmed.to_owned()));
    }

    Ok(trimmed.to_owned())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Archived,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Archived => "archived",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "archived" => Ok(Self::Archived),
            other => Err(format!(
                "invalid run status '{other}', expected one of: running, completed, failed, archived"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Baseline,
    Experimental,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Experimental => "experimental",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    Started,
    Completed,
    Failed,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    pub event: RunEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
}

impl RunEvent {
    /// The metadata patch this lifecycle event stands for.
    pub fn to_patch(&self) -> Map<String, Value> {
        let at = self.at.clone().unwrap_or_else(now_iso);
        let (status, time_field) = match self.event {
            RunEventKind::Started => (RunStatus::Running, "started_at"),
            RunEventKind::Completed => (RunStatus::Completed, "ended_at"),
            RunEventKind::Failed => (RunStatus::Failed, "ended_at"),
            RunEventKind::Archived => (RunStatus::Archived, "archived_at"),
        };

        let mut patch = Map::new();
        patch.insert("status".to_owned(), Value::String(status.as_str().to_owned()));
        patch.insert(time_field.to_owned(), Value::String(at));
        patch
    }
}

/// Listing field computed from the run's data; never stored in metadata.
pub const EVALUATION_COUNT_FIELD: &str = "evaluation_count";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub id: RunId,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<RunKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_input: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_output: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_prs_seen: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_prs_scored: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RunMeta {
    /// Minimal record written when a run id is first registered.
    pub fn new(id: impl Into<RunId>) -> Self {
        let id = id.into();
        let timestamp = derive_timestamp(&id);
        Self {
            id,
            timestamp,
            status: None,
            kind: None,
            prompt_version: None,
            prompt_hash: None,
            model_name: None,
            token_input: None,
            token_output: None,
            cost_usd: None,
            started_at: None,
            ended_at: None,
            total_prs_seen: None,
            total_prs_scored: None,
            extra: Map::new(),
        }
    }

    /// Shallow-merges `patch` over this record. `id` always stays fixed and a
    /// patch can replace `timestamp` but never blank it out.
    pub fn merge_patch(&self, patch: &Map<String, Value>) -> Result<Self, serde_json::Error> {
        let mut merged = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (key, value) in patch {
            merged.insert(key.clone(), value.clone());
        }

        merged.insert("id".to_owned(), Value::String(self.id.clone()));
        merged.remove(EVALUATION_COUNT_FIELD);
        let has_timestamp = matches!(
            merged.get("timestamp"),
            Some(Value::String(timestamp)) if !timestamp.trim().is_empty()
        );
        if !has_timestamp {
            merged.insert(
                "timestamp".to_owned(),
                Value::String(self.timestamp.clone()),
            );
        }

        serde_json::from_value(Value::Object(merged))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    Summary,
    Evaluations,
    Clusters,
    Ranking,
    Trace,
    PromptBundle,
}

impl CollectionKind {
    pub const ALL: [CollectionKind; 6] = [
        Self::Summary,
        Self::Evaluations,
        Self::Clusters,
        Self::Ranking,
        Self::Trace,
        Self::PromptBundle,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Evaluations => "evaluations",
            Self::Clusters => "clusters",
            Self::Ranking => "ranking",
            Self::Trace => "trace",
            Self::PromptBundle => "prompt_bundle",
        }
    }

    /// Segment used inside `run:{id}:{segment}` keys.
    pub fn key_segment(self) -> &'static str {
        match self {
            Self::Trace => "agent_trace",
            other => other.as_str(),
        }
    }

    /// Un-namespaced key used by the legacy scope, if the collection has one.
    pub fn legacy_key(self) -> Option<&'static str> {
        match self {
            Self::Summary => Some("summary"),
            Self::Evaluations => Some("evaluations"),
            Self::Clusters => Some("clusters"),
            Self::Ranking => Some("ranking"),
            Self::Trace => Some("agent_trace"),
            Self::PromptBundle => None,
        }
    }

    /// Keyed collections store one row per item for namespaced runs.
    pub fn item_segment(self) -> Option<&'static str> {
        match self {
            Self::Evaluations => Some("eval"),
            Self::Clusters => Some("cluster"),
            _ => None,
        }
    }

    pub fn is_singleton(self) -> bool {
        matches!(self, Self::Summary | Self::Ranking | Self::PromptBundle)
    }
}

impl std::str::FromStr for CollectionKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value.trim())
            .ok_or_else(|| format!("unknown collection '{}'", value.trim()))
    }
}

/// Which run a request addresses, decided once at the API boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunSelector {
    Explicit(RunId),
    Latest,
    Legacy,
}

impl RunSelector {
    /// Blank, missing, and `latest` all mean "no explicit run".
    pub fn parse(raw: Option<&str>) -> Result<Self, CoreError> {
        let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
            return Ok(Self::Latest);
        };

        match raw {
            LATEST_ALIAS => Ok(Self::Latest),
            LEGACY_RUN_ID => Ok(Self::Legacy),
            other => validate_run_id(other).map(Self::Explicit),
        }
    }
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Ids that are millisecond timestamps carry their own creation instant;
/// anything else is stamped with the current time.
pub fn derive_timestamp(run_id: &str) -> String {
    let from_id = run_id
        .parse::<i64>()
        .ok()
        .filter(|millis| *millis > 0)
        .and_then(DateTime::<Utc>::from_timestamp_millis);

    match from_id {
        Some(instant) => instant.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => now_iso(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn validate_run_id_trims_and_rejects_separators() {
        assert_eq!(
            validate_run_id("  1700000000000 ").expect("valid id"),
            "1700000000000"
        );
        assert_eq!(
            validate_run_id("nightly-2024.06_a").expect("valid label"),
            "nightly-2024.06_a"
        );
        assert_eq!(validate_run_id("   "), Err(CoreError::EmptyRunId));
        assert!(matches!(
            validate_run_id("run:evil"),
            Err(CoreError::InvalidRunId(_))
        ));
        assert!(matches!(
            validate_run_id("two words"),
            Err(CoreError::InvalidRunId(_))
        ));
        assert_eq!(
            validate_run_id(&"a".repeat(MAX_RUN_ID_LEN + 1)),
            Err(CoreError::RunIdTooLong)
        );
    }

    #[test]
    fn selector_parse_maps_sentinels() {
        assert_eq!(RunSelector::parse(None), Ok(RunSelector::Latest));
        assert_eq!(RunSelector::parse(Some("")), Ok(RunSelector::Latest));
        assert_eq!(RunSelector::parse(Some("latest")), Ok(RunSelector::Latest));
        assert_eq!(RunSelector::parse(Some("legacy")), Ok(RunSelector::Legacy));
        assert_eq!(
            RunSelector::parse(Some("1700000000000")),
            Ok(RunSelector::Explicit("1700000000000".to_owned()))
        );
        assert!(RunSelector::parse(Some("a:b")).is_err());
    }

    #[test]
    fn derive_timestamp_reads_millisecond_ids() {
        assert_eq!(derive_timestamp("1700000000000"), "2023-11-14T22:13:20.000Z");
        assert!(derive_timestamp("nightly").ends_with('Z'));
    }

    #[test]
    fn merge_patch_keeps_id_and_timestamp() {
        let meta = RunMeta::new("1700000000000");
        let patch = json!({
            "id": "someone-else",
            "timestamp": null,
            "status": "completed",
            "model_name": "m-1",
            "config_snapshot": {"depth": 2}
        });
        let Value::Object(patch) = patch else {
            panic!("patch should be an object");
        };

        let merged = meta.merge_patch(&patch).expect("merge patch");

        assert_eq!(merged.id, "1700000000000");
        assert_eq!(merged.timestamp, meta.timestamp);
        assert_eq!(merged.status, Some(RunStatus::Completed));
        assert_eq!(merged.model_name.as_deref(), Some("m-1"));
        assert_eq!(merged.extra.get("config_snapshot"), Some(&json!({"depth": 2})));
    }

    #[test]
    fn merge_patch_drops_computed_listing_fields() {
        let Value::Object(patch) = json!({"evaluation_count": 99, "note": "x"}) else {
            panic!("patch should be an object");
        };

        let merged = RunMeta::new("r1").merge_patch(&patch).expect("merge patch");

        assert!(!merged.extra.contains_key(EVALUATION_COUNT_FIELD));
        assert_eq!(merged.extra.get("note"), Some(&json!("x")));
    }

    #[test]
    fn merge_patch_rejects_unknown_status() {
        let meta = RunMeta::new("r1");
        let Value::Object(patch) = json!({"status": "paused"}) else {
            panic!("patch should be an object");
        };

        assert!(meta.merge_patch(&patch).is_err());
    }

    #[test]
    fn run_event_maps_to_status_patch() {
        let event = RunEvent {
            event: RunEventKind::Failed,
            at: Some("2024-01-01T00:00:00.000Z".to_owned()),
        };

        let patch = event.to_patch();

        assert_eq!(patch.get("status"), Some(&json!("failed")));
        assert_eq!(patch.get("ended_at"), Some(&json!("2024-01-01T00:00:00.000Z")));
    }

    #[test]
    fn collection_kind_segments() {
        assert_eq!(CollectionKind::Trace.key_segment(), "agent_trace");
        assert_eq!(CollectionKind::PromptBundle.legacy_key(), None);
        assert_eq!(CollectionKind::Evaluations.item_segment(), Some("eval"));
        assert!(CollectionKind::Ranking.is_singleton());
        assert_eq!(
            "prompt_bundle".parse::<CollectionKind>(),
            Ok(CollectionKind::PromptBundle)
        );
    }
}
