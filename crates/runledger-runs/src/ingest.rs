use runledger_core::{RunId, RunSelector};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collections::{UpsertSummary, integer_from_number};
use crate::{RunStore, RunsError, invalid};

pub const TRACE_STEP_TYPES: [&str; 5] = [
    "llm_response",
    "code_execution",
    "iteration_complete",
    "subcall_start",
    "subcall_complete",
];

const UNTITLED: &str = "(untitled PR)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushKind {
    Summary,
    Evaluation,
    EvaluationsBatch,
    Clusters,
    Ranking,
    Trace,
}

impl PushKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Evaluation => "evaluation",
            Self::EvaluationsBatch => "evaluations_batch",
            Self::Clusters => "clusters",
            Self::Ranking => "ranking",
            Self::Trace => "trace",
        }
    }
}

/// Producer write: `{run_id?, type, data}`. A missing or `latest` run id
/// writes to the current run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PushRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: PushKind,
    #[serde(default)]
    pub data: Value,
}

/// A push whose data has been checked and normalised for its collection.
#[derive(Debug, Clone, PartialEq)]
pub enum PushPayload {
    Summary(Value),
    Evaluation(Value),
    EvaluationsBatch(Vec<Value>),
    Clusters(Vec<Value>),
    Ranking(Value),
    Trace(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushOutcome {
    pub run_id: RunId,
    pub kind: PushKind,
    pub items: usize,
    pub inserted: usize,
    pub replaced: usize,
}

impl PushPayload {
    pub fn validate(kind: PushKind, data: Value) -> Result<Self, RunsError> {
        match kind {
            PushKind::Summary => Ok(Self::Summary(require_object(kind, data)?)),
            PushKind::Ranking => Ok(Self::Ranking(require_object(kind, data)?)),
            PushKind::Evaluation => Ok(Self::Evaluation(normalize_evaluation(data)?)),
            PushKind::EvaluationsBatch => {
                let evaluations = require_array(kind, data)?
                    .into_iter()
                    .map(normalize_evaluation)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::EvaluationsBatch(evaluations))
            }
            PushKind::Clusters => {
                let clusters = match data {
                    Value::Object(_) => vec![data],
                    other => require_array(kind, other)?,
                };
                if clusters.iter().any(|cluster| !cluster.is_object()) {
                    return Err(invalid("every cluster must be an object"));
                }
                Ok(Self::Clusters(clusters))
            }
            PushKind::Trace => {
                let steps = require_array(kind, data)?
                    .into_iter()
                    .map(normalize_trace_step)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::Trace(steps))
            }
        }
    }

    pub fn kind(&self) -> PushKind {
        match self {
            Self::Summary(_) => PushKind::Summary,
            Self::Evaluation(_) => PushKind::Evaluation,
            Self::EvaluationsBatch(_) => PushKind::EvaluationsBatch,
            Self::Clusters(_) => PushKind::Clusters,
            Self::Ranking(_) => PushKind::Ranking,
            Self::Trace(_) => PushKind::Trace,
        }
    }
}

impl RunStore {
    /// Validates first, so a malformed push never allocates a run.
    pub fn apply_push(&self, request: PushRequest) -> Result<PushOutcome, RunsError> {
        let payload = PushPayload::validate(request.kind, request.data)?;
        let selector = RunSelector::parse(request.run_id.as_deref())?;
        let run_id = self.resolve_write(&selector)?;
        self.write_payload(&run_id, payload)
    }

    pub fn write_payload(&self, run_id: &str, payload: PushPayload) -> Result<PushOutcome, RunsError> {
        let kind = payload.kind();
        let (items, summary) = match payload {
            PushPayload::Summary(summary) => {
                self.write_summary(run_id, &summary)?;
                (1, UpsertSummary::default())
            }
            PushPayload::Ranking(ranking) => {
                self.write_ranking(run_id, &ranking)?;
                (1, UpsertSummary::default())
            }
            PushPayload::Trace(steps) => {
                self.write_trace(run_id, &steps)?;
                (steps.len(), UpsertSummary::default())
            }
            PushPayload::Evaluation(evaluation) => {
                let mut summary = UpsertSummary::default();
                summary.record(self.upsert_evaluation(run_id, evaluation)?);
                (1, summary)
            }
            PushPayload::EvaluationsBatch(evaluations) => {
                let items = evaluations.len();
                (items, self.upsert_evaluations(run_id, evaluations)?)
            }
            PushPayload::Clusters(clusters) => {
                let items = clusters.len();
                (items, self.upsert_clusters(run_id, clusters)?)
            }
        };

        tracing::debug!(run_id, kind = kind.as_str(), items, "applied push");
        Ok(PushOutcome {
            run_id: run_id.to_owned(),
            kind,
            items,
            inserted: summary.inserted,
            replaced: summary.replaced,
        })
    }
}

fn require_object(kind: PushKind, data: Value) -> Result<Value, RunsError> {
    if data.is_object() {
        return Ok(data);
    }
    Err(invalid(format!("{} data must be an object", kind.as_str())))
}

fn require_array(kind: PushKind, data: Value) -> Result<Vec<Value>, RunsError> {
    match data {
        Value::Array(items) => Ok(items),
        _ => Err(invalid(format!("{} data must be an array", kind.as_str()))),
    }
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => integer_from_number(number),
        Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }
}

fn non_empty_text(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_owned)
}

fn normalize_evaluation(data: Value) -> Result<Value, RunsError> {
    let Value::Object(mut fields) = data else {
        return Err(invalid("evaluation must be an object"));
    };

    let pr_number = fields
        .get("pr_number")
        .or_else(|| fields.get("number"))
        .and_then(integer)
        .filter(|number| *number >= 1)
        .ok_or_else(|| invalid("evaluation requires a positive integer pr_number"))?;
    fields.insert("pr_number".to_owned(), Value::from(pr_number));

    let title = non_empty_text(fields.get("title")).unwrap_or_else(|| UNTITLED.to_owned());
    fields.insert("title".to_owned(), Value::String(title));

    if non_empty_text(fields.get("review_summary")).is_none() {
        let fallback = ["summary", "reasoning"]
            .into_iter()
            .find_map(|field| non_empty_text(fields.get(field)));
        if let Some(review_summary) = fallback {
            fields.insert("review_summary".to_owned(), Value::String(review_summary));
        }
    }

    if let Some(Value::Array(labels)) = fields.get("labels") {
        let labels: Vec<Value> = labels
            .iter()
            .filter_map(|label| match label {
                Value::String(text) => Some(text.trim().to_lowercase()),
                Value::Number(number) => Some(number.to_string()),
                _ => None,
            })
            .filter(|label| !label.is_empty())
            .map(Value::String)
            .collect();
        fields.insert("labels".to_owned(), Value::Array(labels));
    }

    Ok(Value::Object(fields))
}

fn normalize_trace_step(step: Value) -> Result<Value, RunsError> {
    let Value::Object(mut fields) = step else {
        return Err(invalid("trace steps must be objects"));
    };

    let iteration = fields.get("iteration").and_then(integer).unwrap_or(1).max(1);
    fields.insert("iteration".to_owned(), Value::from(iteration));

    let step_type = fields
        .get("type")
        .and_then(Value::as_str)
        .map(|raw| raw.trim().to_lowercase())
        .filter(|raw| TRACE_STEP_TYPES.contains(&raw.as_str()))
        .unwrap_or_else(|| TRACE_STEP_TYPES[0].to_owned());
    fields.insert("type".to_owned(), Value::String(step_type));

    let content = match fields.remove("content") {
        Some(Value::String(text)) => text,
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    fields.insert("content".to_owned(), Value::String(content));

    Ok(Value::Object(fields))
}
