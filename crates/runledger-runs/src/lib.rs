use runledger_core::{CoreError, LEGACY_RUN_ID, RunId, RunSelector};
use runledger_store::{KvStore, Unavailable};
use thiserror::Error;

mod collections;
mod compare;
mod ingest;
mod latest;
mod legacy;
mod pointer;
mod registry;
mod retention;

pub use collections::{UpsertOutcome, UpsertSummary, cluster_key, evaluation_key};
pub use compare::{ComparisonRow, RunComparison, RunSide, compare_evaluations, comparison_score};
pub use ingest::{PushKind, PushOutcome, PushPayload, PushRequest, TRACE_STEP_TYPES};
pub use pointer::StartRun;
pub use registry::{RunListing, RunSummary};
pub use retention::{CleanupReport, RetentionPolicy};

#[derive(Debug, Error)]
pub enum RunsError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid run id: {0}")]
    RunId(#[from] CoreError),
    #[error(transparent)]
    Unavailable(#[from] Unavailable),
}

/// Run-scoped result store: every operation is expressed through the key
/// scheme on top of a [`KvStore`].
#[derive(Debug, Clone)]
pub struct RunStore {
    kv: KvStore,
}

impl RunStore {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    /// Concrete run a read addresses. `Latest` falls back to the legacy scope
    /// when no run exists at all.
    pub fn resolve_read(&self, selector: &RunSelector) -> RunId {
        match selector {
            RunSelector::Explicit(run_id) => run_id.clone(),
            RunSelector::Legacy => LEGACY_RUN_ID.to_owned(),
            RunSelector::Latest => self
                .latest_run_id()
                .unwrap_or_else(|| LEGACY_RUN_ID.to_owned()),
        }
    }

    /// Concrete run a write addresses. `Latest` means the current run,
    /// allocating one on first use.
    pub fn resolve_write(&self, selector: &RunSelector) -> Result<RunId, RunsError> {
        match selector {
            RunSelector::Explicit(run_id) => Ok(run_id.clone()),
            RunSelector::Legacy => Ok(LEGACY_RUN_ID.to_owned()),
            RunSelector::Latest => self.current_or_create_run_id(),
        }
    }
}

pub(crate) fn invalid(message: impl Into<String>) -> RunsError {
    RunsError::InvalidInput(message.into())
}
