use runledger_core::{
    CURRENT_RUN_KEY, LEGACY_RUN_ID, REGISTRY_KEY, RunId, RunMeta, meta_key, validate_run_id,
};
use runledger_store::Lookup;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::registry::decode_ids;
use crate::{RunStore, RunsError, invalid};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StartRun {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub meta: Option<Map<String, Value>>,
    #[serde(default)]
    pub prompt_bundle: Option<Value>,
}

impl RunStore {
    /// The pointed-to run, only while it is still registered. A dangling
    /// pointer is cleared and reported as `None`; the clear only removes the
    /// value that was seen, so a pointer republished meanwhile survives.
    pub fn current_run_id(&self) -> Option<RunId> {
        let pointer = self.kv.lookup_as::<String>(CURRENT_RUN_KEY).found()?;

        match self.list_run_ids_lookup() {
            Lookup::Found(ids) if ids.contains(&pointer) => Some(pointer),
            Lookup::Found(_) | Lookup::NotFound => {
                match self.kv.delete_if(CURRENT_RUN_KEY, &pointer) {
                    Ok(true) => {
                        tracing::info!(run_id = %pointer, "cleared current run pointer naming an unknown run");
                    }
                    Ok(false) => {}
                    Err(_) => {
                        tracing::warn!(run_id = %pointer, "failed to clear dangling current run pointer");
                    }
                }
                None
            }
            Lookup::Unavailable => None,
        }
    }

    /// The current run, allocating one when there is none. A fresh run is
    /// registered before the pointer names it.
    pub fn current_or_create_run_id(&self) -> Result<RunId, RunsError> {
        if let Some(run_id) = self.current_run_id() {
            return Ok(run_id);
        }

        let candidate = self.allocate_run_id();
        self.ensure_run(&candidate)?;

        let mut chosen = candidate.clone();
        let published = self.kv.update(CURRENT_RUN_KEY, |current| {
            match current.as_ref().and_then(Value::as_str) {
                Some(existing) => {
                    chosen = existing.to_owned();
                    None
                }
                None => {
                    chosen = candidate.clone();
                    Some(Value::String(candidate.clone()))
                }
            }
        });
        if let Err(err) = published {
            self.unregister_unused_run(&candidate);
            return Err(err.into());
        }

        if chosen == candidate {
            tracing::info!(run_id = %chosen, "allocated current run");
        } else {
            self.unregister_unused_run(&candidate);
            self.ensure_run(&chosen)?;
        }
        Ok(chosen)
    }

    /// Best-effort removal of a run this process registered but never used.
    fn unregister_unused_run(&self, run_id: &str) {
        let removed = self.kv.update(REGISTRY_KEY, |current| {
            let ids = decode_ids(current);
            if !ids.iter().any(|id| id == run_id) {
                return None;
            }
            let kept: Vec<RunId> = ids.into_iter().filter(|id| id != run_id).collect();
            Some(Value::from(kept))
        });
        if removed.is_err() || self.kv.delete(&meta_key(run_id)).is_err() {
            tracing::warn!(run_id, "failed to remove unused run allocation");
        }
    }

    /// Starts a fresh run (or adopts the requested id) and makes it current.
    pub fn start_new_current_run(&self, request: StartRun) -> Result<RunMeta, RunsError> {
        let requested = request
            .run_id
            .as_deref()
            .map(str::trim)
            .filter(|raw| !raw.is_empty());
        let run_id = match requested {
            Some(raw) => validate_run_id(raw)?,
            None => self.allocate_run_id(),
        };
        if run_id == LEGACY_RUN_ID {
            return Err(invalid("the legacy run id is reserved"));
        }

        let mut patch = request.meta.unwrap_or_default();
        let prompt_bundle = request.prompt_bundle.or_else(|| patch.remove("prompt_bundle"));
        RunMeta::new(run_id.as_str())
            .merge_patch(&patch)
            .map_err(|err| invalid(format!("invalid run metadata: {err}")))?;

        self.ensure_run(&run_id)?;
        let meta = if patch.is_empty() {
            self.run_meta(&run_id)
                .found()
                .unwrap_or_else(|| RunMeta::new(run_id.as_str()))
        } else {
            self.set_run_meta(&run_id, &patch)?
        };
        if let Some(bundle) = prompt_bundle.filter(|bundle| !bundle.is_null()) {
            self.write_prompt_bundle(&run_id, &bundle)?;
        }

        self.kv.set(CURRENT_RUN_KEY, &run_id)?;
        tracing::info!(run_id = %run_id, "started new current run");
        Ok(meta)
    }
}
