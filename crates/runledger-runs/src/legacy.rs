use runledger_core::{LEGACY_RUN_ID, REGISTRY_KEY, RunMeta, legacy_collection_keys, meta_key};
use runledger_store::Lookup;
use serde_json::Value;

use crate::RunStore;
use crate::registry::decode_ids;

impl RunStore {
    /// Adopts pre-namespacing data as the `legacy` run. Only acts while the
    /// registry is empty, and the emptiness check and the registry write are a
    /// single atomic update, so once any run is registered this never runs
    /// again. Returns whether the registry was populated by this call.
    pub fn migrate_legacy_if_needed(&self) -> bool {
        if !self.legacy_has_data() {
            return false;
        }

        let Ok(fresh) = serde_json::to_value(RunMeta::new(LEGACY_RUN_ID)) else {
            return false;
        };
        let meta_written = self.kv.update(&meta_key(LEGACY_RUN_ID), |current| match current {
            Some(_) => None,
            None => Some(fresh.clone()),
        });
        if meta_written.is_err() {
            return false;
        }

        let mut migrated = false;
        let registry_written = self.kv.update(REGISTRY_KEY, |current| {
            if !decode_ids(current).is_empty() {
                return None;
            }
            migrated = true;
            Some(Value::from(vec![LEGACY_RUN_ID]))
        });

        if registry_written.is_ok() && migrated {
            tracing::info!(run_id = LEGACY_RUN_ID, "adopted un-namespaced data as legacy run");
            return true;
        }
        false
    }

    fn legacy_has_data(&self) -> bool {
        legacy_collection_keys().any(|(_, key)| match self.kv.lookup(key) {
            Lookup::Found(value) => document_has_data(&value),
            Lookup::NotFound | Lookup::Unavailable => false,
        })
    }
}

/// A sequence counts when non-empty; any other present document counts.
fn document_has_data(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}
