use crate::{CollectionKind, LEGACY_RUN_ID};

pub const REGISTRY_KEY: &str = "run-registry";
pub const CURRENT_RUN_KEY: &str = "current-run-pointer";

pub fn run_prefix(run_id: &str) -> String {
    format!("run:{run_id}:")
}

pub fn meta_key(run_id: &str) -> String {
    format!("run:{run_id}:meta")
}

/// Whole-document key of a collection. `None` when the scope has no such
/// collection (the legacy scope never had a prompt bundle).
pub fn collection_key(run_id: &str, kind: CollectionKind) -> Option<String> {
    if run_id == LEGACY_RUN_ID {
        return kind.legacy_key().map(str::to_owned);
    }

    Some(format!("run:{run_id}:{}", kind.key_segment()))
}

pub fn item_prefix(run_id: &str, kind: CollectionKind) -> Option<String> {
    kind.item_segment()
        .map(|segment| format!("run:{run_id}:{segment}:"))
}

pub fn item_key(run_id: &str, kind: CollectionKind, item: &str) -> Option<String> {
    item_prefix(run_id, kind).map(|prefix| format!("{prefix}{item}"))
}

pub fn legacy_collection_keys() -> impl Iterator<Item = (CollectionKind, &'static str)> {
    CollectionKind::ALL
        .into_iter()
        .filter_map(|kind| kind.legacy_key().map(|key| (kind, key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaced_keys_follow_run_prefix() {
        assert_eq!(meta_key("17"), "run:17:meta");
        assert_eq!(
            collection_key("17", CollectionKind::Trace).as_deref(),
            Some("run:17:agent_trace")
        );
        assert_eq!(
            item_key("17", CollectionKind::Evaluations, "42").as_deref(),
            Some("run:17:eval:42")
        );
        assert_eq!(item_key("17", CollectionKind::Summary, "x"), None);
        assert!(meta_key("17").starts_with(&run_prefix("17")));
    }

    #[test]
    fn legacy_scope_uses_unnamespaced_keys() {
        assert_eq!(
            collection_key(LEGACY_RUN_ID, CollectionKind::Evaluations).as_deref(),
            Some("evaluations")
        );
        assert_eq!(
            collection_key(LEGACY_RUN_ID, CollectionKind::PromptBundle),
            None
        );
        assert_eq!(legacy_collection_keys().count(), 5);
    }
}
