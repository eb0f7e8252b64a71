use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

mod sqlite;

pub use sqlite::SqliteKv;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KvRow {
    pub key: String,
    pub value: Value,
    pub updated_at: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection lock poisoned")]
    Poisoned,
    #[error("backend call exceeded {0:?}")]
    Timeout(Duration),
}

/// Raw key/value table. Implementations report every failure; degrading to
/// fallbacks is the job of [`KvStore`].
pub trait KvBackend: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    fn set(&self, key: &str, value: &Value) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Deletes `key` only while it still holds `expected`. Returns whether a
    /// row was removed.
    fn delete_if(&self, key: &str, expected: &Value) -> Result<bool, StoreError>;

    /// Writes every entry in one transaction: all rows land or none do.
    /// Returns, per entry, whether its key already held a value.
    fn set_many(&self, entries: &[(String, Value)]) -> Result<Vec<bool>, StoreError>;

    /// Rows whose key starts with `prefix`, in first-insertion order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<KvRow>, StoreError>;
    fn count_prefix(&self, prefix: &str) -> Result<usize, StoreError>;
    fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError>;

    /// Atomic read-modify-write of one key. `apply` sees the current value and
    /// returns the value to store, or `None` to leave the row untouched.
    /// Returns what was written.
    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<Value>) -> Option<Value>,
    ) -> Result<Option<Value>, StoreError>;
}

/// Outcome of a read that distinguishes "nothing stored" from "backend down".
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
    Unavailable,
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            Self::NotFound | Self::Unavailable => None,
        }
    }

    pub fn unwrap_or(self, fallback: T) -> T {
        self.found().unwrap_or(fallback)
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Self::Found(value) => Lookup::Found(f(value)),
            Self::NotFound => Lookup::NotFound,
            Self::Unavailable => Lookup::Unavailable,
        }
    }
}

impl<T: Default> Lookup<T> {
    pub fn unwrap_or_default(self) -> T {
        self.found().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("storage backend unavailable")]
pub struct Unavailable;

/// Shared handle over a [`KvBackend`]. No call returns a backend error: reads
/// come back as [`Lookup`], writes as `Result<_, Unavailable>`, and the
/// underlying failure is logged here.
#[derive(Debug, Clone)]
pub struct KvStore {
    backend: Arc<dyn KvBackend>,
}

impl KvStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    pub fn open_sqlite(path: impl AsRef<Path>, timeout: Duration) -> Result<Self, StoreError> {
        let backend = SqliteKv::open(path, timeout)?;
        Ok(Self::new(Arc::new(backend)))
    }

    pub fn open_in_memory(timeout: Duration) -> Result<Self, StoreError> {
        let backend = SqliteKv::open_in_memory(timeout)?;
        Ok(Self::new(Arc::new(backend)))
    }

    pub fn lookup(&self, key: &str) -> Lookup<Value> {
        match self.backend.get(key) {
            Ok(Some(value)) => Lookup::Found(value),
            Ok(None) => Lookup::NotFound,
            Err(err) => {
                tracing::warn!(key, error = %err, "kv get failed, using fallback");
                Lookup::Unavailable
            }
        }
    }

    /// Typed read. A stored document of the wrong shape counts as absent.
    pub fn lookup_as<T: DeserializeOwned>(&self, key: &str) -> Lookup<T> {
        match self.lookup(key) {
            Lookup::Found(value) => match serde_json::from_value(value) {
                Ok(decoded) => Lookup::Found(decoded),
                Err(err) => {
                    tracing::warn!(key, error = %err, "kv value has unexpected shape");
                    Lookup::NotFound
                }
            },
            Lookup::NotFound => Lookup::NotFound,
            Lookup::Unavailable => Lookup::Unavailable,
        }
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, fallback: T) -> T {
        self.lookup_as(key).unwrap_or(fallback)
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), Unavailable> {
        let value = serde_json::to_value(value).map_err(|err| {
            tracing::warn!(key, error = %err, "kv value failed to serialize");
            Unavailable
        })?;

        self.backend.set(key, &value).map_err(|err| {
            tracing::warn!(key, error = %err, "kv set failed");
            Unavailable
        })
    }

    pub fn delete(&self, key: &str) -> Result<(), Unavailable> {
        self.backend.delete(key).map_err(|err| {
            tracing::warn!(key, error = %err, "kv delete failed");
            Unavailable
        })
    }

    pub fn delete_if<T: Serialize + ?Sized>(
        &self,
        key: &str,
        expected: &T,
    ) -> Result<bool, Unavailable> {
        let expected = serde_json::to_value(expected).map_err(|err| {
            tracing::warn!(key, error = %err, "kv value failed to serialize");
            Unavailable
        })?;

        self.backend.delete_if(key, &expected).map_err(|err| {
            tracing::warn!(key, error = %err, "kv conditional delete failed");
            Unavailable
        })
    }

    pub fn set_many(&self, entries: &[(String, Value)]) -> Result<Vec<bool>, Unavailable> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        self.backend.set_many(entries).map_err(|err| {
            tracing::warn!(rows = entries.len(), error = %err, "kv batch write failed");
            Unavailable
        })
    }

    /// Always `Found` (possibly empty) unless the backend failed.
    pub fn scan(&self, prefix: &str) -> Lookup<Vec<KvRow>> {
        match self.backend.scan_prefix(prefix) {
            Ok(rows) => Lookup::Found(rows),
            Err(err) => {
                tracing::warn!(prefix, error = %err, "kv scan failed, using fallback");
                Lookup::Unavailable
            }
        }
    }

    pub fn count(&self, prefix: &str) -> Lookup<usize> {
        match self.backend.count_prefix(prefix) {
            Ok(count) => Lookup::Found(count),
            Err(err) => {
                tracing::warn!(prefix, error = %err, "kv count failed, using fallback");
                Lookup::Unavailable
            }
        }
    }

    pub fn delete_prefix(&self, prefix: &str) -> Result<usize, Unavailable> {
        self.backend.delete_prefix(prefix).map_err(|err| {
            tracing::warn!(prefix, error = %err, "kv prefix delete failed");
            Unavailable
        })
    }

    pub fn update(
        &self,
        key: &str,
        mut apply: impl FnMut(Option<Value>) -> Option<Value>,
    ) -> Result<Option<Value>, Unavailable> {
        self.backend.update(key, &mut apply).map_err(|err| {
            tracing::warn!(key, error = %err, "kv update failed");
            Unavailable
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[derive(Debug)]
    struct DownBackend;

    impl KvBackend for DownBackend {
        fn get(&self, _key: &str) -> Result<Option<Value>, StoreError> {
            Err(StoreError::Poisoned)
        }

        fn set(&self, _key: &str, _value: &Value) -> Result<(), StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(5)))
        }

        fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Poisoned)
        }

        fn delete_if(&self, _key: &str, _expected: &Value) -> Result<bool, StoreError> {
            Err(StoreError::Poisoned)
        }

        fn set_many(&self, _entries: &[(String, Value)]) -> Result<Vec<bool>, StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(5)))
        }

        fn scan_prefix(&self, _prefix: &str) -> Result<Vec<KvRow>, StoreError> {
            Err(StoreError::Poisoned)
        }

        fn count_prefix(&self, _prefix: &str) -> Result<usize, StoreError> {
            Err(StoreError::Poisoned)
        }

        fn delete_prefix(&self, _prefix: &str) -> Result<usize, StoreError> {
            Err(StoreError::Poisoned)
        }

        fn update(
            &self,
            _key: &str,
            _apply: &mut dyn FnMut(Option<Value>) -> Option<Value>,
        ) -> Result<Option<Value>, StoreError> {
            Err(StoreError::Poisoned)
        }
    }

    #[test]
    fn unreachable_backend_degrades_every_call() {
        let store = KvStore::new(Arc::new(DownBackend));

        assert_eq!(store.lookup("summary"), Lookup::Unavailable);
        assert_eq!(store.get_or("run-registry", vec!["x".to_owned()]), vec!["x"]);
        assert_eq!(store.set("summary", &json!({"a": 1})), Err(Unavailable));
        assert_eq!(store.delete("summary"), Err(Unavailable));
        assert_eq!(store.delete_if("current-run-pointer", "1"), Err(Unavailable));
        assert_eq!(
            store.set_many(&[("run:1:eval:1".to_owned(), json!({}))]),
            Err(Unavailable)
        );
        assert_eq!(store.set_many(&[]), Ok(Vec::new()));
        assert!(store.scan("run:").is_unavailable());
        assert_eq!(store.count("run:").unwrap_or(0), 0);
        assert_eq!(store.delete_prefix("run:"), Err(Unavailable));
        assert_eq!(store.update("k", |_| Some(json!(1))), Err(Unavailable));
    }

    #[test]
    fn lookup_as_treats_wrong_shape_as_absent() {
        let store = KvStore::open_in_memory(Duration::from_secs(1)).expect("open store");
        store.set("run-registry", &json!({"not": "a list"})).expect("set");

        let ids: Lookup<Vec<String>> = store.lookup_as("run-registry");

        assert_eq!(ids, Lookup::NotFound);
        assert_eq!(store.get_or("missing", 7_u32), 7);
    }

    #[test]
    fn lookup_helpers() {
        assert_eq!(Lookup::Found(2).map(|value| value * 2), Lookup::Found(4));
        assert_eq!(Lookup::<u8>::NotFound.unwrap_or(3), 3);
        assert_eq!(Lookup::<Vec<u8>>::Unavailable.unwrap_or_default(), Vec::<u8>::new());
        assert_eq!(Lookup::Found("x").found(), Some("x"));
    }
}
