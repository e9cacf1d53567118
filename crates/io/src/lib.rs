//! Session archive persistence and history export.

mod export;

pub use export::*;

use model::SessionRecord;
use parking_lot::Mutex;
use serde_json::Value;
use std::{collections::HashMap, fs, path::PathBuf, sync::Arc};
use tracing::{debug, warn};

/// Archive key, newest record first.
pub const HISTORY_KEY: &str = "exerciseHistory";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid store key `{0}`")]
    InvalidKey(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Persistent key-value store the archive is written to.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> { (**self).get(key) }
    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> { (**self).set(key, value) }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.map.lock().insert(key.to_string(), value);
        Ok(())
    }
}

/// One JSON file per key under `dir`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let ok = !key.is_empty()
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !ok {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.dir)?;
        // write-then-rename so a crash never leaves a truncated archive
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&value)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Newest-first list of finished sessions.
pub struct SessionArchive<S> {
    store: S,
}

impl<S: KeyValueStore> SessionArchive<S> {
    pub fn new(store: S) -> Self { Self { store } }

    /// Raw entries; a value that is not a list is treated as an empty archive.
    fn entries(&self) -> Result<Vec<Value>, StoreError> {
        match self.store.get(HISTORY_KEY)? {
            Some(Value::Array(items)) => Ok(items),
            Some(other) => {
                warn!(target = "stride.archive", kind = %value_kind(&other), "archive is not a list, resetting");
                self.store.set(HISTORY_KEY, Value::Array(Vec::new()))?;
                Ok(Vec::new())
            }
            None => Ok(Vec::new()),
        }
    }

    /// Prepends `record`. Returns the archive length afterwards.
    pub fn append(&self, record: &SessionRecord) -> Result<usize, StoreError> {
        let mut items = self.entries()?;
        items.insert(0, serde_json::to_value(record)?);
        let len = items.len();
        self.store.set(HISTORY_KEY, Value::Array(items))?;
        debug!(target = "stride.archive", id = %record.id, len, "session archived");
        Ok(len)
    }

    /// Records that parse; foreign or damaged entries are skipped.
    pub fn load(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let items = self.entries()?;
        let total = items.len();
        let records: Vec<SessionRecord> = items
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();
        if records.len() != total {
            debug!(target = "stride.archive", skipped = total - records.len(), "skipped unreadable entries");
        }
        Ok(records)
    }
}

fn value_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
