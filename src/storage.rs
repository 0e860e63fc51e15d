use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;

use crate::models::{Settings, SettingsFile, Snapshot, Store};

pub const STORE_KEY: &str = "store";
pub const SETTINGS_KEY: &str = "settings";
pub const FAILED_RESTORES_KEY: &str = "restore_failed";
const SNAPSHOT_PREFIX: &str = "snapshot_";
pub const SNAPSHOT_LIMIT: usize = 5;
const SETTINGS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Backend(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(err) => write!(f, "io error: {err}"),
            StorageError::Json(err) => write!(f, "json error: {err}"),
            StorageError::Backend(message) => write!(f, "backend error: {message}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(value: std::io::Error) -> Self {
        StorageError::Io(value)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(value: serde_json::Error) -> Self {
        StorageError::Json(value)
    }
}

/// `Durable` survives a restart; `Volatile` is cleared with the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Durable,
    Volatile,
}

/// Key-value persistence provided by the host.
pub trait KvBackend: Send + Sync {
    fn get(&self, ns: Namespace, keys: &[&str]) -> Result<HashMap<String, Value>, StorageError>;
    fn set(&self, ns: Namespace, entries: HashMap<String, Value>) -> Result<(), StorageError>;
    fn remove(&self, ns: Namespace, keys: &[&str]) -> Result<(), StorageError>;

    /// Best effort; backends that cannot measure report 0.
    fn size_in_use(&self, _ns: Namespace, _keys: &[&str]) -> Result<u64, StorageError> {
        Ok(0)
    }
}

/// Durable keys live as one JSON file each under `root`.
pub struct FileBackend {
    root: PathBuf,
    volatile: Mutex<HashMap<String, Value>>,
}

impl FileBackend {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            volatile: Mutex::new(HashMap::new()),
        }
    }

    pub fn ensure_dirs(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() || key.contains(['/', '\\']) || key.contains("..") {
            return Err(StorageError::Backend(format!("invalid key: {key}")));
        }
        Ok(self.root.join(format!("{key}.json")))
    }

    fn volatile(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.volatile
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Unparseable content, including bytes that are not UTF-8, comes back as
    /// a JSON string so that the caller's validation rejects it instead of
    /// treating the key as absent.
    fn load_value(&self, path: PathBuf) -> Result<Value, StorageError> {
        let bytes = fs::read(&path)?;
        Ok(serde_json::from_slice(&bytes).unwrap_or_else(|err| {
            log::warn!("unparseable file path={} err={err}", path.display());
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        }))
    }

    fn write_atomic<T: Serialize>(&self, path: PathBuf, data: &T) -> Result<(), StorageError> {
        let temp_path = path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(data)?;
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(temp_path, path)?;
        Ok(())
    }
}

impl KvBackend for FileBackend {
    fn get(&self, ns: Namespace, keys: &[&str]) -> Result<HashMap<String, Value>, StorageError> {
        let mut out = HashMap::new();
        match ns {
            Namespace::Volatile => {
                let guard = self.volatile();
                for key in keys {
                    if let Some(value) = guard.get(*key) {
                        out.insert((*key).to_string(), value.clone());
                    }
                }
            }
            Namespace::Durable => {
                for key in keys {
                    match self.load_value(self.path_for(key)?) {
                        Ok(value) => {
                            out.insert((*key).to_string(), value);
                        }
                        Err(StorageError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => return Err(err),
                    }
                }
            }
        }
        Ok(out)
    }

    fn set(&self, ns: Namespace, entries: HashMap<String, Value>) -> Result<(), StorageError> {
        match ns {
            Namespace::Volatile => {
                self.volatile().extend(entries);
            }
            Namespace::Durable => {
                self.ensure_dirs()?;
                for (key, value) in entries {
                    self.write_atomic(self.path_for(&key)?, &value)?;
                }
            }
        }
        Ok(())
    }

    fn remove(&self, ns: Namespace, keys: &[&str]) -> Result<(), StorageError> {
        match ns {
            Namespace::Volatile => {
                let mut guard = self.volatile();
                for key in keys {
                    guard.remove(*key);
                }
            }
            Namespace::Durable => {
                for key in keys {
                    match fs::remove_file(self.path_for(key)?) {
                        Ok(()) => {}
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }
        Ok(())
    }

    fn size_in_use(&self, ns: Namespace, keys: &[&str]) -> Result<u64, StorageError> {
        if ns == Namespace::Volatile {
            return Ok(0);
        }
        let mut total = 0;
        for key in keys {
            if let Ok(meta) = fs::metadata(self.path_for(key)?) {
                total += meta.len();
            }
        }
        Ok(total)
    }
}

#[derive(Debug, Default)]
struct MemoryData {
    durable: HashMap<String, Value>,
    volatile: HashMap<String, Value>,
    failing_writes: u32,
}

/// In-process backend. Clones share the same maps, so a clone handed to a new
/// engine instance behaves like the same browser profile after a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryData>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the volatile namespace, as a process restart would.
    pub fn restart(&self) {
        self.lock().volatile.clear();
    }

    /// Makes the next `count` writes fail.
    pub fn fail_next_writes(&self, count: u32) {
        self.lock().failing_writes = count;
    }

    pub fn raw(&self, key: &str) -> Option<Value> {
        self.lock().durable.get(key).cloned()
    }

    pub fn put_raw(&self, key: &str, value: Value) {
        self.lock().durable.insert(key.to_string(), value);
    }

    fn lock(&self) -> MutexGuard<'_, MemoryData> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, ns: Namespace, keys: &[&str]) -> Result<HashMap<String, Value>, StorageError> {
        let guard = self.lock();
        let map = match ns {
            Namespace::Durable => &guard.durable,
            Namespace::Volatile => &guard.volatile,
        };
        Ok(keys
            .iter()
            .filter_map(|key| map.get(*key).map(|value| ((*key).to_string(), value.clone())))
            .collect())
    }

    fn set(&self, ns: Namespace, entries: HashMap<String, Value>) -> Result<(), StorageError> {
        let mut guard = self.lock();
        if guard.failing_writes > 0 {
            guard.failing_writes -= 1;
            return Err(StorageError::Backend("injected write failure".to_string()));
        }
        match ns {
            Namespace::Durable => guard.durable.extend(entries),
            Namespace::Volatile => guard.volatile.extend(entries),
        }
        Ok(())
    }

    fn remove(&self, ns: Namespace, keys: &[&str]) -> Result<(), StorageError> {
        let mut guard = self.lock();
        let map = match ns {
            Namespace::Durable => &mut guard.durable,
            Namespace::Volatile => &mut guard.volatile,
        };
        for key in keys {
            map.remove(*key);
        }
        Ok(())
    }

    fn size_in_use(&self, ns: Namespace, keys: &[&str]) -> Result<u64, StorageError> {
        let guard = self.lock();
        let map = match ns {
            Namespace::Durable => &guard.durable,
            Namespace::Volatile => &guard.volatile,
        };
        Ok(keys
            .iter()
            .filter_map(|key| map.get(*key))
            .map(|value| value.to_string().len() as u64)
            .sum())
    }
}

/// Writes run under the state lock, so retries are immediate.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3 }
    }
}

/// Typed access to the engine's keys on top of a [`KvBackend`].
///
/// Reads fail closed: a broken read is logged and treated as absent.
/// Primary writes are retried; snapshot writes get a single attempt.
pub struct Storage {
    backend: Box<dyn KvBackend>,
    retry: RetryPolicy,
}

impl Storage {
    pub fn new(backend: impl KvBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn load_store_raw(&self) -> Option<Value> {
        self.read_one(Namespace::Durable, STORE_KEY)
    }

    pub fn save_store(&self, store: &Store) -> Result<(), StorageError> {
        let value = serde_json::to_value(store)?;
        self.write_with_retry(Namespace::Durable, STORE_KEY, value)
    }

    pub fn load_settings(&self) -> Settings {
        let Some(value) = self.read_one(Namespace::Durable, SETTINGS_KEY) else {
            return Settings::default();
        };
        match serde_json::from_value::<SettingsFile>(value) {
            Ok(file) => file.settings,
            Err(err) => {
                log::warn!("settings unreadable, using defaults err={err}");
                Settings::default()
            }
        }
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<(), StorageError> {
        let file = SettingsFile {
            schema_version: SETTINGS_SCHEMA_VERSION,
            settings: settings.clone(),
        };
        self.write_with_retry(Namespace::Durable, SETTINGS_KEY, serde_json::to_value(file)?)
    }

    /// Raw snapshot payloads, newest first. Slots whose `taken_at` cannot be read
    /// sort last. Each slot is read on its own so one broken slot only hides itself.
    pub fn load_snapshots_raw(&self) -> Vec<(String, Value)> {
        let mut entries: Vec<(String, Value)> = snapshot_keys()
            .into_iter()
            .filter_map(|key| {
                let value = self.read_one(Namespace::Durable, &key)?;
                Some((key, value))
            })
            .collect();
        entries.sort_by_key(|(key, value)| {
            (std::cmp::Reverse(snapshot_taken_at(value)), key.clone())
        });
        entries
    }

    /// Writes into an empty slot, or over the oldest one.
    pub fn write_snapshot(&self, snapshot: &Snapshot) -> Result<String, StorageError> {
        let existing = self.load_snapshots_raw();
        let slot = snapshot_keys()
            .into_iter()
            .find(|key| !existing.iter().any(|(used, _)| used == key))
            .or_else(|| existing.last().map(|(key, _)| key.clone()))
            .unwrap_or_else(|| format!("{SNAPSHOT_PREFIX}0"));
        let entries = HashMap::from([(slot.clone(), serde_json::to_value(snapshot)?)]);
        self.backend.set(Namespace::Durable, entries)?;
        log::debug!(
            "snapshot written slot={slot} taken_at={} items={}",
            snapshot.taken_at,
            snapshot.store.items.len()
        );
        Ok(slot)
    }

    pub fn snapshot_raw(&self, slot: &str) -> Option<Value> {
        if !snapshot_keys().iter().any(|key| key == slot) {
            return None;
        }
        self.read_one(Namespace::Durable, slot)
    }

    pub fn size_in_use(&self) -> u64 {
        let mut keys = vec![STORE_KEY.to_string(), SETTINGS_KEY.to_string()];
        keys.extend(snapshot_keys());
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.backend
            .size_in_use(Namespace::Durable, &refs)
            .unwrap_or_else(|err| {
                log::debug!("size_in_use unsupported err={err}");
                0
            })
    }

    pub fn load_failed_restores(&self) -> Vec<String> {
        self.read_one(Namespace::Volatile, FAILED_RESTORES_KEY)
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }

    pub fn save_failed_restores(&self, ids: &[String]) -> Result<(), StorageError> {
        if ids.is_empty() {
            return self
                .backend
                .remove(Namespace::Volatile, &[FAILED_RESTORES_KEY]);
        }
        self.write_with_retry(
            Namespace::Volatile,
            FAILED_RESTORES_KEY,
            serde_json::to_value(ids)?,
        )
    }

    fn read_one(&self, ns: Namespace, key: &str) -> Option<Value> {
        match self.backend.get(ns, &[key]) {
            Ok(mut found) => found.remove(key),
            Err(err) => {
                log::warn!("read failed key={key} err={err}");
                None
            }
        }
    }

    fn write_with_retry(&self, ns: Namespace, key: &str, value: Value) -> Result<(), StorageError> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            let entries = HashMap::from([(key.to_string(), value.clone())]);
            match self.backend.set(ns, entries) {
                Ok(()) => return Ok(()),
                Err(err) if attempt < attempts => {
                    log::warn!("write failed key={key} attempt={attempt} err={err}");
                    attempt += 1;
                }
                Err(err) => {
                    log::error!("write gave up key={key} attempts={attempts} err={err}");
                    return Err(err);
                }
            }
        }
    }
}

fn snapshot_keys() -> Vec<String> {
    (0..SNAPSHOT_LIMIT)
        .map(|slot| format!("{SNAPSHOT_PREFIX}{slot}"))
        .collect()
}

fn snapshot_taken_at(value: &Value) -> i64 {
    value
        .get("taken_at")
        .and_then(Value::as_i64)
        .unwrap_or(i64::MIN)
}
