//! Preference storage seen by the scale layer.
//!
//! The application owns persistence; this crate only talks to an injected
//! [`PreferenceStore`]. Handlers get a [`DriverSettings`] view scoped to their own
//! namespace and the device address, backed by an in-memory cache so that
//! decoding code can read and write settings without awaiting.

use crate::mac_address::MacAddress;
use crate::tuning::TuningProfile;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Hard deadline for loading a handler's settings namespace.
pub const DRIVER_SETTINGS_READ_TIMEOUT: Duration = Duration::from_millis(300);

/// How long the end of a session waits for queued setting writes.
pub const DRIVER_SETTINGS_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Hard deadline for the saved tuning profile lookup.
pub const TUNING_LOOKUP_TIMEOUT: Duration = Duration::from_millis(250);

/// Preference key holding the user's tuning profile choice.
pub const TUNING_PROFILE_KEY: &str = "saved_bluetooth_tune_profile";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("setting '{key}' is not a valid {expected}")]
    TypeMismatch { key: String, expected: &'static str },
    #[error("settings file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("settings write task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SettingsError>> + Send + 'a>>;

/// Key/value persistence provided by the application.
pub trait PreferenceStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Value>>;

    fn put<'a>(&'a self, key: &'a str, value: Value) -> StoreFuture<'a, ()>;

    /// All entries whose key starts with `prefix`.
    fn entries<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<(String, Value)>>;
}

/// Volatile store, used by tests and when no settings file is given.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values<I, K>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self {
            values: Mutex::new(values.into_iter().map(|(k, v)| (k.into(), v)).collect()),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.values.lock().clone()
    }
}

impl PreferenceStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Value>> {
        let value = self.values.lock().get(key).cloned();
        Box::pin(async move { Ok(value) })
    }

    fn put<'a>(&'a self, key: &'a str, value: Value) -> StoreFuture<'a, ()> {
        self.values.lock().insert(key.to_string(), value);
        Box::pin(async { Ok(()) })
    }

    fn entries<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<(String, Value)>> {
        let entries = collect_prefixed(&self.values.lock(), prefix);
        Box::pin(async move { Ok(entries) })
    }
}

fn collect_prefixed(values: &BTreeMap<String, Value>, prefix: &str) -> Vec<(String, Value)> {
    values
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Flat JSON object on disk, rewritten on every `put`.
///
/// File writes run on the blocking pool, one at a time, each with the values
/// current when it started.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    /// Open `path`, starting empty if the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }
}

impl PreferenceStore for JsonFileStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Value>> {
        let value = self.values.lock().get(key).cloned();
        Box::pin(async move { Ok(value) })
    }

    fn put<'a>(&'a self, key: &'a str, value: Value) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let _writing = self.write_lock.lock().await;
            let text = {
                let mut values = self.values.lock();
                values.insert(key.to_string(), value);
                serde_json::to_string_pretty(&*values)?
            };
            let path = self.path.clone();
            tokio::task::spawn_blocking(move || std::fs::write(path, text)).await??;
            Ok(())
        })
    }

    fn entries<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<(String, Value)>> {
        let entries = collect_prefixed(&self.values.lock(), prefix);
        Box::pin(async move { Ok(entries) })
    }
}

/// Look up the saved tuning profile, falling back to `default` when nothing is
/// saved, the value is unknown, or the store does not answer within
/// [`TUNING_LOOKUP_TIMEOUT`].
pub async fn lookup_tuning(store: &dyn PreferenceStore, default: TuningProfile) -> TuningProfile {
    match tokio::time::timeout(TUNING_LOOKUP_TIMEOUT, store.get(TUNING_PROFILE_KEY)).await {
        Ok(Ok(Some(Value::String(name)))) => TuningProfile::parse_or(&name, default),
        Ok(Ok(_)) => default,
        Ok(Err(e)) => {
            warn!(error = %e, "tuning profile lookup failed, using {default}");
            default
        }
        Err(_) => {
            warn!("tuning profile lookup timed out, using {default}");
            default
        }
    }
}

/// Settings of one handler for one device, keyed `ble/{handler}/{address}/{key}`.
pub struct DriverSettings {
    prefix: String,
    store: Arc<dyn PreferenceStore>,
    cache: Mutex<HashMap<String, Value>>,
    /// Store writes still in flight.
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for DriverSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverSettings")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl DriverSettings {
    /// Prefetch the namespace. A store that does not answer within
    /// [`DRIVER_SETTINGS_READ_TIMEOUT`] leaves the cache empty and every read
    /// falls back to its default.
    pub async fn load(
        store: Arc<dyn PreferenceStore>,
        handler: &str,
        address: MacAddress,
    ) -> DriverSettings {
        let prefix = format!("ble/{handler}/{address}/");
        let mut cache = HashMap::new();
        match tokio::time::timeout(DRIVER_SETTINGS_READ_TIMEOUT, store.entries(&prefix)).await {
            Ok(Ok(entries)) => {
                for (key, value) in entries {
                    if let Some(short) = key.strip_prefix(&prefix) {
                        cache.insert(short.to_string(), value);
                    }
                }
            }
            Ok(Err(e)) => warn!(%prefix, error = %e, "driver settings unavailable"),
            Err(_) => warn!(%prefix, "driver settings read timed out"),
        }
        debug!(%prefix, entries = cache.len(), "driver settings loaded");
        DriverSettings {
            prefix,
            store,
            cache: Mutex::new(cache),
            pending: Mutex::default(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Integer setting. The value read (or `default`) stays cached.
    pub fn get_int(&self, key: &str, default: i32) -> Result<i32, SettingsError> {
        let mut cache = self.cache.lock();
        let value = match cache.get(key) {
            None => default,
            Some(Value::Number(n)) => n
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .ok_or_else(|| self.mismatch(key, "integer"))?,
            Some(Value::String(s)) if s.is_empty() => default,
            Some(Value::String(s)) => s.trim().parse().map_err(|_| self.mismatch(key, "integer"))?,
            Some(Value::Null) => default,
            Some(_) => return Err(self.mismatch(key, "integer")),
        };
        cache.insert(key.to_string(), Value::from(value));
        Ok(value)
    }

    pub fn put_int(&self, key: &str, value: i32) {
        self.cache.lock().insert(key.to_string(), Value::from(value));
        self.persist(key, Value::from(value));
    }

    /// String setting. A stored empty string reads as `default`, which may be `None`.
    pub fn get_string(&self, key: &str, default: Option<&str>) -> Result<Option<String>, SettingsError> {
        let cache = self.cache.lock();
        match cache.get(key) {
            None | Some(Value::Null) => Ok(default.map(str::to_string)),
            Some(Value::String(s)) if s.is_empty() => Ok(default.map(str::to_string)),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(self.mismatch(key, "string")),
        }
    }

    pub fn put_string(&self, key: &str, value: &str) {
        self.cache.lock().insert(key.to_string(), Value::from(value));
        self.persist(key, Value::from(value));
    }

    /// Forget `key`. The store keeps an empty string, which reads back as unset.
    pub fn remove(&self, key: &str) {
        self.cache.lock().remove(key);
        self.persist(key, Value::from(""));
    }

    /// Wait for the writes queued so far. After [`DRIVER_SETTINGS_FLUSH_TIMEOUT`]
    /// the rest is left to finish in the background.
    pub async fn flush(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            return;
        }
        let count = pending.len();
        let wait_all = async {
            for write in pending {
                if let Err(e) = write.await {
                    warn!(prefix = %self.prefix, error = %e, "driver setting write aborted");
                }
            }
        };
        match tokio::time::timeout(DRIVER_SETTINGS_FLUSH_TIMEOUT, wait_all).await {
            Ok(()) => debug!(prefix = %self.prefix, count, "driver settings flushed"),
            Err(_) => warn!(prefix = %self.prefix, count, "driver setting writes still pending"),
        }
    }

    fn mismatch(&self, key: &str, expected: &'static str) -> SettingsError {
        SettingsError::TypeMismatch {
            key: format!("{}{}", self.prefix, key),
            expected,
        }
    }

    fn persist(&self, key: &str, value: Value) {
        let full_key = format!("{}{}", self.prefix, key);
        let store = Arc::clone(&self.store);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let write = runtime.spawn(async move {
                    if let Err(e) = store.put(&full_key, value).await {
                        warn!(key = %full_key, error = %e, "failed to persist driver setting");
                    }
                });
                let mut pending = self.pending.lock();
                pending.retain(|w| !w.is_finished());
                pending.push(write);
            }
            Err(_) => warn!(key = %full_key, "no runtime, driver setting kept in memory only"),
        }
    }
}
