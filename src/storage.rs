use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Common get/set/remove contract shared by both storage scopes.
///
/// Missing keys are represented as `None`; no operation raises an error.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// Ephemeral per-tab storage.
///
/// One instance exists per tab and disappears with it. Nothing stored here
/// is visible to any other tab.
#[derive(Debug, Default)]
pub struct TabStore {
    entries: Mutex<HashMap<String, String>>,
}

impl TabStore {
    pub fn new() -> Self {
        TabStore::default()
    }
}

impl KeyValueStore for TabStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }
}

/// A change notification for a watched key. `value` is `None` when the key
/// was removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub value: Option<String>,
}

struct WatcherSlot {
    origin: String,
    keys: Vec<String>,
    pending: Arc<Mutex<HashMap<String, Option<String>>>>,
}

struct SharedInner {
    entries: RwLock<HashMap<String, String>>,
    watchers: Mutex<Vec<WatcherSlot>>,
}

/// Persistent storage shared by every tab of the same profile.
///
/// The store is a cheaply cloneable handle over shared state. Each handle
/// carries an `origin` label (normally the owning tab's id): writes made
/// through a handle are never reported back to watchers registered under
/// the same origin, so a tab does not observe its own changes. Individual
/// calls are atomic; a read-modify-write cycle spanning several calls is
/// not, and the last write wins at whole-value granularity.
///
/// Pending notifications coalesce per key. A watcher that polls late sees
/// only the final value for each key, not a history of intermediate writes.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<SharedInner>,
    origin: String,
}

impl SharedStore {
    pub fn new() -> Self {
        SharedStore {
            inner: Arc::new(SharedInner {
                entries: RwLock::new(HashMap::new()),
                watchers: Mutex::new(Vec::new()),
            }),
            origin: String::new(),
        }
    }

    /// A handle over the same underlying store whose writes are attributed
    /// to `origin`.
    pub fn handle_for(&self, origin: &str) -> SharedStore {
        SharedStore {
            inner: Arc::clone(&self.inner),
            origin: origin.to_string(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Register interest in a set of keys. Changes made through other
    /// origins' handles are queued on the returned watcher until polled.
    pub fn watch(&self, keys: &[&str]) -> StorageWatcher {
        let pending = Arc::new(Mutex::new(HashMap::new()));
        self.inner.watchers.lock().unwrap().push(WatcherSlot {
            origin: self.origin.clone(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            pending: Arc::clone(&pending),
        });
        StorageWatcher { pending }
    }

    /// Copy of the full map, for persistence.
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            entries: self.inner.entries.read().unwrap().clone(),
        }
    }

    /// Replace the full map with a previously saved snapshot. No change
    /// notifications are produced; this runs before any tab is attached.
    pub fn restore(&self, snapshot: StoreSnapshot) {
        *self.inner.entries.write().unwrap() = snapshot.entries;
    }

    fn notify(&self, key: &str, value: Option<&str>) {
        let watchers = self.inner.watchers.lock().unwrap();
        for watcher in watchers.iter() {
            if watcher.origin == self.origin {
                continue;
            }
            if !watcher.keys.iter().any(|k| k == key) {
                continue;
            }
            watcher
                .pending
                .lock()
                .unwrap()
                .insert(key.to_string(), value.map(|v| v.to_string()));
        }
    }
}

impl Default for SharedStore {
    fn default() -> Self {
        SharedStore::new()
    }
}

impl KeyValueStore for SharedStore {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.entries.read().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let previous = self
            .inner
            .entries
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        // No notification unless the stored value actually changed
        if previous.as_deref() != Some(value) {
            self.notify(key, Some(value));
        }
    }

    fn remove(&self, key: &str) {
        let previous = self.inner.entries.write().unwrap().remove(key);
        if previous.is_some() {
            self.notify(key, None);
        }
    }
}

/// Receiving end of a `watch` registration.
pub struct StorageWatcher {
    pending: Arc<Mutex<HashMap<String, Option<String>>>>,
}

impl StorageWatcher {
    /// Drain pending notifications, one per changed key, latest value only.
    /// Order between keys is unspecified.
    pub fn poll(&self) -> Vec<StorageEvent> {
        self.pending
            .lock()
            .unwrap()
            .drain()
            .map(|(key, value)| StorageEvent { key, value })
            .collect()
    }
}

/// Serializable copy of the shared store contents.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreSnapshot {
    pub entries: HashMap<String, String>,
}
