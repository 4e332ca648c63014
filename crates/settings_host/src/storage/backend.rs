//! Key/value storage backend contract and the in-memory adapter.

use std::{
    cell::RefCell,
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
};

use serde_json::{Map, Value};
use thiserror::Error;

use super::change::{ChangeListener, StorageChange, StorageChanges};
use crate::listeners::{ListenerRegistry, SubscriptionId};

/// Quota of the browser's replicated (`chrome.storage.sync`) area in bytes.
pub const REPLICATED_AREA_QUOTA_BYTES: u64 = 102_400;
/// Quota of the browser's device-local (`chrome.storage.local`) area in bytes.
pub const LOCAL_AREA_QUOTA_BYTES: u64 = 5_242_880;

/// Key/value mapping read from or written to a backend.
pub type StorageMap = Map<String, Value>;

/// Object-safe boxed future used by [`StorageBackend`] async methods.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Failure reported by a storage backend.
pub enum BackendError {
    /// The write would push the backend past its byte quota; nothing was written.
    #[error("quota exceeded: {requested_bytes} bytes requested, quota is {quota_bytes} bytes")]
    QuotaExceeded {
        /// Bytes the backend would hold after the rejected write.
        requested_bytes: u64,
        /// Backend quota in bytes.
        quota_bytes: u64,
    },
    /// The backend could not be reached or refused the operation.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Host storage area holding JSON values by string key.
///
/// Every write is atomic for the whole mapping it receives. Successful mutations are reported
/// to change-feed subscribers as one [`StorageChanges`] batch, in the order the backend applied
/// them.
pub trait StorageBackend {
    /// Reads the listed keys. Absent keys are omitted from the result.
    fn get<'a>(&'a self, keys: &'a [String]) -> BackendFuture<'a, Result<StorageMap, BackendError>>;

    /// Reads every key held by the backend.
    fn get_all<'a>(&'a self) -> BackendFuture<'a, Result<StorageMap, BackendError>>;

    /// Writes all `items` or none of them.
    fn set<'a>(&'a self, items: StorageMap) -> BackendFuture<'a, Result<(), BackendError>>;

    /// Removes the listed keys.
    fn remove<'a>(&'a self, keys: &'a [String]) -> BackendFuture<'a, Result<(), BackendError>>;

    /// Removes every key.
    fn clear<'a>(&'a self) -> BackendFuture<'a, Result<(), BackendError>>;

    /// Measures the bytes currently held.
    fn bytes_in_use<'a>(&'a self) -> BackendFuture<'a, Result<u64, BackendError>>;

    /// Returns the byte quota of the backend.
    fn quota_bytes(&self) -> u64;

    /// Attaches a listener to the backend change feed.
    fn subscribe(&self, listener: ChangeListener) -> SubscriptionId;

    /// Detaches a change-feed listener.
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Bytes charged for one stored item: key length plus serialized JSON length.
pub fn item_size_bytes(key: &str, value: &Value) -> u64 {
    let value_len = serde_json::to_string(value).map_or(0, |raw| raw.len());
    (key.len() + value_len) as u64
}

/// Bytes charged for a whole mapping.
pub fn map_size_bytes(items: &StorageMap) -> u64 {
    items
        .iter()
        .map(|(key, value)| item_size_bytes(key, value))
        .sum()
}

struct MemoryBackendInner {
    items: RefCell<StorageMap>,
    quota_bytes: u64,
    unavailable: RefCell<Option<String>>,
    listeners: ListenerRegistry<StorageChanges>,
}

#[derive(Clone)]
/// In-memory backend with browser-like quota accounting and change feed.
///
/// Clones share the same storage, so handing a clone to each view models several views of
/// one installation writing to the same durable area.
pub struct MemoryStorageBackend {
    inner: Rc<MemoryBackendInner>,
}

impl fmt::Debug for MemoryStorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStorageBackend")
            .field("keys", &self.inner.items.borrow().len())
            .field("quota_bytes", &self.inner.quota_bytes)
            .field("listeners", &self.inner.listeners.len())
            .finish()
    }
}

impl MemoryStorageBackend {
    /// Creates an empty backend with the given byte quota.
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            inner: Rc::new(MemoryBackendInner {
                items: RefCell::new(StorageMap::new()),
                quota_bytes,
                unavailable: RefCell::new(None),
                listeners: ListenerRegistry::default(),
            }),
        }
    }

    /// Creates a backend sized like the browser's replicated area.
    pub fn replicated() -> Self {
        Self::with_quota(REPLICATED_AREA_QUOTA_BYTES)
    }

    /// Creates a backend sized like the browser's device-local area.
    pub fn local() -> Self {
        Self::with_quota(LOCAL_AREA_QUOTA_BYTES)
    }

    /// Makes every subsequent operation fail with [`BackendError::Unavailable`] until cleared.
    pub fn set_unavailable(&self, reason: Option<&str>) {
        *self.inner.unavailable.borrow_mut() = reason.map(str::to_string);
    }

    /// Returns a copy of the stored items.
    pub fn snapshot(&self) -> StorageMap {
        self.inner.items.borrow().clone()
    }

    /// Number of live change-feed listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    fn check_available(&self) -> Result<(), BackendError> {
        match self.inner.unavailable.borrow().as_ref() {
            Some(reason) => Err(BackendError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    fn apply_set(&self, items: StorageMap) -> Result<StorageChanges, BackendError> {
        self.check_available()?;
        let mut stored = self.inner.items.borrow_mut();
        let mut projected = map_size_bytes(&stored);
        for (key, value) in &items {
            if let Some(existing) = stored.get(key) {
                projected -= item_size_bytes(key, existing);
            }
            projected += item_size_bytes(key, value);
        }
        if projected > self.inner.quota_bytes {
            return Err(BackendError::QuotaExceeded {
                requested_bytes: projected,
                quota_bytes: self.inner.quota_bytes,
            });
        }

        let mut changes = StorageChanges::new();
        for (key, value) in items {
            let old_value = stored.insert(key.clone(), value.clone());
            if old_value.as_ref() == Some(&value) {
                continue;
            }
            changes.insert(
                key,
                StorageChange {
                    old_value,
                    new_value: Some(value),
                },
            );
        }
        Ok(changes)
    }

    fn apply_remove<'k>(
        &self,
        keys: impl IntoIterator<Item = &'k String>,
    ) -> Result<StorageChanges, BackendError> {
        self.check_available()?;
        let mut stored = self.inner.items.borrow_mut();
        let mut changes = StorageChanges::new();
        for key in keys {
            if let Some(old_value) = stored.remove(key) {
                changes.insert(
                    key.clone(),
                    StorageChange {
                        old_value: Some(old_value),
                        new_value: None,
                    },
                );
            }
        }
        Ok(changes)
    }

    fn notify(&self, changes: StorageChanges) {
        if !changes.is_empty() {
            self.inner.listeners.emit(&changes);
        }
    }
}

impl StorageBackend for MemoryStorageBackend {
    fn get<'a>(&'a self, keys: &'a [String]) -> BackendFuture<'a, Result<StorageMap, BackendError>> {
        Box::pin(async move {
            self.check_available()?;
            let stored = self.inner.items.borrow();
            Ok(keys
                .iter()
                .filter_map(|key| stored.get(key).map(|value| (key.clone(), value.clone())))
                .collect())
        })
    }

    fn get_all<'a>(&'a self) -> BackendFuture<'a, Result<StorageMap, BackendError>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.snapshot())
        })
    }

    fn set<'a>(&'a self, items: StorageMap) -> BackendFuture<'a, Result<(), BackendError>> {
        Box::pin(async move {
            let changes = self.apply_set(items)?;
            self.notify(changes);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, keys: &'a [String]) -> BackendFuture<'a, Result<(), BackendError>> {
        Box::pin(async move {
            let changes = self.apply_remove(keys)?;
            self.notify(changes);
            Ok(())
        })
    }

    fn clear<'a>(&'a self) -> BackendFuture<'a, Result<(), BackendError>> {
        Box::pin(async move {
            let keys: Vec<String> = self.inner.items.borrow().keys().cloned().collect();
            let changes = self.apply_remove(&keys)?;
            self.notify(changes);
            Ok(())
        })
    }

    fn bytes_in_use<'a>(&'a self) -> BackendFuture<'a, Result<u64, BackendError>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(map_size_bytes(&self.inner.items.borrow()))
        })
    }

    fn quota_bytes(&self) -> u64 {
        self.inner.quota_bytes
    }

    fn subscribe(&self, listener: ChangeListener) -> SubscriptionId {
        self.inner.listeners.add(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.listeners.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use futures::executor::block_on;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn map(value: Value) -> StorageMap {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn memory_backend_round_trip_remove_and_clear() {
        let backend = MemoryStorageBackend::replicated();
        let backend_obj: &dyn StorageBackend = &backend;

        block_on(backend_obj.set(map(json!({"a": 1, "b": [true]})))).expect("set");
        let keys = vec!["a".to_string(), "missing".to_string()];
        assert_eq!(
            block_on(backend_obj.get(&keys)).expect("get"),
            map(json!({"a": 1}))
        );

        block_on(backend_obj.remove(&["a".to_string()])).expect("remove");
        assert_eq!(
            block_on(backend_obj.get_all()).expect("get all"),
            map(json!({"b": [true]}))
        );

        block_on(backend_obj.clear()).expect("clear");
        assert!(block_on(backend_obj.get_all()).expect("get all").is_empty());
    }

    #[test]
    fn writes_over_quota_are_rejected_whole() {
        let backend = MemoryStorageBackend::with_quota(16);
        block_on(backend.set(map(json!({"k": "1234"})))).expect("fits");

        let err = block_on(backend.set(map(json!({"k": "12", "big": "0123456789"}))))
            .expect_err("over quota");
        assert!(matches!(
            err,
            BackendError::QuotaExceeded {
                quota_bytes: 16,
                ..
            }
        ));
        assert_eq!(backend.snapshot(), map(json!({"k": "1234"})));
    }

    #[test]
    fn bytes_in_use_counts_keys_and_serialized_values() {
        let backend = MemoryStorageBackend::local();
        block_on(backend.set(map(json!({"ab": "xyz"})))).expect("set");
        // "ab" (2) + "\"xyz\"" (5)
        assert_eq!(block_on(backend.bytes_in_use()).expect("bytes"), 7);
        assert_eq!(backend.quota_bytes(), LOCAL_AREA_QUOTA_BYTES);
    }

    #[test]
    fn change_feed_reports_old_and_new_values_once_per_operation() {
        let backend = MemoryStorageBackend::replicated();
        let batches = Rc::new(RefCell::new(Vec::new()));
        let sink = batches.clone();
        let id = backend.subscribe(Rc::new(move |changes: &StorageChanges| {
            sink.borrow_mut().push(changes.clone())
        }));

        block_on(backend.set(map(json!({"color": "#000"})))).expect("first");
        block_on(backend.set(map(json!({"color": "#fff"})))).expect("second");
        block_on(backend.set(map(json!({"color": "#fff"})))).expect("unchanged");
        block_on(backend.remove(&["color".to_string()])).expect("remove");
        backend.unsubscribe(id);
        block_on(backend.set(map(json!({"color": "#111"})))).expect("after unsubscribe");

        let batches = batches.borrow();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0]["color"].old_value, None);
        assert_eq!(batches[1]["color"].old_value, Some(json!("#000")));
        assert_eq!(batches[1]["color"].new_value, Some(json!("#fff")));
        assert_eq!(batches[2]["color"].new_value, None);
    }

    #[test]
    fn unavailable_backend_fails_every_operation() {
        let backend = MemoryStorageBackend::local();
        backend.set_unavailable(Some("disk detached"));
        let err = block_on(backend.get_all()).expect_err("unavailable");
        assert_eq!(err, BackendError::Unavailable("disk detached".to_string()));
        assert!(block_on(backend.set(map(json!({"a": 1})))).is_err());

        backend.set_unavailable(None);
        block_on(backend.set(map(json!({"a": 1})))).expect("available again");
    }
}
