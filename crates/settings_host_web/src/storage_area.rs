//! [`StorageBackend`] adapter over one `chrome.storage` area.

use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

use settings_host::{
    map_size_bytes, BackendError, BackendFuture, ChangeListener, ListenerRegistry, StorageBackend,
    StorageChanges, StorageMap, SubscriptionId,
};

use crate::bridge;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Browser extension storage area.
pub enum StorageAreaName {
    /// `chrome.storage.sync`: replicated across the user's signed-in browsers.
    Sync,
    /// `chrome.storage.local`: device-local.
    Local,
}

impl StorageAreaName {
    /// Area name as used by the extension API.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Local => "local",
        }
    }
}

/// Storage backend talking to one extension storage area.
///
/// A single JS change-feed registration is shared by all Rust subscribers of one adapter; it
/// is attached on the first subscription and released with the last.
pub struct ChromeStorageArea {
    area: StorageAreaName,
    listeners: Rc<ListenerRegistry<StorageChanges>>,
    feed: RefCell<Option<bridge::ChangeFeedHandle>>,
}

impl fmt::Debug for ChromeStorageArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChromeStorageArea")
            .field("area", &self.area)
            .field("listeners", &self.listeners.len())
            .field("feed_attached", &self.feed.borrow().is_some())
            .finish()
    }
}

impl ChromeStorageArea {
    /// Creates an adapter for `area`.
    pub fn new(area: StorageAreaName) -> Self {
        Self {
            area,
            listeners: Rc::new(ListenerRegistry::default()),
            feed: RefCell::new(None),
        }
    }

    /// Adapter for `chrome.storage.sync`.
    pub fn sync() -> Self {
        Self::new(StorageAreaName::Sync)
    }

    /// Adapter for `chrome.storage.local`.
    pub fn local() -> Self {
        Self::new(StorageAreaName::Local)
    }

    /// Area this adapter talks to.
    pub fn area(&self) -> StorageAreaName {
        self.area
    }

    fn ensure_feed(&self) {
        if self.feed.borrow().is_some() {
            return;
        }
        let weak: Weak<ListenerRegistry<StorageChanges>> = Rc::downgrade(&self.listeners);
        match bridge::subscribe_changes(self.area.as_str(), move |changes| {
            if let Some(listeners) = weak.upgrade() {
                listeners.emit(&changes);
            }
        }) {
            Ok(handle) => *self.feed.borrow_mut() = Some(handle),
            Err(err) => {
                tracing::warn!(area = self.area.as_str(), error = %err, "change feed unavailable")
            }
        }
    }
}

/// Maps a host error message onto the backend error taxonomy.
///
/// The extension API reports quota violations only through the message text
/// (`QUOTA_BYTES quota exceeded`, `QUOTA_BYTES_PER_ITEM quota exceeded`); browsers report
/// `localStorage` exhaustion as `QuotaExceededError`.
pub fn classify_host_error(message: String, requested_bytes: u64, quota_bytes: u64) -> BackendError {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("quota") {
        BackendError::QuotaExceeded {
            requested_bytes,
            quota_bytes,
        }
    } else {
        BackendError::Unavailable(message)
    }
}

impl StorageBackend for ChromeStorageArea {
    fn get<'a>(&'a self, keys: &'a [String]) -> BackendFuture<'a, Result<StorageMap, BackendError>> {
        Box::pin(async move {
            bridge::storage_get(self.area.as_str(), keys)
                .await
                .map_err(BackendError::Unavailable)
        })
    }

    fn get_all<'a>(&'a self) -> BackendFuture<'a, Result<StorageMap, BackendError>> {
        Box::pin(async move {
            bridge::storage_get_all(self.area.as_str())
                .await
                .map_err(BackendError::Unavailable)
        })
    }

    fn set<'a>(&'a self, items: StorageMap) -> BackendFuture<'a, Result<(), BackendError>> {
        Box::pin(async move {
            match bridge::storage_set(self.area.as_str(), &items).await {
                Ok(()) => Ok(()),
                Err(message) => {
                    let held = bridge::storage_bytes_in_use(self.area.as_str())
                        .await
                        .unwrap_or(0);
                    Err(classify_host_error(
                        message,
                        held + map_size_bytes(&items),
                        self.quota_bytes(),
                    ))
                }
            }
        })
    }

    fn remove<'a>(&'a self, keys: &'a [String]) -> BackendFuture<'a, Result<(), BackendError>> {
        Box::pin(async move {
            bridge::storage_remove(self.area.as_str(), keys)
                .await
                .map_err(BackendError::Unavailable)
        })
    }

    fn clear<'a>(&'a self) -> BackendFuture<'a, Result<(), BackendError>> {
        Box::pin(async move {
            bridge::storage_clear(self.area.as_str())
                .await
                .map_err(BackendError::Unavailable)
        })
    }

    fn bytes_in_use<'a>(&'a self) -> BackendFuture<'a, Result<u64, BackendError>> {
        Box::pin(async move {
            bridge::storage_bytes_in_use(self.area.as_str())
                .await
                .map_err(BackendError::Unavailable)
        })
    }

    fn quota_bytes(&self) -> u64 {
        bridge::storage_quota(self.area.as_str())
    }

    fn subscribe(&self, listener: ChangeListener) -> SubscriptionId {
        let id = self.listeners.add(listener);
        self.ensure_feed();
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.remove(id);
        if self.listeners.is_empty() {
            self.feed.borrow_mut().take();
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn quota_messages_map_to_quota_exceeded() {
        assert_eq!(
            classify_host_error("QUOTA_BYTES quota exceeded".to_string(), 120_000, 102_400),
            BackendError::QuotaExceeded {
                requested_bytes: 120_000,
                quota_bytes: 102_400
            }
        );
        assert_eq!(
            classify_host_error("QuotaExceededError".to_string(), 1, 1),
            BackendError::QuotaExceeded {
                requested_bytes: 1,
                quota_bytes: 1
            }
        );
        assert_eq!(
            classify_host_error("Extension context invalidated.".to_string(), 1, 1),
            BackendError::Unavailable("Extension context invalidated.".to_string())
        );
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn areas_report_browser_quotas_and_fail_off_wasm() {
        let sync = ChromeStorageArea::sync();
        let local = ChromeStorageArea::local();
        assert_eq!(sync.quota_bytes(), 102_400);
        assert_eq!(local.quota_bytes(), 5_242_880);
        assert!(matches!(
            block_on(sync.get_all()),
            Err(BackendError::Unavailable(_))
        ));
        assert!(matches!(
            block_on(local.set(StorageMap::new())),
            Err(BackendError::Unavailable(_))
        ));
    }

    #[test]
    fn feed_registration_follows_subscriber_count() {
        let area = ChromeStorageArea::local();
        let first = area.subscribe(Rc::new(|_: &StorageChanges| {}));
        let second = area.subscribe(Rc::new(|_: &StorageChanges| {}));
        assert!(area.feed.borrow().is_some());
        area.unsubscribe(first);
        assert!(area.feed.borrow().is_some());
        area.unsubscribe(second);
        assert!(area.feed.borrow().is_none());
    }
}
