//! `localStorage`-backed cross-view broadcast slot.

use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

use settings_host::{BroadcastSlot, ListenerRegistry, SlotListener, SubscriptionId};

use crate::bridge;

/// `localStorage` key every view writes change records to.
pub const BROADCAST_SLOT_KEY: &str = "lastUpdate";

/// Broadcast slot over one `localStorage` key.
///
/// Browsers raise the `storage` event only in views other than the writer, which is exactly the
/// delivery the slot contract asks for.
pub struct LocalStorageBroadcastSlot {
    key: String,
    listeners: Rc<ListenerRegistry<str>>,
    watcher: RefCell<Option<bridge::StorageEventHandle>>,
}

impl fmt::Debug for LocalStorageBroadcastSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStorageBroadcastSlot")
            .field("key", &self.key)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Default for LocalStorageBroadcastSlot {
    fn default() -> Self {
        Self::new(BROADCAST_SLOT_KEY)
    }
}

impl LocalStorageBroadcastSlot {
    /// Creates a slot over `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            listeners: Rc::new(ListenerRegistry::default()),
            watcher: RefCell::new(None),
        }
    }

    fn ensure_watcher(&self) {
        if self.watcher.borrow().is_some() {
            return;
        }
        let weak: Weak<ListenerRegistry<str>> = Rc::downgrade(&self.listeners);
        match bridge::watch_storage_key(&self.key, move |payload| {
            if let Some(listeners) = weak.upgrade() {
                listeners.emit(payload.as_str());
            }
        }) {
            Ok(handle) => *self.watcher.borrow_mut() = Some(handle),
            Err(err) => tracing::warn!(key = %self.key, error = %err, "storage events unavailable"),
        }
    }
}

impl BroadcastSlot for LocalStorageBroadcastSlot {
    fn write(&self, payload: &str) -> Result<(), String> {
        bridge::slot_write(&self.key, payload)
    }

    fn read(&self) -> Option<String> {
        bridge::slot_read(&self.key)
    }

    fn subscribe(&self, listener: SlotListener) -> SubscriptionId {
        let id = self.listeners.add(listener);
        self.ensure_watcher();
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.remove(id);
        if self.listeners.is_empty() {
            self.watcher.borrow_mut().take();
        }
    }
}
