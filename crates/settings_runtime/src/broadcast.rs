//! Cross-view change propagation.
//!
//! Two channels feed one stream of [`SettingChange`] notifications:
//!
//! - the broadcast slot, a lossy low-latency hint holding only the most recent [`ChangeRecord`];
//! - the change feeds of both storage backends, which are authoritative and ordered per key.
//!
//! A hint is applied only when its timestamp is newer than the last hint applied for the same
//! key. Hint timestamps come from the writer's clock, so backend changes never move that
//! watermark; they are always applied. Repeated delivery of an already applied value (the same
//! write arriving on both channels) is not re-announced.
//!
//! The slot is not a queue: a slow listener is only guaranteed to see some write that happened
//! after its last read. There is no per-key version counter.

use std::{
    cell::RefCell,
    collections::HashMap,
    fmt,
    rc::{Rc, Weak},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use settings_host::{
    BroadcastSlot, Clock, Listener, ListenerRegistry, SettingsHost, StorageBackend,
    StorageChanges, SubscriptionId,
};

use crate::keys::{BackendAssignment, BackendKind, PayloadClass};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Most recent write, as stored in the shared broadcast slot.
pub struct ChangeRecord {
    /// Written key.
    pub key: String,
    /// Full value written.
    pub value: Value,
    /// Writer's unix time in milliseconds.
    pub timestamp: u64,
    /// Payload class of the key.
    pub payload_class: PayloadClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Channel a [`SettingChange`] arrived on.
pub enum ChangeSource {
    /// The broadcast slot.
    Hint,
    /// A backend change feed.
    Backend(BackendKind),
}

#[derive(Debug, Clone, PartialEq)]
/// Notification delivered to subscribers.
pub struct SettingChange {
    /// Changed key.
    pub key: String,
    /// New value, `None` when the key was removed.
    pub new_value: Option<Value>,
    /// Delivering channel.
    pub source: ChangeSource,
}

#[derive(Debug, Clone)]
struct AppliedValue {
    hint_timestamp: Option<u64>,
    value: Option<Value>,
}

enum Attachment {
    Slot(SubscriptionId),
    Backend(BackendKind, SubscriptionId),
}

/// Per-view change broadcaster.
pub struct ChangeBroadcaster {
    assignment: Rc<BackendAssignment>,
    slot: Rc<dyn BroadcastSlot>,
    replicated: Rc<dyn StorageBackend>,
    local: Rc<dyn StorageBackend>,
    clock: Rc<dyn Clock>,
    applied: RefCell<HashMap<String, AppliedValue>>,
    listeners: ListenerRegistry<SettingChange>,
    attachments: RefCell<Vec<Attachment>>,
}

impl fmt::Debug for ChangeBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeBroadcaster")
            .field("tracked_keys", &self.applied.borrow().len())
            .field("listeners", &self.listeners.len())
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl ChangeBroadcaster {
    /// Creates a broadcaster for one view and attaches it to the slot and both backend feeds.
    pub fn attach(host: &SettingsHost, assignment: Rc<BackendAssignment>) -> Rc<Self> {
        let broadcaster = Rc::new(Self {
            assignment,
            slot: host.broadcast_slot.clone(),
            replicated: host.replicated.clone(),
            local: host.local.clone(),
            clock: host.clock.clone(),
            applied: RefCell::new(HashMap::new()),
            listeners: ListenerRegistry::default(),
            attachments: RefCell::new(Vec::new()),
        });
        broadcaster.connect();
        broadcaster
    }

    fn connect(self: &Rc<Self>) {
        let weak: Weak<Self> = Rc::downgrade(self);
        let slot_id = self.slot.subscribe(Rc::new(move |payload: &str| {
            if let Some(broadcaster) = weak.upgrade() {
                broadcaster.receive_hint(payload);
            }
        }));

        let mut attachments = vec![Attachment::Slot(slot_id)];
        for kind in BackendKind::ALL {
            let weak: Weak<Self> = Rc::downgrade(self);
            let id = self.backend(kind).subscribe(Rc::new(move |changes: &StorageChanges| {
                if let Some(broadcaster) = weak.upgrade() {
                    broadcaster.receive_backend_changes(kind, changes);
                }
            }));
            attachments.push(Attachment::Backend(kind, id));
        }
        *self.attachments.borrow_mut() = attachments;
    }

    fn backend(&self, kind: BackendKind) -> &Rc<dyn StorageBackend> {
        match kind {
            BackendKind::Replicated => &self.replicated,
            BackendKind::Local => &self.local,
        }
    }

    /// Whether the broadcaster still listens to its channels.
    pub fn is_attached(&self) -> bool {
        !self.attachments.borrow().is_empty()
    }

    /// Stops listening to the slot and backend feeds. Idempotent.
    pub fn detach(&self) {
        let attachments = std::mem::take(&mut *self.attachments.borrow_mut());
        for attachment in attachments {
            match attachment {
                Attachment::Slot(id) => self.slot.unsubscribe(id),
                Attachment::Backend(kind, id) => self.backend(kind).unsubscribe(id),
            }
        }
    }

    /// Registers a change listener.
    pub fn subscribe(&self, listener: Listener<SettingChange>) -> SubscriptionId {
        self.listeners.add(listener)
    }

    /// Removes a change listener.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.remove(id);
    }

    /// Announces a persisted write on the broadcast slot. Failures are logged, never returned.
    pub fn publish(&self, key: &str, value: &Value) {
        if !self.assignment.broadcasts(key) {
            return;
        }
        let record = ChangeRecord {
            key: key.to_string(),
            value: value.clone(),
            timestamp: self.clock.now_ms(),
            payload_class: self.assignment.payload_class(key, value),
        };
        let payload = match serde_json::to_string(&record) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(key, error = %err, "change record not encodable; hint skipped");
                return;
            }
        };
        if let Err(err) = self.slot.write(&payload) {
            tracing::warn!(key, error = %err, "broadcast slot write failed");
        }
    }

    fn receive_hint(&self, payload: &str) {
        let record: ChangeRecord = match serde_json::from_str(payload) {
            Ok(record) => record,
            Err(err) => {
                tracing::debug!(error = %err, "ignoring malformed change record");
                return;
            }
        };
        let stale = self
            .applied
            .borrow()
            .get(&record.key)
            .and_then(|applied| applied.hint_timestamp)
            .is_some_and(|seen| record.timestamp <= seen);
        if stale {
            tracing::debug!(key = %record.key, "ignoring stale change record");
            return;
        }
        self.apply(
            record.key,
            Some(record.value),
            Some(record.timestamp),
            ChangeSource::Hint,
        );
    }

    fn receive_backend_changes(&self, kind: BackendKind, changes: &StorageChanges) {
        for (key, change) in changes {
            self.apply(
                key.clone(),
                change.new_value.clone(),
                None,
                ChangeSource::Backend(kind),
            );
        }
    }

    fn apply(
        &self,
        key: String,
        value: Option<Value>,
        hint_timestamp: Option<u64>,
        source: ChangeSource,
    ) {
        let changed = {
            let mut applied = self.applied.borrow_mut();
            match applied.get_mut(&key) {
                Some(entry) => {
                    let changed = entry.value != value;
                    if hint_timestamp.is_some() {
                        entry.hint_timestamp = entry.hint_timestamp.max(hint_timestamp);
                    }
                    entry.value = value.clone();
                    changed
                }
                None => {
                    applied.insert(
                        key.clone(),
                        AppliedValue {
                            hint_timestamp,
                            value: value.clone(),
                        },
                    );
                    true
                }
            }
        };
        if changed {
            tracing::debug!(key = %key, ?source, "setting changed");
            self.listeners.emit(&SettingChange {
                key,
                new_value: value,
                source,
            });
        }
    }
}

impl Drop for ChangeBroadcaster {
    fn drop(&mut self) {
        self.detach();
    }
}
