//! Fast cross-view notification slot.
//!
//! In the browser this is a single `localStorage` key whose writes raise a `storage` event in
//! every other open view of the same installation. The writer itself is never notified.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

use crate::listeners::{Listener, ListenerRegistry, SubscriptionId};

/// Listener invoked with the raw payload written by another view.
pub type SlotListener = Listener<str>;

/// Single-value slot shared by every view of one installation.
pub trait BroadcastSlot {
    /// Overwrites the slot and notifies every other view.
    ///
    /// # Errors
    ///
    /// Returns the host error text when the slot cannot be written.
    fn write(&self, payload: &str) -> Result<(), String>;

    /// Returns the last payload written by any view.
    fn read(&self) -> Option<String>;

    /// Attaches a listener for writes made by other views.
    fn subscribe(&self, listener: SlotListener) -> SubscriptionId;

    /// Detaches a slot listener.
    fn unsubscribe(&self, id: SubscriptionId);
}

struct HubView {
    id: u64,
    listeners: Rc<ListenerRegistry<str>>,
}

#[derive(Default)]
struct HubInner {
    value: RefCell<Option<String>>,
    views: RefCell<Vec<HubView>>,
    next_view: Cell<u64>,
    write_failure: RefCell<Option<String>>,
}

#[derive(Clone, Default)]
/// In-memory stand-in for `localStorage` storage events across several views.
pub struct MemoryBroadcastHub {
    inner: Rc<HubInner>,
}

impl fmt::Debug for MemoryBroadcastHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBroadcastHub")
            .field("views", &self.inner.views.borrow().len())
            .field("value", &self.inner.value.borrow())
            .finish()
    }
}

impl MemoryBroadcastHub {
    /// Creates a slot handle for one more view.
    pub fn attach(&self) -> MemoryBroadcastSlot {
        let id = self.inner.next_view.get();
        self.inner.next_view.set(id + 1);
        let listeners = Rc::new(ListenerRegistry::default());
        self.inner.views.borrow_mut().push(HubView {
            id,
            listeners: listeners.clone(),
        });
        MemoryBroadcastSlot {
            hub: self.clone(),
            view_id: id,
            listeners,
        }
    }

    /// Makes every subsequent write fail with `reason` until cleared.
    pub fn set_write_failure(&self, reason: Option<&str>) {
        *self.inner.write_failure.borrow_mut() = reason.map(str::to_string);
    }

    fn publish(&self, from_view: u64, payload: &str) -> Result<(), String> {
        if let Some(reason) = self.inner.write_failure.borrow().clone() {
            return Err(reason);
        }
        *self.inner.value.borrow_mut() = Some(payload.to_string());
        let targets: Vec<Rc<ListenerRegistry<str>>> = self
            .inner
            .views
            .borrow()
            .iter()
            .filter(|view| view.id != from_view)
            .map(|view| view.listeners.clone())
            .collect();
        for listeners in targets {
            listeners.emit(payload);
        }
        Ok(())
    }
}

/// One view's handle onto a [`MemoryBroadcastHub`].
pub struct MemoryBroadcastSlot {
    hub: MemoryBroadcastHub,
    view_id: u64,
    listeners: Rc<ListenerRegistry<str>>,
}

impl fmt::Debug for MemoryBroadcastSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBroadcastSlot")
            .field("view_id", &self.view_id)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl BroadcastSlot for MemoryBroadcastSlot {
    fn write(&self, payload: &str) -> Result<(), String> {
        self.hub.publish(self.view_id, payload)
    }

    fn read(&self) -> Option<String> {
        self.hub.inner.value.borrow().clone()
    }

    fn subscribe(&self, listener: SlotListener) -> SubscriptionId {
        self.listeners.add(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.remove(id);
    }
}

impl Drop for MemoryBroadcastSlot {
    fn drop(&mut self) {
        self.hub
            .inner
            .views
            .borrow_mut()
            .retain(|view| view.id != self.view_id);
    }
}
