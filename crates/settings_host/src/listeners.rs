//! Single-threaded listener registry shared by host adapters and the runtime.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Handle returned by every `subscribe`-style call; pass it back to unsubscribe.
pub struct SubscriptionId(pub u64);

/// Reference-counted listener callback for events of type `E`.
pub type Listener<E> = Rc<dyn Fn(&E)>;

/// Ordered set of listeners keyed by [`SubscriptionId`].
///
/// Emission works on a snapshot of the registered listeners, so a listener may subscribe or
/// unsubscribe (itself or others) while an event is being delivered.
pub struct ListenerRegistry<E: ?Sized> {
    next_id: Cell<u64>,
    listeners: RefCell<Vec<(SubscriptionId, Listener<E>)>>,
}

impl<E: ?Sized> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self {
            next_id: Cell::new(1),
            listeners: RefCell::new(Vec::new()),
        }
    }
}

impl<E: ?Sized> fmt::Debug for ListenerRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

impl<E: ?Sized> ListenerRegistry<E> {
    /// Registers `listener` and returns its handle.
    pub fn add(&self, listener: Listener<E>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.listeners.borrow_mut().push((id, listener));
        id
    }

    /// Removes a listener. Returns `false` when the handle was unknown.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Delivers `event` to every listener registered at call time, in registration order.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = self
            .listeners
            .borrow()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.borrow().len()
    }

    /// Returns whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
