//! In-memory installation: shared storage and slot with any number of views.

use std::{cell::RefCell, fmt, future::Future, rc::Rc, time::Duration};

use futures::executor::LocalPool;

use crate::{
    ManualClock, ManualTimerService, MemoryBroadcastHub, MemoryStorageBackend, SettingsHost,
};

/// One simulated browser installation.
///
/// All views share the two storage areas, the broadcast slot, virtual time, and the task pool.
/// Spawned work and timer ticks only make progress when the installation is driven through
/// [`MemoryInstallation::block_on`], [`MemoryInstallation::run_until_stalled`], or
/// [`MemoryInstallation::advance`].
pub struct MemoryInstallation {
    /// Replicated area shared by all views.
    pub replicated: MemoryStorageBackend,
    /// Device-local area shared by all views.
    pub local: MemoryStorageBackend,
    /// Broadcast hub shared by all views.
    pub hub: MemoryBroadcastHub,
    /// Virtual timers.
    pub timers: ManualTimerService,
    /// Virtual wall clock.
    pub clock: ManualClock,
    pool: RefCell<LocalPool>,
}

impl Default for MemoryInstallation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryInstallation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryInstallation")
            .field("replicated", &self.replicated)
            .field("local", &self.local)
            .field("hub", &self.hub)
            .field("timers", &self.timers)
            .finish_non_exhaustive()
    }
}

impl MemoryInstallation {
    /// Creates an installation with browser-sized quotas and the clock at `1_700_000_000_000`.
    pub fn new() -> Self {
        Self::with_backends(MemoryStorageBackend::replicated(), MemoryStorageBackend::local())
    }

    /// Creates an installation over caller-supplied backends (for example tiny quotas).
    pub fn with_backends(replicated: MemoryStorageBackend, local: MemoryStorageBackend) -> Self {
        Self {
            replicated,
            local,
            hub: MemoryBroadcastHub::default(),
            timers: ManualTimerService::default(),
            clock: ManualClock::starting_at(1_700_000_000_000),
            pool: RefCell::new(LocalPool::new()),
        }
    }

    /// Builds the host bundle for one more open view.
    pub fn view_host(&self) -> SettingsHost {
        SettingsHost {
            replicated: Rc::new(self.replicated.clone()),
            local: Rc::new(self.local.clone()),
            broadcast_slot: Rc::new(self.hub.attach()),
            timers: Rc::new(self.timers.clone()),
            spawner: Rc::new(self.pool.borrow().spawner()),
            clock: Rc::new(self.clock.clone()),
        }
    }

    /// Drives `future` to completion, running spawned tasks alongside it.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.pool.borrow_mut().run_until(future)
    }

    /// Runs spawned tasks until none can make progress.
    pub fn run_until_stalled(&self) {
        self.pool.borrow_mut().run_until_stalled();
    }

    /// Advances virtual time (timers and clock) and settles spawned work.
    pub fn advance(&self, by: Duration) {
        self.clock.advance_ms(by.as_millis() as u64);
        self.timers.advance(by);
        self.run_until_stalled();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::StorageMap;

    #[test]
    fn views_share_storage_and_notify_each_other() {
        let installation = MemoryInstallation::new();
        let first = installation.view_host();
        let second = installation.view_host();

        let mut items = StorageMap::new();
        items.insert("backgroundColor".into(), json!("#123456"));
        installation
            .block_on(first.replicated.set(items))
            .expect("set");
        let keys = vec!["backgroundColor".to_string()];
        let read = installation
            .block_on(second.replicated.get(&keys))
            .expect("get");
        assert_eq!(read.get("backgroundColor"), Some(&json!("#123456")));

        let seen = Rc::new(RefCell::new(None));
        let sink = seen.clone();
        second
            .broadcast_slot
            .subscribe(Rc::new(move |payload: &str| {
                *sink.borrow_mut() = Some(payload.to_string())
            }));
        first.broadcast_slot.write("ping").expect("write");
        assert_eq!(seen.borrow().as_deref(), Some("ping"));
    }

    #[test]
    fn advance_moves_clock_and_timers_together() {
        let installation = MemoryInstallation::new();
        let host = installation.view_host();
        let start = host.clock.now_ms();
        let ticks = Rc::new(std::cell::Cell::new(0));
        let counter = ticks.clone();
        let _handle = host
            .timers
            .set_interval(Duration::from_secs(10), Rc::new(move || counter.set(counter.get() + 1)));

        installation.advance(Duration::from_secs(25));
        assert_eq!(ticks.get(), 2);
        assert_eq!(host.clock.now_ms(), start + 25_000);
    }
}
