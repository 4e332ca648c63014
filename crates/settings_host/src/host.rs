//! Host service bundle consumed by the settings runtime.

use std::{fmt, rc::Rc};

use crate::{BroadcastSlot, Clock, StorageBackend, TaskSpawner, TimerService};

/// Every host capability one view of the new-tab page needs, bundled behind trait objects.
///
/// Browser builds assemble it from `chrome.storage` and `window` adapters; tests assemble it from
/// the in-memory adapters in [`crate::memory`].
#[derive(Clone)]
pub struct SettingsHost {
    /// Small, account-replicated storage area.
    pub replicated: Rc<dyn StorageBackend>,
    /// Large, device-local storage area.
    pub local: Rc<dyn StorageBackend>,
    /// Fast cross-view notification slot.
    pub broadcast_slot: Rc<dyn BroadcastSlot>,
    /// Periodic timers.
    pub timers: Rc<dyn TimerService>,
    /// Local task spawning.
    pub spawner: Rc<dyn TaskSpawner>,
    /// Wall clock for change records and backups.
    pub clock: Rc<dyn Clock>,
}

impl fmt::Debug for SettingsHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsHost")
            .field("replicated_quota", &self.replicated.quota_bytes())
            .field("local_quota", &self.local.quota_bytes())
            .field("now_ms", &self.clock.now_ms())
            .finish_non_exhaustive()
    }
}
