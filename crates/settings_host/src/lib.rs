//! Host contracts and in-memory adapters for the new-tab settings runtime.
//!
//! The runtime in `settings_runtime` only talks to the traits defined here: two key/value storage
//! areas with change feeds, a cross-view broadcast slot, periodic timers, local task spawning,
//! and a wall clock. Browser adapters live in `settings_host_web`; the in-memory adapters in this
//! crate model one browser installation with several open views for tests and headless use.

#![warn(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod broadcast_slot;
pub mod host;
pub mod listeners;
pub mod memory;
pub mod spawn;
pub mod storage;
pub mod time;
pub mod timer;

pub use broadcast_slot::{BroadcastSlot, MemoryBroadcastHub, MemoryBroadcastSlot, SlotListener};
pub use host::SettingsHost;
pub use listeners::{Listener, ListenerRegistry, SubscriptionId};
pub use memory::MemoryInstallation;
pub use spawn::TaskSpawner;
pub use storage::{
    item_size_bytes, map_size_bytes, BackendError, BackendFuture, ChangeListener,
    MemoryStorageBackend, StorageBackend, StorageChange, StorageChanges, StorageMap,
    LOCAL_AREA_QUOTA_BYTES, REPLICATED_AREA_QUOTA_BYTES,
};
pub use time::{next_monotonic_timestamp_ms, unix_time_ms_now, Clock, ManualClock, SystemClock};
pub use timer::{IntervalHandle, ManualTimerService, TickCallback, TimerService};
