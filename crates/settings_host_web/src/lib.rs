//! Browser (`wasm32`) implementations of the [`settings_host`] contracts.
//!
//! Storage goes through `chrome.storage.sync` / `chrome.storage.local` (falling back to prefixed
//! `localStorage` outside an extension), cross-view notifications through the `lastUpdate`
//! `localStorage` key and `storage` events, timers through `window.setInterval`, and spawned
//! work through the microtask queue.

#![warn(missing_docs, rustdoc::broken_intra_doc_links)]

mod bridge;
pub mod broadcast_slot;
pub mod spawn;
pub mod storage_area;
pub mod timer;

use std::rc::Rc;

use settings_host::{SettingsHost, SystemClock};

pub use broadcast_slot::{LocalStorageBroadcastSlot, BROADCAST_SLOT_KEY};
pub use spawn::WasmTaskSpawner;
pub use storage_area::{classify_host_error, ChromeStorageArea, StorageAreaName};
pub use timer::WindowTimerService;

/// Builds the host bundle for the current browser view.
pub fn browser_host() -> SettingsHost {
    SettingsHost {
        replicated: Rc::new(ChromeStorageArea::sync()),
        local: Rc::new(ChromeStorageArea::local()),
        broadcast_slot: Rc::new(LocalStorageBroadcastSlot::default()),
        timers: Rc::new(WindowTimerService),
        spawner: Rc::new(WasmTaskSpawner),
        clock: Rc::new(SystemClock),
    }
}
