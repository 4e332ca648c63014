//! Storage backend contracts and in-memory adapters.

pub mod backend;
pub mod change;

pub use backend::{
    item_size_bytes, map_size_bytes, BackendError, BackendFuture, MemoryStorageBackend,
    StorageBackend, StorageMap, LOCAL_AREA_QUOTA_BYTES, REPLICATED_AREA_QUOTA_BYTES,
};
pub use change::{ChangeListener, StorageChange, StorageChanges};
