//! Microtask-queue task spawner.

use futures::future::LocalBoxFuture;
use settings_host::TaskSpawner;

#[derive(Debug, Clone, Copy, Default)]
/// Spawner that hands futures to `wasm_bindgen_futures::spawn_local`.
pub struct WasmTaskSpawner;

impl TaskSpawner for WasmTaskSpawner {
    fn spawn_local(&self, task: LocalBoxFuture<'static, ()>) {
        #[cfg(target_arch = "wasm32")]
        {
            wasm_bindgen_futures::spawn_local(task);
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            drop(task);
            tracing::warn!("no browser event loop; spawned task dropped");
        }
    }
}
