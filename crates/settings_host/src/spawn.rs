//! Local (single-threaded) task spawning contract.

use futures::{
    executor::LocalSpawner,
    future::LocalBoxFuture,
    task::LocalSpawnExt,
};

/// Host service that drives `'static` futures on the current thread's event loop.
///
/// Timer callbacks and change-feed listeners are synchronous, so any async follow-up work they
/// start (a persisted rotation step, a quota measurement) goes through this contract.
pub trait TaskSpawner {
    /// Schedules `task` to run to completion. Spawn failures are logged by the host and dropped.
    fn spawn_local(&self, task: LocalBoxFuture<'static, ()>);
}

impl TaskSpawner for LocalSpawner {
    fn spawn_local(&self, task: LocalBoxFuture<'static, ()>) {
        if let Err(err) = LocalSpawnExt::spawn_local(self, task) {
            tracing::warn!(error = %err, "local task dropped; executor is shut down");
        }
    }
}
