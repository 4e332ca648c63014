//! Periodic per-backend usage measurement with rising-edge warnings.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
    time::Duration,
};

use futures::{future::join, FutureExt};
use serde::Serialize;
use settings_host::{
    IntervalHandle, Listener, ListenerRegistry, SubscriptionId, TaskSpawner, TimerService,
};

use crate::{error::SettingsError, keys::BackendKind, store::PartitionedStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
/// Bytes used against the quota of one backend.
pub struct BackendUsage {
    /// Bytes currently held.
    pub used_bytes: u64,
    /// Backend quota.
    pub quota_bytes: u64,
}

impl BackendUsage {
    /// Fraction of the quota in use. A zero quota reports `0.0`.
    pub fn ratio(&self) -> f64 {
        if self.quota_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.quota_bytes as f64
        }
    }

    /// Rounded percentage of the quota in use.
    pub fn percent(&self) -> u32 {
        (self.ratio() * 100.0).round() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
/// Usage of both backends at one measurement.
pub struct QuotaStatus {
    /// Replicated backend usage.
    pub replicated: BackendUsage,
    /// Local backend usage.
    pub local: BackendUsage,
}

impl QuotaStatus {
    /// Usage of one backend.
    pub fn usage(&self, kind: BackendKind) -> BackendUsage {
        match kind {
            BackendKind::Replicated => self.replicated,
            BackendKind::Local => self.local,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Informational warning raised once per high-water crossing.
pub struct QuotaWarning {
    /// Backend that crossed the mark.
    pub backend: BackendKind,
    /// Usage at the crossing.
    pub usage: BackendUsage,
    /// User-facing message.
    pub message: String,
}

impl QuotaWarning {
    fn new(backend: BackendKind, usage: BackendUsage) -> Self {
        Self {
            backend,
            usage,
            message: format!(
                "{} storage is {}% full!",
                backend.display_name(),
                usage.percent()
            ),
        }
    }
}

/// Measures backend usage on a fixed period and warns on each rising edge over the high-water
/// mark. Warnings are informational; nothing is evicted.
pub struct QuotaMonitor {
    store: Rc<PartitionedStore>,
    timers: Rc<dyn TimerService>,
    spawner: Rc<dyn TaskSpawner>,
    period: Duration,
    high_water_ratio: f64,
    above: Cell<[bool; 2]>,
    last_status: Cell<Option<QuotaStatus>>,
    listeners: ListenerRegistry<QuotaWarning>,
    interval: RefCell<Option<IntervalHandle>>,
    weak_self: Weak<Self>,
}

impl fmt::Debug for QuotaMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaMonitor")
            .field("period", &self.period)
            .field("high_water_ratio", &self.high_water_ratio)
            .field("last_status", &self.last_status.get())
            .field("running", &self.is_running())
            .finish()
    }
}

fn slot(kind: BackendKind) -> usize {
    match kind {
        BackendKind::Replicated => 0,
        BackendKind::Local => 1,
    }
}

impl QuotaMonitor {
    /// Creates a stopped monitor.
    pub fn new(
        store: Rc<PartitionedStore>,
        timers: Rc<dyn TimerService>,
        spawner: Rc<dyn TaskSpawner>,
        period: Duration,
        high_water_ratio: f64,
    ) -> Rc<Self> {
        Rc::new_cyclic(|weak_self| Self {
            store,
            timers,
            spawner,
            period,
            high_water_ratio,
            above: Cell::new([false; 2]),
            last_status: Cell::new(None),
            listeners: ListenerRegistry::default(),
            interval: RefCell::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// Registers a warning listener.
    pub fn on_warning(&self, listener: Listener<QuotaWarning>) -> SubscriptionId {
        self.listeners.add(listener)
    }

    /// Removes a warning listener.
    pub fn off_warning(&self, id: SubscriptionId) {
        self.listeners.remove(id);
    }

    /// Status recorded by the last successful check.
    pub fn last_status(&self) -> Option<QuotaStatus> {
        self.last_status.get()
    }

    /// Whether the periodic check is armed.
    pub fn is_running(&self) -> bool {
        self.interval.borrow().is_some()
    }

    /// Measures both backends without touching warning state.
    ///
    /// # Errors
    ///
    /// Returns a backend-scoped error when either measurement fails.
    pub async fn measure(&self) -> Result<QuotaStatus, SettingsError> {
        let (replicated, local) = join(
            self.store.bytes_in_use(BackendKind::Replicated),
            self.store.bytes_in_use(BackendKind::Local),
        )
        .await;
        Ok(QuotaStatus {
            replicated: BackendUsage {
                used_bytes: replicated?,
                quota_bytes: self.store.backend(BackendKind::Replicated).quota_bytes(),
            },
            local: BackendUsage {
                used_bytes: local?,
                quota_bytes: self.store.backend(BackendKind::Local).quota_bytes(),
            },
        })
    }

    /// Measures both backends and raises one warning per backend that crossed the high-water
    /// mark since the previous successful check.
    ///
    /// # Errors
    ///
    /// A failed measurement is returned and leaves the crossing state untouched.
    pub async fn check_quota(&self) -> Result<QuotaStatus, SettingsError> {
        let status = match self.measure().await {
            Ok(status) => status,
            Err(err) => {
                tracing::warn!(error = %err, "quota measurement failed; keeping previous state");
                return Err(err);
            }
        };

        let mut above = self.above.get();
        let mut warnings = Vec::new();
        for kind in BackendKind::ALL {
            let usage = status.usage(kind);
            let now_above = usage.ratio() >= self.high_water_ratio;
            if now_above && !above[slot(kind)] {
                warnings.push(QuotaWarning::new(kind, usage));
            }
            above[slot(kind)] = now_above;
        }
        self.above.set(above);
        self.last_status.set(Some(status));

        for warning in warnings {
            tracing::warn!(backend = %warning.backend, percent = warning.usage.percent(), "{}", warning.message);
            self.listeners.emit(&warning);
        }
        Ok(status)
    }

    /// Runs one check now and then every period until [`QuotaMonitor::stop`].
    pub fn start(&self) {
        if self.is_running() {
            return;
        }
        self.spawn_check();
        let weak = self.weak_self.clone();
        let handle = self.timers.set_interval(
            self.period,
            Rc::new(move || {
                if let Some(monitor) = weak.upgrade() {
                    monitor.spawn_check();
                }
            }),
        );
        *self.interval.borrow_mut() = Some(handle);
    }

    /// Cancels the periodic check.
    pub fn stop(&self) {
        let handle = self.interval.borrow_mut().take();
        drop(handle);
    }

    fn spawn_check(&self) {
        let Some(monitor) = self.weak_self.upgrade() else {
            return;
        };
        self.spawner.spawn_local(
            async move {
                let _ = monitor.check_quota().await;
            }
            .boxed_local(),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use settings_host::{MemoryInstallation, MemoryStorageBackend, StorageMap};
    use tracing_test::traced_test;

    use super::*;
    use crate::keys::BackendAssignment;

    fn filler(bytes: usize) -> StorageMap {
        // key "k" (1) + quotes (2) + payload
        let mut items = StorageMap::new();
        items.insert("k".into(), json!("x".repeat(bytes - 3)));
        items
    }

    fn monitor_for(installation: &MemoryInstallation) -> (Rc<PartitionedStore>, Rc<QuotaMonitor>) {
        let host = installation.view_host();
        let store = Rc::new(PartitionedStore::new(
            &host,
            Rc::new(BackendAssignment::default()),
        ));
        let monitor = QuotaMonitor::new(
            store.clone(),
            host.timers.clone(),
            host.spawner.clone(),
            Duration::from_secs(60),
            0.9,
        );
        (store, monitor)
    }

    fn collect(monitor: &QuotaMonitor) -> Rc<RefCell<Vec<QuotaWarning>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        monitor.on_warning(Rc::new(move |warning: &QuotaWarning| {
            sink.borrow_mut().push(warning.clone())
        }));
        seen
    }

    #[traced_test]
    #[test]
    fn warns_once_per_rising_edge() {
        let installation = MemoryInstallation::with_backends(
            MemoryStorageBackend::with_quota(1_000),
            MemoryStorageBackend::local(),
        );
        let (store, monitor) = monitor_for(&installation);
        let warnings = collect(&monitor);

        installation.block_on(store.set(filler(890))).expect("89%");
        let status = installation
            .block_on(monitor.check_quota())
            .expect("check");
        assert_eq!(status.replicated.used_bytes, 890);
        assert!(warnings.borrow().is_empty());

        installation.block_on(store.set(filler(910))).expect("91%");
        installation
            .block_on(monitor.check_quota())
            .expect("check");
        installation
            .block_on(monitor.check_quota())
            .expect("check again");

        assert_eq!(warnings.borrow().len(), 1);
        assert_eq!(warnings.borrow()[0].backend, BackendKind::Replicated);
        assert_eq!(warnings.borrow()[0].message, "Sync storage is 91% full!");
        assert!(logs_contain("Sync storage is 91% full!"));

        installation.block_on(store.set(filler(500))).expect("50%");
        installation.block_on(monitor.check_quota()).expect("drop");
        installation.block_on(store.set(filler(950))).expect("95%");
        installation.block_on(monitor.check_quota()).expect("rise");
        assert_eq!(warnings.borrow().len(), 2);
    }

    #[traced_test]
    #[test]
    fn failed_measurement_keeps_previous_state() {
        let installation = MemoryInstallation::with_backends(
            MemoryStorageBackend::with_quota(1_000),
            MemoryStorageBackend::local(),
        );
        let (store, monitor) = monitor_for(&installation);
        let warnings = collect(&monitor);

        installation.block_on(store.set(filler(950))).expect("95%");
        installation.block_on(monitor.check_quota()).expect("warn");
        installation.replicated.set_unavailable(Some("offline"));
        assert!(installation.block_on(monitor.check_quota()).is_err());
        assert!(logs_contain("quota measurement failed"));
        installation.replicated.set_unavailable(None);
        installation.block_on(monitor.check_quota()).expect("still above");

        assert_eq!(warnings.borrow().len(), 1);
        assert_eq!(
            monitor.last_status().map(|status| status.replicated.used_bytes),
            Some(950)
        );
    }

    #[test]
    fn periodic_checks_run_until_stopped() {
        let installation = MemoryInstallation::with_backends(
            MemoryStorageBackend::with_quota(1_000),
            MemoryStorageBackend::local(),
        );
        let (store, monitor) = monitor_for(&installation);
        let warnings = collect(&monitor);

        monitor.start();
        installation.run_until_stalled();
        assert!(monitor.last_status().is_some());

        installation.block_on(store.set(filler(950))).expect("95%");
        installation.advance(Duration::from_secs(60));
        assert_eq!(warnings.borrow().len(), 1);

        monitor.stop();
        assert!(!monitor.is_running());
        assert_eq!(installation.timers.active_intervals(), 0);
    }

    #[test]
    fn zero_quota_reports_zero_ratio() {
        let usage = BackendUsage {
            used_bytes: 10,
            quota_bytes: 0,
        };
        assert_eq!(usage.ratio(), 0.0);
        assert_eq!(usage.percent(), 0);
    }
}
