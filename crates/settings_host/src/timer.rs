//! Periodic timer contract and a manually advanced implementation.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    fmt,
    rc::{Rc, Weak},
    time::Duration,
};

/// Callback fired on every interval tick.
pub type TickCallback = Rc<dyn Fn()>;

/// Cancels a registered interval when cleared or dropped.
pub struct IntervalHandle {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl IntervalHandle {
    /// Wraps a host-specific cancellation routine.
    pub fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Handle that owns no timer.
    pub fn inert() -> Self {
        Self { cancel: None }
    }

    /// Cancels the interval. Later calls are no-ops.
    pub fn clear(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for IntervalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntervalHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

impl Drop for IntervalHandle {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Host service that runs a callback periodically until the returned handle is cleared.
pub trait TimerService {
    /// Registers `callback` to fire every `period`.
    fn set_interval(&self, period: Duration, callback: TickCallback) -> IntervalHandle;
}

struct ManualInterval {
    period_ms: u64,
    next_due_ms: u64,
    callback: TickCallback,
}

#[derive(Default)]
struct ManualTimerInner {
    now_ms: Cell<u64>,
    next_id: Cell<u64>,
    intervals: RefCell<BTreeMap<u64, ManualInterval>>,
}

#[derive(Clone, Default)]
/// Timer service driven explicitly by [`ManualTimerService::advance`].
pub struct ManualTimerService {
    inner: Rc<ManualTimerInner>,
}

impl fmt::Debug for ManualTimerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualTimerService")
            .field("now_ms", &self.inner.now_ms.get())
            .field("intervals", &self.active_intervals())
            .finish()
    }
}

impl ManualTimerService {
    /// Number of intervals that have not been cleared.
    pub fn active_intervals(&self) -> usize {
        self.inner.intervals.borrow().len()
    }

    /// Period of every active interval, in registration order.
    pub fn active_periods(&self) -> Vec<Duration> {
        self.inner
            .intervals
            .borrow()
            .values()
            .map(|interval| Duration::from_millis(interval.period_ms))
            .collect()
    }

    /// Moves virtual time forward, firing every tick that falls due in chronological order.
    ///
    /// Callbacks run with no internal borrow held, so they may register or clear intervals.
    pub fn advance(&self, by: Duration) {
        let target = self
            .inner
            .now_ms
            .get()
            .saturating_add(by.as_millis() as u64);
        loop {
            let due = self
                .inner
                .intervals
                .borrow()
                .iter()
                .filter(|(_, interval)| interval.next_due_ms <= target)
                .min_by_key(|(id, interval)| (interval.next_due_ms, **id))
                .map(|(id, interval)| (*id, interval.next_due_ms));
            let Some((id, due_ms)) = due else {
                break;
            };

            self.inner.now_ms.set(due_ms);
            let callback = {
                let mut intervals = self.inner.intervals.borrow_mut();
                let Some(interval) = intervals.get_mut(&id) else {
                    continue;
                };
                interval.next_due_ms = due_ms.saturating_add(interval.period_ms.max(1));
                interval.callback.clone()
            };
            callback();
        }
        self.inner.now_ms.set(target);
    }
}

impl TimerService for ManualTimerService {
    fn set_interval(&self, period: Duration, callback: TickCallback) -> IntervalHandle {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        let period_ms = (period.as_millis() as u64).max(1);
        self.inner.intervals.borrow_mut().insert(
            id,
            ManualInterval {
                period_ms,
                next_due_ms: self.inner.now_ms.get().saturating_add(period_ms),
                callback,
            },
        );

        let weak: Weak<ManualTimerInner> = Rc::downgrade(&self.inner);
        IntervalHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.intervals.borrow_mut().remove(&id);
            }
        })
    }
}
