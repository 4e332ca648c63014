//! `window.setInterval` timer service.

use std::time::Duration;

use settings_host::{IntervalHandle, TickCallback, TimerService};

#[derive(Debug, Clone, Copy, Default)]
/// Timer service backed by `window.setInterval` / `clearInterval`.
pub struct WindowTimerService;

impl TimerService for WindowTimerService {
    fn set_interval(&self, period: Duration, callback: TickCallback) -> IntervalHandle {
        #[cfg(target_arch = "wasm32")]
        {
            use wasm_bindgen::{closure::Closure, JsCast};

            let Some(window) = web_sys::window() else {
                tracing::warn!("window unavailable; interval not scheduled");
                return IntervalHandle::inert();
            };
            let closure = Closure::<dyn FnMut()>::wrap(Box::new(move || callback()));
            let millis = i32::try_from(period.as_millis()).unwrap_or(i32::MAX);
            match window.set_interval_with_callback_and_timeout_and_arguments_0(
                closure.as_ref().unchecked_ref(),
                millis,
            ) {
                Ok(id) => IntervalHandle::new(move || {
                    if let Some(window) = web_sys::window() {
                        window.clear_interval_with_handle(id);
                    }
                    drop(closure);
                }),
                Err(err) => {
                    tracing::warn!(error = ?err, "setInterval failed");
                    IntervalHandle::inert()
                }
            }
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            let _ = callback;
            tracing::debug!(?period, "window timers are only available on wasm32");
            IntervalHandle::inert()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn non_wasm_intervals_are_inert() {
        let mut handle = WindowTimerService.set_interval(Duration::from_secs(60), Rc::new(|| {}));
        handle.clear();
        handle.clear();
    }
}
