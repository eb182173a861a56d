//! Cooperative stop for long-running engines.
//!
//! Both the copy engine and the integrity checker run work units on their own
//! pools. A stop request raises a shared flag that work units poll between
//! chunks; the completion callback fires once every running unit has returned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Callback invoked once a stop request has been honoured.
pub type StopCallback = Box<dyn FnOnce() + Send + 'static>;

/// Anything that can be asked to wind down.
pub trait Stoppable {
    /// Request a stop. `on_done` runs once all in-flight work has returned,
    /// or right away when nothing is running.
    fn stop(&self, on_done: StopCallback);
}

#[derive(Default)]
struct RunState {
    active: usize,
    waiters: Vec<StopCallback>,
}

/// Stop flag plus a count of running work units.
#[derive(Default)]
pub struct RunControl {
    stop: Arc<AtomicBool>,
    state: Mutex<RunState>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Flag polled by work units.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.state().active > 0
    }

    /// Register `units` work units about to run.
    pub(crate) fn enter(&self, units: usize) {
        self.state().active += units;
    }

    /// Mark one work unit as finished.
    pub(crate) fn leave(&self) {
        let waiters = {
            let mut state = self.state();
            state.active = state.active.saturating_sub(1);
            if state.active > 0 {
                return;
            }
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter();
        }
    }

    /// Raise the stop flag and schedule `on_done`.
    pub fn request_stop(&self, on_done: StopCallback) {
        self.stop.store(true, Ordering::SeqCst);
        let mut state = self.state();
        if state.active == 0 {
            drop(state);
            on_done();
        } else {
            state.waiters.push(on_done);
        }
    }
}
