//! One-second cadence driver on top of [`crate::runner::TaskRunner::iterate`].
//!
//! `iterate` itself is cadence-agnostic; something has to call it once a
//! second. The reference driver here is a dedicated `std::thread` — this
//! crate has no other use for an async runtime, so pulling one in just for
//! a one-Hz loop would be a dependency with a single caller — that sleeps
//! to absolute instants rather than repeatedly sleeping a relative second,
//! so the iteration loop does not accumulate drift from its own scheduling
//! latency.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::runner::TaskRunner;
use crate::schedule::AppStateSet;

/// Collaborator interface supplying the inputs to `iterate` that
/// `TaskRunner` itself has no other way to source: the application-state
/// bitset, the GPS-derived wall-clock time, and the battery charge. Uptime
/// comes from the runner's own `TimeSource` instead, since the runner
/// already owns that collaborator.
pub trait AutoIterateInputs: Send + Sync {
    fn app_states(&self) -> AppStateSet;
    fn gps_time_s(&self) -> u64;
    fn battery_percent(&self) -> u8;
}

/// Handle to a running auto-iterate driver thread. Dropping it stops the
/// thread, the same as calling [`AutoIterateHandle::stop`] explicitly.
pub struct AutoIterateHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl AutoIterateHandle {
    /// Signal the driver thread to stop and block until it exits. Safe to
    /// call more than once.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for AutoIterateHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawns the one-Hz driver thread. Each firing locks `runner` just long
/// enough to call one `iterate`; `runner` is expected to not be driven by
/// any other caller concurrently (`iterate` requires `&mut self`, so the
/// `Mutex` here is what makes that safe across the driver thread and any
/// other caller sharing the same `Arc`).
pub fn start_auto_iterate<const S_MAX: usize, const T_MAX: usize>(
    runner: Arc<Mutex<TaskRunner<S_MAX, T_MAX>>>,
    inputs: Arc<dyn AutoIterateInputs>,
) -> AutoIterateHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();
    let join = thread::Builder::new()
        .name("task-runner-auto-iterate".into())
        .spawn(move || run(runner, inputs, thread_stop))
        .expect("spawn auto-iterate driver thread");
    AutoIterateHandle { stop, join: Some(join) }
}

fn run<const S_MAX: usize, const T_MAX: usize>(
    runner: Arc<Mutex<TaskRunner<S_MAX, T_MAX>>>,
    inputs: Arc<dyn AutoIterateInputs>,
    stop: Arc<AtomicBool>,
) {
    let mut next_deadline = Instant::now() + Duration::from_secs(1);
    loop {
        let now = Instant::now();
        if next_deadline > now {
            thread::sleep(next_deadline - now);
        }
        if stop.load(Ordering::SeqCst) {
            return;
        }

        {
            let mut guard = match runner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => {
                    warn!("task runner mutex poisoned, recovering for this iteration");
                    poisoned.into_inner()
                }
            };
            let uptime_s = guard.time_source().uptime_seconds();
            let app_states = inputs.app_states();
            let gps_time_s = inputs.gps_time_s();
            let battery_percent = inputs.battery_percent();
            trace!(uptime_s, gps_time_s, battery_percent, "auto-iterate firing");
            guard.iterate(&app_states, uptime_s, gps_time_s, battery_percent);
        }

        // Advance by a fixed second rather than accumulating from `now`,
        // so a single slow iteration doesn't shift every later deadline.
        next_deadline += Duration::from_secs(1);

        // If we've fallen far behind (e.g. a debugger pause), resync to
        // "one second from now" instead of firing a burst of catch-up
        // iterations to walk the deadline back up to the present.
        let now = Instant::now();
        if next_deadline < now {
            next_deadline = now + Duration::from_secs(1);
        }
    }
}
