//! `WatchdogChannel`: the liveness gate fed exactly once per iteration.
//!
//! The core never decides what happens on expiry — that is a platform
//! concern (record the fault, reboot). It only guarantees it calls `feed`
//! once per `iterate`, and registers the feeding thread once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub trait WatchdogChannel: Send + Sync {
    /// The period within which `feed` must be called at least once.
    fn period(&self) -> Duration;

    /// Register the calling thread as the feeder. Called once, on the
    /// first iteration.
    fn register_thread(&self);

    /// Record one liveness heartbeat.
    fn feed(&self);
}

/// Reference `WatchdogChannel`. Tracks the last feed time and exposes
/// `is_expired` for tests; a real platform adapter would instead arm a
/// hardware or RTOS watchdog timer in `register_thread` and pet it in
/// `feed`.
pub struct RefWatchdog {
    period: Duration,
    registered: AtomicBool,
    last_feed: Mutex<Option<Instant>>,
    on_expiry: Option<Box<dyn Fn() + Send + Sync>>,
}

impl RefWatchdog {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            registered: AtomicBool::new(false),
            last_feed: Mutex::new(None),
            on_expiry: None,
        }
    }

    pub fn with_expiry_handler(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_expiry = Some(Box::new(handler));
        self
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// True if more than `period` has elapsed since the last feed (or the
    /// channel was never fed at all despite being registered).
    pub fn is_expired(&self) -> bool {
        if !self.is_registered() {
            return false;
        }
        match *self.last_feed.lock().unwrap() {
            Some(last) => last.elapsed() > self.period,
            None => true,
        }
    }

    /// Check for expiry and invoke the expiry handler if configured. A
    /// reference implementation would call this from a periodic checker
    /// thread; it is exposed directly here so tests can drive it
    /// deterministically instead of racing a background timer.
    pub fn check(&self) {
        if self.is_expired() {
            if let Some(handler) = &self.on_expiry {
                handler();
            }
        }
    }
}

impl WatchdogChannel for RefWatchdog {
    fn period(&self) -> Duration {
        self.period
    }

    fn register_thread(&self) {
        self.registered.store(true, Ordering::SeqCst);
        *self.last_feed.lock().unwrap() = Some(Instant::now());
    }

    fn feed(&self) {
        *self.last_feed.lock().unwrap() = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn fed_watchdog_never_expires() {
        let wd = RefWatchdog::new(Duration::from_millis(50));
        wd.register_thread();
        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(10));
            wd.feed();
            assert!(!wd.is_expired());
        }
    }

    #[test]
    fn unfed_watchdog_expires_and_fires_handler() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let wd = RefWatchdog::new(Duration::from_millis(10))
            .with_expiry_handler(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            });
        wd.register_thread();
        std::thread::sleep(Duration::from_millis(30));
        assert!(wd.is_expired());
        wd.check();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
