//! `TimeSource`: uptime, ticks, and civil (wall-clock) time as seen by the
//! runner. Civil time validity is enumerated rather than a bare bool
//! because the host may have recovered it from several sources of differing
//! trust (GNSS fix, RPC from a paired phone, a previous session) — the core
//! only needs to know "usable or not", but a diagnostic collaborator cares
//! which.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Where civil time, if any, came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CivilTimeValidity {
    None,
    Recovered,
    Gnss,
    Rpc,
}

impl CivilTimeValidity {
    pub fn is_usable(self) -> bool {
        !matches!(self, CivilTimeValidity::None)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CivilTime {
    pub seconds: u64,
    pub validity: CivilTimeValidity,
}

/// Collaborator interface for time. The core treats any `CivilTime` whose
/// validity is not `None` as usable.
pub trait TimeSource: Send + Sync {
    fn uptime_seconds(&self) -> u64;
    fn uptime_ticks(&self) -> u64;
    fn civil_time(&self) -> CivilTime;
    fn ticks_per_second(&self) -> u64;

    fn ticks_to_ms(&self, ticks: u64) -> u64 {
        let tps = self.ticks_per_second().max(1);
        ticks.saturating_mul(1000) / tps
    }
}

/// Reference `TimeSource` built on `std::time::Instant`, for hosts and
/// tests that have no RTOS tick source. Civil time is never recovered by
/// this adapter (`CivilTimeValidity::None`) — a host with GNSS or RPC time
/// recovery should supply its own `TimeSource`.
pub struct MonotonicTimeSource {
    start: Instant,
    ticks_per_second: u64,
}

impl MonotonicTimeSource {
    pub fn new(ticks_per_second: u64) -> Self {
        Self {
            start: Instant::now(),
            ticks_per_second,
        }
    }
}

impl Default for MonotonicTimeSource {
    fn default() -> Self {
        Self::new(1_000_000)
    }
}

impl TimeSource for MonotonicTimeSource {
    fn uptime_seconds(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    fn uptime_ticks(&self) -> u64 {
        let elapsed = self.start.elapsed();
        elapsed.as_secs() * self.ticks_per_second
            + (elapsed.subsec_nanos() as u64 * self.ticks_per_second) / 1_000_000_000
    }

    fn civil_time(&self) -> CivilTime {
        CivilTime {
            seconds: 0,
            validity: CivilTimeValidity::None,
        }
    }

    fn ticks_per_second(&self) -> u64 {
        self.ticks_per_second
    }
}

/// A `TimeSource` driven entirely by the test: uptime is an explicit
/// counter rather than wall-clock elapsed time, so scenario tests can
/// drive `iterate` one simulated second at a time without sleeping.
pub struct SimulatedTimeSource {
    uptime_s: AtomicU64,
    ticks_per_second: u64,
}

impl SimulatedTimeSource {
    pub fn new(ticks_per_second: u64) -> Self {
        Self {
            uptime_s: AtomicU64::new(0),
            ticks_per_second,
        }
    }

    pub fn advance(&self, secs: u64) {
        self.uptime_s.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, secs: u64) {
        self.uptime_s.store(secs, Ordering::SeqCst);
    }
}

impl TimeSource for SimulatedTimeSource {
    fn uptime_seconds(&self) -> u64 {
        self.uptime_s.load(Ordering::SeqCst)
    }

    fn uptime_ticks(&self) -> u64 {
        self.uptime_seconds() * self.ticks_per_second
    }

    fn civil_time(&self) -> CivilTime {
        CivilTime {
            seconds: self.uptime_seconds(),
            validity: CivilTimeValidity::Recovered,
        }
    }

    fn ticks_per_second(&self) -> u64 {
        self.ticks_per_second
    }
}
