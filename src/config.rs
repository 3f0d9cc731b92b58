//! Runtime-tunable configuration.
//!
//! The hard upper bounds on schedule and task counts (`S_MAX`, `T_MAX`) are
//! const generic parameters on [`crate::runner::TaskRunner`] itself, not
//! fields here — the core never allocates past them, so they need to be
//! known at compile time the same way every other bounded collection in
//! this crate is fixed-capacity (`arrayvec::ArrayVec`) rather than growable.
//! `RunnerConfig` carries the handful of values that are genuinely runtime
//! tunables.

/// Runtime-tunable configuration for a [`crate::runner::TaskRunner`].
#[derive(Debug, Clone, Copy)]
pub struct RunnerConfig {
    /// Application-supplied component of the schedule-set identifier.
    /// Bump this whenever the application's compile-time default schedule
    /// set changes shape, to force every persisted schedule to reset.
    pub app_supplied_default_id: u16,

    /// Watchdog period in seconds. `iterate` must be called at least once
    /// per this many seconds or the watchdog collaborator will expire.
    pub iteration_watchdog_s: u32,

    /// Opaque identifier a host running more than one `TaskRunner` can use
    /// to tell their watchdog channels apart. The core never interprets
    /// it beyond returning it from `TaskRunner::watchdog_channel_id`.
    pub watchdog_channel_id: crate::channel::ChannelId,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            app_supplied_default_id: 0,
            iteration_watchdog_s: 10,
            watchdog_channel_id: crate::channel::ChannelId(0),
        }
    }
}

impl RunnerConfig {
    pub fn with_app_supplied_default_id(mut self, id: u16) -> Self {
        self.app_supplied_default_id = id;
        self
    }

    pub fn with_iteration_watchdog_s(mut self, secs: u32) -> Self {
        self.iteration_watchdog_s = secs;
        self
    }

    pub fn with_watchdog_channel_id(mut self, id: crate::channel::ChannelId) -> Self {
        self.watchdog_channel_id = id;
        self
    }
}
