// infuse-task-runner: cooperative real-time task scheduler core for the
// Infuse embedded IoT application framework.
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! # infuse-task-runner
//!
//! The Task Runner core of Infuse: a cooperative, real-time scheduler that
//! boots, tracks, and terminates application tasks against declarative
//! schedules, backed by a watchdog safety net, a live configuration channel
//! on top of persistent key/value storage, and a bounded-lifetime
//! event/state bus tasks publish and subscribe to.
//!
//! Concrete task bodies, drivers, data loggers, transport, and the
//! key/value store's own storage engine are external collaborators; this
//! crate specifies and implements only the interfaces the core consumes
//! from and exposes to them, as traits (`KvStore`, `TimeSource`,
//! `WatchdogChannel`, `WorkQueue`, `DeviceReady`) a host binary or test
//! harness supplies concrete adapters for.
//!
//! ## Layout
//!
//! - [`schedule`] / [`store`]: the schedule data model, validation, and the
//!   merge of compile-time defaults with persistent KV.
//! - [`evaluator`]: pure should-start/should-terminate decisions.
//! - [`task`]: task definitions, task state, and the termination signal.
//! - [`runner`]: [`runner::TaskRunner`], the lifecycle entry points
//!   `init`/`iterate` and the reload FSM.
//! - [`auto_iterate`]: the one-second cadence driver built on `iterate`.
//! - [`channel`]: the typed, observer-notified data bus.
//! - [`watchdog`]: the per-iteration liveness gate.
//! - [`kv`] / [`time`] / [`work_queue`]: collaborator traits plus reference
//!   adapters.
//! - [`config`]: runtime-tunable configuration.
//! - [`error`]: the crate-wide error type used at collaborator boundaries.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use infuse_task_runner::config::RunnerConfig;
//! use infuse_task_runner::kv::MemoryKvStore;
//! use infuse_task_runner::runner::TaskRunner;
//! use infuse_task_runner::schedule::{AppStateSet, Periodicity, Schedule, Validity};
//! use infuse_task_runner::task::{ExecutionKind, TaskArg, TaskDefinition, TaskFlags, ThreadTaskContext};
//! use infuse_task_runner::time::MonotonicTimeSource;
//! use infuse_task_runner::watchdog::RefWatchdog;
//! use infuse_task_runner::work_queue::{AlwaysReady, ThreadWorkQueue};
//!
//! fn gnss_fix(ctx: ThreadTaskContext<'_>) {
//!     let _ = ctx.terminate.wait_with_termination(None);
//! }
//!
//! static TASKS: [TaskDefinition; 1] = [TaskDefinition {
//!     id: 1,
//!     name: "gnss-fix",
//!     kind: ExecutionKind::DedicatedThread { stack_size: 4096, entry: gnss_fix },
//!     arg: TaskArg::None,
//!     flags: TaskFlags::empty(),
//! }];
//!
//! let defaults = [Schedule::new(1, Validity::always(), Periodicity::Fixed { period_s: 60 })];
//! let mut runner = TaskRunner::<1, 1>::init(
//!     &TASKS,
//!     defaults,
//!     Arc::new(MemoryKvStore::new()),
//!     Arc::new(MonotonicTimeSource::default()),
//!     Arc::new(RefWatchdog::new(std::time::Duration::from_secs(10))),
//!     Arc::new(ThreadWorkQueue::new()),
//!     Arc::new(AlwaysReady),
//!     RunnerConfig::default(),
//! );
//!
//! runner.iterate(&AppStateSet::empty(), 0, 0, 100);
//! ```

pub mod auto_iterate;
pub mod channel;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod kv;
pub mod runner;
pub mod schedule;
pub mod store;
pub mod task;
pub mod time;
pub mod watchdog;
pub mod work_queue;

pub use error::{Error, Result};
pub use runner::TaskRunner;
pub use schedule::{AppStateSet, Periodicity, Schedule, Validity, ValidityBase};
pub use task::{ExecutionKind, TaskArg, TaskDefinition, TaskFlags, TaskId};

/// Common imports for a host binary wiring up a [`runner::TaskRunner`].
pub mod prelude {
    pub use crate::auto_iterate::{start_auto_iterate, AutoIterateInputs};
    pub use crate::channel::{Channel, ChannelId, ChannelRegistry};
    pub use crate::config::RunnerConfig;
    pub use crate::error::{Error, Result};
    pub use crate::kv::{KvStore, MemoryKvStore};
    pub use crate::runner::{ScheduleEvent, StopReason, TaskRunner};
    pub use crate::schedule::{AppStateSet, Periodicity, Schedule, Validity, ValidityBase};
    pub use crate::task::{
        task_runner_task_block, DeviceHandle, ExecutionKind, TaskArg, TaskDefinition, TaskFlags, TaskId,
        WaitOutcome,
    };
    pub use crate::time::{MonotonicTimeSource, SimulatedTimeSource, TimeSource};
    pub use crate::watchdog::{RefWatchdog, WatchdogChannel};
    pub use crate::work_queue::{AlwaysReady, DeviceReady, ThreadWorkQueue, WorkQueue};
}
