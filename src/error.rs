//! Crate-wide error type.
//!
//! `TaskRunner::init` and `TaskRunner::iterate` never return an `Err` —
//! every fault caught internally is recovered and turned into a `tracing`
//! event (see module docs on `runner`). `Error` exists because the
//! collaborator traits (`KvStore`, `WorkQueue`, `TaskExecutor`-internal
//! helpers) are fallible and need a concrete type the runner can match on,
//! and that tests can assert against.

use thiserror::Error;

use crate::task::TaskId;

/// Result alias used at collaborator boundaries.
pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A schedule referenced an unknown task id, or an `after` periodicity
    /// predecessor index was out of range.
    #[error("invalid schedule: task id {task_id} is not bound by any compile-time definition")]
    InvalidArgument { task_id: TaskId },

    /// The device backing an `argument-is-device` task failed its
    /// readiness predicate; the task is marked `skip`.
    #[error("task {task_id} argument device is not ready")]
    Unavailable { task_id: TaskId },

    /// Attempted to start a task that is already running from a different
    /// schedule.
    #[error("task {task_id} is already running from schedule {schedule_index}")]
    Busy { task_id: TaskId, schedule_index: usize },

    /// A KV slot held the wrong number of bytes for a `Schedule`; the slot
    /// is treated as empty.
    #[error("schedule slot {slot} held {len} bytes, expected {expected}")]
    StorageCorrupt { slot: usize, len: usize, expected: usize },

    /// A collaborator-backed KV store reported an error.
    #[error(transparent)]
    Kv(#[from] crate::kv::KvError),

    /// A collaborator-backed IO error (e.g. from the `sled` adapter).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
