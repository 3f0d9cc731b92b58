//! Task definitions, task state, and the cooperative termination signal.
//!
//! A [`TaskDefinition`] is compile-time, immutable data handed to
//! [`crate::runner::TaskRunner::init`] in a static slice — the core never
//! allocates it. [`TaskState`] is the one mutable record per definition
//! the runner owns.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Compile-time task identifier. Unique within the static task table.
pub type TaskId = u8;

bitflags::bitflags! {
    /// Flags attached to a [`TaskDefinition`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u8 {
        /// The task's argument is a device handle that must pass
        /// [`crate::work_queue::DeviceReady::is_ready`] before the task is
        /// eligible to start. See [`TaskArg::Device`].
        const ARGUMENT_IS_DEVICE = 0b0000_0001;
    }
}

/// Opaque per-task argument, typed as `None | Const(&'static T) |
/// Device(DeviceHandle)` rather than a raw `void*`: the `argument-is-device`
/// flag is not a separate bit to keep in sync, it falls directly out of
/// which variant is in play.
#[derive(Clone, Copy)]
pub enum TaskArg {
    /// No argument.
    None,
    /// A `'static` constant argument, opaque to the core.
    Const(&'static (dyn std::any::Any + Send + Sync)),
    /// A device handle; readiness is checked once at `init`.
    Device(DeviceHandle),
}

impl TaskArg {
    pub fn is_device(&self) -> bool {
        matches!(self, TaskArg::Device(_))
    }
}

/// Opaque handle a `DeviceReady` collaborator knows how to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u32);

/// Result of one cooperative work-item step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStep {
    /// The task has finished this run.
    Done,
    /// Re-enqueue after `Duration`; capped to zero by the runner once the
    /// termination signal has been raised.
    RescheduleIn(Duration),
}

/// Context handed to a dedicated-thread task body.
pub struct ThreadTaskContext<'a> {
    pub schedule_index: usize,
    pub terminate: TerminationSignal,
    pub arg: &'a TaskArg,
    /// Shared handle to this schedule's cross-run storage; see
    /// [`crate::schedule::ScheduleState::storage_handle`].
    pub storage: crate::schedule::PersistentStorage,
}

/// Context handed to a cooperative work-item step function.
pub struct WorkItemTaskContext<'a> {
    pub schedule_index: usize,
    pub terminate: TerminationSignal,
    pub arg: &'a TaskArg,
    pub reschedule_count: u64,
    /// Shared handle to this schedule's cross-run storage; see
    /// [`crate::schedule::ScheduleState::storage_handle`].
    pub storage: crate::schedule::PersistentStorage,
}

pub type ThreadEntry = fn(ThreadTaskContext<'_>);
pub type WorkItemStep = fn(WorkItemTaskContext<'_>) -> WorkStep;

/// How a task definition is executed.
#[derive(Clone, Copy)]
pub enum ExecutionKind {
    /// A dedicated OS/RTOS thread, given a pre-allocated stack.
    DedicatedThread { stack_size: usize, entry: ThreadEntry },
    /// A work item re-enqueued by its own step function until done.
    CooperativeWorkItem { step: WorkItemStep },
}

/// Compile-time, immutable task definition.
pub struct TaskDefinition {
    pub id: TaskId,
    pub name: &'static str,
    pub kind: ExecutionKind,
    pub arg: TaskArg,
    pub flags: TaskFlags,
}

impl TaskDefinition {
    pub fn requires_device_ready(&self) -> bool {
        self.flags.contains(TaskFlags::ARGUMENT_IS_DEVICE) || self.arg.is_device()
    }
}

/// Outcome of [`TerminationSignal::wait_with_termination`]. `Terminated`
/// takes precedence over `Woken` when both occur in the same quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Woken,
    TimedOut,
    Terminated,
}

struct TerminationInner {
    raised: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

/// Single-shot, multi-waiter cooperative termination signal. A raise is
/// idempotent; every waiter (current and future) observes the latched
/// value.
#[derive(Clone)]
pub struct TerminationSignal {
    inner: Arc<TerminationInner>,
}

impl TerminationSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TerminationInner {
                raised: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Idempotent: raising an already-raised signal is a no-op beyond the
    /// wakeup, which is harmless.
    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        let _guard = self.inner.mutex.lock().unwrap();
        self.inner.condvar.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Blocking wait used by dedicated-thread task bodies. Work-item task
    /// bodies should use a non-blocking check (`is_raised`) followed by a
    /// `WorkStep::RescheduleIn` yield instead of calling this.
    pub fn wait_with_termination(&self, timeout: Option<Duration>) -> WaitOutcome {
        if self.is_raised() {
            return WaitOutcome::Terminated;
        }
        let guard = self.inner.mutex.lock().unwrap();
        let result = match timeout {
            None => {
                let _g = self.inner.condvar.wait(guard).unwrap();
                WaitOutcome::Woken
            }
            Some(d) => {
                let (_g, timeout_result) = self.inner.condvar.wait_timeout(guard, d).unwrap();
                if timeout_result.timed_out() {
                    WaitOutcome::TimedOut
                } else {
                    WaitOutcome::Woken
                }
            }
        };
        if self.is_raised() {
            WaitOutcome::Terminated
        } else {
            result
        }
    }
}

impl Default for TerminationSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Free-function form of [`TerminationSignal::wait_with_termination`], for
/// task bodies that only hold a borrowed `&TerminationSignal` (e.g. from a
/// task context) rather than an owned clone.
pub fn task_runner_task_block(signal: &TerminationSignal, timeout: Option<Duration>) -> WaitOutcome {
    signal.wait_with_termination(timeout)
}

/// Per-kind execution handle the runner uses to detect completion.
pub enum ExecutionHandle {
    None,
    Thread(JoinHandle<()>),
    WorkItem(crate::work_queue::DelayableHandle),
}

/// One mutable record per [`TaskDefinition`], owned by the runner.
pub struct TaskState {
    pub running: bool,
    pub schedule_index: Option<usize>,
    /// Set once at `init` for `argument-is-device` tasks whose device
    /// failed readiness. Never re-evaluated at runtime.
    pub skip: bool,
    pub handle: ExecutionHandle,
    pub terminate: TerminationSignal,
    /// Incremented every time a cooperative work item yields back into the
    /// queue via `RescheduleIn`.
    pub reschedule_count: u64,
}

impl TaskState {
    pub fn new() -> Self {
        Self {
            running: false,
            schedule_index: None,
            skip: false,
            handle: ExecutionHandle::None,
            terminate: TerminationSignal::new(),
            reschedule_count: 0,
        }
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic counter used by reference `WorkQueue` implementations to hand
/// out fresh handles; kept here since both `work_queue` and `task` need a
/// definition-agnostic notion of "some running thing".
pub(crate) static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);
