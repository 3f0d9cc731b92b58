//! Collaborator interfaces for cooperative work-item execution:
//! [`WorkQueue`] (reschedule/enqueue) and [`DeviceReady`] (device gating).
//! A reference thread-backed [`ThreadWorkQueue`] is provided for tests and
//! as a host starting point.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::schedule::PersistentStorage;
use crate::task::{TaskArg, TerminationSignal, WorkItemStep, WorkStep, NEXT_HANDLE};

/// Opaque handle to a work item in flight. Used by the runner to detect
/// completion via [`WorkQueue::busy`] without polling the step function
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DelayableHandle(pub u64);

/// Collaborator interface for cooperative (non-thread) task execution.
///
/// Every work item runs its step function inline on a queue-owned worker,
/// never on the caller's thread — `enqueue` and `reschedule*` only ever
/// schedule, they do not block waiting for the step to run.
pub trait WorkQueue: Send + Sync {
    /// Schedule `step` to run once, immediately. Returns a handle the
    /// runner can later check with `busy`.
    fn enqueue(
        &self,
        step: WorkItemStep,
        arg: TaskArg,
        schedule_index: usize,
        terminate: TerminationSignal,
        storage: PersistentStorage,
    ) -> DelayableHandle;

    /// Re-run the same work item after `delay` relative to now.
    fn reschedule(&self, handle: DelayableHandle, delay: Duration);

    /// Re-run the same work item at an absolute instant, used by
    /// `auto_iterate` to avoid cumulative drift from repeated relative
    /// delays.
    fn reschedule_abs(&self, handle: DelayableHandle, at: Instant);

    /// `true` while `handle` still has a pending or in-flight step.
    fn busy(&self, handle: DelayableHandle) -> bool;
}

/// Collaborator interface gating tasks whose argument is a device handle
/// (`TaskFlags::ARGUMENT_IS_DEVICE`). Consulted once, at `init`.
pub trait DeviceReady: Send + Sync {
    fn is_ready(&self, device: crate::task::DeviceHandle) -> bool;
}

/// `DeviceReady` that always answers `true`, for hosts/tests with no
/// device-gated tasks.
pub struct AlwaysReady;

impl DeviceReady for AlwaysReady {
    fn is_ready(&self, _device: crate::task::DeviceHandle) -> bool {
        true
    }
}

struct PendingItem {
    at: Instant,
    handle: DelayableHandle,
    step: WorkItemStep,
    arg: TaskArg,
    schedule_index: usize,
    terminate: TerminationSignal,
    reschedule_count: u64,
    storage: PersistentStorage,
}

// BinaryHeap is a max-heap; `Reverse` + `Instant` ordering on `at` turns it
// into the min-heap a delay queue needs.
struct HeapEntry(Reverse<Instant>, u64, DelayableHandle);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0 && self.1 == other.1
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0).then_with(|| self.1.cmp(&other.1))
    }
}

struct Shared {
    heap: Mutex<BinaryHeap<HeapEntry>>,
    items: Mutex<std::collections::HashMap<u64, PendingItem>>,
    in_flight: Mutex<std::collections::HashSet<u64>>,
    condvar: Condvar,
    shutdown: AtomicBool,
}

/// Reference single-worker implementation of [`WorkQueue`]. Dispatches
/// enqueued and rescheduled steps in delay order on a dedicated background
/// thread; a `CooperativeWorkItem` task never gets its own OS thread, only
/// its step function does, one quantum at a time.
pub struct ThreadWorkQueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadWorkQueue {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            heap: Mutex::new(BinaryHeap::new()),
            items: Mutex::new(std::collections::HashMap::new()),
            in_flight: Mutex::new(std::collections::HashSet::new()),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("work-queue".into())
            .spawn(move || Self::run(worker_shared))
            .expect("spawn work queue worker thread");
        Self { shared, worker: Some(worker) }
    }

    fn run(shared: Arc<Shared>) {
        loop {
            if shared.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let next_due = {
                let mut heap = shared.heap.lock().unwrap();
                loop {
                    match heap.peek() {
                        Some(entry) => break Some(entry.0 .0),
                        None => {
                            let (guard, timeout) = shared
                                .condvar
                                .wait_timeout(heap, Duration::from_millis(200))
                                .unwrap();
                            heap = guard;
                            if shared.shutdown.load(Ordering::SeqCst) {
                                return;
                            }
                            if timeout.timed_out() && heap.peek().is_none() {
                                break None;
                            }
                        }
                    }
                }
            };

            let Some(at) = next_due else { continue };
            let now = Instant::now();
            if at > now {
                std::thread::sleep((at - now).min(Duration::from_millis(50)));
                continue;
            }

            let entry = { shared.heap.lock().unwrap().pop() };
            let Some(HeapEntry(_, _, handle)) = entry else { continue };
            let item = { shared.items.lock().unwrap().remove(&handle.0) };
            let Some(item) = item else { continue };

            shared.in_flight.lock().unwrap().insert(handle.0);
            let ctx = crate::task::WorkItemTaskContext {
                schedule_index: item.schedule_index,
                terminate: item.terminate.clone(),
                arg: &item.arg,
                reschedule_count: item.reschedule_count,
                storage: item.storage.clone(),
            };
            let outcome = (item.step)(ctx);
            match outcome {
                WorkStep::Done => {
                    shared.in_flight.lock().unwrap().remove(&handle.0);
                }
                WorkStep::RescheduleIn(delay) => {
                    let delay = if item.terminate.is_raised() { Duration::ZERO } else { delay };
                    let at = Instant::now() + delay;
                    let mut items = shared.items.lock().unwrap();
                    items.insert(
                        handle.0,
                        PendingItem {
                            at,
                            reschedule_count: item.reschedule_count + 1,
                            ..item
                        },
                    );
                    drop(items);
                    shared.heap.lock().unwrap().push(HeapEntry(Reverse(at), handle.0, handle));
                    shared.condvar.notify_all();
                    shared.in_flight.lock().unwrap().remove(&handle.0);
                }
            }
        }
    }

    fn schedule_at(&self, handle: DelayableHandle, at: Instant, item: Option<PendingItem>) {
        if let Some(item) = item {
            self.shared.items.lock().unwrap().insert(handle.0, item);
        } else if let Some(existing) = self.shared.items.lock().unwrap().get_mut(&handle.0) {
            existing.at = at;
        }
        self.shared.heap.lock().unwrap().push(HeapEntry(Reverse(at), handle.0, handle));
        self.shared.condvar.notify_all();
    }
}

impl Default for ThreadWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadWorkQueue {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.condvar.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl WorkQueue for ThreadWorkQueue {
    fn enqueue(
        &self,
        step: WorkItemStep,
        arg: TaskArg,
        schedule_index: usize,
        terminate: TerminationSignal,
        storage: PersistentStorage,
    ) -> DelayableHandle {
        let handle = DelayableHandle(NEXT_HANDLE.fetch_add(1, Ordering::SeqCst));
        trace!(handle = handle.0, schedule_index, "enqueue work item");
        let now = Instant::now();
        self.schedule_at(
            handle,
            now,
            Some(PendingItem {
                at: now,
                handle,
                step,
                arg,
                schedule_index,
                terminate,
                reschedule_count: 0,
                storage,
            }),
        );
        handle
    }

    fn reschedule(&self, handle: DelayableHandle, delay: Duration) {
        self.reschedule_abs(handle, Instant::now() + delay);
    }

    fn reschedule_abs(&self, handle: DelayableHandle, at: Instant) {
        self.schedule_at(handle, at, None);
    }

    fn busy(&self, handle: DelayableHandle) -> bool {
        self.shared.items.lock().unwrap().contains_key(&handle.0)
            || self.shared.in_flight.lock().unwrap().contains(&handle.0)
            || self
                .shared
                .heap
                .lock()
                .unwrap()
                .iter()
                .any(|e| e.2 == handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn storage() -> PersistentStorage {
        Arc::new(parking_lot::Mutex::new(Vec::new()))
    }

    fn noop_step(_ctx: crate::task::WorkItemTaskContext<'_>) -> WorkStep {
        WorkStep::Done
    }

    #[test]
    fn enqueue_runs_and_completes() {
        let queue = ThreadWorkQueue::new();
        let handle = queue.enqueue(noop_step, TaskArg::None, 0, TerminationSignal::new(), storage());
        let deadline = Instant::now() + Duration::from_secs(1);
        while queue.busy(handle) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!queue.busy(handle));
    }

    static RESCHEDULE_COUNT: AtomicUsize = AtomicUsize::new(0);

    fn reschedule_twice_step(ctx: crate::task::WorkItemTaskContext<'_>) -> WorkStep {
        if ctx.reschedule_count < 2 {
            RESCHEDULE_COUNT.fetch_add(1, Ordering::SeqCst);
            WorkStep::RescheduleIn(Duration::from_millis(5))
        } else {
            WorkStep::Done
        }
    }

    #[test]
    fn reschedule_in_requeues_until_done() {
        let queue = ThreadWorkQueue::new();
        let handle = queue.enqueue(reschedule_twice_step, TaskArg::None, 0, TerminationSignal::new(), storage());
        let deadline = Instant::now() + Duration::from_secs(2);
        while queue.busy(handle) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!queue.busy(handle));
    }

    #[test]
    fn terminate_collapses_reschedule_delay() {
        let queue = ThreadWorkQueue::new();
        let terminate = TerminationSignal::new();
        terminate.raise();

        fn step(ctx: crate::task::WorkItemTaskContext<'_>) -> WorkStep {
            if ctx.reschedule_count == 0 {
                WorkStep::RescheduleIn(Duration::from_secs(100))
            } else {
                WorkStep::Done
            }
        }
        let handle = queue.enqueue(step, TaskArg::None, 0, terminate, storage());
        let deadline = Instant::now() + Duration::from_millis(500);
        while queue.busy(handle) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!queue.busy(handle), "terminated work item should not wait out its full delay");
    }

    #[test]
    fn always_ready_accepts_any_device() {
        let ready = AlwaysReady;
        assert!(ready.is_ready(crate::task::DeviceHandle(42)));
    }
}
