//! The task runner: owns the static task table, the merged schedule set,
//! and the reload FSM. `TaskRunner::init`/`::iterate` are the only two
//! entry points a host calls directly (see module docs on `auto_iterate`
//! for the one-second driver built on top of `iterate`).

use std::sync::Arc;
use std::time::Duration;

use arrayvec::ArrayVec;
use rustc_hash::FxHashMap;
use tracing::{debug, info, instrument, warn};

use crate::channel::ChannelId;
use crate::config::RunnerConfig;
use crate::evaluator::{self, TickContext};
use crate::kv::KvStore;
use crate::schedule::{AppStateSet, Periodicity, Schedule, ScheduleState};
use crate::store::ScheduleStore;
use crate::task::{
    ExecutionHandle, ExecutionKind, TaskArg, TaskDefinition, TaskId, TaskState, TerminationSignal,
    ThreadTaskContext,
};
use crate::time::TimeSource;
use crate::watchdog::WatchdogChannel;
use crate::work_queue::{DeviceReady, WorkQueue};

/// Why a running task was asked to stop, or stopped on its own. Surfaced to
/// hosts via [`ScheduleEvent::Stopped`] since the core otherwise has no
/// safe way to tell a deliberate timeout from a battery cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Timeout,
    ValidityClosed,
    Battery,
    Reload,
    /// The task's thread/work item finished without the runner having
    /// asked it to.
    Voluntary,
}

/// Typed schedule transition notifications. Fired at exactly three points:
/// after a successful start, immediately after raising a termination
/// signal, and after reap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleEvent {
    Started { schedule_index: usize, task_id: TaskId },
    TerminateRequested { schedule_index: usize, task_id: TaskId },
    Stopped { schedule_index: usize, task_id: TaskId, reason: StopReason },
}

pub type EventSink = Arc<dyn Fn(ScheduleEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReloadState {
    Idle,
    TerminatingAll,
}

/// The task runner core. `S_MAX` bounds the schedule set; `T_MAX` bounds
/// the task table. Both are compile-time upper bounds the core never
/// allocates past.
pub struct TaskRunner<const S_MAX: usize, const T_MAX: usize> {
    tasks: &'static [TaskDefinition; T_MAX],
    task_states: [TaskState; T_MAX],
    pending_stop_reason: [Option<StopReason>; T_MAX],
    defaults: [Schedule; S_MAX],
    store: ScheduleStore<S_MAX>,
    schedule_states: [ScheduleState; S_MAX],
    kv: Arc<dyn KvStore>,
    time: Arc<dyn TimeSource>,
    watchdog: Arc<dyn WatchdogChannel>,
    work_queue: Arc<dyn WorkQueue>,
    device_ready: Arc<dyn DeviceReady>,
    config: RunnerConfig,
    reload: ReloadState,
    watchdog_registered: bool,
    event_sink: Option<EventSink>,
}

impl<const S_MAX: usize, const T_MAX: usize> TaskRunner<S_MAX, T_MAX> {
    /// Validates task definitions, resolves device readiness, loads the
    /// schedule set (`ScheduleStore::load`), links `after` predecessors,
    /// and registers for KV change notifications. Never fails outright:
    /// faults are logged and degrade gracefully (an unready device marks
    /// its tasks `skip`; a schedule that cannot be validated is simply
    /// absent from the evaluated set).
    #[instrument(skip_all)]
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        tasks: &'static [TaskDefinition; T_MAX],
        defaults: [Schedule; S_MAX],
        kv: Arc<dyn KvStore>,
        time: Arc<dyn TimeSource>,
        watchdog: Arc<dyn WatchdogChannel>,
        work_queue: Arc<dyn WorkQueue>,
        device_ready: Arc<dyn DeviceReady>,
        config: RunnerConfig,
    ) -> Self {
        let mut seen: FxHashMap<TaskId, usize> = FxHashMap::default();
        for (idx, def) in tasks.iter().enumerate() {
            if let Some(first) = seen.insert(def.id, idx) {
                warn!(task_id = def.id, first, duplicate = idx, "duplicate task id in task table");
            }
        }

        let mut task_states: [TaskState; T_MAX] = std::array::from_fn(|_| TaskState::new());
        for (idx, def) in tasks.iter().enumerate() {
            if def.requires_device_ready() {
                let ready = match def.arg {
                    TaskArg::Device(handle) => device_ready.is_ready(handle),
                    _ => true,
                };
                if !ready {
                    warn!(task_id = def.id, "device not ready at init, task marked skip");
                    task_states[idx].skip = true;
                }
            }
        }

        let known_task_ids: ArrayVec<TaskId, T_MAX> = tasks.iter().map(|t| t.id).collect();
        let store = ScheduleStore::load(&*kv, &defaults, &known_task_ids, config.app_supplied_default_id);

        let mut runner = Self {
            tasks,
            task_states,
            pending_stop_reason: std::array::from_fn(|_| None),
            defaults,
            store,
            schedule_states: std::array::from_fn(|_| ScheduleState::new()),
            kv,
            time,
            watchdog,
            work_queue,
            device_ready,
            config,
            reload: ReloadState::Idle,
            watchdog_registered: false,
            event_sink: None,
        };

        runner.link_schedules();
        runner.store.subscribe_for_changes(&*runner.kv);
        runner
    }

    /// Installs a callback invoked for every `ScheduleEvent`. Replaces any
    /// previously installed sink.
    pub fn set_event_sink(&mut self, sink: EventSink) {
        self.event_sink = Some(sink);
    }

    pub fn watchdog_channel_id(&self) -> ChannelId {
        self.config.watchdog_channel_id
    }

    /// Read-only introspection: task ids currently running, in task-table
    /// order. Used by diagnostic collaborators and by this crate's own
    /// tests.
    pub fn running_task_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.task_states
            .iter()
            .zip(self.tasks.iter())
            .filter(|(state, _)| state.running)
            .map(|(_, def)| def.id)
    }

    fn link_schedules(&mut self) {
        for slot in 0..S_MAX {
            let Some(schedule) = self.store.schedule(slot) else { continue };
            let bound_task_index = self.tasks.iter().position(|t| t.id == schedule.task_id);
            self.schedule_states[slot].bound_task_index = bound_task_index;
            self.schedule_states[slot].predecessor_index = match schedule.periodicity {
                Periodicity::After { predecessor_index, .. } => Some(predecessor_index as usize),
                _ => None,
            };
        }
    }

    fn emit(&self, event: ScheduleEvent) {
        if let Some(sink) = &self.event_sink {
            sink(event);
        }
    }

    /// One scheduler tick. Feeds the watchdog, reaps terminated tasks,
    /// drives the reload FSM, and (once `Idle`) evaluates every valid
    /// schedule in index order.
    #[instrument(skip_all, fields(uptime_s))]
    pub fn iterate(&mut self, app_states: &AppStateSet, uptime_s: u64, gps_time_s: u64, battery_percent: u8) {
        if !self.watchdog_registered {
            self.watchdog.register_thread();
            self.watchdog_registered = true;
        }
        self.watchdog.feed();

        self.reap(uptime_s);

        match self.reload {
            ReloadState::Idle => {
                if self.store.reload_requested() {
                    info!("kv change observed, terminating all running tasks before reload");
                    self.terminate_all(StopReason::Reload);
                    self.reload = ReloadState::TerminatingAll;
                    return;
                }
            }
            ReloadState::TerminatingAll => {
                if self.task_states.iter().any(|s| s.running) {
                    return;
                }
                self.rebuild_schedule_set();
                self.reload = ReloadState::Idle;
            }
        }

        let unload_all = false;
        let ctx = TickContext { app_states, uptime_s, gps_time_s, battery_percent, unload_all };
        for slot in 0..self.store.num_eval() {
            self.evaluate_slot(slot, ctx);
        }
    }

    fn rebuild_schedule_set(&mut self) {
        let known_task_ids: ArrayVec<TaskId, T_MAX> = self.tasks.iter().map(|t| t.id).collect();
        self.store.reload(
            &*self.kv,
            &self.defaults,
            &known_task_ids,
            self.config.app_supplied_default_id,
        );
        self.schedule_states = std::array::from_fn(|_| ScheduleState::new());
        self.link_schedules();
    }

    fn evaluate_slot(&mut self, slot: usize, ctx: TickContext<'_>) {
        let Some(schedule) = self.store.schedule(slot).copied() else { return };
        let Some(task_index) = self.schedule_states[slot].bound_task_index else { return };
        if self.task_states[task_index].skip {
            return;
        }

        let running_here = self.task_states[task_index].running
            && self.task_states[task_index].schedule_index == Some(slot);
        let running_elsewhere = self.task_states[task_index].running && !running_here;

        if running_here {
            if evaluator::should_terminate(&schedule, &self.schedule_states[slot], ctx) {
                let reason = classify_stop_reason(&schedule, &self.schedule_states[slot], ctx);
                self.request_terminate(slot, task_index, reason);
            }
            return;
        }

        let predecessor = self.schedule_states[slot]
            .predecessor_index
            .map(|idx| self.schedule_states[idx].clone());

        let should_start = evaluator::should_start(
            &schedule,
            &self.schedule_states[slot],
            predecessor.as_ref(),
            running_elsewhere,
            false,
            ctx,
        );
        if should_start {
            self.start_task(slot, task_index, &schedule, ctx.uptime_s);
        }
    }

    fn start_task(&mut self, slot: usize, task_index: usize, schedule: &Schedule, uptime_s: u64) {
        let def = &self.tasks[task_index];
        let terminate = TerminationSignal::new();
        self.task_states[task_index].terminate = terminate.clone();

        let storage = self.schedule_states[slot].storage_handle();
        match def.kind {
            ExecutionKind::DedicatedThread { stack_size, entry } => {
                let arg: &'static TaskArg = &def.arg;
                let ctx = ThreadTaskContext { schedule_index: slot, terminate: terminate.clone(), arg, storage };
                let handle = std::thread::Builder::new()
                    .name(def.name.into())
                    .stack_size(stack_size)
                    .spawn(move || entry(ctx))
                    .expect("spawn task thread");
                self.task_states[task_index].handle = ExecutionHandle::Thread(handle);
            }
            ExecutionKind::CooperativeWorkItem { step } => {
                let handle = self.work_queue.enqueue(step, def.arg, slot, terminate.clone(), storage);
                self.task_states[task_index].handle = ExecutionHandle::WorkItem(handle);
            }
        }

        self.task_states[task_index].running = true;
        self.task_states[task_index].schedule_index = Some(slot);
        self.task_states[task_index].reschedule_count = 0;
        self.pending_stop_reason[task_index] = None;

        self.schedule_states[slot].last_run = uptime_s;
        if let Some(predecessor_index) = self.schedule_states[slot].predecessor_index {
            let predecessor_last_terminate = self.schedule_states[predecessor_index].last_terminate;
            self.schedule_states[slot].after_consumed_terminate = Some(predecessor_last_terminate);
        }
        if matches!(schedule.periodicity, Periodicity::Event) {
            self.schedule_states[slot].take_event();
        }

        debug!(slot, task_id = def.id, "task started");
        self.emit(ScheduleEvent::Started { schedule_index: slot, task_id: def.id });
    }

    fn request_terminate(&mut self, slot: usize, task_index: usize, reason: StopReason) {
        self.task_states[task_index].terminate.raise();
        if let ExecutionHandle::WorkItem(handle) = &self.task_states[task_index].handle {
            self.work_queue.reschedule(*handle, Duration::ZERO);
        }
        self.pending_stop_reason[task_index] = Some(reason);
        let task_id = self.tasks[task_index].id;
        debug!(slot, task_id, ?reason, "terminate requested");
        self.emit(ScheduleEvent::TerminateRequested { schedule_index: slot, task_id });
    }

    fn terminate_all(&mut self, reason: StopReason) {
        for task_index in 0..T_MAX {
            if self.task_states[task_index].running {
                if let Some(slot) = self.task_states[task_index].schedule_index {
                    self.request_terminate(slot, task_index, reason);
                }
            }
        }
    }

    fn reap(&mut self, uptime_s: u64) {
        for task_index in 0..T_MAX {
            if !self.task_states[task_index].running {
                continue;
            }
            let finished = match &self.task_states[task_index].handle {
                ExecutionHandle::Thread(handle) => handle.is_finished(),
                ExecutionHandle::WorkItem(handle) => !self.work_queue.busy(*handle),
                ExecutionHandle::None => true,
            };
            if !finished {
                continue;
            }
            let handle = std::mem::replace(&mut self.task_states[task_index].handle, ExecutionHandle::None);
            if let ExecutionHandle::Thread(handle) = handle {
                if let Err(panic) = handle.join() {
                    warn!(task_id = self.tasks[task_index].id, ?panic, "task thread panicked");
                }
            }

            self.task_states[task_index].running = false;
            let slot = self.task_states[task_index].schedule_index.take();
            let reason = self.pending_stop_reason[task_index].take().unwrap_or(StopReason::Voluntary);
            if let Some(slot) = slot {
                self.schedule_states[slot].last_terminate = uptime_s;
            }
            let task_id = self.tasks[task_index].id;
            info!(task_id, slot, ?reason, "task reaped");
            if let Some(slot) = slot {
                self.emit(ScheduleEvent::Stopped { schedule_index: slot, task_id, reason });
            }
        }
    }
}

impl<const S_MAX: usize, const T_MAX: usize> TaskRunner<S_MAX, T_MAX> {
    /// Shared handle to the runner's `TimeSource`, for `auto_iterate`'s
    /// driver thread to read uptime without holding the runner's mutex.
    pub fn time_source(&self) -> Arc<dyn TimeSource> {
        self.time.clone()
    }
}

fn classify_stop_reason(schedule: &Schedule, state: &ScheduleState, ctx: TickContext<'_>) -> StopReason {
    if ctx.unload_all {
        return StopReason::Reload;
    }
    if let Some(timeout_s) = schedule.timeout_s {
        if timeout_s > 0 && ctx.uptime_s.saturating_sub(state.last_run) >= timeout_s as u64 {
            return StopReason::Timeout;
        }
    }
    if let Some(threshold) = schedule.battery_terminate_threshold {
        if threshold > 0 && ctx.battery_percent <= threshold {
            return StopReason::Battery;
        }
    }
    StopReason::ValidityClosed
}
