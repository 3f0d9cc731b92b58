//! Schedule data model, validation, and the fixed-width persisted
//! representation.
//!
//! [`Schedule`] is the ergonomic, enum-based type used everywhere in the
//! evaluator and the host application. [`ScheduleRepr`] is a private,
//! all-primitive mirror used only to get a byte-for-byte fixed-width wire
//! format out of `bincode` — a naive `#[derive(Serialize)]` on `Schedule`
//! itself would vary in length across `Periodicity` variants (`Fixed` has
//! one `u32` payload, `After` has a `u16` and a `u32`), which would break
//! the "every schedule slot is exactly `SCHEDULE_WIRE_LEN` bytes" contract
//! the original C implementation gets for free from `sizeof(struct)`.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::task::TaskId;

/// Opaque cross-run storage a task body may stash its own state in between
/// runs. The core never reads or writes the contents, only provides and
/// shares the handle; mirrors the external-interfaces accessor named
/// `ScheduleState::persistent_storage` against Rust ownership rather than a
/// raw `&mut [u8]`, since a task body runs on its own thread or work-queue
/// worker and cannot safely borrow straight out of the runner's state.
pub type PersistentStorage = Arc<Mutex<Vec<u8>>>;

/// Maximum number of `task_logging` entries per schedule.
pub const MAX_TASK_LOGGING: usize = 4;
/// Maximum size of the opaque `task_args` blob.
pub const TASK_ARGS_CAP: usize = 32;

/// Index of an application-defined boolean state, consulted for
/// `active`/`inactive` validity.
pub type AppState = u8;
/// Number of distinct application states `app_states` can track.
pub const APP_STATES_MAX: usize = 32;

/// A bitset of application states, passed into `iterate`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppStateSet(u32);

impl AppStateSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn with(mut self, state: AppState) -> Self {
        self.set(state);
        self
    }

    pub fn set(&mut self, state: AppState) {
        self.0 |= 1 << (state as u32 % 32);
    }

    pub fn clear(&mut self, state: AppState) {
        self.0 &= !(1 << (state as u32 % 32));
    }

    pub fn is_set(&self, state: AppState) -> bool {
        self.0 & (1 << (state as u32 % 32)) != 0
    }
}

/// Base validity mode, before the `locked` override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidityBase {
    Never,
    /// Active only while the named application state is set.
    Active(AppState),
    /// Active only while the named application state is clear.
    Inactive(AppState),
    Always,
    /// Bypasses should-start/should-terminate entirely; the evaluator
    /// restarts it whenever it is not running.
    PermanentlyRuns,
}

/// `validity` is the union of a base mode and a `locked` flag that forbids
/// overriding the compile-time default via the KV store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub base: ValidityBase,
    pub locked: bool,
}

impl Validity {
    pub const fn always() -> Self {
        Self { base: ValidityBase::Always, locked: false }
    }

    pub const fn locked(self) -> Self {
        Self { locked: true, ..self }
    }
}

/// When a schedule's bound task is eligible to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Periodicity {
    Fixed { period_s: u32 },
    Lockout { lockout_s: u32 },
    /// Eligible while `uptime_s - predecessor.last_terminate` is within
    /// `[0, gap_s]` of the schedule at `predecessor_index`, once per edge.
    After { predecessor_index: u16, gap_s: u32 },
    /// Eligible once an external signal has been posted since the last
    /// start (see `ScheduleState::post_event`).
    Event,
}

/// One `task_logging` entry: a bitset of output sinks plus a task-defined
/// TDF (Tagged Data Format) mask. The core does not interpret either value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskLoggingEntry {
    pub sinks: u8,
    pub tdf_mask: u32,
}

/// A declarative record of when a task may run. Persistent or
/// compile-time-default; `ScheduleStore` is what decides which wins for a
/// given slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Schedule {
    pub task_id: TaskId,
    pub validity: Validity,
    pub periodicity: Periodicity,
    /// `None` means "no timeout".
    pub timeout_s: Option<u32>,
    /// `None` (or a wire-encoded `0`) means "no battery gate".
    pub battery_start_threshold: Option<u8>,
    pub battery_terminate_threshold: Option<u8>,
    pub task_logging: [TaskLoggingEntry; MAX_TASK_LOGGING],
    pub task_logging_count: u8,
    pub task_args: [u8; TASK_ARGS_CAP],
    pub task_args_len: u16,
}

impl Schedule {
    pub const fn new(task_id: TaskId, validity: Validity, periodicity: Periodicity) -> Self {
        Self {
            task_id,
            validity,
            periodicity,
            timeout_s: None,
            battery_start_threshold: None,
            battery_terminate_threshold: None,
            task_logging: [TaskLoggingEntry { sinks: 0, tdf_mask: 0 }; MAX_TASK_LOGGING],
            task_logging_count: 0,
            task_args: [0; TASK_ARGS_CAP],
            task_args_len: 0,
        }
    }

    pub const fn with_timeout(mut self, timeout_s: u32) -> Self {
        self.timeout_s = Some(timeout_s);
        self
    }
}

/// Returns `false` if `schedule` fails any validity rule. Called both on
/// compile-time defaults (during `ScheduleStore::load`) and on bytes freshly
/// read from the KV store (to reject tampered/stale persisted data).
pub fn validate(schedule: &Schedule, known_task_ids: &[TaskId], s_max: usize) -> bool {
    if !known_task_ids.contains(&schedule.task_id) {
        return false;
    }
    if schedule.battery_start_threshold.is_some_and(|t| t > 100) {
        return false;
    }
    if schedule.battery_terminate_threshold.is_some_and(|t| t > 100) {
        return false;
    }
    match schedule.periodicity {
        Periodicity::After { predecessor_index, .. } => {
            if predecessor_index as usize >= s_max {
                return false;
            }
        }
        Periodicity::Fixed { period_s } => {
            if period_s == 0 && schedule.validity.base != ValidityBase::PermanentlyRuns {
                return false;
            }
        }
        Periodicity::Lockout { .. } | Periodicity::Event => {}
    }
    true
}

/// One mutable record per schedule, owned by the runner.
#[derive(Debug, Clone)]
pub struct ScheduleState {
    /// Resolved index into the task table, or `None` if the schedule's
    /// `task_id` did not resolve at link time.
    pub bound_task_index: Option<usize>,
    /// Index of the predecessor schedule, for `after` periodicity.
    pub predecessor_index: Option<usize>,
    pub last_run: u64,
    pub last_terminate: u64,
    pub runtime_s: u64,
    /// Opaque cross-run state the task body may use; the core never reads
    /// or writes the contents, only provides storage. Shared with whatever
    /// context the runner hands the bound task at start time via
    /// [`ScheduleState::storage_handle`].
    pub runtime_state: PersistentStorage,
    /// The predecessor's `last_terminate` value this schedule has already
    /// started from, for `after` periodicity. Compared against the
    /// predecessor's *current* `last_terminate` rather than latched as a
    /// single sticky bit, so a later predecessor run produces a new edge
    /// this schedule can start from again.
    pub after_consumed_terminate: Option<u64>,
    /// Latched by `post_event`; consumed by the evaluator on start.
    event_posted: bool,
}

impl ScheduleState {
    pub fn new() -> Self {
        Self {
            bound_task_index: None,
            predecessor_index: None,
            last_run: 0,
            last_terminate: 0,
            runtime_s: 0,
            runtime_state: Arc::new(Mutex::new(Vec::new())),
            after_consumed_terminate: None,
            event_posted: false,
        }
    }

    /// Clone of the shared handle to this schedule's persistent storage,
    /// handed to the bound task's execution context at start time.
    pub fn storage_handle(&self) -> PersistentStorage {
        self.runtime_state.clone()
    }

    /// Post an `event`-periodicity trigger. A single-slot latch, not a
    /// queue: posting while the schedule's task is already running is a
    /// no-op until the task stops and the evaluator re-arms.
    pub fn post_event(&mut self) {
        self.event_posted = true;
    }

    pub fn take_event(&mut self) -> bool {
        std::mem::take(&mut self.event_posted)
    }

    /// Non-consuming peek, used by the evaluator's should-start check. The
    /// runner calls `take_event` separately once it decides to actually
    /// start the task, so a decision that is overridden (e.g. by the
    /// index-order tie-break) does not silently drop the event.
    pub fn is_event_posted(&self) -> bool {
        self.event_posted
    }
}

impl Default for ScheduleState {
    fn default() -> Self {
        Self::new()
    }
}

// --- Fixed-width wire representation -------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ValidityRepr {
    base_tag: u8,
    app_state: u8,
    locked: u8,
}

const VALIDITY_TAG_NEVER: u8 = 0;
const VALIDITY_TAG_ACTIVE: u8 = 1;
const VALIDITY_TAG_INACTIVE: u8 = 2;
const VALIDITY_TAG_ALWAYS: u8 = 3;
const VALIDITY_TAG_PERMANENTLY_RUNS: u8 = 4;

impl From<Validity> for ValidityRepr {
    fn from(v: Validity) -> Self {
        let (base_tag, app_state) = match v.base {
            ValidityBase::Never => (VALIDITY_TAG_NEVER, 0),
            ValidityBase::Active(s) => (VALIDITY_TAG_ACTIVE, s),
            ValidityBase::Inactive(s) => (VALIDITY_TAG_INACTIVE, s),
            ValidityBase::Always => (VALIDITY_TAG_ALWAYS, 0),
            ValidityBase::PermanentlyRuns => (VALIDITY_TAG_PERMANENTLY_RUNS, 0),
        };
        ValidityRepr { base_tag, app_state, locked: v.locked as u8 }
    }
}

impl ValidityRepr {
    fn try_into_validity(self) -> Option<Validity> {
        let base = match self.base_tag {
            VALIDITY_TAG_NEVER => ValidityBase::Never,
            VALIDITY_TAG_ACTIVE => ValidityBase::Active(self.app_state),
            VALIDITY_TAG_INACTIVE => ValidityBase::Inactive(self.app_state),
            VALIDITY_TAG_ALWAYS => ValidityBase::Always,
            VALIDITY_TAG_PERMANENTLY_RUNS => ValidityBase::PermanentlyRuns,
            _ => return None,
        };
        Some(Validity { base, locked: self.locked != 0 })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct PeriodicityRepr {
    tag: u8,
    period_or_lockout_s: u32,
    predecessor_index: u16,
    gap_s: u32,
}

const PERIODICITY_TAG_FIXED: u8 = 0;
const PERIODICITY_TAG_LOCKOUT: u8 = 1;
const PERIODICITY_TAG_AFTER: u8 = 2;
const PERIODICITY_TAG_EVENT: u8 = 3;

impl From<Periodicity> for PeriodicityRepr {
    fn from(p: Periodicity) -> Self {
        match p {
            Periodicity::Fixed { period_s } => PeriodicityRepr {
                tag: PERIODICITY_TAG_FIXED,
                period_or_lockout_s: period_s,
                predecessor_index: 0,
                gap_s: 0,
            },
            Periodicity::Lockout { lockout_s } => PeriodicityRepr {
                tag: PERIODICITY_TAG_LOCKOUT,
                period_or_lockout_s: lockout_s,
                predecessor_index: 0,
                gap_s: 0,
            },
            Periodicity::After { predecessor_index, gap_s } => PeriodicityRepr {
                tag: PERIODICITY_TAG_AFTER,
                period_or_lockout_s: 0,
                predecessor_index,
                gap_s,
            },
            Periodicity::Event => PeriodicityRepr {
                tag: PERIODICITY_TAG_EVENT,
                period_or_lockout_s: 0,
                predecessor_index: 0,
                gap_s: 0,
            },
        }
    }
}

impl PeriodicityRepr {
    fn try_into_periodicity(self) -> Option<Periodicity> {
        Some(match self.tag {
            PERIODICITY_TAG_FIXED => Periodicity::Fixed { period_s: self.period_or_lockout_s },
            PERIODICITY_TAG_LOCKOUT => Periodicity::Lockout { lockout_s: self.period_or_lockout_s },
            PERIODICITY_TAG_AFTER => Periodicity::After {
                predecessor_index: self.predecessor_index,
                gap_s: self.gap_s,
            },
            PERIODICITY_TAG_EVENT => Periodicity::Event,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ScheduleRepr {
    task_id: TaskId,
    validity: ValidityRepr,
    periodicity: PeriodicityRepr,
    timeout_s: u32,
    battery_start_threshold: u8,
    battery_terminate_threshold: u8,
    task_logging_count: u8,
    task_logging: [TaskLoggingEntry; MAX_TASK_LOGGING],
    task_args_len: u16,
    task_args: [u8; TASK_ARGS_CAP],
}

impl Serialize for TaskLoggingEntry {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.sinks, self.tdf_mask).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TaskLoggingEntry {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (sinks, tdf_mask) = <(u8, u32)>::deserialize(deserializer)?;
        Ok(TaskLoggingEntry { sinks, tdf_mask })
    }
}

impl From<Schedule> for ScheduleRepr {
    fn from(s: Schedule) -> Self {
        ScheduleRepr {
            task_id: s.task_id,
            validity: s.validity.into(),
            periodicity: s.periodicity.into(),
            timeout_s: s.timeout_s.unwrap_or(0),
            battery_start_threshold: s.battery_start_threshold.unwrap_or(0),
            battery_terminate_threshold: s.battery_terminate_threshold.unwrap_or(0),
            task_logging_count: s.task_logging_count,
            task_logging: s.task_logging,
            task_args_len: s.task_args_len,
            task_args: s.task_args,
        }
    }
}

impl ScheduleRepr {
    fn try_into_schedule(self) -> Option<Schedule> {
        Some(Schedule {
            task_id: self.task_id,
            validity: self.validity.try_into_validity()?,
            periodicity: self.periodicity.try_into_periodicity()?,
            timeout_s: (self.timeout_s != 0).then_some(self.timeout_s),
            battery_start_threshold: (self.battery_start_threshold != 0)
                .then_some(self.battery_start_threshold),
            battery_terminate_threshold: (self.battery_terminate_threshold != 0)
                .then_some(self.battery_terminate_threshold),
            task_logging: self.task_logging,
            task_logging_count: self.task_logging_count,
            task_args: self.task_args,
            task_args_len: self.task_args_len,
        })
    }
}

/// Exact on-the-wire length of an encoded [`Schedule`], in bytes. Every
/// schedule slot in the KV store holds exactly this many bytes; a read that
/// returns a different length is `storage-corrupt` (the slot is zeroed and
/// ignored, never fatal).
///
/// This is a manual sum of each `ScheduleRepr` field's fixed-width bincode
/// encoding (1 byte per `u8`, 2 per `u16`, 4 per `u32`), not
/// `size_of::<ScheduleRepr>()` — Rust's in-memory layout includes alignment
/// padding bincode's wire format does not. `tests::wire_len_matches_bincode`
/// cross-checks this constant against `bincode::serialized_size` directly.
pub const SCHEDULE_WIRE_LEN: usize = {
    const VALIDITY_LEN: usize = 1 + 1 + 1;
    const PERIODICITY_LEN: usize = 1 + 4 + 2 + 4;
    const TASK_LOGGING_ENTRY_LEN: usize = 1 + 4;
    1 // task_id
        + VALIDITY_LEN
        + PERIODICITY_LEN
        + 4 // timeout_s
        + 1 // battery_start_threshold
        + 1 // battery_terminate_threshold
        + 1 // task_logging_count
        + TASK_LOGGING_ENTRY_LEN * MAX_TASK_LOGGING
        + 2 // task_args_len
        + TASK_ARGS_CAP
};

/// Encode a schedule to its fixed-width wire representation.
pub fn encode(schedule: &Schedule) -> Vec<u8> {
    let repr: ScheduleRepr = (*schedule).into();
    bincode::serialize(&repr).expect("ScheduleRepr is all fixed-width primitives")
}

/// Decode a schedule from exactly [`SCHEDULE_WIRE_LEN`] bytes. Any other
/// length, or a tag byte outside the enumerated set, is `None` — the
/// caller treats this as `storage-corrupt`.
pub fn decode(bytes: &[u8]) -> Option<Schedule> {
    if bytes.len() != SCHEDULE_WIRE_LEN {
        return None;
    }
    let repr: ScheduleRepr = bincode::deserialize(bytes).ok()?;
    repr.try_into_schedule()
}
