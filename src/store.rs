//! Schedule store & loader: merges compile-time default schedules with the
//! persistent KV store into a single in-RAM array of up to `S_MAX`
//! schedules, and tracks runtime edits for the reload FSM in `runner`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::kv::{Key, KvStore};
use crate::schedule::{validate, Schedule, SCHEDULE_WIRE_LEN};
use crate::task::TaskId;

/// Reserved key holding the 32-bit schedule-set identifier. By convention
/// the slot just below the reserved per-schedule range.
pub const KV_DEFAULT_ID_KEY: Key = 0x5348_0000; // "SH\0\0"
/// Base of the reserved per-schedule key range: `[KV_SCHEDULE_BASE,
/// KV_SCHEDULE_BASE + S_MAX)`.
pub const KV_SCHEDULE_BASE: Key = KV_DEFAULT_ID_KEY + 1;

fn schedule_key(slot: usize) -> Key {
    KV_SCHEDULE_BASE + slot as u32
}

/// Computes the 32-bit schedule-set identifier: `(wire_len << 16) |
/// app_supplied_id`. Changing the wire layout (adding a field to
/// `Schedule`) or bumping `app_supplied_id` both force every persisted
/// schedule to reset to its compile-time default.
pub fn expected_schedule_set_id(app_supplied_default_id: u16) -> u32 {
    ((SCHEDULE_WIRE_LEN as u32) << 16) | app_supplied_default_id as u32
}

/// Holds the merged, in-RAM schedule set and the KV-change rebuild flag.
pub struct ScheduleStore<const S_MAX: usize> {
    schedules: [Option<Schedule>; S_MAX],
    /// Highest slot index + 1 with a valid schedule; schedules beyond this
    /// are never evaluated.
    num_eval: usize,
    rebuild_requested: Arc<AtomicBool>,
}

impl<const S_MAX: usize> ScheduleStore<S_MAX> {
    /// Loads the schedule set: overwrite mode if the persisted `default-id`
    /// is missing or stale, merge mode otherwise. Does not subscribe to KV
    /// changes — call
    /// `subscribe_for_changes` once, after `init` is otherwise complete, so
    /// the writes this function itself performs in overwrite mode cannot
    /// trigger a spurious rebuild.
    #[instrument(skip_all, fields(app_supplied_default_id))]
    pub fn load(
        kv: &dyn KvStore,
        defaults: &[Schedule; S_MAX],
        known_task_ids: &[TaskId],
        app_supplied_default_id: u16,
    ) -> Self {
        let expected_id = expected_schedule_set_id(app_supplied_default_id);
        let persisted_id = read_default_id(kv);

        let schedules = if persisted_id != Some(expected_id) {
            info!(expected_id, ?persisted_id, "schedule-set id mismatch, resetting to defaults");
            overwrite_with_defaults(kv, defaults, known_task_ids, S_MAX)
        } else {
            merge_with_persistence(kv, defaults, known_task_ids, S_MAX)
        };

        if persisted_id != Some(expected_id) {
            if let Err(err) = kv.write(KV_DEFAULT_ID_KEY, &expected_id.to_le_bytes()) {
                warn!(?err, "failed to persist schedule-set id");
            }
        }

        let num_eval = schedules
            .iter()
            .rposition(|s| s.is_some())
            .map(|idx| idx + 1)
            .unwrap_or(0);

        Self {
            schedules,
            num_eval,
            rebuild_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Registers a KV-change callback for the reserved schedule key range.
    /// Sets the rebuild flag consumed by `runner::TaskRunner::iterate`;
    /// does not reload immediately (see the reload FSM in `runner`).
    pub fn subscribe_for_changes(&self, kv: &dyn KvStore) {
        let flag = self.rebuild_requested.clone();
        kv.subscribe(
            KV_DEFAULT_ID_KEY..KV_SCHEDULE_BASE + S_MAX as u32,
            Box::new(move || {
                flag.store(true, Ordering::SeqCst);
            }),
        );
    }

    pub fn reload_requested(&self) -> bool {
        self.rebuild_requested.swap(false, Ordering::SeqCst)
    }

    pub fn num_eval(&self) -> usize {
        self.num_eval
    }

    pub fn schedules(&self) -> &[Option<Schedule>; S_MAX] {
        &self.schedules
    }

    pub fn schedule(&self, slot: usize) -> Option<&Schedule> {
        self.schedules.get(slot).and_then(|s| s.as_ref())
    }

    /// Rebuilds the in-RAM set from scratch, reusing the same load logic.
    /// Called by the runner once every task has been reaped following a
    /// reload request.
    pub fn reload(
        &mut self,
        kv: &dyn KvStore,
        defaults: &[Schedule; S_MAX],
        known_task_ids: &[TaskId],
        app_supplied_default_id: u16,
    ) {
        let reloaded = Self::load(kv, defaults, known_task_ids, app_supplied_default_id);
        self.schedules = reloaded.schedules;
        self.num_eval = reloaded.num_eval;
    }
}

fn read_default_id(kv: &dyn KvStore) -> Option<u32> {
    let bytes = kv.read(KV_DEFAULT_ID_KEY).ok().flatten()?;
    let arr: [u8; 4] = bytes.try_into().ok()?;
    Some(u32::from_le_bytes(arr))
}

fn overwrite_with_defaults<const S_MAX: usize>(
    kv: &dyn KvStore,
    defaults: &[Schedule; S_MAX],
    known_task_ids: &[TaskId],
    s_max: usize,
) -> [Option<Schedule>; S_MAX] {
    let mut out: [Option<Schedule>; S_MAX] = std::array::from_fn(|_| None);
    for (slot, default) in defaults.iter().enumerate() {
        if validate(default, known_task_ids, s_max) {
            let bytes = crate::schedule::encode(default);
            if let Err(err) = kv.write(schedule_key(slot), &bytes) {
                warn!(slot, ?err, "failed to persist default schedule");
            }
            out[slot] = Some(*default);
        } else {
            // An invalid default does not consume a slot: leave it absent
            // and make sure any leftover persisted value is gone too.
            let _ = kv.delete(schedule_key(slot));
        }
    }
    out
}

fn merge_with_persistence<const S_MAX: usize>(
    kv: &dyn KvStore,
    defaults: &[Schedule; S_MAX],
    known_task_ids: &[TaskId],
    s_max: usize,
) -> [Option<Schedule>; S_MAX] {
    std::array::from_fn(|slot| {
        let default = defaults[slot];
        if default.validity.locked {
            return validate(&default, known_task_ids, s_max).then_some(default);
        }
        match kv.read(schedule_key(slot)) {
            Ok(Some(bytes)) => {
                if bytes.len() != SCHEDULE_WIRE_LEN {
                    warn!(
                        slot,
                        len = bytes.len(),
                        expected = SCHEDULE_WIRE_LEN,
                        "storage-corrupt schedule slot, ignoring"
                    );
                    return None;
                }
                match crate::schedule::decode(&bytes) {
                    Some(schedule) if validate(&schedule, known_task_ids, s_max) => Some(schedule),
                    _ => {
                        warn!(slot, "persisted schedule failed validation, ignoring");
                        None
                    }
                }
            }
            Ok(None) => validate(&default, known_task_ids, s_max).then_some(default),
            Err(err) => {
                warn!(slot, ?err, "kv read failed, falling back to default");
                validate(&default, known_task_ids, s_max).then_some(default)
            }
        }
    })
}

/// Helper for `runner`/task bodies that want to write a live edit into a
/// non-locked slot (e.g. surfaced over RPC). Bypasses validation on
/// read-back — the next `load`/`reload` will reject it if it is bad.
pub fn write_slot(kv: &dyn KvStore, slot: usize, schedule: &Schedule) -> crate::error::Result<()> {
    let bytes = crate::schedule::encode(schedule);
    kv.write(schedule_key(slot), &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use crate::schedule::{Periodicity, Validity};

    fn defaults() -> [Schedule; 2] {
        [
            Schedule::new(1, Validity::always(), Periodicity::Fixed { period_s: 10 }),
            Schedule::new(2, Validity::always(), Periodicity::Fixed { period_s: 20 }),
        ]
    }

    #[test]
    fn fresh_store_writes_defaults_and_id() {
        let kv = MemoryKvStore::new();
        let store = ScheduleStore::load(&kv, &defaults(), &[1, 2], 0);
        assert_eq!(store.num_eval(), 2);
        assert_eq!(store.schedule(0).unwrap().task_id, 1);
        assert_eq!(
            read_default_id(&kv),
            Some(expected_schedule_set_id(0))
        );
    }

    #[test]
    fn merge_stability_non_locked_edit_survives_reload() {
        let kv = MemoryKvStore::new();
        let _ = ScheduleStore::load(&kv, &defaults(), &[1, 2], 0);

        let edited = Schedule::new(1, Validity::always(), Periodicity::Fixed { period_s: 3 });
        write_slot(&kv, 0, &edited).unwrap();

        let store = ScheduleStore::load(&kv, &defaults(), &[1, 2], 0);
        match store.schedule(0).unwrap().periodicity {
            Periodicity::Fixed { period_s } => assert_eq!(period_s, 3),
            other => panic!("unexpected periodicity {other:?}"),
        }
    }

    #[test]
    fn locked_default_wins_over_kv_edit() {
        let kv = MemoryKvStore::new();
        let mut defs = defaults();
        defs[0].validity.locked = true;
        let _ = ScheduleStore::load(&kv, &defs, &[1, 2], 0);

        let edited = Schedule::new(1, Validity::always(), Periodicity::Fixed { period_s: 3 });
        write_slot(&kv, 0, &edited).unwrap();

        let store = ScheduleStore::load(&kv, &defs, &[1, 2], 0);
        match store.schedule(0).unwrap().periodicity {
            Periodicity::Fixed { period_s } => assert_eq!(period_s, 10),
            other => panic!("unexpected periodicity {other:?}"),
        }
    }

    #[test]
    fn reset_on_id_change_restores_defaults() {
        let kv = MemoryKvStore::new();
        let _ = ScheduleStore::load(&kv, &defaults(), &[1, 2], 0);
        write_slot(&kv, 0, &Schedule::new(1, Validity::always(), Periodicity::Fixed { period_s: 3 })).unwrap();

        let store = ScheduleStore::load(&kv, &defaults(), &[1, 2], 7);
        match store.schedule(0).unwrap().periodicity {
            Periodicity::Fixed { period_s } => assert_eq!(period_s, 10),
            other => panic!("unexpected periodicity {other:?}"),
        }
    }

    #[test]
    fn invalid_default_does_not_consume_slot() {
        let kv = MemoryKvStore::new();
        let mut defs = defaults();
        defs[1] = Schedule::new(99, Validity::always(), Periodicity::Fixed { period_s: 1 });
        let store = ScheduleStore::load(&kv, &defs, &[1, 2], 0);
        assert!(store.schedule(1).is_none());
        assert_eq!(store.num_eval(), 1);
    }

    #[test]
    fn corrupt_slot_is_skipped_not_fatal() {
        let kv = MemoryKvStore::new();
        let _ = ScheduleStore::load(&kv, &defaults(), &[1, 2], 0);
        kv.write(schedule_key(0), &[1, 2, 3]).unwrap();

        let store = ScheduleStore::load(&kv, &defaults(), &[1, 2], 0);
        // Unchanged id, so merge mode: a corrupt slot is treated as empty
        // regardless of whether a default exists for it, not silently
        // replaced by the default.
        assert!(store.schedule(0).is_none());
    }
}
