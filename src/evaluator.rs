//! Pure should-start / should-terminate decisions for one schedule, given
//! the current tick's inputs. Holds no state itself — `runner` owns the
//! mutable [`crate::schedule::ScheduleState`]/[`crate::task::TaskState`]
//! records and applies whatever this module decides.

use crate::schedule::{AppStateSet, Periodicity, Schedule, ScheduleState, ValidityBase};

/// Inputs common to both decisions, bundled so call sites in `runner`
/// don't have to thread five positional arguments through.
#[derive(Debug, Clone, Copy)]
pub struct TickContext<'a> {
    pub app_states: &'a AppStateSet,
    pub uptime_s: u64,
    pub gps_time_s: u64,
    pub battery_percent: u8,
    /// Set by the runner while draining the `TerminatingAll` reload state;
    /// forces every running task to terminate regardless of its schedule.
    pub unload_all: bool,
}

fn validity_open(schedule: &Schedule, app_states: &AppStateSet) -> bool {
    match schedule.validity.base {
        ValidityBase::Never => false,
        ValidityBase::Always | ValidityBase::PermanentlyRuns => true,
        ValidityBase::Active(state) => app_states.is_set(state),
        ValidityBase::Inactive(state) => !app_states.is_set(state),
    }
}

fn periodicity_eligible(
    schedule: &Schedule,
    state: &ScheduleState,
    predecessor: Option<&ScheduleState>,
    uptime_s: u64,
) -> bool {
    match schedule.periodicity {
        Periodicity::Fixed { period_s } => {
            state.last_run == 0 || uptime_s.saturating_sub(state.last_run) >= period_s as u64
        }
        Periodicity::Lockout { lockout_s } => {
            state.last_terminate == 0 || uptime_s.saturating_sub(state.last_terminate) >= lockout_s as u64
        }
        Periodicity::After { gap_s, .. } => {
            let Some(predecessor) = predecessor else { return false };
            if predecessor.last_terminate == 0 {
                return false;
            }
            if state.after_consumed_terminate == Some(predecessor.last_terminate) {
                return false;
            }
            let elapsed = uptime_s.saturating_sub(predecessor.last_terminate);
            uptime_s >= predecessor.last_terminate && elapsed <= gap_s as u64
        }
        Periodicity::Event => state.is_event_posted(),
    }
}

/// `true` if the task bound to `schedule` should be started this tick.
///
/// `predecessor` must be `Some` whenever `schedule.periodicity` is `After`;
/// `runner` guarantees this at link time via `validate`.
#[allow(clippy::too_many_arguments)]
pub fn should_start(
    schedule: &Schedule,
    state: &ScheduleState,
    predecessor: Option<&ScheduleState>,
    task_running_elsewhere: bool,
    task_skip: bool,
    ctx: TickContext<'_>,
) -> bool {
    if ctx.unload_all || task_running_elsewhere || task_skip {
        return false;
    }
    if matches!(schedule.validity.base, ValidityBase::PermanentlyRuns) {
        return true;
    }
    if !validity_open(schedule, ctx.app_states) {
        return false;
    }
    if let Some(threshold) = schedule.battery_start_threshold {
        if threshold > 0 && ctx.battery_percent < threshold {
            return false;
        }
    }
    periodicity_eligible(schedule, state, predecessor, ctx.uptime_s)
}

/// `true` if a task currently running from `schedule` should be asked to
/// terminate this tick. Only meaningful when the caller already knows the
/// task is running.
pub fn should_terminate(schedule: &Schedule, state: &ScheduleState, ctx: TickContext<'_>) -> bool {
    if ctx.unload_all {
        return true;
    }
    if matches!(schedule.validity.base, ValidityBase::PermanentlyRuns) {
        return false;
    }
    if let Some(timeout_s) = schedule.timeout_s {
        if timeout_s > 0 && ctx.uptime_s.saturating_sub(state.last_run) >= timeout_s as u64 {
            return true;
        }
    }
    if !validity_open(schedule, ctx.app_states) {
        return true;
    }
    if let Some(threshold) = schedule.battery_terminate_threshold {
        if threshold > 0 && ctx.battery_percent <= threshold {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{Periodicity, Validity};
    use proptest::prelude::*;

    fn ctx(uptime_s: u64, battery: u8, app_states: &AppStateSet) -> TickContext<'_> {
        TickContext { app_states, uptime_s, gps_time_s: uptime_s, battery_percent: battery, unload_all: false }
    }

    #[test]
    fn fixed_first_run_allowed_when_last_run_zero() {
        let schedule = Schedule::new(1, Validity::always(), Periodicity::Fixed { period_s: 5 });
        let state = ScheduleState::new();
        let app = AppStateSet::empty();
        assert!(should_start(&schedule, &state, None, false, false, ctx(0, 100, &app)));
    }

    #[test]
    fn fixed_waits_out_period() {
        let schedule = Schedule::new(1, Validity::always(), Periodicity::Fixed { period_s: 5 });
        let mut state = ScheduleState::new();
        state.last_run = 10;
        let app = AppStateSet::empty();
        assert!(!should_start(&schedule, &state, None, false, false, ctx(12, 100, &app)));
        assert!(should_start(&schedule, &state, None, false, false, ctx(15, 100, &app)));
    }

    #[test]
    fn lockout_measures_from_last_terminate() {
        let schedule = Schedule::new(1, Validity::always(), Periodicity::Lockout { lockout_s: 60 });
        let mut state = ScheduleState::new();
        state.last_terminate = 10;
        let app = AppStateSet::empty();
        assert!(!should_start(&schedule, &state, None, false, false, ctx(20, 100, &app)));
        assert!(should_start(&schedule, &state, None, false, false, ctx(70, 100, &app)));
    }

    #[test]
    fn after_requires_unconsumed_edge_within_gap() {
        let schedule = Schedule::new(
            2,
            Validity::always(),
            Periodicity::After { predecessor_index: 0, gap_s: 2 },
        );
        let state = ScheduleState::new();
        let mut predecessor = ScheduleState::new();
        predecessor.last_terminate = 5;
        let app = AppStateSet::empty();

        assert!(!should_start(&schedule, &state, Some(&predecessor), false, false, ctx(4, 100, &app)));
        assert!(should_start(&schedule, &state, Some(&predecessor), false, false, ctx(6, 100, &app)));
        assert!(!should_start(&schedule, &state, Some(&predecessor), false, false, ctx(8, 100, &app)));

        let mut consumed = state.clone();
        consumed.after_consumed_terminate = Some(predecessor.last_terminate);
        assert!(!should_start(&schedule, &consumed, Some(&predecessor), false, false, ctx(6, 100, &app)));

        // A later predecessor run produces a new edge this schedule can
        // start from again, even though the flag was previously consumed.
        let mut new_predecessor = predecessor.clone();
        new_predecessor.last_terminate = 20;
        assert!(should_start(&schedule, &consumed, Some(&new_predecessor), false, false, ctx(21, 100, &app)));
    }

    #[test]
    fn active_validity_gates_on_app_state() {
        let schedule = Schedule::new(1, Validity { base: ValidityBase::Active(3), locked: false }, Periodicity::Fixed { period_s: 1 });
        let state = ScheduleState::new();
        let mut app = AppStateSet::empty();
        assert!(!should_start(&schedule, &state, None, false, false, ctx(0, 100, &app)));
        app.set(3);
        assert!(should_start(&schedule, &state, None, false, false, ctx(0, 100, &app)));
    }

    #[test]
    fn battery_start_threshold_gates_start() {
        let mut schedule = Schedule::new(1, Validity::always(), Periodicity::Fixed { period_s: 1 });
        schedule.battery_start_threshold = Some(30);
        let state = ScheduleState::new();
        let app = AppStateSet::empty();
        assert!(!should_start(&schedule, &state, None, false, false, ctx(0, 20, &app)));
        assert!(should_start(&schedule, &state, None, false, false, ctx(0, 30, &app)));
    }

    #[test]
    fn permanently_runs_bypasses_periodicity() {
        let schedule = Schedule::new(
            1,
            Validity { base: ValidityBase::PermanentlyRuns, locked: false },
            Periodicity::Fixed { period_s: 0 },
        );
        let state = ScheduleState::new();
        let app = AppStateSet::empty();
        assert!(should_start(&schedule, &state, None, false, false, ctx(0, 0, &app)));
        assert!(!should_terminate(&schedule, &state, ctx(999_999, 0, &app)));
    }

    #[test]
    fn running_elsewhere_or_skip_blocks_start() {
        let schedule = Schedule::new(1, Validity::always(), Periodicity::Fixed { period_s: 1 });
        let state = ScheduleState::new();
        let app = AppStateSet::empty();
        assert!(!should_start(&schedule, &state, None, true, false, ctx(0, 100, &app)));
        assert!(!should_start(&schedule, &state, None, false, true, ctx(0, 100, &app)));
    }

    #[test]
    fn timeout_triggers_terminate() {
        let mut schedule = Schedule::new(1, Validity::always(), Periodicity::Fixed { period_s: 5 });
        schedule.timeout_s = Some(4);
        let mut state = ScheduleState::new();
        state.last_run = 0;
        let app = AppStateSet::empty();
        assert!(!should_terminate(&schedule, &state, ctx(3, 100, &app)));
        assert!(should_terminate(&schedule, &state, ctx(4, 100, &app)));
    }

    #[test]
    fn validity_flip_closed_triggers_terminate() {
        let schedule = Schedule::new(1, Validity { base: ValidityBase::Active(1), locked: false }, Periodicity::Fixed { period_s: 5 });
        let state = ScheduleState::new();
        let mut app = AppStateSet::empty();
        app.set(1);
        assert!(!should_terminate(&schedule, &state, ctx(0, 100, &app)));
        app.clear(1);
        assert!(should_terminate(&schedule, &state, ctx(0, 100, &app)));
    }

    #[test]
    fn battery_terminate_threshold_triggers_terminate() {
        let mut schedule = Schedule::new(1, Validity::always(), Periodicity::Fixed { period_s: 5 });
        schedule.battery_terminate_threshold = Some(15);
        let state = ScheduleState::new();
        let app = AppStateSet::empty();
        assert!(!should_terminate(&schedule, &state, ctx(0, 20, &app)));
        assert!(should_terminate(&schedule, &state, ctx(0, 15, &app)));
    }

    #[test]
    fn unload_all_forces_terminate_and_blocks_start() {
        let schedule = Schedule::new(1, Validity::always(), Periodicity::Fixed { period_s: 1 });
        let state = ScheduleState::new();
        let app = AppStateSet::empty();
        let mut ctx = ctx(0, 100, &app);
        ctx.unload_all = true;
        assert!(!should_start(&schedule, &state, None, false, false, ctx));
        assert!(should_terminate(&schedule, &state, ctx));
    }

    proptest! {
        #[test]
        fn fixed_periodicity_matches_closed_form(
            period in 1u32..1_000_000,
            last_run in 0u64..2_000_000,
            uptime in 0u64..2_000_000,
        ) {
            let schedule = Schedule::new(1, Validity::always(), Periodicity::Fixed { period_s: period });
            let mut state = ScheduleState::new();
            state.last_run = last_run;
            let app = AppStateSet::empty();
            let expected = last_run == 0 || uptime.saturating_sub(last_run) >= period as u64;
            prop_assert_eq!(
                should_start(&schedule, &state, None, false, false, ctx(uptime, 100, &app)),
                expected
            );
        }

        #[test]
        fn lockout_periodicity_matches_closed_form(
            lockout in 1u32..1_000_000,
            last_terminate in 0u64..2_000_000,
            uptime in 0u64..2_000_000,
        ) {
            let schedule = Schedule::new(1, Validity::always(), Periodicity::Lockout { lockout_s: lockout });
            let mut state = ScheduleState::new();
            state.last_terminate = last_terminate;
            let app = AppStateSet::empty();
            let expected = last_terminate == 0 || uptime.saturating_sub(last_terminate) >= lockout as u64;
            prop_assert_eq!(
                should_start(&schedule, &state, None, false, false, ctx(uptime, 100, &app)),
                expected
            );
        }

        #[test]
        fn after_periodicity_matches_closed_form(
            gap_s in 0u32..10_000,
            predecessor_last_terminate in 1u64..2_000_000,
            uptime in 0u64..2_000_000,
        ) {
            let schedule = Schedule::new(
                2,
                Validity::always(),
                Periodicity::After { predecessor_index: 0, gap_s },
            );
            let state = ScheduleState::new();
            let mut predecessor = ScheduleState::new();
            predecessor.last_terminate = predecessor_last_terminate;
            let app = AppStateSet::empty();
            let elapsed = uptime.saturating_sub(predecessor_last_terminate);
            let expected = uptime >= predecessor_last_terminate && elapsed <= gap_s as u64;
            prop_assert_eq!(
                should_start(&schedule, &state, Some(&predecessor), false, false, ctx(uptime, 100, &app)),
                expected
            );
        }
    }
}
