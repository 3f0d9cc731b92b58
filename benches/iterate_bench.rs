// infuse-task-runner: per-tick evaluation cost of `TaskRunner::iterate`.
// Measures the steady-state case (nothing due to start or stop) across a
// range of schedule-set sizes, since that is the cost every embedded
// caller pays on every tick regardless of what is actually running.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use infuse_task_runner::config::RunnerConfig;
use infuse_task_runner::kv::MemoryKvStore;
use infuse_task_runner::runner::TaskRunner;
use infuse_task_runner::schedule::{AppStateSet, Periodicity, Schedule, Validity, ValidityBase};
use infuse_task_runner::task::{ExecutionKind, TaskArg, TaskDefinition, TaskFlags, ThreadTaskContext};
use infuse_task_runner::time::MonotonicTimeSource;
use infuse_task_runner::watchdog::RefWatchdog;
use infuse_task_runner::work_queue::{AlwaysReady, ThreadWorkQueue};

fn idle_entry(ctx: ThreadTaskContext<'_>) {
    let _ = ctx.terminate.wait_with_termination(None);
}

/// Leaks a fresh task table of `N` never-eligible tasks, one schedule each,
/// so `iterate` walks the full evaluation loop without ever starting or
/// reaping anything.
fn make_tasks<const N: usize>() -> &'static [TaskDefinition; N] {
    let tasks: [TaskDefinition; N] = std::array::from_fn(|i| TaskDefinition {
        id: i as u8,
        name: "idle",
        kind: ExecutionKind::DedicatedThread { stack_size: 4096, entry: idle_entry },
        arg: TaskArg::None,
        flags: TaskFlags::empty(),
    });
    Box::leak(Box::new(tasks))
}

fn make_defaults<const N: usize>() -> [Schedule; N] {
    std::array::from_fn(|i| {
        Schedule::new(
            i as u8,
            Validity { base: ValidityBase::Never, locked: true },
            Periodicity::Fixed { period_s: 60 },
        )
    })
}

fn bench_one_size<const N: usize>(
    group: &mut criterion::BenchmarkGroup<'_, criterion::measurement::WallTime>,
) {
    let mut runner = TaskRunner::<N, N>::init(
        make_tasks::<N>(),
        make_defaults::<N>(),
        Arc::new(MemoryKvStore::new()),
        Arc::new(MonotonicTimeSource::default()),
        Arc::new(RefWatchdog::new(std::time::Duration::from_secs(10))),
        Arc::new(ThreadWorkQueue::new()),
        Arc::new(AlwaysReady),
        RunnerConfig::default(),
    );
    let app_states = AppStateSet::empty();
    let mut uptime = 0u64;

    group.bench_with_input(BenchmarkId::new("schedules", N), &N, |b, _| {
        b.iter(|| {
            uptime += 1;
            runner.iterate(black_box(&app_states), black_box(uptime), black_box(uptime), black_box(100));
        });
    });
}

fn bench_iterate(c: &mut Criterion) {
    let mut group = c.benchmark_group("iterate_idle_tick");
    group.significance_level(0.01);

    bench_one_size::<4>(&mut group);
    bench_one_size::<16>(&mut group);
    bench_one_size::<64>(&mut group);

    group.finish();
}

criterion_group!(benches, bench_iterate);
criterion_main!(benches);
