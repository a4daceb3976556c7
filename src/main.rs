/*!
 * Racewatch - Demo Entry Point
 *
 * Drives the collector with a synthetic multi-threaded workload:
 * - Confined counters each worker owns
 * - One counter shared by every worker under a lock
 * - Short-lived objects reported as reclaimed
 *
 * Configuration comes from RACEWATCH_* environment variables.
 */

use anyhow::Context;
use racewatch::{
    init_tracing, ClassRef, Collector, CollectorConfig, EdgeRole, FieldId, LockFlavor, ObjectRef,
    SiteId,
};
use std::sync::Arc;
use std::thread;
use tracing::info;

const WORKERS: u64 = 4;
const ITERATIONS: u64 = 2_000;

const COUNTER_FIELD: FieldId = FieldId(1);
const SHARED_FIELD: FieldId = FieldId(2);
const SCRATCH_FIELD: FieldId = FieldId(3);

struct Ledger;
struct Counter(#[allow(dead_code)] u64);
struct Scratch;

fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = CollectorConfig::from_env().context("invalid RACEWATCH_* configuration")?;
    info!(run = %config.run_name, dir = %config.output_dir.display(), "racewatch demo starting");

    let collector = Arc::new(Collector::start(config).context("collector failed to start")?);

    let shared = Arc::new(Ledger);
    let shared_ref = ObjectRef::of(&shared);
    let lock = ObjectRef::new(0x10c, ClassRef::new("std::sync::Mutex"));

    let workers: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let collector = Arc::clone(&collector);
            let shared_ref = shared_ref.clone();
            let lock = lock.clone();
            thread::Builder::new()
                .name(format!("worker-{worker}"))
                .spawn(move || run_worker(&collector, worker, &shared_ref, &lock))
        })
        .collect::<std::io::Result<_>>()
        .context("cannot spawn workers")?;

    for (worker, handle) in workers.into_iter().enumerate() {
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("worker {worker} panicked"))?;
        collector.happens_before_thread(
            SiteId(900),
            &ObjectRef::new(worker as u64, ClassRef::new("std::thread::Thread")),
            EdgeRole::Target,
        );
    }

    let snapshot = collector.shutdown()?;
    info!(
        emitted = snapshot.events_emitted,
        output = snapshot.events_output,
        filtered = snapshot.events_filtered,
        confined_fields = snapshot.confined_fields,
        collected = snapshot.objects_collected,
        checkpoints = snapshot.checkpoints,
        "racewatch demo finished"
    );
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn run_worker(collector: &Collector, worker: u64, shared: &ObjectRef, lock: &ObjectRef) {
    let flavor = LockFlavor::UtilConcurrent;
    let counter = Arc::new(Counter(worker));
    let counter_ref = ObjectRef::of(&counter);

    collector.push_trace(SiteId(100));
    for i in 0..ITERATIONS {
        collector.field_read(SiteId(101), COUNTER_FIELD, Some(&counter_ref));
        collector.field_write(SiteId(102), COUNTER_FIELD, Some(&counter_ref));

        if i % 16 == 0 {
            collector.before_lock_acquire(SiteId(110), lock, flavor);
            collector.after_lock_acquire(SiteId(110), lock, flavor, true);
            collector.field_write(SiteId(111), SHARED_FIELD, Some(shared));
            collector.after_lock_release(SiteId(112), lock, flavor, true);
        }

        if i % 128 == 0 {
            let scratch = Arc::new(Scratch);
            let scratch_ref = ObjectRef::of(&scratch);
            collector.field_write(SiteId(120), SCRATCH_FIELD, Some(&scratch_ref));
            drop(scratch);
            collector.sweep();
        }
    }
    collector.pop_trace(SiteId(100));
    collector.flush_thread();
}
