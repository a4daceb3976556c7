/*!
 * Pipeline Benchmarks
 *
 * Producer-side cost of recording events, and encoding cost per format
 */

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use racewatch::output::EventEncoder;
use racewatch::{
    Collector, CollectorConfig, Event, EventKind, FieldAccess, FieldId, MemoryOutput,
    NoDefinitions, ObjectRef, OutputFormat, SiteId, SurrogateId, TraceNodeId,
};
use std::io;
use std::thread;

fn collector(filter: bool) -> Collector {
    let config = CollectorConfig::default()
        .with_filtering(filter)
        .without_checkpoints();
    Collector::start_with(config, Box::new(MemoryOutput::new()), Box::new(NoDefinitions))
        .expect("collector starts")
}

fn bench_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("record");
    group.throughput(Throughput::Elements(1));

    let collector = collector(true);
    let object = ObjectRef::new(1, "bench.Object");

    group.bench_function("static_write", |b| {
        b.iter(|| collector.field_write(black_box(SiteId(1)), FieldId(1), None))
    });
    group.bench_function("instance_write", |b| {
        b.iter(|| collector.field_write(black_box(SiteId(2)), FieldId(2), Some(&object)))
    });
    group.finish();
    collector.shutdown().ok();
}

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_record");

    for threads in [1usize, 2, 4, 8] {
        let per_thread = 10_000u64;
        group.throughput(Throughput::Elements(per_thread * threads as u64));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                let collector = collector(false);
                thread::scope(|scope| {
                    for t in 0..threads {
                        let collector = &collector;
                        scope.spawn(move || {
                            for i in 0..per_thread {
                                collector.field_write(SiteId(i), FieldId(t as u32), None);
                            }
                        });
                    }
                });
                collector.shutdown().ok();
            });
        });
    }
    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    let event = Event::new(EventKind::FieldWrite(FieldAccess {
        field: FieldId(3),
        receiver: Some(SurrogateId(42)),
        site: SiteId(7),
        thread: SurrogateId(1),
        trace: TraceNodeId(9),
        under_construction: false,
    }));

    for format in [OutputFormat::JsonLines, OutputFormat::Binary] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{:?}", format)),
            &format,
            |b, &format| {
                let mut encoder = EventEncoder::new(io::sink(), format);
                b.iter(|| encoder.encode(black_box(&event)).ok());
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_record, bench_contended, bench_encode);
criterion_main!(benches);
