/*!
 * Output Tests
 * File-based strategies driven through a running collector
 */

use racewatch::core::limits::HEADER_SUFFIX;
use racewatch::{
    read_events, CheckpointConfig, Collector, CollectorConfig, Event, EventKind, FieldId,
    OutputFormat, OutputKind, RunHeader, SiteId,
};
use std::path::Path;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn config(dir: &Path, kind: OutputKind, format: OutputFormat) -> CollectorConfig {
    CollectorConfig::default()
        .with_run_name("run")
        .with_output_dir(dir)
        .with_output(kind, format)
        .with_poll_interval(Duration::from_millis(10))
        .with_filtering(false)
        .without_checkpoints()
}

fn emit(collector: &Collector, count: u64) {
    for i in 0..count {
        collector.field_write(SiteId(i), FieldId(1), None);
    }
}

#[test]
fn test_single_stream_binary() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path(), OutputKind::Single, OutputFormat::Binary);
    let header_path = config.run_file(HEADER_SUFFIX);
    let data_path = config.run_file("flb");

    let collector = Collector::start(config).unwrap();
    emit(&collector, 500);
    collector.shutdown().unwrap();

    let header = RunHeader::read(&header_path).unwrap();
    assert_eq!(header.run, "run");
    assert_eq!(header.output, OutputKind::Single);

    let events = read_events(&data_path, OutputFormat::Binary).unwrap();
    assert!(matches!(events[0].kind, EventKind::Time { .. }));
    assert_eq!(events.iter().filter_map(Event::field_access).count(), 500);
    assert!(events.last().unwrap().is_final());
}

#[test]
fn test_checkpointing_rotates_files() {
    let dir = TempDir::new().unwrap();
    let checkpoint = CheckpointConfig {
        enabled: true,
        initial_duration: Duration::from_millis(20),
        duration: Duration::from_millis(20),
        event_count: 100_000,
    };
    let config = config(dir.path(), OutputKind::Checkpointing, OutputFormat::JsonLines)
        .with_checkpoints(checkpoint);

    let collector = Collector::start(config).unwrap();
    emit(&collector, 100);
    collector.flush_thread();
    thread::sleep(Duration::from_millis(150));
    emit(&collector, 100);
    let snapshot = collector.shutdown().unwrap();
    assert!(snapshot.checkpoints >= 1);

    let first = dir.path().join("run.000000.fl");
    let marker = dir.path().join("run.000000.complete");
    let events = read_events(&first, OutputFormat::JsonLines).unwrap();
    assert!(events.last().unwrap().is_final());
    assert!(events[events.len() - 2].is_checkpoint());

    let text = std::fs::read_to_string(marker).unwrap();
    assert!(text.ends_with(" ns"));
    assert_eq!(
        text.trim_end_matches(" ns").parse::<u64>().unwrap(),
        events[events.len() - 2].nanos
    );

    // Every file ends with the sentinel and all writes are present once
    let mut writes = 0;
    for index in 0..=snapshot.checkpoints {
        let path = dir.path().join(format!("run.{index:06}.fl"));
        let events = read_events(&path, OutputFormat::JsonLines).unwrap();
        assert!(events.last().unwrap().is_final());
        writes += events.iter().filter_map(Event::field_access).count();
    }
    assert_eq!(writes, 200);
}

#[test]
fn test_multi_stream_routes_by_category() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path(), OutputKind::MultiStream, OutputFormat::JsonLines);

    let collector = Collector::start(config).unwrap();
    emit(&collector, 10);
    collector.shutdown().unwrap();

    let read = |name: &str| read_events(&dir.path().join(format!("run.{name}.fl")), OutputFormat::JsonLines).unwrap();
    let accesses = read("accesses");
    assert_eq!(accesses.iter().filter_map(Event::field_access).count(), 10);

    let objects = read("objects");
    assert!(objects
        .iter()
        .any(|e| matches!(e.kind, EventKind::ThreadDefinition { .. })));
    assert!(objects.iter().all(|e| e.field_access().is_none()));

    for name in ["locks", "accesses", "objects", "indirect", "other"] {
        let events = read(name);
        assert!(events.last().unwrap().is_final(), "{name}");
    }
}

#[test]
fn test_unwritable_output_dir_fails_start() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let config = config(&blocker.join("out"), OutputKind::Single, OutputFormat::JsonLines);
    assert!(Collector::start(config).is_err());
}
