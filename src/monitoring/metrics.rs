/*!
 * Pipeline Metrics
 * Lock-free counters shared by producers and both workers
 *
 * Problems (malformed events, sink failures) are never raised to the
 * application; they are logged and show up here as a growing count.
 */

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counter set for one collection run
///
/// # Performance
/// - Cache-line aligned so the hot producer counter does not false-share
#[repr(C, align(64))]
#[derive(Debug)]
pub struct PipelineMetrics {
    events_emitted: AtomicU64,
    events_dropped_after_shutdown: AtomicU64,
    events_filtered: AtomicU64,
    events_output: AtomicU64,
    batches_raw: AtomicU64,
    batches_out: AtomicU64,
    checkpoints: AtomicU64,
    objects_collected: AtomicU64,
    confined_fields: AtomicU64,
    problems: AtomicU64,
    start_time: Instant,
}

/// Snapshot of all counters at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MetricsSnapshot {
    pub events_emitted: u64,
    pub events_dropped_after_shutdown: u64,
    pub events_filtered: u64,
    pub events_output: u64,
    pub batches_raw: u64,
    pub batches_out: u64,
    pub checkpoints: u64,
    pub objects_collected: u64,
    pub confined_fields: u64,
    pub problems: u64,
    pub uptime_secs: u64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        #[inline]
        pub fn $inc(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }
    };
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            events_emitted: AtomicU64::new(0),
            events_dropped_after_shutdown: AtomicU64::new(0),
            events_filtered: AtomicU64::new(0),
            events_output: AtomicU64::new(0),
            batches_raw: AtomicU64::new(0),
            batches_out: AtomicU64::new(0),
            checkpoints: AtomicU64::new(0),
            objects_collected: AtomicU64::new(0),
            confined_fields: AtomicU64::new(0),
            problems: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    counter!(add_emitted, events_emitted);
    counter!(add_dropped_after_shutdown, events_dropped_after_shutdown);
    counter!(add_filtered, events_filtered);
    counter!(add_output, events_output);
    counter!(add_raw_batches, batches_raw);
    counter!(add_out_batches, batches_out);
    counter!(add_checkpoints, checkpoints);
    counter!(add_objects_collected, objects_collected);
    counter!(add_confined_fields, confined_fields);

    /// Record one problem
    #[inline]
    pub fn problem(&self) {
        self.problems.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn problems(&self) -> u64 {
        self.problems.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            events_dropped_after_shutdown: self
                .events_dropped_after_shutdown
                .load(Ordering::Relaxed),
            events_filtered: self.events_filtered.load(Ordering::Relaxed),
            events_output: self.events_output.load(Ordering::Relaxed),
            batches_raw: self.batches_raw.load(Ordering::Relaxed),
            batches_out: self.batches_out.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            objects_collected: self.objects_collected.load(Ordering::Relaxed),
            confined_fields: self.confined_fields.load(Ordering::Relaxed),
            problems: self.problems.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
