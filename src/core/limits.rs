/*!
 * Collection Limits and Constants
 *
 * Centralized location for the pipeline's defaults, thresholds, and naming
 * conventions. Every knob in `CollectorConfig` starts from a value here.
 */

use std::time::Duration;

// =============================================================================
// THREAD-LOCAL BUFFERING
// =============================================================================

/// Events a producer thread accumulates before handing a batch off
pub const LOCAL_BUFFER_CAPACITY: usize = 256;

// =============================================================================
// QUEUES
// =============================================================================

/// Batches buffered between producer threads and the refinery
pub const RAW_QUEUE_CAPACITY: usize = 16;

/// Batches buffered between the refinery and the depository
pub const OUT_QUEUE_CAPACITY: usize = 16;

/// Reclamation batches buffered ahead of the refinery
/// Governs how far the GC signal can drift ahead of refinement
pub const GC_QUEUE_CAPACITY: usize = 16;

/// Slice used when retrying a blocked hand-off
/// A hand-off never gives up; this only bounds each individual wait
pub const HANDOFF_RETRY_SLICE: Duration = Duration::from_millis(100);

// =============================================================================
// REFINERY
// =============================================================================

/// Target number of events the refinery holds back for retroactive filtering
pub const REFINERY_CACHE_SIZE: usize = 65_536;

/// Bounded wait on an empty raw queue so checkpoint timing keeps running
pub const REFINERY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Time before the first checkpoint of a run
pub const CHECKPOINT_INITIAL_DURATION: Duration = Duration::from_secs(1);

/// Time between subsequent checkpoints
pub const CHECKPOINT_DURATION: Duration = Duration::from_secs(3);

/// Events accepted since the last checkpoint that force a new one
pub const CHECKPOINT_EVENT_COUNT: usize = 100_000;

/// Wait between attempts to lock a producer buffer during a forced flush
pub const FORCE_FLUSH_LOCK_SLICE: Duration = Duration::from_millis(5);

// =============================================================================
// OUTPUT
// =============================================================================

/// Default run name, used as output file prefix
pub const DEFAULT_RUN_NAME: &str = "racewatch";

/// Header file suffix
pub const HEADER_SUFFIX: &str = "flh";

/// Completion marker suffix written when a checkpoint file is closed
pub const COMPLETE_SUFFIX: &str = "complete";

/// Multi-stream file suffixes
pub const LOCK_STREAM_SUFFIX: &str = "locks";
pub const ACCESS_STREAM_SUFFIX: &str = "accesses";
pub const OBJECT_STREAM_SUFFIX: &str = "objects";
pub const INDIRECT_STREAM_SUFFIX: &str = "indirect";
pub const OTHER_STREAM_SUFFIX: &str = "other";

/// Buffer size for file and socket writers
pub const OUTPUT_BUFFER_SIZE: usize = 32 * 1024;

/// Persisted format version, bumped whenever `Event` changes shape
pub const FORMAT_VERSION: u32 = 1;
