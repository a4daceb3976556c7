/*!
 * Racewatch Library
 * Runtime event collection for data-race detection
 *
 * Producer threads record observations into private buffers. A refinery
 * worker windows them, cuts consistent checkpoints and drops accesses to
 * provably confined state. A depository worker hands the refined stream to
 * a pluggable output strategy.
 */

pub mod config;
pub mod core;
pub mod definitions;
pub mod depository;
pub mod events;
pub mod monitoring;
pub mod output;
pub mod refinery;
pub mod store;
pub mod surrogate;

// Re-exports
pub use crate::config::{CheckpointConfig, CollectorConfig, OutputConfig, OutputFormat, OutputKind};
pub use crate::core::errors::{CollectorError, Result};
pub use crate::core::types::{FieldId, SiteId, SurrogateId, TraceNodeId};
pub use definitions::{DefinitionSource, NoDefinitions, SiteCatalog};
pub use events::{
    Category, EdgeRole, Event, EventKind, FieldAccess, FieldKey, HappensBeforeEdge, LockEvent,
    LockFlavor, LockPhase,
};
pub use monitoring::{init_tracing, MetricsSnapshot};
pub use output::{read_events, MemoryOutput, OutputStrategy, RunHeader};
pub use store::Collector;
pub use surrogate::{ClassRef, ObjectRef};
