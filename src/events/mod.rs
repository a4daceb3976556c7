/*!
 * Event Model
 * Immutable, strongly-typed observations flowing through the pipeline
 *
 * Every event carries a monotonic timestamp. Per-thread observations also
 * carry the emitting thread's surrogate and its current trace node.
 */

pub mod trace;

use crate::core::types::{now_ns, wall_clock_ms, FieldId, SiteId, SurrogateId, TraceNodeId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use trace::TraceArena;

/// One observation, owned by exactly one batch at a time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic timestamp (nanoseconds since process clock start)
    pub nanos: u64,
    pub kind: EventKind,
}

/// Event payload - one variant per observable kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // Administrative
    Time {
        wall_clock_ms: i64,
    },
    Checkpoint,
    Final,

    // Definitions
    ClassDefinition {
        id: SurrogateId,
        name: Arc<str>,
    },
    ObjectDefinition {
        id: SurrogateId,
        class: SurrogateId,
    },
    ThreadDefinition {
        id: SurrogateId,
        class: SurrogateId,
        name: Arc<str>,
    },
    FieldDefinition {
        field: FieldId,
        declaring_class: SurrogateId,
        name: Arc<str>,
        is_static: bool,
        modifiers: u32,
    },
    StaticCallLocation {
        site: SiteId,
        declaring_class: SurrogateId,
        member: Arc<str>,
        line: u32,
        file: Arc<str>,
    },
    ReadWriteLockDefinition {
        lock: SurrogateId,
        read_lock: SurrogateId,
        write_lock: SurrogateId,
    },
    TraceNode {
        id: TraceNodeId,
        parent: TraceNodeId,
        site: SiteId,
        thread: SurrogateId,
    },

    // Observations
    FieldRead(FieldAccess),
    FieldWrite(FieldAccess),
    IndirectAccess {
        receiver: SurrogateId,
        site: SiteId,
        thread: SurrogateId,
        trace: TraceNodeId,
    },
    Lock(LockEvent),
    HappensBefore {
        edge: HappensBeforeEdge,
        role: EdgeRole,
        site: SiteId,
        thread: SurrogateId,
        trace: TraceNodeId,
    },

    // Refinery annotations
    SingleThreadedField {
        field: FieldId,
        receiver: Option<SurrogateId>,
    },
    GarbageCollected {
        object: SurrogateId,
    },
}

/// A read or write of a static (`receiver == None`) or instance field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldAccess {
    pub field: FieldId,
    pub receiver: Option<SurrogateId>,
    pub site: SiteId,
    pub thread: SurrogateId,
    pub trace: TraceNodeId,
    #[serde(default)]
    pub under_construction: bool,
}

impl FieldAccess {
    /// Key the confinement table and filter use for this access
    #[inline]
    pub fn key(&self) -> FieldKey {
        FieldKey {
            field: self.field,
            receiver: self.receiver,
        }
    }
}

/// A field, optionally qualified by the object it lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldKey {
    pub field: FieldId,
    pub receiver: Option<SurrogateId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPhase {
    BeforeAcquire,
    AfterAcquire,
    AfterRelease,
    BeforeWait,
    AfterWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockFlavor {
    /// Monitor-style lock built into the object
    Intrinsic {
        lock_is_this: bool,
        lock_is_class: bool,
    },
    /// Explicit lock object
    UtilConcurrent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEvent {
    pub phase: LockPhase,
    pub flavor: LockFlavor,
    pub lock: SurrogateId,
    pub site: SiteId,
    pub thread: SurrogateId,
    pub trace: TraceNodeId,
    /// Whether the acquire/release attempt succeeded
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HappensBeforeEdge {
    Thread {
        target: SurrogateId,
    },
    Object {
        object: SurrogateId,
    },
    Collection {
        collection: SurrogateId,
        item: SurrogateId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeRole {
    Source,
    Target,
}

/// Output stream an event is routed to when streams are split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Category {
    /// Lock events and reclamation notices
    Lock,
    /// Field reads and writes
    Access,
    /// Class, object and thread definitions
    Object,
    /// Indirect accesses
    Indirect,
    /// Everything else
    Other,
    /// Delivered to every stream (time, checkpoint, final)
    Broadcast,
}

impl Event {
    /// Create an event stamped with the current monotonic time
    #[inline]
    pub fn new(kind: EventKind) -> Self {
        Self {
            nanos: now_ns(),
            kind,
        }
    }

    /// Create an event with an explicit timestamp
    #[inline]
    pub fn at(nanos: u64, kind: EventKind) -> Self {
        Self { nanos, kind }
    }

    /// Wall-clock marker event
    pub fn time() -> Self {
        Self::new(EventKind::Time {
            wall_clock_ms: wall_clock_ms(),
        })
    }

    pub fn checkpoint(cut_nanos: u64) -> Self {
        Self::at(cut_nanos, EventKind::Checkpoint)
    }

    /// Terminal sentinel with a fresh timestamp
    pub fn final_sentinel() -> Self {
        Self::new(EventKind::Final)
    }

    #[inline]
    pub fn is_final(&self) -> bool {
        matches!(self.kind, EventKind::Final)
    }

    #[inline]
    pub fn is_checkpoint(&self) -> bool {
        matches!(self.kind, EventKind::Checkpoint)
    }

    /// Field access payload, if this is a read or write
    #[inline]
    pub fn field_access(&self) -> Option<&FieldAccess> {
        match &self.kind {
            EventKind::FieldRead(access) | EventKind::FieldWrite(access) => Some(access),
            _ => None,
        }
    }

    /// Emitting thread for per-thread observations
    pub fn thread(&self) -> Option<SurrogateId> {
        match &self.kind {
            EventKind::FieldRead(a) | EventKind::FieldWrite(a) => Some(a.thread),
            EventKind::IndirectAccess { thread, .. }
            | EventKind::HappensBefore { thread, .. }
            | EventKind::TraceNode { thread, .. } => Some(*thread),
            EventKind::Lock(lock) => Some(lock.thread),
            _ => None,
        }
    }

    pub fn category(&self) -> Category {
        match &self.kind {
            EventKind::Time { .. } | EventKind::Checkpoint | EventKind::Final => {
                Category::Broadcast
            }
            EventKind::Lock(_) | EventKind::GarbageCollected { .. } => Category::Lock,
            EventKind::FieldRead(_) | EventKind::FieldWrite(_) => Category::Access,
            EventKind::ClassDefinition { .. }
            | EventKind::ObjectDefinition { .. }
            | EventKind::ThreadDefinition { .. } => Category::Object,
            EventKind::IndirectAccess { .. } => Category::Indirect,
            EventKind::FieldDefinition { .. }
            | EventKind::StaticCallLocation { .. }
            | EventKind::ReadWriteLockDefinition { .. }
            | EventKind::TraceNode { .. }
            | EventKind::HappensBefore { .. }
            | EventKind::SingleThreadedField { .. } => Category::Other,
        }
    }
}
