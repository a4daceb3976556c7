/*!
 * ID Generation
 * Monotonic, never-recycled generators for surrogates and trace nodes
 */

use super::types::{SurrogateId, TraceNodeId};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Generic ID generator interface
pub trait IdGenerator<T> {
    /// Generate next ID
    fn next(&self) -> T;

    /// Last value handed out, or the start value minus one
    fn current(&self) -> T;
}

/// Lock-free atomic counter for hot paths
///
/// Identifiers are never recycled: a surrogate, once issued, names nothing
/// else for the rest of the run.
#[repr(C, align(64))]
pub struct AtomicGenerator<T> {
    counter: Arc<AtomicU64>,
    _marker: PhantomData<T>,
}

impl<T> AtomicGenerator<T> {
    /// Create new generator starting at given value
    #[inline]
    pub fn new(start: u64) -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(start)),
            _marker: PhantomData,
        }
    }

    /// Create new generator starting at 1
    #[inline]
    pub fn default_start() -> Self {
        Self::new(1)
    }

    #[inline]
    fn bump(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    fn last(&self) -> u64 {
        self.counter.load(Ordering::Relaxed).saturating_sub(1)
    }
}

impl<T> Clone for AtomicGenerator<T> {
    fn clone(&self) -> Self {
        Self {
            counter: Arc::clone(&self.counter),
            _marker: PhantomData,
        }
    }
}

impl IdGenerator<SurrogateId> for AtomicGenerator<SurrogateId> {
    #[inline]
    fn next(&self) -> SurrogateId {
        SurrogateId(self.bump())
    }

    #[inline]
    fn current(&self) -> SurrogateId {
        SurrogateId(self.last())
    }
}

impl IdGenerator<TraceNodeId> for AtomicGenerator<TraceNodeId> {
    #[inline]
    fn next(&self) -> TraceNodeId {
        TraceNodeId(self.bump())
    }

    #[inline]
    fn current(&self) -> TraceNodeId {
        TraceNodeId(self.last())
    }
}
