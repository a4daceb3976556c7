/*!
 * In-Memory Output
 * Keeps the refined stream in a shared vector for embedding and tests
 */

use super::OutputStrategy;
use crate::core::errors::Result;
use crate::events::Event;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Cloned handles share the same storage
#[derive(Clone, Default)]
pub struct MemoryOutput {
    events: Arc<Mutex<Vec<Event>>>,
    flushes: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything received so far
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl OutputStrategy for MemoryOutput {
    fn handle(&mut self, event: &Event) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
