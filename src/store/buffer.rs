/*!
 * Thread-Local Buffers
 * Per-thread event accumulation and the registry the refinery flushes through
 *
 * # Locking
 *
 * A buffer's lock is only ever contended by the refinery. The owning thread
 * stamps events and, when the buffer fills, hands the batch to the raw queue
 * while still holding its lock, so no other batch of the same thread can
 * overtake it.
 *
 * The refinery locks the registry first and then buffers in registration
 * order. When a buffer's lock is busy its owner may be blocked on a full raw
 * queue, so the refinery drains the queue between attempts.
 */

use crate::core::limits::FORCE_FLUSH_LOCK_SLICE;
use crate::core::types::{now_ns, SurrogateId};
use crate::events::{Event, EventKind};
use crate::store::queue::{BatchReceiver, BatchSender};
use parking_lot::{Mutex, MutexGuard};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Why a batch did not reach the raw queue
#[derive(Debug, PartialEq)]
pub enum HandOffError {
    /// Collection has shut down; this many events were discarded
    Sealed(usize),
    /// The refinery is gone and the batch could not be delivered
    Disconnected(Vec<Event>),
}

#[derive(Default)]
struct Slot {
    events: Vec<Event>,
    sealed: bool,
}

/// Events appended by one producer thread since its last hand-off
pub struct LocalBuffer {
    slot: Mutex<Slot>,
    capacity: usize,
}

impl LocalBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            slot: Mutex::new(Slot {
                events: Vec::with_capacity(capacity),
                sealed: false,
            }),
            capacity,
        }
    }

    /// Stamp and append events, handing the batch off once full
    ///
    /// Timestamps are read under the buffer lock, so every event in the
    /// buffer predates any cut the refinery takes while holding it.
    pub fn append<I>(&self, kinds: I, raw: &BatchSender<Event>) -> Result<usize, HandOffError>
    where
        I: IntoIterator<Item = EventKind>,
    {
        let mut slot = self.slot.lock();
        if slot.sealed {
            return Err(HandOffError::Sealed(kinds.into_iter().count()));
        }

        let before = slot.events.len();
        for kind in kinds {
            slot.events.push(Event::at(now_ns(), kind));
        }
        let appended = slot.events.len() - before;

        if slot.events.len() >= self.capacity {
            Self::hand_off_locked(&mut slot, self.capacity, raw)?;
        }
        Ok(appended)
    }

    /// Hand off whatever is buffered, returning the batch size
    pub fn hand_off(&self, raw: &BatchSender<Event>) -> Result<usize, HandOffError> {
        let mut slot = self.slot.lock();
        Self::hand_off_locked(&mut slot, self.capacity, raw)
    }

    fn hand_off_locked(
        slot: &mut MutexGuard<'_, Slot>,
        capacity: usize,
        raw: &BatchSender<Event>,
    ) -> Result<usize, HandOffError> {
        if slot.events.is_empty() {
            return Ok(0);
        }
        let batch = std::mem::replace(&mut slot.events, Vec::with_capacity(capacity));
        let len = batch.len();
        raw.put(batch).map_err(HandOffError::Disconnected)?;
        Ok(len)
    }

    /// Remove everything buffered without handing it off
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut self.slot.lock().events)
    }

    /// Refuse all further events
    pub fn seal(&self) {
        self.slot.lock().sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.slot.lock().sealed
    }

    pub fn len(&self) -> usize {
        self.slot.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().events.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

struct Registered {
    thread: SurrogateId,
    buffer: Arc<LocalBuffer>,
    /// Dies with the owning thread's local state
    alive: Weak<()>,
}

/// Result of a forced flush
#[derive(Debug, Default)]
pub struct Flush {
    /// Raw-queue batches first, then buffer contents in registration order
    pub events: Vec<Event>,
    /// Monotonic time at which every buffer was held
    pub cut: u64,
}

#[derive(Default)]
struct Entries {
    list: Vec<Registered>,
    sealed: bool,
}

/// Weakly-held registry of every producer buffer, in registration order
#[derive(Default)]
pub struct BufferRegistry {
    entries: Mutex<Entries>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a thread's buffer; it stays registered until the thread exits
    /// and the refinery reaps it
    ///
    /// Buffers registered after the registry is sealed start out sealed.
    pub fn register(&self, thread: SurrogateId, buffer: Arc<LocalBuffer>, alive: Weak<()>) {
        let mut entries = self.entries.lock();
        if entries.sealed {
            buffer.seal();
        }
        entries.list.push(Registered {
            thread,
            buffer,
            alive,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().list.is_empty()
    }

    /// Drain every buffer and the raw queue into one combined batch
    pub fn force_flush(&self, raw: &BatchReceiver<Event>) -> Flush {
        self.flush_all(raw, false)
    }

    /// Final forced flush: every buffer, present and future, refuses events
    /// once it returns
    pub fn seal(&self, raw: &BatchReceiver<Event>) -> Flush {
        self.flush_all(raw, true)
    }

    fn flush_all(&self, raw: &BatchReceiver<Event>, seal: bool) -> Flush {
        let mut entries = self.entries.lock();
        entries.sealed |= seal;
        let mut pending: Vec<Vec<Event>> = Vec::new();
        let mut held = Vec::with_capacity(entries.list.len());

        for entry in entries.list.iter() {
            loop {
                if let Some(guard) = entry.buffer.slot.try_lock_for(FORCE_FLUSH_LOCK_SLICE) {
                    held.push(guard);
                    break;
                }
                raw.drain_into(&mut pending);
            }
        }

        let cut = now_ns();
        // Nothing can enter the raw queue while every buffer is held
        raw.drain_into(&mut pending);

        let buffered: usize = held.iter().map(|guard| guard.events.len()).sum();
        let mut events: Vec<Event> = Vec::with_capacity(
            pending.iter().map(Vec::len).sum::<usize>() + buffered,
        );
        for batch in pending {
            events.extend(batch);
        }
        for guard in held.iter_mut() {
            events.append(&mut guard.events);
            guard.sealed |= seal;
        }
        drop(held);

        Flush { events, cut }
    }

    /// Collect the leftovers of exited threads and deregister them
    ///
    /// The raw queue is drained into `intake` before the leftovers are
    /// appended, so each exited thread's final batches keep their order.
    pub fn reap_exited(&self, raw: &BatchReceiver<Event>, intake: &mut Vec<Vec<Event>>) -> usize {
        let mut entries = self.entries.lock();
        if !entries.list.iter().any(|e| e.alive.strong_count() == 0) {
            return 0;
        }

        raw.drain_into(intake);

        let mut reaped = 0;
        entries.list.retain(|entry| {
            if entry.alive.strong_count() > 0 {
                return true;
            }
            let leftovers = entry.buffer.take();
            debug!(thread = %entry.thread, leftovers = leftovers.len(), "reaped exited thread");
            if !leftovers.is_empty() {
                intake.push(leftovers);
            }
            reaped += 1;
            false
        });
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FieldId, SiteId, TraceNodeId};
    use crate::events::FieldAccess;
    use crate::store::queue::bounded;
    use std::thread;

    fn access(thread: u64, field: u32) -> EventKind {
        EventKind::FieldWrite(FieldAccess {
            field: FieldId(field),
            receiver: None,
            site: SiteId(1),
            thread: SurrogateId(thread),
            trace: TraceNodeId::ROOT,
            under_construction: false,
        })
    }

    #[test]
    fn test_append_hands_off_when_full() {
        let (tx, rx) = bounded(4);
        let buffer = LocalBuffer::new(3);

        buffer.append([access(1, 1), access(1, 2)], &tx).unwrap();
        assert!(rx.is_empty());
        buffer.append([access(1, 3)], &tx).unwrap();

        let batch = rx.try_take().unwrap();
        assert_eq!(batch.len(), 3);
        assert!(buffer.is_empty());
        assert!(batch.windows(2).all(|w| w[0].nanos <= w[1].nanos));
    }

    #[test]
    fn test_hand_off_empty_is_noop() {
        let (tx, rx) = bounded(1);
        let buffer = LocalBuffer::new(8);
        assert_eq!(buffer.hand_off(&tx), Ok(0));
        assert!(rx.is_empty());
    }

    #[test]
    fn test_sealed_buffer_refuses_events() {
        let (tx, rx) = bounded(4);
        let registry = BufferRegistry::new();
        let alive = Arc::new(());
        let buffer = Arc::new(LocalBuffer::new(8));
        registry.register(SurrogateId(1), Arc::clone(&buffer), Arc::downgrade(&alive));
        buffer.append([access(1, 1)], &tx).unwrap();

        let flush = registry.seal(&rx);
        assert_eq!(flush.events.len(), 1);
        assert_eq!(
            buffer.append([access(1, 2), access(1, 3)], &tx),
            Err(HandOffError::Sealed(2))
        );

        let late = Arc::new(LocalBuffer::new(8));
        registry.register(SurrogateId(2), Arc::clone(&late), Arc::downgrade(&alive));
        assert!(late.is_sealed());
    }

    #[test]
    fn test_disconnected_returns_batch() {
        let (tx, rx) = bounded(1);
        drop(rx);
        let buffer = LocalBuffer::new(1);
        match buffer.append([access(1, 1)], &tx) {
            Err(HandOffError::Disconnected(batch)) => assert_eq!(batch.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_force_flush_orders_queue_before_buffers() {
        let (tx, rx) = bounded(8);
        let registry = BufferRegistry::new();
        let alive = Arc::new(());
        let buffer = Arc::new(LocalBuffer::new(2));
        registry.register(SurrogateId(1), Arc::clone(&buffer), Arc::downgrade(&alive));

        buffer.append([access(1, 1), access(1, 2)], &tx).unwrap();
        buffer.append([access(1, 3)], &tx).unwrap();

        let flush = registry.force_flush(&rx);
        let fields: Vec<u32> = flush
            .events
            .iter()
            .map(|e| e.field_access().unwrap().field.0)
            .collect();
        assert_eq!(fields, vec![1, 2, 3]);
        assert!(flush.events.iter().all(|e| e.nanos < flush.cut));
        assert!(rx.is_empty());
    }

    #[test]
    fn test_force_flush_unblocks_producer_on_full_queue() {
        let (tx, rx) = bounded(1);
        let registry = Arc::new(BufferRegistry::new());
        let alive = Arc::new(());
        let buffer = Arc::new(LocalBuffer::new(1));
        registry.register(SurrogateId(1), Arc::clone(&buffer), Arc::downgrade(&alive));

        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for i in 0..50 {
                    buffer.append([access(1, i)], &tx).unwrap();
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < 50 {
            let flush = registry.force_flush(&rx);
            seen.extend(flush.events.iter().map(|e| e.field_access().unwrap().field.0));
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_reap_exited_thread() {
        let (tx, rx) = bounded(8);
        let registry = BufferRegistry::new();
        let alive = Arc::new(());
        let buffer = Arc::new(LocalBuffer::new(2));
        registry.register(SurrogateId(7), Arc::clone(&buffer), Arc::downgrade(&alive));

        buffer.append([access(7, 1), access(7, 2)], &tx).unwrap();
        buffer.append([access(7, 3)], &tx).unwrap();

        let mut intake = Vec::new();
        assert_eq!(registry.reap_exited(&rx, &mut intake), 0);
        assert!(intake.is_empty());

        drop(alive);
        assert_eq!(registry.reap_exited(&rx, &mut intake), 1);
        assert_eq!(intake.len(), 2);
        assert_eq!(intake[0].len(), 2);
        assert_eq!(intake[1].len(), 1);
        assert!(registry.is_empty());
    }
}
