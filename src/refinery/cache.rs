/*!
 * Refinement Cache
 * Window of refined events held back so they can still be deleted
 */

use crate::events::Event;
use std::collections::VecDeque;

/// FIFO of pending events with in-place tombstones
///
/// Purged entries become `None` and are skipped when the cache is drained,
/// so a purge never reorders what remains.
#[derive(Debug)]
pub struct RefinementCache {
    entries: VecDeque<Option<Event>>,
    live: usize,
    target: usize,
}

impl RefinementCache {
    pub fn new(target: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(target.min(1 << 16)),
            live: 0,
            target,
        }
    }

    #[inline]
    pub fn push(&mut self, event: Event) {
        self.entries.push_back(Some(event));
        self.live += 1;
    }

    pub fn extend<I: IntoIterator<Item = Event>>(&mut self, events: I) {
        for event in events {
            self.push(event);
        }
    }

    /// Live (non-purged) events
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Tombstone every live event matching `doomed`, returning how many
    pub fn purge<F>(&mut self, mut doomed: F) -> usize
    where
        F: FnMut(&Event) -> bool,
    {
        let mut purged = 0;
        for slot in self.entries.iter_mut() {
            if slot.as_ref().is_some_and(|event| doomed(event)) {
                *slot = None;
                purged += 1;
            }
        }
        self.live -= purged;
        purged
    }

    /// Oldest events beyond the target size
    pub fn take_overflow(&mut self) -> Vec<Event> {
        let excess = self.live.saturating_sub(self.target);
        let mut out = Vec::with_capacity(excess);
        while out.len() < excess {
            match self.entries.pop_front() {
                Some(Some(event)) => out.push(event),
                Some(None) => {}
                None => break,
            }
        }
        self.live -= out.len();
        out
    }

    /// Everything still live, oldest first
    pub fn take_all(&mut self) -> Vec<Event> {
        let out: Vec<Event> = self.entries.drain(..).flatten().collect();
        self.live = 0;
        out
    }
}
