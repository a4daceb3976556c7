/*!
 * Batch Queues
 * Bounded channels of batches between producers and the two workers
 *
 * The same plumbing carries raw event batches, refined batches, and
 * reclamation batches. `put` never gives up while the receiving side exists:
 * a full queue only ever delays the sender.
 */

use crate::core::limits::HANDOFF_RETRY_SLICE;
use flume::{RecvTimeoutError, SendTimeoutError, TryRecvError};
use std::time::Duration;
use tracing::trace;

/// Sending half of a bounded batch queue
pub struct BatchSender<T> {
    tx: flume::Sender<Vec<T>>,
}

/// Receiving half of a bounded batch queue
pub struct BatchReceiver<T> {
    rx: flume::Receiver<Vec<T>>,
}

/// Outcome of a bounded wait on a queue
#[derive(Debug, PartialEq)]
pub enum Poll<T> {
    Batch(Vec<T>),
    Empty,
    /// Every sender is gone and nothing is left
    Closed,
}

/// Create a queue holding at most `capacity` batches
pub fn bounded<T>(capacity: usize) -> (BatchSender<T>, BatchReceiver<T>) {
    let (tx, rx) = flume::bounded(capacity);
    (BatchSender { tx }, BatchReceiver { rx })
}

impl<T> BatchSender<T> {
    /// Hand a batch off, blocking while the queue is full
    ///
    /// Each wait is sliced so a stalled consumer shows up in traces; the
    /// batch is only handed back if the receiver has been dropped.
    pub fn put(&self, batch: Vec<T>) -> Result<(), Vec<T>> {
        let mut batch = batch;
        loop {
            match self.tx.send_timeout(batch, HANDOFF_RETRY_SLICE) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => {
                    trace!(len = returned.len(), "queue full, retrying hand-off");
                    batch = returned;
                }
                Err(SendTimeoutError::Disconnected(returned)) => return Err(returned),
            }
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_disconnected()
    }
}

impl<T> Clone for BatchSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> BatchReceiver<T> {
    /// Wait up to `timeout` for the next batch
    pub fn poll(&self, timeout: Duration) -> Poll<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(batch) => Poll::Batch(batch),
            Err(RecvTimeoutError::Timeout) => Poll::Empty,
            Err(RecvTimeoutError::Disconnected) => Poll::Closed,
        }
    }

    /// Next batch if one is ready
    #[inline]
    pub fn try_take(&self) -> Option<Vec<T>> {
        match self.rx.try_recv() {
            Ok(batch) => Some(batch),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Block until a batch arrives; `None` once all senders are gone
    pub fn take(&self) -> Option<Vec<T>> {
        self.rx.recv().ok()
    }

    /// Move every ready batch into `into`, returning how many were taken
    pub fn drain_into(&self, into: &mut Vec<Vec<T>>) -> usize {
        let mut taken = 0;
        while let Some(batch) = self.try_take() {
            into.push(batch);
            taken += 1;
        }
        taken
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
