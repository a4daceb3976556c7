/*!
 * Collector
 * Producer-facing entry point and pipeline lifecycle
 *
 * Every observation call is fire and forget: it returns `()`, never panics
 * on pipeline failure, and only blocks when the raw queue is full. Each
 * calling thread is registered on first use with its own buffer and trace
 * arena, kept in thread-local storage keyed by collector.
 */

use super::buffer::{BufferRegistry, HandOffError, LocalBuffer};
use super::queue::{self, BatchSender};
use crate::config::CollectorConfig;
use crate::core::errors::{CollectorError, Result};
use crate::core::id::AtomicGenerator;
use crate::core::types::{FieldId, SiteId, SurrogateId, TraceNodeId};
use crate::definitions::{DefinitionSource, NoDefinitions, SiteCatalog};
use crate::depository::Depository;
use crate::events::{
    EdgeRole, Event, EventKind, FieldAccess, HappensBeforeEdge, LockEvent, LockFlavor, LockPhase,
    TraceArena,
};
use crate::monitoring::{MetricsSnapshot, PipelineMetrics};
use crate::output::{build_strategy, OutputStrategy};
use crate::refinery::{Refinery, RefineryChannels};
use crate::surrogate::{ObjectRef, SurrogateRegistry};
use ahash::RandomState;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

static NEXT_COLLECTOR: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static PRODUCERS: RefCell<HashMap<u64, ProducerThread, RandomState>> =
        RefCell::new(HashMap::with_hasher(RandomState::new()));
}

/// A producer thread's private state for one collector
struct ProducerThread {
    thread: SurrogateId,
    buffer: Arc<LocalBuffer>,
    trace: TraceArena,
    /// Dropped with the thread-local map; the refinery then reaps the buffer
    _alive: Arc<()>,
}

struct Workers {
    refinery: JoinHandle<()>,
    depository: JoinHandle<()>,
}

pub struct Collector {
    id: u64,
    config: CollectorConfig,
    registry: SurrogateRegistry,
    buffers: Arc<BufferRegistry>,
    raw: BatchSender<Event>,
    metrics: Arc<PipelineMetrics>,
    trace_ids: AtomicGenerator<TraceNodeId>,
    closed: AtomicBool,
    workers: Mutex<Option<Workers>>,
}

impl Collector {
    /// Start collection with the output and definitions `config` describes
    pub fn start(config: CollectorConfig) -> Result<Self> {
        config.validate()?;
        let definitions: Box<dyn DefinitionSource> =
            if config.sites_file.is_some() || config.fields_file.is_some() {
                Box::new(SiteCatalog::load(
                    config.sites_file.as_deref(),
                    config.fields_file.as_deref(),
                )?)
            } else {
                Box::new(NoDefinitions)
            };
        let strategy = build_strategy(&config)?;
        Self::start_with(config, strategy, definitions)
    }

    /// Start collection into a caller-supplied strategy
    pub fn start_with(
        config: CollectorConfig,
        strategy: Box<dyn OutputStrategy>,
        definitions: Box<dyn DefinitionSource>,
    ) -> Result<Self> {
        config.validate()?;

        let (raw, raw_rx) = queue::bounded(config.raw_queue_capacity);
        let (out, out_rx) = queue::bounded(config.out_queue_capacity);
        let (gc, gc_rx) = queue::bounded(config.gc_queue_capacity);
        let metrics = Arc::new(PipelineMetrics::new());
        let buffers = Arc::new(BufferRegistry::new());

        let refinery = Refinery::new(
            &config,
            RefineryChannels {
                raw: raw_rx,
                gc: gc_rx,
                out,
            },
            Arc::clone(&buffers),
            definitions,
            Arc::clone(&metrics),
        );
        let depository = Depository::new(out_rx, strategy, Arc::clone(&metrics));

        let depository = thread::Builder::new()
            .name("racewatch-depository".into())
            .spawn(move || depository.run())
            .map_err(|err| CollectorError::Internal(format!("cannot spawn depository: {err}")))?;
        let refinery = thread::Builder::new()
            .name("racewatch-refinery".into())
            .spawn(move || refinery.run())
            .map_err(|err| CollectorError::Internal(format!("cannot spawn refinery: {err}")))?;

        info!(
            run = %config.run_name,
            dir = %config.output_dir.display(),
            output = ?config.output.kind,
            "collection started"
        );

        Ok(Self {
            id: NEXT_COLLECTOR.fetch_add(1, Ordering::Relaxed),
            config,
            registry: SurrogateRegistry::new(gc),
            buffers,
            raw,
            metrics,
            trace_ids: AtomicGenerator::default_start(),
            closed: AtomicBool::new(false),
            workers: Mutex::new(Some(Workers {
                refinery,
                depository,
            })),
        })
    }

    // =========================================================================
    // Field and object observations
    // =========================================================================

    pub fn field_read(&self, site: SiteId, field: FieldId, receiver: Option<&ObjectRef>) {
        self.field_access(false, site, field, receiver, false);
    }

    pub fn field_write(&self, site: SiteId, field: FieldId, receiver: Option<&ObjectRef>) {
        self.field_access(true, site, field, receiver, false);
    }

    /// Field access with every detail spelled out
    ///
    /// `receiver` is `None` for static fields. `under_construction` marks
    /// accesses made while the receiver's constructor is still running.
    pub fn field_access(
        &self,
        write: bool,
        site: SiteId,
        field: FieldId,
        receiver: Option<&ObjectRef>,
        under_construction: bool,
    ) {
        self.record(|registry, producer, kinds| {
            let receiver = receiver.map(|object| registry.id_for(object, kinds));
            let access = FieldAccess {
                field,
                receiver,
                site,
                thread: producer.thread,
                trace: producer.trace.current(),
                under_construction,
            };
            kinds.push(if write {
                EventKind::FieldWrite(access)
            } else {
                EventKind::FieldRead(access)
            });
        });
    }

    /// Access to an object's state through a library call
    pub fn indirect_access(&self, site: SiteId, receiver: &ObjectRef) {
        self.record(|registry, producer, kinds| {
            let receiver = registry.id_for(receiver, kinds);
            kinds.push(EventKind::IndirectAccess {
                receiver,
                site,
                thread: producer.thread,
                trace: producer.trace.current(),
            });
        });
    }

    /// Make sure `object` has a surrogate, defining it if new
    pub fn object_defined(&self, object: &ObjectRef) {
        self.record(|registry, _, kinds| {
            registry.id_for(object, kinds);
        });
    }

    // =========================================================================
    // Locks
    // =========================================================================

    pub fn before_lock_acquire(&self, site: SiteId, lock: &ObjectRef, flavor: LockFlavor) {
        self.lock_event(LockPhase::BeforeAcquire, site, lock, flavor, true);
    }

    pub fn after_lock_acquire(&self, site: SiteId, lock: &ObjectRef, flavor: LockFlavor, success: bool) {
        self.lock_event(LockPhase::AfterAcquire, site, lock, flavor, success);
    }

    pub fn after_lock_release(&self, site: SiteId, lock: &ObjectRef, flavor: LockFlavor, success: bool) {
        self.lock_event(LockPhase::AfterRelease, site, lock, flavor, success);
    }

    /// Entering (`before`) or leaving a condition wait on `lock`
    pub fn lock_wait(&self, site: SiteId, lock: &ObjectRef, before: bool) {
        let phase = if before {
            LockPhase::BeforeWait
        } else {
            LockPhase::AfterWait
        };
        let flavor = LockFlavor::Intrinsic {
            lock_is_this: false,
            lock_is_class: false,
        };
        self.lock_event(phase, site, lock, flavor, true);
    }

    fn lock_event(
        &self,
        phase: LockPhase,
        site: SiteId,
        lock: &ObjectRef,
        flavor: LockFlavor,
        success: bool,
    ) {
        self.record(|registry, producer, kinds| {
            let lock = registry.id_for(lock, kinds);
            kinds.push(EventKind::Lock(LockEvent {
                phase,
                flavor,
                lock,
                site,
                thread: producer.thread,
                trace: producer.trace.current(),
                success,
            }));
        });
    }

    /// Describe a read/write lock pair; only the first call per lock is kept
    pub fn read_write_lock_defined(
        &self,
        lock: &ObjectRef,
        read_lock: &ObjectRef,
        write_lock: &ObjectRef,
    ) {
        self.record(|registry, _, kinds| {
            let lock = registry.id_for(lock, kinds);
            if registry.first_rw_lock_definition(lock) {
                let read_lock = registry.id_for(read_lock, kinds);
                let write_lock = registry.id_for(write_lock, kinds);
                kinds.push(EventKind::ReadWriteLockDefinition {
                    lock,
                    read_lock,
                    write_lock,
                });
            }
        });
    }

    // =========================================================================
    // Call traces
    // =========================================================================

    pub fn push_trace(&self, site: SiteId) {
        let ids = &self.trace_ids;
        self.record(|_, producer, kinds| {
            let entered = producer.trace.push(site, ids);
            if entered.created {
                kinds.push(EventKind::TraceNode {
                    id: entered.node,
                    parent: entered.parent,
                    site,
                    thread: producer.thread,
                });
            }
        });
    }

    /// Leave `site`; a site that is not on the stack counts as a problem
    pub fn pop_trace(&self, site: SiteId) {
        let metrics = &self.metrics;
        self.record(|_, producer, _| {
            if let Err(unbalanced) = producer.trace.pop(site) {
                debug!(
                    site = %unbalanced.site,
                    depth = unbalanced.depth,
                    thread = %producer.thread,
                    "unbalanced trace pop"
                );
                metrics.problem();
            }
        });
    }

    // =========================================================================
    // Happens-before edges
    // =========================================================================

    /// Thread start/join style edge with another thread
    pub fn happens_before_thread(&self, site: SiteId, target: &ObjectRef, role: EdgeRole) {
        self.record(|registry, producer, kinds| {
            let target = registry.id_for(target, kinds);
            kinds.push(Self::edge(HappensBeforeEdge::Thread { target }, role, site, producer));
        });
    }

    /// Edge through a synchronizing object (latch, future, barrier)
    pub fn happens_before_object(&self, site: SiteId, object: &ObjectRef, role: EdgeRole) {
        self.record(|registry, producer, kinds| {
            let object = registry.id_for(object, kinds);
            kinds.push(Self::edge(HappensBeforeEdge::Object { object }, role, site, producer));
        });
    }

    /// Edge through an item handed over by a concurrent collection
    pub fn happens_before_collection(
        &self,
        site: SiteId,
        collection: &ObjectRef,
        item: &ObjectRef,
        role: EdgeRole,
    ) {
        self.record(|registry, producer, kinds| {
            let collection = registry.id_for(collection, kinds);
            let item = registry.id_for(item, kinds);
            kinds.push(Self::edge(
                HappensBeforeEdge::Collection { collection, item },
                role,
                site,
                producer,
            ));
        });
    }

    fn edge(
        edge: HappensBeforeEdge,
        role: EdgeRole,
        site: SiteId,
        producer: &ProducerThread,
    ) -> EventKind {
        EventKind::HappensBefore {
            edge,
            role,
            site,
            thread: producer.thread,
            trace: producer.trace.current(),
        }
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    /// Run `build` against the calling thread's state and append its events
    fn record<F>(&self, build: F)
    where
        F: FnOnce(&SurrogateRegistry, &mut ProducerThread, &mut Vec<EventKind>),
    {
        if self.closed.load(Ordering::Acquire) {
            self.metrics.add_dropped_after_shutdown(1);
            let _ = PRODUCERS.try_with(|producers| producers.borrow_mut().remove(&self.id));
            return;
        }

        let outcome = PRODUCERS.try_with(|producers| {
            let mut producers = producers.borrow_mut();
            let mut kinds = Vec::new();
            if !producers.contains_key(&self.id) {
                // Forget collectors that shut down since this thread last used them
                producers.retain(|_, producer| !producer.buffer.is_sealed());
            }
            let producer = producers
                .entry(self.id)
                .or_insert_with(|| self.register_thread(&mut kinds));
            build(&self.registry, producer, &mut kinds);
            if kinds.is_empty() {
                return Ok(0);
            }
            let appended = producer.buffer.append(kinds, &self.raw);
            if matches!(appended, Err(HandOffError::Sealed(_))) {
                producers.remove(&self.id);
            }
            appended
        });

        match outcome {
            Ok(Ok(appended)) => self.metrics.add_emitted(appended as u64),
            Ok(Err(HandOffError::Sealed(dropped))) => {
                self.metrics.add_dropped_after_shutdown(dropped as u64)
            }
            Ok(Err(HandOffError::Disconnected(lost))) => {
                warn!(lost = lost.len(), "refinery is gone, batch dropped");
                self.metrics.problem();
            }
            Err(_) => {
                debug!("observation during thread teardown ignored");
                self.metrics.problem();
            }
        }
    }

    fn register_thread(&self, kinds: &mut Vec<EventKind>) -> ProducerThread {
        let current = thread::current();
        let name = current
            .name()
            .map(str::to_owned)
            .unwrap_or_else(|| format!("{:?}", current.id()));
        let surrogate = self.registry.thread_id(&name, kinds);

        let buffer = Arc::new(LocalBuffer::new(self.config.local_buffer_capacity));
        let alive = Arc::new(());
        self.buffers
            .register(surrogate, Arc::clone(&buffer), Arc::downgrade(&alive));
        debug!(thread = %surrogate, name = %name, "producer thread registered");

        ProducerThread {
            thread: surrogate,
            buffer,
            trace: TraceArena::new(),
            _alive: alive,
        }
    }

    /// Hand the calling thread's buffered events off now
    pub fn flush_thread(&self) {
        let outcome = PRODUCERS.try_with(|producers| {
            producers
                .borrow()
                .get(&self.id)
                .map(|producer| producer.buffer.hand_off(&self.raw))
        });
        if let Ok(Some(Err(HandOffError::Disconnected(lost)))) = outcome {
            warn!(lost = lost.len(), "refinery is gone, batch dropped");
            self.metrics.problem();
        }
    }

    /// Surrogate of the calling thread, once it has emitted anything
    pub fn current_thread(&self) -> Option<SurrogateId> {
        PRODUCERS
            .try_with(|producers| producers.borrow().get(&self.id).map(|p| p.thread))
            .ok()
            .flatten()
    }

    /// Report reclaimed objects (external liveness oracle)
    pub fn on_reclaimed(&self, ids: Vec<SurrogateId>) {
        self.registry.on_reclaimed(ids);
    }

    /// Report every weakly tracked object that has been dropped
    pub fn sweep(&self) -> usize {
        self.registry.sweep()
    }

    pub fn registry(&self) -> &SurrogateRegistry {
        &self.registry
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drain everything to the output and stop both workers
    ///
    /// Events recorded before this call are all written; later calls are
    /// counted as dropped. Calling it again is a no-op.
    pub fn shutdown(&self) -> Result<MetricsSnapshot> {
        let Some(workers) = self.workers.lock().take() else {
            return Ok(self.metrics());
        };
        self.closed.store(true, Ordering::Release);

        if self.raw.put(vec![Event::final_sentinel()]).is_err() {
            warn!("refinery exited before shutdown");
        }
        workers
            .refinery
            .join()
            .map_err(|_| CollectorError::Shutdown("refinery thread panicked".into()))?;
        workers
            .depository
            .join()
            .map_err(|_| CollectorError::Shutdown("depository thread panicked".into()))?;

        let snapshot = self.metrics();
        info!(
            emitted = snapshot.events_emitted,
            output = snapshot.events_output,
            filtered = snapshot.events_filtered,
            problems = snapshot.problems,
            "collection shut down"
        );
        Ok(snapshot)
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        if self.workers.get_mut().is_some() {
            if let Err(err) = self.shutdown() {
                error!(%err, "shutdown on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::MemoryOutput;
    use std::time::Duration;

    fn start() -> (Collector, MemoryOutput) {
        let output = MemoryOutput::new();
        let config = CollectorConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_local_buffer_capacity(4)
            .with_filtering(false)
            .without_checkpoints();
        let collector =
            Collector::start_with(config, Box::new(output.clone()), Box::new(NoDefinitions)).unwrap();
        (collector, output)
    }

    #[test]
    fn test_thread_registered_on_first_event() {
        let (collector, output) = start();
        assert_eq!(collector.current_thread(), None);

        collector.field_write(SiteId(1), FieldId(1), None);
        let thread = collector.current_thread().unwrap();
        collector.shutdown().unwrap();

        let events = output.events();
        let defined = events.iter().any(|e| {
            matches!(&e.kind, EventKind::ThreadDefinition { id, .. } if *id == thread)
        });
        assert!(defined);
        let write = events.iter().find_map(Event::field_access).unwrap();
        assert_eq!(write.thread, thread);
    }

    #[test]
    fn test_calls_after_shutdown_are_dropped() {
        let (collector, output) = start();
        collector.field_read(SiteId(1), FieldId(1), None);
        collector.shutdown().unwrap();
        let written = output.len();

        collector.field_read(SiteId(1), FieldId(1), None);
        collector.push_trace(SiteId(2));
        assert_eq!(output.len(), written);
        assert_eq!(collector.metrics().events_dropped_after_shutdown, 2);
        assert!(collector.shutdown().is_ok());
    }

    #[test]
    fn test_thread_state_released_after_shutdown() {
        let (collector, _output) = start();
        collector.field_write(SiteId(1), FieldId(1), None);
        assert!(collector.current_thread().is_some());
        collector.shutdown().unwrap();

        collector.field_write(SiteId(2), FieldId(1), None);
        assert_eq!(collector.current_thread(), None);
    }

    #[test]
    fn test_sealed_collectors_forgotten_on_registration() {
        let (first, _first_output) = start();
        first.field_write(SiteId(1), FieldId(1), None);
        first.shutdown().unwrap();
        assert!(first.current_thread().is_some());

        let (second, _second_output) = start();
        second.field_write(SiteId(1), FieldId(1), None);
        assert!(second.current_thread().is_some());
        assert_eq!(first.current_thread(), None);
        second.shutdown().unwrap();
    }

    #[test]
    fn test_trace_nodes_emitted_once() {
        let (collector, output) = start();
        for _ in 0..3 {
            collector.push_trace(SiteId(10));
            collector.field_read(SiteId(11), FieldId(1), None);
            collector.pop_trace(SiteId(10));
        }
        collector.pop_trace(SiteId(99));
        let snapshot = collector.shutdown().unwrap();

        let events = output.events();
        let nodes: Vec<TraceNodeId> = events
            .iter()
            .filter_map(|e| match e.kind {
                EventKind::TraceNode { id, .. } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(nodes.len(), 1);
        assert!(events
            .iter()
            .filter_map(Event::field_access)
            .all(|a| a.trace == nodes[0]));
        assert_eq!(snapshot.problems, 1);
    }

    #[test]
    fn test_rw_lock_defined_once() {
        let (collector, output) = start();
        let lock = ObjectRef::new(1, "RwLock");
        let read = ObjectRef::new(2, "ReadGuard");
        let write = ObjectRef::new(3, "WriteGuard");
        collector.read_write_lock_defined(&lock, &read, &write);
        collector.read_write_lock_defined(&lock, &read, &write);
        collector.shutdown().unwrap();

        let definitions = output
            .events()
            .iter()
            .filter(|e| matches!(e.kind, EventKind::ReadWriteLockDefinition { .. }))
            .count();
        assert_eq!(definitions, 1);
    }

    #[test]
    fn test_drop_shuts_down() {
        let (collector, output) = start();
        collector.indirect_access(SiteId(1), &ObjectRef::new(5, "Vec"));
        drop(collector);
        assert!(output.is_closed());
        assert!(output.events().last().unwrap().is_final());
    }
}
