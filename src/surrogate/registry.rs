/*!
 * Surrogate Registry
 * Identity-keyed, read-mostly maps from application objects to surrogate ids
 *
 * Lookups of already-known objects take a shard read lock and nothing else.
 * First sightings append their definition events to the caller's batch, so
 * a definition always travels in the same per-thread stream as, and ahead
 * of, the first event that mentions the new id.
 */

use super::{ClassRef, ObjectRef};
use crate::core::id::{AtomicGenerator, IdGenerator};
use crate::core::types::SurrogateId;
use crate::events::EventKind;
use crate::store::queue::BatchSender;
use ahash::RandomState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::any::Any;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Class name recorded for thread surrogates
const THREAD_CLASS: &str = "std::thread::Thread";

struct Tracked {
    id: SurrogateId,
    liveness: Option<Weak<dyn Any + Send + Sync>>,
}

impl Tracked {
    #[inline]
    fn is_dead(&self) -> bool {
        self.liveness
            .as_ref()
            .is_some_and(|weak| weak.strong_count() == 0)
    }

    /// True when `object` is a new allocation at this entry's identity
    ///
    /// A dead entry reached through a stale ref, or a ref without a probe,
    /// still names the tracked object until the reclamation is reported.
    fn superseded_by(&self, object: &ObjectRef) -> bool {
        if !self.is_dead() {
            return false;
        }
        match (self.liveness.as_ref(), object.liveness()) {
            (Some(tracked), Some(incoming)) => {
                incoming.strong_count() > 0 && !Weak::ptr_eq(tracked, incoming)
            }
            _ => false,
        }
    }
}

pub struct SurrogateRegistry {
    objects: DashMap<u64, Tracked, RandomState>,
    reverse: DashMap<SurrogateId, u64, RandomState>,
    classes: DashMap<Arc<str>, SurrogateId, RandomState>,
    rw_locks: DashMap<SurrogateId, (), RandomState>,
    ids: AtomicGenerator<SurrogateId>,
    gc: BatchSender<SurrogateId>,
}

impl SurrogateRegistry {
    /// Registry reporting reclamations to `gc`
    pub fn new(gc: BatchSender<SurrogateId>) -> Self {
        Self {
            objects: DashMap::with_hasher(RandomState::new()),
            reverse: DashMap::with_hasher(RandomState::new()),
            classes: DashMap::with_hasher(RandomState::new()),
            rw_locks: DashMap::with_hasher(RandomState::new()),
            ids: AtomicGenerator::default_start(),
            gc,
        }
    }

    /// Surrogate for `object`, issuing one on first sight
    ///
    /// New ids push their definitions onto `defs`: the class definition
    /// first if the class is new, then the object definition.
    pub fn id_for(&self, object: &ObjectRef, defs: &mut Vec<EventKind>) -> SurrogateId {
        if let Some(tracked) = self.objects.get(&object.identity()) {
            if !tracked.superseded_by(object) {
                return tracked.id;
            }
        }

        let mut retired = None;
        let id = match self.objects.entry(object.identity()) {
            Entry::Occupied(mut entry) if entry.get().superseded_by(object) => {
                let id = self.define_object(object, defs);
                let old = entry.insert(Tracked {
                    id,
                    liveness: object.liveness().cloned(),
                });
                retired = Some(old.id);
                id
            }
            Entry::Occupied(entry) => entry.get().id,
            Entry::Vacant(entry) => {
                let id = self.define_object(object, defs);
                entry.insert(Tracked {
                    id,
                    liveness: object.liveness().cloned(),
                });
                id
            }
        };
        self.reverse.insert(id, object.identity());

        if let Some(old) = retired {
            trace!(old = %old, new = %id, "identity reused, retiring surrogate");
            self.reverse.remove(&old);
            self.forward(vec![old]);
        }
        id
    }

    fn define_object(&self, object: &ObjectRef, defs: &mut Vec<EventKind>) -> SurrogateId {
        let class = self.class_id(object.class(), defs);
        let id = self.ids.next();
        defs.push(EventKind::ObjectDefinition { id, class });
        id
    }

    /// Surrogate for a class, defined once per name
    pub fn class_id(&self, class: &ClassRef, defs: &mut Vec<EventKind>) -> SurrogateId {
        if let Some(id) = self.classes.get(class.name()) {
            return *id;
        }
        *self
            .classes
            .entry(Arc::clone(class.name()))
            .or_insert_with(|| {
                let id = self.ids.next();
                defs.push(EventKind::ClassDefinition {
                    id,
                    name: Arc::clone(class.name()),
                });
                id
            })
    }

    /// Fresh surrogate for a newly registered thread
    pub fn thread_id(&self, name: &str, defs: &mut Vec<EventKind>) -> SurrogateId {
        let class = self.class_id(&ClassRef::new(THREAD_CLASS), defs);
        let id = self.ids.next();
        defs.push(EventKind::ThreadDefinition {
            id,
            class,
            name: Arc::from(name),
        });
        id
    }

    /// True the first time a read/write lock pair is described
    pub fn first_rw_lock_definition(&self, lock: SurrogateId) -> bool {
        self.rw_locks.insert(lock, ()).is_none()
    }

    /// Report a batch of reclaimed surrogates
    ///
    /// Identity mappings are dropped so a later allocation at the same
    /// identity gets a new id; the batch itself is forwarded unmodified.
    /// Blocks while the reclamation queue is full.
    pub fn on_reclaimed(&self, ids: Vec<SurrogateId>) {
        if ids.is_empty() {
            return;
        }
        for id in &ids {
            if let Some((_, identity)) = self.reverse.remove(id) {
                self.objects.remove_if(&identity, |_, tracked| tracked.id == *id);
            }
        }
        self.forward(ids);
    }

    fn forward(&self, ids: Vec<SurrogateId>) {
        if let Err(lost) = self.gc.put(ids) {
            debug!(count = lost.len(), "refinery gone, reclamation batch discarded");
        }
    }

    /// Report every tracked object whose liveness probe has died
    ///
    /// This is the bundled liveness oracle; hosts call it periodically.
    /// Returns the number of objects reported.
    pub fn sweep(&self) -> usize {
        let dead: Vec<SurrogateId> = self
            .objects
            .iter()
            .filter(|entry| entry.value().is_dead())
            .map(|entry| entry.value().id)
            .collect();
        let count = dead.len();
        if count > 0 {
            debug!(count, "sweep found reclaimed objects");
            self.on_reclaimed(dead);
        }
        count
    }

    /// Number of objects currently mapped
    pub fn tracked(&self) -> usize {
        self.objects.len()
    }

    /// Number of distinct classes seen
    pub fn classes(&self) -> usize {
        self.classes.len()
    }
}
