/*!
 * Confinement Table
 * Which thread, if any single one, has touched each field and object
 *
 * Owned by the refinery thread. An owner only ever moves from `Single` to
 * `Shared`; nothing in here is consulted for the batch currently being
 * observed, only when an object's lifetime is known to be over.
 */

use crate::core::types::{FieldId, SurrogateId};
use crate::events::{FieldAccess, FieldKey};
use ahash::RandomState;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Single(SurrogateId),
    Shared,
}

impl Owner {
    #[inline]
    fn observe(&mut self, thread: SurrogateId) {
        if let Owner::Single(owner) = *self {
            if owner != thread {
                *self = Owner::Shared;
            }
        }
    }

    #[inline]
    fn single(self) -> Option<SurrogateId> {
        match self {
            Owner::Single(thread) => Some(thread),
            Owner::Shared => None,
        }
    }
}

/// Fields and objects proven to have been touched by one thread only
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Confined {
    pub fields: Vec<FieldKey>,
    pub objects: Vec<SurrogateId>,
}

impl Confined {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.objects.is_empty()
    }

    pub fn merge(&mut self, other: Confined) {
        self.fields.extend(other.fields);
        self.objects.extend(other.objects);
    }
}

#[derive(Debug, Default)]
pub struct ConfinementTable {
    statics: HashMap<FieldId, Owner, RandomState>,
    instances: HashMap<SurrogateId, HashMap<FieldId, Owner, RandomState>, RandomState>,
    indirect: HashMap<SurrogateId, Owner, RandomState>,
}

impl ConfinementTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a field access
    pub fn observe_field(&mut self, access: &FieldAccess) {
        let owners = match access.receiver {
            None => &mut self.statics,
            Some(receiver) => self.instances.entry(receiver).or_default(),
        };
        owners
            .entry(access.field)
            .and_modify(|owner| owner.observe(access.thread))
            .or_insert(Owner::Single(access.thread));
    }

    /// Record an indirect access through `receiver`
    pub fn observe_indirect(&mut self, receiver: SurrogateId, thread: SurrogateId) {
        self.indirect
            .entry(receiver)
            .and_modify(|owner| owner.observe(thread))
            .or_insert(Owner::Single(thread));
    }

    pub fn owner(&self, key: &FieldKey) -> Option<Owner> {
        match key.receiver {
            None => self.statics.get(&key.field).copied(),
            Some(receiver) => self
                .instances
                .get(&receiver)
                .and_then(|fields| fields.get(&key.field))
                .copied(),
        }
    }

    pub fn indirect_owner(&self, receiver: SurrogateId) -> Option<Owner> {
        self.indirect.get(&receiver).copied()
    }

    /// Close out a reclaimed object's lifetime
    ///
    /// Its entries are removed; whatever was still single-owner is returned.
    pub fn reclaim(&mut self, object: SurrogateId) -> Confined {
        let mut confined = Confined::default();
        if let Some(fields) = self.instances.remove(&object) {
            confined.fields.extend(
                fields
                    .into_iter()
                    .filter(|(_, owner)| owner.single().is_some())
                    .map(|(field, _)| FieldKey {
                        field,
                        receiver: Some(object),
                    }),
            );
        }
        if let Some(owner) = self.indirect.remove(&object) {
            if owner.single().is_some() {
                confined.objects.push(object);
            }
        }
        confined
    }

    /// Close out every remaining lifetime at the end of the run
    pub fn drain_confined(&mut self) -> Confined {
        let mut confined = Confined::default();
        confined.fields.extend(
            self.statics
                .drain()
                .filter(|(_, owner)| owner.single().is_some())
                .map(|(field, _)| FieldKey {
                    field,
                    receiver: None,
                }),
        );
        let receivers: Vec<SurrogateId> = self
            .instances
            .keys()
            .chain(self.indirect.keys())
            .copied()
            .collect();
        for receiver in receivers {
            confined.merge(self.reclaim(receiver));
        }
        confined
    }

    /// Number of tracked fields and objects
    pub fn len(&self) -> usize {
        self.statics.len()
            + self.instances.values().map(HashMap::len).sum::<usize>()
            + self.indirect.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
