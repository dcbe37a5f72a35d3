//! Object-ID registry (spec.md §4.1). Generalized from the teacher's
//! `Environment::db_cache` — a mutex-guarded name→handle cache — into an
//! ID-keyed descriptor arena with reference counting, per SPEC_FULL.md
//! §9's "arena of typed descriptors ... shared-ownership wrapper"
//! guidance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use mpool_backend::ObjectId;

use crate::error::{Error, Origin, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Mblock,
    Mlog,
}

struct Slot {
    kind: ObjectKind,
    refcount: AtomicU32,
}

/// A reference obtained from `Registry::find_get`. Must be released
/// exactly once, by `Registry::put` (spec.md §3 invariant).
pub struct Handle {
    id: ObjectId,
    kind: ObjectKind,
    slot: Arc<Slot>,
}

impl Handle {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }
}

/// Per-pool mapping from object ID to object descriptor kind, with
/// balanced find_get/put reference counting (spec.md §4.1).
pub struct Registry {
    slots: Mutex<HashMap<ObjectId, Arc<Slot>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry { slots: Mutex::new(HashMap::new()) }
    }

    /// Registers a freshly backend-allocated ID. Fails with
    /// `AlreadyExists` if the backend handed back a colliding ID.
    pub fn insert(&self, id: ObjectId, kind: ObjectKind) -> Result<()> {
        trace!("registry: acquiring lock to insert {:?}", id);
        let mut slots = self.slots.lock().unwrap();
        if slots.contains_key(&id) {
            return Err(Error::new(
                crate::error::ErrorKind::AlreadyExists,
                Origin::Registry,
                0,
                format!("object {} already registered", id),
            ));
        }
        slots.insert(id, Arc::new(Slot { kind, refcount: AtomicU32::new(0) }));
        Ok(())
    }

    /// Resolves an ID without taking a reference (find-without-ref).
    pub fn find(&self, id: ObjectId, expected: ObjectKind) -> Result<()> {
        let slots = self.slots.lock().unwrap();
        match slots.get(&id) {
            Some(slot) if slot.kind == expected => Ok(()),
            Some(_) => Err(Error::invalid_argument(Origin::Registry, format!("object {} is the wrong kind", id))),
            None => Err(Error::not_found(Origin::Registry, format!("object {} not found", id))),
        }
    }

    /// Resolves an ID and takes a reference; the returned `Handle` must
    /// be released with `put`.
    pub fn find_get(&self, id: ObjectId, expected: ObjectKind) -> Result<Handle> {
        trace!("registry: acquiring lock to find_get {:?}", id);
        let slots = self.slots.lock().unwrap();
        match slots.get(&id) {
            Some(slot) if slot.kind == expected => {
                slot.refcount.fetch_add(1, Ordering::SeqCst);
                Ok(Handle { id, kind: expected, slot: slot.clone() })
            }
            Some(_) => Err(Error::invalid_argument(Origin::Registry, format!("object {} is the wrong kind", id))),
            None => Err(Error::not_found(Origin::Registry, format!("object {} not found", id))),
        }
    }

    /// Releases a reference obtained from `find_get`.
    pub fn put(&self, handle: Handle) {
        handle.slot.refcount.fetch_sub(1, Ordering::SeqCst);
    }

    /// Removes the descriptor for `id`. Fails with `Busy` if any
    /// handles are still outstanding.
    pub fn remove(&self, id: ObjectId) -> Result<()> {
        trace!("registry: acquiring lock to remove {:?}", id);
        let mut slots = self.slots.lock().unwrap();
        match slots.get(&id) {
            Some(slot) if slot.refcount.load(Ordering::SeqCst) > 0 => {
                Err(Error::busy(Origin::Registry, format!("object {} has outstanding references", id)))
            }
            Some(_) => {
                slots.remove(&id);
                Ok(())
            }
            None => Err(Error::not_found(Origin::Registry, format!("object {} not found", id))),
        }
    }

    /// Total outstanding references across the registry (spec.md §8
    /// invariant 6: "Σ find_get == Σ put at the moment of close").
    pub fn outstanding_refs(&self) -> u32 {
        self.slots
            .lock()
            .unwrap()
            .values()
            .map(|slot| slot.refcount.load(Ordering::SeqCst))
            .sum()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}
