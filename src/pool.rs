//! Pool handle (spec.md §3 "Pool handle", §5 "exclusive vs shared
//! mode"). Grounded on the teacher's `Environment`: an `Arc`-shared
//! handle wrapping a single connection, with `EnvBuilder`-style
//! construction replaced by `PoolConfig` (see `config.rs`).
//!
//! §9's "no process-wide mutable singletons beyond the backend-client
//! connection, which itself should be a reference-counted resource"
//! is implemented literally: there is no global table of open pools.
//! `PoolClient` is that one reference-counted resource — callers create
//! it once per backend connection and open named pools through it, the
//! same way the teacher's `Environment` owns its `db_cache` rather than
//! keying off a process-global.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use mpool_backend::{Backend, MediaClass, ObjectId};

use crate::config::{MdcOpenFlags, PoolConfig, PoolOpenFlags};
use crate::error::{Error, Origin, Result};
use crate::mblock::{AsyncWriteContext, MblockHandle};
use crate::mcache::{Advice, Mcache};
use crate::mdc::Mdc;
use crate::mlog::MlogHandle;
use crate::registry::Registry;

enum OpenMode {
    Exclusive,
    Shared(u32),
}

struct PoolSlot {
    mode: OpenMode,
    registry: Arc<Registry>,
}

/// The reference-counted backend connection pools are opened through
/// (spec.md §9). Cheap to clone; every clone shares the same open-pool
/// bookkeeping.
#[derive(Clone)]
pub struct PoolClient {
    backend: Arc<dyn Backend>,
    pools: Arc<Mutex<HashMap<String, PoolSlot>>>,
}

impl PoolClient {
    pub fn new(backend: Arc<dyn Backend>) -> PoolClient {
        PoolClient { backend, pools: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Open (spec.md §3/§5): exclusive mode causes all subsequent opens
    /// of the same name to fail with `Busy`; shared mode allows
    /// multiple opens but rejects exclusive upgrades.
    pub fn open(&self, name: &str, config: PoolConfig, flags: PoolOpenFlags) -> Result<Pool> {
        let mut pools = self.pools.lock().unwrap();
        let registry = match pools.get_mut(name) {
            Some(slot) => match (&mut slot.mode, flags.contains(PoolOpenFlags::EXCLUSIVE)) {
                (OpenMode::Exclusive, _) => {
                    return Err(Error::busy(Origin::Pool, format!("pool {} is already open exclusively", name)))
                }
                (OpenMode::Shared(_), true) => {
                    return Err(Error::busy(Origin::Pool, format!("pool {} is open shared, cannot upgrade to exclusive", name)))
                }
                (OpenMode::Shared(count), false) => {
                    *count += 1;
                    slot.registry.clone()
                }
            },
            None => {
                let registry = Arc::new(Registry::new());
                let mode = if flags.contains(PoolOpenFlags::EXCLUSIVE) { OpenMode::Exclusive } else { OpenMode::Shared(1) };
                pools.insert(name.to_string(), PoolSlot { mode, registry: registry.clone() });
                registry
            }
        };
        info!("pool {}: opened ({:?})", name, flags);
        Ok(Pool {
            name: name.to_string(),
            client: self.clone(),
            backend: self.backend.clone(),
            registry,
            config,
            flags,
        })
    }

    fn release(&self, name: &str) {
        let mut pools = self.pools.lock().unwrap();
        let done = match pools.get_mut(name) {
            Some(slot) => match &mut slot.mode {
                OpenMode::Exclusive => true,
                OpenMode::Shared(count) => {
                    *count -= 1;
                    *count == 0
                }
            },
            None => false,
        };
        if done {
            pools.remove(name);
        }
    }
}

/// A caller-held reference to an open pool (spec.md §3 "Pool handle").
pub struct Pool {
    name: String,
    client: PoolClient,
    backend: Arc<dyn Backend>,
    registry: Arc<Registry>,
    config: PoolConfig,
    flags: PoolOpenFlags,
}

impl Pool {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn check_writable(&self) -> Result<()> {
        if self.flags.contains(PoolOpenFlags::READ_ONLY) {
            return Err(Error::invalid_state(Origin::Pool, "pool was opened read-only"));
        }
        Ok(())
    }

    /// Close (spec.md §3): fails with `Busy` if any object handles
    /// issued from this pool's registry are still outstanding (spec.md
    /// §8 invariant 6).
    pub fn close(self) -> Result<()> {
        let outstanding = self.registry.outstanding_refs();
        if outstanding > 0 {
            return Err(Error::busy(
                Origin::Pool,
                format!("pool {} has {} outstanding object references", self.name, outstanding),
            ));
        }
        self.client.release(&self.name);
        info!("pool {}: closed", self.name);
        Ok(())
    }

    // -- mblock --

    pub fn mblock_alloc(&self, media_class: MediaClass, spare: bool) -> Result<MblockHandle> {
        self.check_writable()?;
        let (handle, _props) = MblockHandle::allocate(self.registry.clone(), self.backend.clone(), media_class, spare)?;
        Ok(handle)
    }

    pub fn mblock_open(&self, id: ObjectId) -> Result<MblockHandle> {
        MblockHandle::open_existing(self.registry.clone(), self.backend.clone(), id)
    }

    pub fn async_write_context(&self) -> AsyncWriteContext {
        AsyncWriteContext::new(self.backend.clone())
    }

    // -- mlog --

    pub fn mlog_alloc(&self, capacity_target: u64, media_class: MediaClass) -> Result<MlogHandle> {
        self.check_writable()?;
        let (handle, _props) = MlogHandle::allocate(self.registry.clone(), self.backend.clone(), capacity_target, media_class)?;
        Ok(handle)
    }

    /// Open (spec.md §4.3): re-acquires a handle to an already-committed
    /// mlog by ID, mirroring `mblock_open`.
    pub fn mlog_open(&self, id: ObjectId) -> Result<MlogHandle> {
        MlogHandle::open_existing(self.registry.clone(), self.backend.clone(), id)
    }

    // -- mdc --

    pub fn mdc_alloc(&self, media_class: MediaClass, capacity: u64) -> Result<(ObjectId, ObjectId)> {
        self.check_writable()?;
        Mdc::alloc(&self.registry, self.backend.as_ref(), media_class, capacity)
    }

    pub fn mdc_commit(&self, id1: ObjectId, id2: ObjectId) -> Result<()> {
        self.check_writable()?;
        Mdc::commit(&self.registry, self.backend.as_ref(), id1, id2)
    }

    pub fn mdc_destroy(&self, id1: ObjectId, id2: ObjectId) -> Result<()> {
        self.check_writable()?;
        Mdc::destroy(&self.registry, self.backend.as_ref(), id1, id2)
    }

    pub fn mdc_open(&self, id1: ObjectId, id2: ObjectId, flags: MdcOpenFlags) -> Result<Mdc> {
        Mdc::open(self.registry.clone(), self.backend.clone(), id1, id2, flags)
    }

    // -- mcache --

    pub fn mcache_mmap(&self, mbidv: &[ObjectId], advice: Advice) -> Result<Mcache> {
        Mcache::mmap(&self.registry, self.backend.clone(), mbidv, advice)
    }
}
