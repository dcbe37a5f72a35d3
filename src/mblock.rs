//! Mblock manager (spec.md §4.2). Grounded on the teacher's
//! `RawTransaction`/`Database` state-machine methods and
//! `TransactionState` enum, generalized to the
//! allocate→write*→commit|abort→delete lifecycle.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use mpool_backend::{Backend, MblockProperties, MediaClass, ObjectId};

use crate::error::{Error, Origin, Result};
use crate::registry::{self, ObjectKind, Registry};

const ASYNC_CHUNK_LIMIT: usize = 1024 * 1024;

/// A handle to a single mblock. Tracks the write offset locally so a
/// partial/failed write can be rejected before it ever reaches the
/// backend (spec.md §4.2 "a failed write leaves the mblock logically
/// empty").
pub struct MblockHandle {
    id: ObjectId,
    registry: Arc<Registry>,
    backend: Arc<dyn Backend>,
    handle: registry::Handle,
    committed: AtomicBool,
    write_offset: AtomicU64,
    write_alignment: u32,
}

impl MblockHandle {
    pub(crate) fn allocate(
        registry: Arc<Registry>,
        backend: Arc<dyn Backend>,
        media_class: MediaClass,
        spare: bool,
    ) -> Result<(MblockHandle, MblockProperties)> {
        let props = backend
            .mblock_alloc(media_class, spare)
            .map_err(|e| Error::from_backend(Origin::Mblock, e))?;
        registry.insert(props.id, ObjectKind::Mblock)?;
        let handle = registry.find_get(props.id, ObjectKind::Mblock)?;
        debug!("mblock {}: allocated ({:?}, spare={})", props.id, media_class, spare);
        Ok((
            MblockHandle {
                id: props.id,
                registry,
                backend,
                handle,
                committed: AtomicBool::new(false),
                write_offset: AtomicU64::new(0),
                write_alignment: props.optimal_write_alignment,
            },
            props,
        ))
    }

    /// Re-acquires a handle to an already-committed mblock by ID, e.g.
    /// when an mcache map resolves its mbidv before mmap.
    pub(crate) fn open_existing(
        registry: Arc<Registry>,
        backend: Arc<dyn Backend>,
        id: ObjectId,
    ) -> Result<MblockHandle> {
        let handle = registry.find_get(id, ObjectKind::Mblock)?;
        let props = match backend.mblock_properties(id) {
            Ok(p) => p,
            Err(e) => {
                registry.put(handle);
                return Err(Error::from_backend(Origin::Mblock, e));
            }
        };
        Ok(MblockHandle {
            id,
            registry,
            backend,
            handle,
            committed: AtomicBool::new(true),
            write_offset: AtomicU64::new(0),
            write_alignment: props.optimal_write_alignment,
        })
    }

    /// Releases the in-process reference without touching the backend
    /// object, mirroring `MlogHandle::close`.
    pub fn close(self) -> Result<()> {
        let MblockHandle { registry, handle, .. } = self;
        registry.put(handle);
        Ok(())
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Write-sync (spec.md §4.2). All-or-nothing: on failure the write
    /// offset is left unchanged.
    pub fn write_sync(&self, data: &[u8]) -> Result<()> {
        if self.committed.load(Ordering::SeqCst) {
            return Err(Error::invalid_state(Origin::Mblock, "mblock is committed, not writable"));
        }
        if data.len() as u64 % self.write_alignment as u64 != 0 {
            return Err(Error::invalid_argument(
                Origin::Mblock,
                format!("write length {} is not a multiple of the optimal write alignment {}", data.len(), self.write_alignment),
            ));
        }
        let offset = self.write_offset.load(Ordering::SeqCst);
        self.backend
            .mblock_write(self.id, offset, data)
            .map_err(|e| Error::from_backend(Origin::Mblock, e))?;
        self.write_offset.fetch_add(data.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    /// Read (spec.md §4.2). `offset` must be page-aligned; enforced by
    /// the backend, which owns the page size.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if !self.committed.load(Ordering::SeqCst) {
            return Err(Error::invalid_state(Origin::Mblock, "mblock is not committed"));
        }
        self.backend.mblock_read(self.id, offset, buf).map_err(|e| Error::from_backend(Origin::Mblock, e))
    }

    pub fn commit(&self) -> Result<()> {
        if self.committed.swap(true, Ordering::SeqCst) {
            return Err(Error::invalid_state(Origin::Mblock, "mblock already committed"));
        }
        if let Err(e) = self.backend.mblock_commit(self.id) {
            self.committed.store(false, Ordering::SeqCst);
            return Err(Error::from_backend(Origin::Mblock, e));
        }
        debug!("mblock {}: committed", self.id);
        Ok(())
    }

    /// Abort (spec.md §4.2). Consumes the handle: an aborted mblock has
    /// no further valid operations.
    pub fn abort(self) -> Result<()> {
        if self.committed.load(Ordering::SeqCst) {
            return Err(Error::invalid_state(Origin::Mblock, "cannot abort a committed mblock"));
        }
        let MblockHandle { id, registry, backend, handle, .. } = self;
        if let Err(e) = backend.mblock_abort(id) {
            registry.put(handle);
            return Err(Error::from_backend(Origin::Mblock, e));
        }
        registry.put(handle);
        registry.remove(id)?;
        debug!("mblock {}: aborted", id);
        Ok(())
    }

    /// Delete (spec.md §4.2). Consumes the handle.
    pub fn delete(self) -> Result<()> {
        if !self.committed.load(Ordering::SeqCst) {
            return Err(Error::invalid_state(Origin::Mblock, "cannot delete an uncommitted mblock"));
        }
        let MblockHandle { id, registry, backend, handle, .. } = self;
        if let Err(e) = backend.mblock_delete(id) {
            registry.put(handle);
            return Err(Error::from_backend(Origin::Mblock, e));
        }
        registry.put(handle);
        registry.remove(id)?;
        debug!("mblock {}: deleted", id);
        Ok(())
    }

    pub fn properties(&self) -> Result<MblockProperties> {
        self.backend.mblock_properties(self.id).map_err(|e| Error::from_backend(Origin::Mblock, e))
    }

    pub(crate) fn pin(&self) -> Result<()> {
        self.backend.mblock_pin(self.id).map_err(|e| Error::from_backend(Origin::Mcache, e))
    }

    pub(crate) fn unpin(&self) -> Result<()> {
        self.backend.mblock_unpin(self.id).map_err(|e| Error::from_backend(Origin::Mcache, e))
    }
}

struct QueuedWrite {
    mblock: ObjectId,
    offset: u64,
    data: Vec<u8>,
}

/// Async-write context (spec.md §4.2). Chunks are validated
/// offset-monotonic per mblock at submit time and issued in FIFO order
/// at `flush`, which establishes the happens-before the spec requires.
///
/// The reference backend has no real asynchronous I/O path, so unlike a
/// driver-backed context this one defers backend calls entirely to
/// `flush` rather than dispatching them to a worker as they are queued;
/// the observable contract (FIFO issue order, first-failure reporting,
/// ctx unusable after flush) is identical either way.
pub struct AsyncWriteContext {
    backend: Arc<dyn Backend>,
    queue: Mutex<VecDeque<QueuedWrite>>,
    next_offset: Mutex<HashMap<ObjectId, u64>>,
    poisoned: AtomicBool,
}

impl AsyncWriteContext {
    pub fn new(backend: Arc<dyn Backend>) -> AsyncWriteContext {
        AsyncWriteContext {
            backend,
            queue: Mutex::new(VecDeque::new()),
            next_offset: Mutex::new(HashMap::new()),
            poisoned: AtomicBool::new(false),
        }
    }

    /// Queues a chunk against `mblock`. Chunks may span distinct
    /// mblocks sharing this context (spec.md §4.2, resolved in
    /// DESIGN.md Open Question 2).
    pub fn submit(&self, mblock: &MblockHandle, offset: u64, data: &[u8]) -> Result<()> {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(Error::invalid_state(Origin::Mblock, "async write context is poisoned, call flush"));
        }
        if data.len() > ASYNC_CHUNK_LIMIT {
            return Err(Error::invalid_argument(Origin::Mblock, "async write chunk exceeds 1 MiB"));
        }
        let mut next_offsets = self.next_offset.lock().unwrap();
        let expected = *next_offsets.get(&mblock.id).unwrap_or(&0);
        if offset != expected {
            return Err(Error::invalid_argument(Origin::Mblock, "async write submissions must be offset-monotonic"));
        }
        next_offsets.insert(mblock.id, offset + data.len() as u64);
        self.queue.lock().unwrap().push_back(QueuedWrite { mblock: mblock.id, offset, data: data.to_vec() });
        Ok(())
    }

    /// Drains the context, issuing every queued chunk in FIFO order.
    /// Reports the first failure, if any; the context is unusable
    /// afterward regardless of outcome.
    pub fn flush(self) -> Result<()> {
        let queue = self.queue.into_inner().unwrap();
        let mut first_error = None;
        for chunk in queue {
            if let Err(e) = self.backend.mblock_write(chunk.mblock, chunk.offset, &chunk.data) {
                let err = Error::from_backend(Origin::Mblock, e);
                warn!("async write context: chunk for mblock {} failed: {}", chunk.mblock, err);
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
