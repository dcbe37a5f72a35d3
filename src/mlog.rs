//! Mlog manager (spec.md §4.3). Same state-machine shape as
//! `mblock.rs`, generalized to the append/read-cursor/erase/generation
//! lifecycle and the record-boundary constraints of an append log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use mpool_backend::{Backend, MediaClass, MlogProperties, ObjectId, RecordKind};

use crate::config::MdcOpenFlags;
use crate::error::{Error, Origin, Result};
use crate::registry::{self, ObjectKind, Registry};

/// Per-record framing overhead charged by the reference backend; mirrors
/// `mpool_backend::mem`'s own accounting so `Mlog::usage`/`len` agree
/// with what the backend reports.
pub(crate) const FRAME_OVERHEAD: u64 = 8;

/// A handle to a single mlog, with a local read cursor (spec.md §4.3
/// Read-init/Read-next/Seek-read-next).
pub struct MlogHandle {
    id: ObjectId,
    registry: Arc<Registry>,
    backend: Arc<dyn Backend>,
    handle: registry::Handle,
    committed: AtomicBool,
    read_only: bool,
    cursor: Mutex<u64>,
}

impl MlogHandle {
    pub(crate) fn allocate(
        registry: Arc<Registry>,
        backend: Arc<dyn Backend>,
        capacity_target: u64,
        media_class: MediaClass,
    ) -> Result<(MlogHandle, MlogProperties)> {
        let props = backend
            .mlog_alloc(capacity_target, media_class)
            .map_err(|e| Error::from_backend(Origin::Mlog, e))?;
        registry.insert(props.id, ObjectKind::Mlog)?;
        let handle = registry.find_get(props.id, ObjectKind::Mlog)?;
        debug!("mlog {}: allocated (capacity_target={})", props.id, capacity_target);
        Ok((
            MlogHandle {
                id: props.id,
                registry,
                backend,
                handle,
                committed: AtomicBool::new(false),
                read_only: false,
                cursor: Mutex::new(0),
            },
            props,
        ))
    }

    /// Re-acquires a handle to an already-committed mlog, e.g. when an
    /// MDC opens its two constituent mlogs by ID (spec.md §4.3 Open).
    pub(crate) fn open_existing(
        registry: Arc<Registry>,
        backend: Arc<dyn Backend>,
        id: ObjectId,
    ) -> Result<MlogHandle> {
        let handle = registry.find_get(id, ObjectKind::Mlog)?;
        Ok(MlogHandle {
            id,
            registry,
            backend,
            handle,
            committed: AtomicBool::new(true),
            read_only: false,
            cursor: Mutex::new(0),
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Close (spec.md §4.3): drains buffered appends and releases the
    /// in-process reference. Unlike `delete`, the backend object is
    /// left intact and may be reopened later by ID; the read cursor is
    /// undefined afterward (the handle is gone).
    pub fn close(self) -> Result<()> {
        self.backend.mlog_flush(self.id).map_err(|e| Error::from_backend(Origin::Mlog, e))?;
        let MlogHandle { registry, handle, .. } = self;
        registry.put(handle);
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        if self.committed.swap(true, Ordering::SeqCst) {
            return Err(Error::invalid_state(Origin::Mlog, "mlog already committed"));
        }
        if let Err(e) = self.backend.mlog_commit(self.id) {
            self.committed.store(false, Ordering::SeqCst);
            return Err(Error::from_backend(Origin::Mlog, e));
        }
        debug!("mlog {}: committed", self.id);
        Ok(())
    }

    pub fn abort(self) -> Result<()> {
        if self.committed.load(Ordering::SeqCst) {
            return Err(Error::invalid_state(Origin::Mlog, "cannot abort a committed mlog"));
        }
        let MlogHandle { id, registry, backend, handle, .. } = self;
        if let Err(e) = backend.mlog_abort(id) {
            registry.put(handle);
            return Err(Error::from_backend(Origin::Mlog, e));
        }
        registry.put(handle);
        registry.remove(id)?;
        Ok(())
    }

    pub fn delete(self) -> Result<()> {
        if !self.committed.load(Ordering::SeqCst) {
            return Err(Error::invalid_state(Origin::Mlog, "cannot delete an uncommitted mlog"));
        }
        let MlogHandle { id, registry, backend, handle, .. } = self;
        if let Err(e) = backend.mlog_delete(id) {
            registry.put(handle);
            return Err(Error::from_backend(Origin::Mlog, e));
        }
        registry.put(handle);
        registry.remove(id)?;
        Ok(())
    }

    /// Open (spec.md §4.3): applies the open flags and returns the
    /// current generation.
    pub(crate) fn apply_open_flags(&mut self, flags: MdcOpenFlags) -> Result<u64> {
        self.read_only = flags.contains(MdcOpenFlags::READ_ONLY);
        self.generation()
    }

    pub fn generation(&self) -> Result<u64> {
        self.backend.mlog_generation(self.id).map_err(|e| Error::from_backend(Origin::Mlog, e))
    }

    fn append_record(&self, kind: RecordKind, data: &[u8], sync: bool) -> Result<u64> {
        if self.read_only {
            return Err(Error::invalid_state(Origin::Mlog, "mlog opened read-only"));
        }
        let index = self.backend.mlog_append(self.id, kind, data).map_err(|e| Error::from_backend(Origin::Mlog, e))?;
        if sync {
            self.backend.mlog_flush(self.id).map_err(|e| Error::from_backend(Origin::Mlog, e))?;
        }
        Ok(index)
    }

    pub fn append(&self, data: &[u8], sync: bool) -> Result<()> {
        self.append_record(RecordKind::User, data, sync)?;
        Ok(())
    }

    /// Append-vector (spec.md §4.3): gathers multiple buffers into a
    /// single record.
    pub fn append_vector(&self, iov: &[&[u8]], sync: bool) -> Result<()> {
        let mut buf = Vec::with_capacity(iov.iter().map(|b| b.len()).sum());
        for chunk in iov {
            buf.extend_from_slice(chunk);
        }
        self.append(&buf, sync)
    }

    pub(crate) fn append_marker(&self, kind: RecordKind) -> Result<u64> {
        self.append_record(kind, &[], true)
    }

    pub fn read_init(&self) {
        *self.cursor.lock().unwrap() = 0;
    }

    /// Read-next (spec.md §4.3). On a too-small buffer returns
    /// `Overflow` with the required length; the cursor is not advanced.
    pub fn read_next(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cursor = self.cursor.lock().unwrap();
        match self.backend.mlog_read_at(self.id, *cursor).map_err(|e| Error::from_backend(Origin::Mlog, e))? {
            None => Err(Error::not_found(Origin::Mlog, "end of mlog")),
            Some((_, data)) => {
                if data.len() > buf.len() {
                    return Err(Error::overflow(Origin::Mlog, data.len()));
                }
                buf[..data.len()].copy_from_slice(&data);
                *cursor += 1;
                Ok(data.len())
            }
        }
    }

    /// Seek-read-next (spec.md §4.3): `skip` must land exactly on a
    /// record boundary counted in framed bytes from the current cursor.
    pub fn seek_read_next(&self, skip: u64, buf: &mut [u8]) -> Result<usize> {
        let count = self.backend.mlog_record_count(self.id).map_err(|e| Error::from_backend(Origin::Mlog, e))?;
        let mut remaining = skip;
        let mut idx = *self.cursor.lock().unwrap();
        while remaining > 0 {
            if idx >= count {
                return Err(Error::invalid_argument(Origin::Mlog, "skip runs past end of mlog"));
            }
            let (_, data) =
                self.backend.mlog_read_at(self.id, idx).map_err(|e| Error::from_backend(Origin::Mlog, e))?.unwrap();
            let framed = data.len() as u64 + FRAME_OVERHEAD;
            if framed > remaining {
                return Err(Error::invalid_argument(Origin::Mlog, "skip does not land on a record boundary"));
            }
            remaining -= framed;
            idx += 1;
        }
        *self.cursor.lock().unwrap() = idx;
        self.read_next(buf)
    }

    pub fn flush(&self) -> Result<()> {
        self.backend.mlog_flush(self.id).map_err(|e| Error::from_backend(Origin::Mlog, e))
    }

    pub fn len(&self) -> Result<u64> {
        self.backend.mlog_len(self.id).map_err(|e| Error::from_backend(Origin::Mlog, e))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Erase (spec.md §4.3): new generation is `max(current+1, min_gen)`.
    pub fn erase(&self, min_gen: u64) -> Result<u64> {
        let gen = self.backend.mlog_erase(self.id, min_gen).map_err(|e| Error::from_backend(Origin::Mlog, e))?;
        *self.cursor.lock().unwrap() = 0;
        debug!("mlog {}: erased, generation now {}", self.id, gen);
        Ok(gen)
    }

    pub(crate) fn record_count(&self) -> Result<u64> {
        self.backend.mlog_record_count(self.id).map_err(|e| Error::from_backend(Origin::Mlog, e))
    }

    pub(crate) fn read_record_at(&self, index: u64) -> Result<Option<(RecordKind, Vec<u8>)>> {
        self.backend.mlog_read_at(self.id, index).map_err(|e| Error::from_backend(Origin::Mlog, e))
    }

    pub(crate) fn set_cursor(&self, index: u64) {
        *self.cursor.lock().unwrap() = index;
    }
}
