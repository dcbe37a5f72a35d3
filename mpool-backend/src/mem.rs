//! In-memory reference `Backend`. Used by the engine's own test suite and
//! as a template for a real driver binding: every method does in plain
//! Rust data structures what a driver would do over ioctl against a
//! block device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::{
    Backend, BackendError, BackendErrorKind, BackendResult, MblockProperties, MediaClass,
    MlogProperties, ObjectId, RecordKind,
};

const DEFAULT_PAGE_SIZE: u32 = 4096;
const DEFAULT_ALIGNMENT: u32 = 4096;

fn not_found(id: ObjectId) -> BackendError {
    BackendError::new(BackendErrorKind::NotFound, 0, format!("object {} not found", id))
}

struct MblockEntry {
    media_class: MediaClass,
    capacity: u64,
    data: Vec<u8>,
    write_len: u64,
    committed: bool,
    pin_count: u32,
}

struct MlogEntry {
    media_class: MediaClass,
    capacity_target: u64,
    generation: u64,
    committed: bool,
    records: Vec<(RecordKind, Vec<u8>)>,
}

enum Object {
    Mblock(MblockEntry),
    Mlog(MlogEntry),
}

/// An in-memory stand-in for a block-device backend.
///
/// `extent_capacity` sizes every mblock it allocates; there is no
/// per-call capacity parameter in the contract (the backend is the sole
/// authority on extent sizing), so a fixed value is configured once at
/// construction.
pub struct MemBackend {
    extent_capacity: u64,
    next_id: AtomicU64,
    objects: Mutex<HashMap<ObjectId, Object>>,
}

impl MemBackend {
    pub fn new(extent_capacity: u64) -> Self {
        MemBackend {
            extent_capacity,
            next_id: AtomicU64::new(1),
            objects: Mutex::new(HashMap::new()),
        }
    }

    fn alloc_id(&self) -> ObjectId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MemBackend {
    fn default() -> Self {
        MemBackend::new(8 * 1024 * 1024)
    }
}

impl Backend for MemBackend {
    fn mblock_alloc(&self, media_class: MediaClass, _spare: bool) -> BackendResult<MblockProperties> {
        let id = self.alloc_id();
        let entry = MblockEntry {
            media_class,
            capacity: self.extent_capacity,
            data: Vec::new(),
            write_len: 0,
            committed: false,
            pin_count: 0,
        };
        let props = MblockProperties {
            id,
            media_class,
            capacity: entry.capacity,
            write_len: 0,
            committed: false,
            optimal_write_alignment: DEFAULT_ALIGNMENT,
            page_size: DEFAULT_PAGE_SIZE,
        };
        self.objects.lock().unwrap().insert(id, Object::Mblock(entry));
        Ok(props)
    }

    fn mblock_write(&self, id: ObjectId, offset: u64, data: &[u8]) -> BackendResult<()> {
        let mut objects = self.objects.lock().unwrap();
        let entry = match objects.get_mut(&id) {
            Some(Object::Mblock(e)) => e,
            Some(Object::Mlog(_)) => return Err(BackendError::new(BackendErrorKind::InvalidArgument, 0, "not an mblock")),
            None => return Err(not_found(id)),
        };
        if entry.committed {
            return Err(BackendError::new(BackendErrorKind::InvalidState, 0, "mblock already committed"));
        }
        if offset != entry.write_len {
            return Err(BackendError::new(
                BackendErrorKind::InvalidArgument,
                0,
                "write offset is not the current write offset",
            ));
        }
        if offset + data.len() as u64 > entry.capacity {
            return Err(BackendError::new(BackendErrorKind::NoSpace, 0, "write exceeds extent capacity"));
        }
        if data.len() as u64 % DEFAULT_ALIGNMENT as u64 != 0 {
            return Err(BackendError::new(
                BackendErrorKind::InvalidArgument,
                0,
                "write length is not a multiple of the optimal write alignment",
            ));
        }
        entry.data.extend_from_slice(data);
        entry.write_len += data.len() as u64;
        Ok(())
    }

    fn mblock_read(&self, id: ObjectId, offset: u64, buf: &mut [u8]) -> BackendResult<usize> {
        let objects = self.objects.lock().unwrap();
        let entry = match objects.get(&id) {
            Some(Object::Mblock(e)) => e,
            Some(Object::Mlog(_)) => return Err(BackendError::new(BackendErrorKind::InvalidArgument, 0, "not an mblock")),
            None => return Err(not_found(id)),
        };
        if !entry.committed {
            return Err(BackendError::new(BackendErrorKind::InvalidState, 0, "mblock not committed"));
        }
        if offset % DEFAULT_PAGE_SIZE as u64 != 0 {
            return Err(BackendError::new(BackendErrorKind::InvalidArgument, 0, "read offset not page-aligned"));
        }
        if offset > entry.write_len {
            return Err(BackendError::new(BackendErrorKind::OutOfRange, 0, "read offset beyond mblock end"));
        }
        let available = (entry.write_len - offset) as usize;
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&entry.data[offset as usize..offset as usize + n]);
        Ok(n)
    }

    fn mblock_commit(&self, id: ObjectId) -> BackendResult<()> {
        let mut objects = self.objects.lock().unwrap();
        match objects.get_mut(&id) {
            Some(Object::Mblock(e)) if e.committed => {
                Err(BackendError::new(BackendErrorKind::InvalidState, 0, "mblock already committed"))
            }
            Some(Object::Mblock(e)) => {
                e.committed = true;
                Ok(())
            }
            Some(Object::Mlog(_)) => Err(BackendError::new(BackendErrorKind::InvalidArgument, 0, "not an mblock")),
            None => Err(not_found(id)),
        }
    }

    fn mblock_abort(&self, id: ObjectId) -> BackendResult<()> {
        let mut objects = self.objects.lock().unwrap();
        match objects.get(&id) {
            Some(Object::Mblock(e)) if e.committed => {
                return Err(BackendError::new(BackendErrorKind::InvalidState, 0, "cannot abort a committed mblock"))
            }
            Some(Object::Mblock(_)) => {}
            Some(Object::Mlog(_)) => return Err(BackendError::new(BackendErrorKind::InvalidArgument, 0, "not an mblock")),
            None => return Err(not_found(id)),
        }
        objects.remove(&id);
        Ok(())
    }

    fn mblock_delete(&self, id: ObjectId) -> BackendResult<()> {
        let mut objects = self.objects.lock().unwrap();
        match objects.get(&id) {
            Some(Object::Mblock(e)) if !e.committed => {
                return Err(BackendError::new(BackendErrorKind::InvalidState, 0, "cannot delete an uncommitted mblock"))
            }
            Some(Object::Mblock(e)) if e.pin_count > 0 => {
                return Err(BackendError::new(BackendErrorKind::InvalidState, 0, "mblock is pinned by an mcache map"))
            }
            Some(Object::Mblock(_)) => {}
            Some(Object::Mlog(_)) => return Err(BackendError::new(BackendErrorKind::InvalidArgument, 0, "not an mblock")),
            None => return Err(not_found(id)),
        }
        objects.remove(&id);
        Ok(())
    }

    fn mblock_properties(&self, id: ObjectId) -> BackendResult<MblockProperties> {
        let objects = self.objects.lock().unwrap();
        match objects.get(&id) {
            Some(Object::Mblock(e)) => Ok(MblockProperties {
                id,
                media_class: e.media_class,
                capacity: e.capacity,
                write_len: e.write_len,
                committed: e.committed,
                optimal_write_alignment: DEFAULT_ALIGNMENT,
                page_size: DEFAULT_PAGE_SIZE,
            }),
            Some(Object::Mlog(_)) => Err(BackendError::new(BackendErrorKind::InvalidArgument, 0, "not an mblock")),
            None => Err(not_found(id)),
        }
    }

    fn mblock_pin(&self, id: ObjectId) -> BackendResult<()> {
        let mut objects = self.objects.lock().unwrap();
        match objects.get_mut(&id) {
            Some(Object::Mblock(e)) if e.committed => {
                e.pin_count += 1;
                Ok(())
            }
            Some(Object::Mblock(_)) => Err(BackendError::new(BackendErrorKind::InvalidState, 0, "mblock not committed")),
            Some(Object::Mlog(_)) => Err(BackendError::new(BackendErrorKind::InvalidArgument, 0, "not an mblock")),
            None => Err(not_found(id)),
        }
    }

    fn mblock_unpin(&self, id: ObjectId) -> BackendResult<()> {
        let mut objects = self.objects.lock().unwrap();
        match objects.get_mut(&id) {
            Some(Object::Mblock(e)) => {
                e.pin_count = e.pin_count.saturating_sub(1);
                Ok(())
            }
            Some(Object::Mlog(_)) => Err(BackendError::new(BackendErrorKind::InvalidArgument, 0, "not an mblock")),
            None => Err(not_found(id)),
        }
    }

    fn mlog_alloc(&self, capacity_target: u64, media_class: MediaClass) -> BackendResult<MlogProperties> {
        let id = self.alloc_id();
        let entry = MlogEntry {
            media_class,
            capacity_target,
            generation: 0,
            committed: false,
            records: Vec::new(),
        };
        let props = MlogProperties { id, media_class, capacity_target, generation: 0 };
        self.objects.lock().unwrap().insert(id, Object::Mlog(entry));
        Ok(props)
    }

    fn mlog_commit(&self, id: ObjectId) -> BackendResult<()> {
        let mut objects = self.objects.lock().unwrap();
        match objects.get_mut(&id) {
            Some(Object::Mlog(e)) if e.committed => {
                Err(BackendError::new(BackendErrorKind::InvalidState, 0, "mlog already committed"))
            }
            Some(Object::Mlog(e)) => {
                e.committed = true;
                Ok(())
            }
            Some(Object::Mblock(_)) => Err(BackendError::new(BackendErrorKind::InvalidArgument, 0, "not an mlog")),
            None => Err(not_found(id)),
        }
    }

    fn mlog_abort(&self, id: ObjectId) -> BackendResult<()> {
        let mut objects = self.objects.lock().unwrap();
        match objects.get(&id) {
            Some(Object::Mlog(e)) if e.committed => {
                return Err(BackendError::new(BackendErrorKind::InvalidState, 0, "cannot abort a committed mlog"))
            }
            Some(Object::Mlog(_)) => {}
            Some(Object::Mblock(_)) => return Err(BackendError::new(BackendErrorKind::InvalidArgument, 0, "not an mlog")),
            None => return Err(not_found(id)),
        }
        objects.remove(&id);
        Ok(())
    }

    fn mlog_delete(&self, id: ObjectId) -> BackendResult<()> {
        let mut objects = self.objects.lock().unwrap();
        match objects.get(&id) {
            Some(Object::Mlog(e)) if !e.committed => {
                return Err(BackendError::new(BackendErrorKind::InvalidState, 0, "cannot delete an uncommitted mlog"))
            }
            Some(Object::Mlog(_)) => {}
            Some(Object::Mblock(_)) => return Err(BackendError::new(BackendErrorKind::InvalidArgument, 0, "not an mlog")),
            None => return Err(not_found(id)),
        }
        objects.remove(&id);
        Ok(())
    }

    fn mlog_append(&self, id: ObjectId, kind: RecordKind, data: &[u8]) -> BackendResult<u64> {
        let mut objects = self.objects.lock().unwrap();
        let entry = match objects.get_mut(&id) {
            Some(Object::Mlog(e)) => e,
            Some(Object::Mblock(_)) => return Err(BackendError::new(BackendErrorKind::InvalidArgument, 0, "not an mlog")),
            None => return Err(not_found(id)),
        };
        if !entry.committed {
            return Err(BackendError::new(BackendErrorKind::InvalidState, 0, "mlog not committed"));
        }
        let used: u64 = entry.records.iter().map(|(_, d)| d.len() as u64 + 8).sum();
        if used + data.len() as u64 + 8 > entry.capacity_target {
            return Err(BackendError::new(BackendErrorKind::NoSpace, 0, "mlog capacity exhausted"));
        }
        entry.records.push((kind, data.to_vec()));
        Ok((entry.records.len() - 1) as u64)
    }

    fn mlog_read_at(&self, id: ObjectId, index: u64) -> BackendResult<Option<(RecordKind, Vec<u8>)>> {
        let objects = self.objects.lock().unwrap();
        let entry = match objects.get(&id) {
            Some(Object::Mlog(e)) => e,
            Some(Object::Mblock(_)) => return Err(BackendError::new(BackendErrorKind::InvalidArgument, 0, "not an mlog")),
            None => return Err(not_found(id)),
        };
        Ok(entry.records.get(index as usize).cloned())
    }

    fn mlog_record_count(&self, id: ObjectId) -> BackendResult<u64> {
        let objects = self.objects.lock().unwrap();
        match objects.get(&id) {
            Some(Object::Mlog(e)) => Ok(e.records.len() as u64),
            Some(Object::Mblock(_)) => Err(BackendError::new(BackendErrorKind::InvalidArgument, 0, "not an mlog")),
            None => Err(not_found(id)),
        }
    }

    fn mlog_len(&self, id: ObjectId) -> BackendResult<u64> {
        let objects = self.objects.lock().unwrap();
        match objects.get(&id) {
            Some(Object::Mlog(e)) => Ok(e.records.iter().map(|(_, d)| d.len() as u64 + 8).sum()),
            Some(Object::Mblock(_)) => Err(BackendError::new(BackendErrorKind::InvalidArgument, 0, "not an mlog")),
            None => Err(not_found(id)),
        }
    }

    fn mlog_generation(&self, id: ObjectId) -> BackendResult<u64> {
        let objects = self.objects.lock().unwrap();
        match objects.get(&id) {
            Some(Object::Mlog(e)) => Ok(e.generation),
            Some(Object::Mblock(_)) => Err(BackendError::new(BackendErrorKind::InvalidArgument, 0, "not an mlog")),
            None => Err(not_found(id)),
        }
    }

    fn mlog_erase(&self, id: ObjectId, min_gen: u64) -> BackendResult<u64> {
        let mut objects = self.objects.lock().unwrap();
        let entry = match objects.get_mut(&id) {
            Some(Object::Mlog(e)) => e,
            Some(Object::Mblock(_)) => return Err(BackendError::new(BackendErrorKind::InvalidArgument, 0, "not an mlog")),
            None => return Err(not_found(id)),
        };
        entry.records.clear();
        entry.generation = (entry.generation + 1).max(min_gen);
        Ok(entry.generation)
    }

    fn mlog_flush(&self, id: ObjectId) -> BackendResult<()> {
        let objects = self.objects.lock().unwrap();
        match objects.get(&id) {
            Some(Object::Mlog(_)) => Ok(()),
            Some(Object::Mblock(_)) => Err(BackendError::new(BackendErrorKind::InvalidArgument, 0, "not an mlog")),
            None => Err(not_found(id)),
        }
    }
}
