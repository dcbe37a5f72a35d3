//! MDC engine (spec.md §4.4) — the centerpiece. Grounded on the
//! teacher's `Cursor`/`CursorIterator` read-side pattern for `read`, and
//! on `Transaction`/`ReadonlyTransaction` commit/abort pairing for the
//! two-phase commit of the mlog pair; the recovery algorithm itself
//! (candidate selection by generation, marker scanning) has no teacher
//! analogue and follows SPEC_FULL.md §4.4 directly.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use mpool_backend::{Backend, MediaClass, ObjectId, RecordKind};

use crate::config::MdcOpenFlags;
use crate::error::{Error, Origin, Result};
use crate::mlog::MlogHandle;
use crate::registry::Registry;

/// What a single-mlog scan found, used to judge recovery candidacy
/// (spec.md §4.4 "Recovery algorithm", step 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Validity {
    Empty,
    /// Only user records, no compaction markers at all — the
    /// pre-first-compaction regime.
    PreCompaction,
    /// A compaction-start marker followed by zero or more user records
    /// and a terminating compaction-end marker.
    CompleteCompaction,
    /// A compaction-start marker with no terminating compaction-end —
    /// a crash during Cstart…Cend.
    IncompleteCompaction,
}

fn scan(log: &MlogHandle) -> Result<Validity> {
    let count = log.record_count()?;
    if count == 0 {
        return Ok(Validity::Empty);
    }
    let (first_kind, _) = log.read_record_at(0)?.ok_or_else(|| {
        Error::corrupt(Origin::Mdc, format!("mlog {} reports {} records but index 0 is missing", log.id(), count))
    })?;
    match first_kind {
        RecordKind::User => Ok(Validity::PreCompaction),
        RecordKind::CompactionEnd => {
            Err(Error::corrupt(Origin::Mdc, format!("mlog {} opens with a compaction-end marker", log.id())))
        }
        RecordKind::CompactionStart => {
            let (last_kind, _) = log.read_record_at(count - 1)?.ok_or_else(|| {
                Error::corrupt(Origin::Mdc, format!("mlog {} reports {} records but the last is missing", log.id(), count))
            })?;
            if last_kind == RecordKind::CompactionEnd {
                Ok(Validity::CompleteCompaction)
            } else {
                Ok(Validity::IncompleteCompaction)
            }
        }
    }
}

fn valid_as_candidate(v: Validity) -> bool {
    matches!(v, Validity::Empty | Validity::CompleteCompaction)
}

fn valid_at_all(v: Validity) -> bool {
    matches!(v, Validity::Empty | Validity::PreCompaction | Validity::CompleteCompaction)
}

/// A logical append-only record stream built from two mlogs in
/// alternation (spec.md §4.4). Unless opened with `SKIP_SERIALIZATION`,
/// all operations on one `Mdc` serialize through an internal mutex.
pub struct Mdc {
    logs: [MlogHandle; 2],
    active: AtomicUsize,
    compacting: AtomicBool,
    lock: Option<Mutex<()>>,
    read_cursor: Mutex<u64>,
}

/// RAII no-op guard used when `SKIP_SERIALIZATION` is set, so
/// `with_lock` has one code path regardless of whether locking is live.
enum Guard<'a> {
    Locked(MutexGuard<'a, ()>),
    Unlocked,
}

impl Mdc {
    /// Alloc (spec.md §4.4): allocates two mlogs with the same capacity
    /// target and media class. Returns both IDs for the caller to
    /// persist in its own metadata; no handle is retained here.
    pub fn alloc(
        registry: &Registry,
        backend: &dyn Backend,
        media_class: MediaClass,
        capacity: u64,
    ) -> Result<(ObjectId, ObjectId)> {
        let p1 = backend.mlog_alloc(capacity, media_class).map_err(|e| Error::from_backend(Origin::Mdc, e))?;
        registry.insert(p1.id, crate::registry::ObjectKind::Mlog)?;
        let p2 = match backend.mlog_alloc(capacity, media_class) {
            Ok(p) => p,
            Err(e) => {
                let _ = registry.remove(p1.id);
                let _ = backend.mlog_abort(p1.id);
                return Err(Error::from_backend(Origin::Mdc, e));
            }
        };
        if let Err(e) = registry.insert(p2.id, crate::registry::ObjectKind::Mlog) {
            let _ = registry.remove(p1.id);
            let _ = backend.mlog_abort(p1.id);
            let _ = backend.mlog_abort(p2.id);
            return Err(e);
        }
        debug!("mdc: allocated pair ({}, {})", p1.id, p2.id);
        Ok((p1.id, p2.id))
    }

    /// Commit (spec.md §4.4): commits both mlogs atomically from the
    /// caller's point of view. If the second commit fails, the first's
    /// effect is undone so recovery never sees a half-committed pair.
    pub fn commit(registry: &Registry, backend: &dyn Backend, id1: ObjectId, id2: ObjectId) -> Result<()> {
        backend.mlog_commit(id1).map_err(|e| Error::from_backend(Origin::Mdc, e))?;
        if let Err(e) = backend.mlog_commit(id2) {
            warn!("mdc: commit of mlog {} failed after {} already committed, undoing {}", id2, id1, id1);
            let _ = backend.mlog_delete(id1);
            let _ = registry.remove(id1);
            return Err(Error::from_backend(Origin::Mdc, e));
        }
        Ok(())
    }

    /// Destroy (spec.md §4.4): legal only after close.
    pub fn destroy(registry: &Registry, backend: &dyn Backend, id1: ObjectId, id2: ObjectId) -> Result<()> {
        backend.mlog_delete(id1).map_err(|e| Error::from_backend(Origin::Mdc, e))?;
        registry.remove(id1)?;
        backend.mlog_delete(id2).map_err(|e| Error::from_backend(Origin::Mdc, e))?;
        registry.remove(id2)?;
        Ok(())
    }

    /// Open (spec.md §4.4): opens both mlogs, reads both generations,
    /// and runs recovery to pick the authoritative mlog.
    pub fn open(
        registry: Arc<Registry>,
        backend: Arc<dyn Backend>,
        id1: ObjectId,
        id2: ObjectId,
        flags: MdcOpenFlags,
    ) -> Result<Mdc> {
        let mut h0 = MlogHandle::open_existing(registry.clone(), backend.clone(), id1)?;
        let mut h1 = MlogHandle::open_existing(registry, backend, id2)?;
        h0.apply_open_flags(flags)?;
        h1.apply_open_flags(flags)?;
        let mdc = Mdc {
            logs: [h0, h1],
            active: AtomicUsize::new(0),
            compacting: AtomicBool::new(false),
            lock: if flags.contains(MdcOpenFlags::SKIP_SERIALIZATION) { None } else { Some(Mutex::new(())) },
            read_cursor: Mutex::new(0),
        };
        mdc.recover()?;
        Ok(mdc)
    }

    fn with_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = match &self.lock {
            Some(m) => Guard::Locked(m.lock().unwrap()),
            None => Guard::Unlocked,
        };
        f()
    }

    fn active_index(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn active_log(&self) -> &MlogHandle {
        &self.logs[self.active_index()]
    }

    /// Recovery algorithm (spec.md §4.4 "Recovery algorithm (open)").
    fn recover(&self) -> Result<()> {
        let gens = [
            self.logs[0].generation().map_err(|e| Error::new(e.kind(), Origin::Mdc, e.errno(), e.to_string()))?,
            self.logs[1].generation().map_err(|e| Error::new(e.kind(), Origin::Mdc, e.errno(), e.to_string()))?,
        ];
        let validity = [scan(&self.logs[0])?, scan(&self.logs[1])?];

        let authoritative = if gens[0] != gens[1] {
            let candidate = if gens[0] > gens[1] { 0 } else { 1 };
            let other = 1 - candidate;
            if valid_as_candidate(validity[candidate]) {
                candidate
            } else {
                info!(
                    "mdc: candidate mlog {} (gen {}) failed recovery validation, falling back to mlog {} (gen {})",
                    self.logs[candidate].id(),
                    gens[candidate],
                    self.logs[other].id(),
                    gens[other]
                );
                self.logs[candidate].erase(gens[other])?;
                other
            }
        } else {
            let zero_ok = valid_at_all(validity[0]) && validity[0] != Validity::Empty;
            let one_ok = valid_at_all(validity[1]) && validity[1] != Validity::Empty;
            match (zero_ok, one_ok) {
                (true, true) => {
                    return Err(Error::corrupt(
                        Origin::Mdc,
                        format!(
                            "mlogs {} and {} are both valid and non-empty at generation {}",
                            self.logs[0].id(),
                            self.logs[1].id(),
                            gens[0]
                        ),
                    ))
                }
                (true, false) => 0,
                (false, true) => 1,
                (false, false) => 0,
            }
        };

        self.active.store(authoritative, Ordering::SeqCst);
        self.compacting.store(false, Ordering::SeqCst);
        let start = rewind_index(&self.logs[authoritative])?;
        *self.read_cursor.lock().unwrap() = start;
        info!(
            "mdc: recovery selected mlog {} as authoritative (generations {}/{})",
            self.logs[authoritative].id(),
            gens[0],
            gens[1]
        );
        Ok(())
    }

    /// Rewind (spec.md §4.4): positions the read cursor at the first
    /// record after the most recent compaction-start marker, or at
    /// record 0 if no markers exist.
    pub fn rewind(&self) -> Result<()> {
        self.with_lock(|| {
            let start = rewind_index(self.active_log())?;
            *self.read_cursor.lock().unwrap() = start;
            Ok(())
        })
    }

    /// Read (spec.md §4.4): returns the next user record, transparently
    /// skipping compaction markers.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.with_lock(|| {
            let mut cursor = self.read_cursor.lock().unwrap();
            loop {
                match self.active_log().read_record_at(*cursor)? {
                    None => return Err(Error::not_found(Origin::Mdc, "end of mdc record stream")),
                    Some((RecordKind::User, data)) => {
                        if data.len() > buf.len() {
                            return Err(Error::overflow(Origin::Mdc, data.len()));
                        }
                        buf[..data.len()].copy_from_slice(&data);
                        *cursor += 1;
                        return Ok(data.len());
                    }
                    Some((_marker, _)) => {
                        *cursor += 1;
                    }
                }
            }
        })
    }

    /// Append (spec.md §4.4): appends to the active mlog.
    pub fn append(&self, data: &[u8], sync: bool) -> Result<()> {
        self.with_lock(|| self.active_log().append(data, sync))
    }

    /// Cstart (spec.md §4.4): swaps active/standby, erases the new
    /// active (bumping its generation past the old active's), and
    /// writes a compaction-start marker. On failure the MDC remains
    /// `Active(i)` — the swap only takes effect once the marker write
    /// succeeds.
    pub fn cstart(&self) -> Result<()> {
        self.with_lock(|| {
            let old_active = self.active_index();
            let new_active = 1 - old_active;
            let old_gen = self.logs[old_active].generation()?;
            self.logs[new_active].erase(old_gen + 1)?;
            self.logs[new_active].append_marker(RecordKind::CompactionStart)?;
            self.active.store(new_active, Ordering::SeqCst);
            self.compacting.store(true, Ordering::SeqCst);
            debug!("mdc: cstart, active now mlog {}", self.logs[new_active].id());
            Ok(())
        })
    }

    /// Cend (spec.md §4.4): writes a compaction-end marker, flushes,
    /// and reclaims space by erasing the former active. On failure the
    /// MDC remains `Compacting`.
    pub fn cend(&self) -> Result<()> {
        self.with_lock(|| {
            let active = self.active_index();
            let former = 1 - active;
            self.logs[active].append_marker(RecordKind::CompactionEnd)?;
            self.logs[active].flush()?;
            self.compacting.store(false, Ordering::SeqCst);
            if let Err(e) = self.logs[former].erase(0) {
                warn!("mdc: failed to reclaim former-active mlog {} after cend: {}", self.logs[former].id(), e);
            }
            debug!("mdc: cend, mlog {} now durable", self.logs[active].id());
            Ok(())
        })
    }

    /// Usage (spec.md §4.4): estimated bytes used in the active mlog.
    pub fn usage(&self) -> Result<u64> {
        self.active_log().len()
    }

    pub fn is_compacting(&self) -> bool {
        self.compacting.load(Ordering::SeqCst)
    }

    /// Sync (spec.md §4.4): flushes the active mlog.
    pub fn sync(&self) -> Result<()> {
        self.with_lock(|| self.active_log().flush())
    }

    /// Close (spec.md §4.4): flushes any buffered appends, then closes
    /// both mlogs.
    pub fn close(self) -> Result<()> {
        self.logs[self.active_index()].flush()?;
        let Mdc { logs, .. } = self;
        let [l0, l1] = logs;
        l0.close()?;
        l1.close()?;
        Ok(())
    }
}

/// Finds the index of the first user record after the last
/// compaction-start marker, or 0 if the log has none (spec.md §4.4
/// Rewind).
fn rewind_index(log: &MlogHandle) -> Result<u64> {
    let count = log.record_count()?;
    let mut start = 0u64;
    for i in 0..count {
        if let Some((RecordKind::CompactionStart, _)) = log.read_record_at(i)? {
            start = i + 1;
        }
    }
    Ok(start)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mpool_backend::mem::MemBackend;
    use mpool_backend::MediaClass;

    use super::*;
    use crate::registry::Registry;

    fn setup() -> (Arc<Registry>, Arc<dyn Backend>) {
        (Arc::new(Registry::new()), Arc::new(MemBackend::new(4 * 1024 * 1024)))
    }

    fn open_fresh(registry: &Arc<Registry>, backend: &Arc<dyn Backend>) -> Mdc {
        let (id1, id2) = Mdc::alloc(registry, backend.as_ref(), MediaClass::Capacity, 4 * 1024 * 1024).unwrap();
        Mdc::commit(registry, backend.as_ref(), id1, id2).unwrap();
        Mdc::open(registry.clone(), backend.clone(), id1, id2, MdcOpenFlags::empty()).unwrap()
    }

    #[test]
    fn round_trip_pre_compaction() {
        let (registry, backend) = setup();
        let mdc = open_fresh(&registry, &backend);
        mdc.append(b"a", true).unwrap();
        mdc.append(b"bb", true).unwrap();
        mdc.append(b"ccc", true).unwrap();
        mdc.rewind().unwrap();
        let mut buf = [0u8; 16];
        let n = mdc.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"a");
        let n = mdc.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"bb");
        let n = mdc.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ccc");
        assert!(mdc.read(&mut buf).is_err());
    }

    #[test]
    fn compaction_round_trip() {
        let (registry, backend) = setup();
        let mdc = open_fresh(&registry, &backend);
        for _ in 0..1000 {
            mdc.append(&[b'x'; 128], false).unwrap();
        }
        mdc.cstart().unwrap();
        for _ in 0..10 {
            mdc.append(&[b'y'; 128], false).unwrap();
        }
        mdc.cend().unwrap();
        mdc.rewind().unwrap();
        let mut buf = [0u8; 128];
        let mut count = 0;
        loop {
            match mdc.read(&mut buf) {
                Ok(n) => {
                    assert_eq!(&buf[..n], &[b'y'; 128][..]);
                    count += 1;
                }
                Err(_) => break,
            }
        }
        assert_eq!(count, 10);
    }

    #[test]
    fn crash_during_compaction_recovers_pre_compaction_stream() {
        let (registry, backend) = setup();
        let (id1, id2) = Mdc::alloc(&registry, backend.as_ref(), MediaClass::Capacity, 4 * 1024 * 1024).unwrap();
        Mdc::commit(&registry, backend.as_ref(), id1, id2).unwrap();
        {
            let mdc = Mdc::open(registry.clone(), backend.clone(), id1, id2, MdcOpenFlags::empty()).unwrap();
            for _ in 0..5 {
                mdc.append(b"old", true).unwrap();
            }
            mdc.cstart().unwrap();
            for _ in 0..3 {
                mdc.append(b"new", true).unwrap();
            }
            // No cend: simulate a crash. Drop without close.
        }
        let mdc = Mdc::open(registry.clone(), backend.clone(), id1, id2, MdcOpenFlags::empty()).unwrap();
        mdc.rewind().unwrap();
        let mut buf = [0u8; 16];
        let mut count = 0;
        loop {
            match mdc.read(&mut buf) {
                Ok(n) => {
                    assert_eq!(&buf[..n], b"old");
                    count += 1;
                }
                Err(_) => break,
            }
        }
        assert_eq!(count, 5);
    }

    #[test]
    fn close_then_reopen_preserves_records() {
        let (registry, backend) = setup();
        let (id1, id2) = Mdc::alloc(&registry, backend.as_ref(), MediaClass::Capacity, 4 * 1024 * 1024).unwrap();
        Mdc::commit(&registry, backend.as_ref(), id1, id2).unwrap();
        {
            let mdc = Mdc::open(registry.clone(), backend.clone(), id1, id2, MdcOpenFlags::empty()).unwrap();
            mdc.append(b"one", true).unwrap();
            mdc.append(b"two", true).unwrap();
            mdc.close().unwrap();
        }
        let mdc = Mdc::open(registry.clone(), backend.clone(), id1, id2, MdcOpenFlags::empty()).unwrap();
        mdc.rewind().unwrap();
        let mut buf = [0u8; 16];
        let n = mdc.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"one");
        let n = mdc.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"two");
    }

    #[test]
    fn overflow_on_short_buffer_does_not_advance_cursor() {
        let (registry, backend) = setup();
        let mdc = open_fresh(&registry, &backend);
        mdc.append(b"hello", true).unwrap();
        mdc.rewind().unwrap();
        let mut tiny = [0u8; 2];
        let err = mdc.read(&mut tiny).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Overflow);
        let mut buf = [0u8; 16];
        let n = mdc.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }
}
