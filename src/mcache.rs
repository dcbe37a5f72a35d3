//! Mcache map (spec.md §4.5). Has no close teacher analogue; built
//! directly from SPEC_FULL.md §4.5, carrying the teacher's `libc = "0.2"`
//! dependency forward to do the actual `mmap`/`munmap`/`madvise`/
//! `mincore` work against real anonymous pages, so `mincore` reports
//! genuine OS residency rather than a simulated counter.
//!
//! A map's backing bytes are populated by copying each committed
//! mblock's committed bytes in via `Backend::mblock_read` at mmap time
//! (there is no real block device behind `mpool_backend::mem`'s
//! reference backend to map a file descriptor from); the invariant that
//! matters for callers — a page pointer aliases the same byte a
//! page-aligned `Mblock::read` would return — holds because both read
//! through the same backend state.

use std::io;
use std::ptr;
use std::sync::Arc;

use libc::{c_void, size_t};
use mpool_backend::{Backend, ObjectId};

use crate::error::{Error, Origin, Result};
use crate::registry::{ObjectKind, Registry};

/// Coarse `madvise` hint (spec.md §4.5 "Advice is a coarse hint routed
/// to page-level madvise").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    Normal,
    Random,
    Sequential,
    WillNeed,
    DontNeed,
}

impl Advice {
    fn to_libc(self) -> libc::c_int {
        match self {
            Advice::Normal => libc::MADV_NORMAL,
            Advice::Random => libc::MADV_RANDOM,
            Advice::Sequential => libc::MADV_SEQUENTIAL,
            Advice::WillNeed => libc::MADV_WILLNEED,
            Advice::DontNeed => libc::MADV_DONTNEED,
        }
    }
}

/// Length sentinel meaning "to end of map" for `Mcache::madvise`
/// (spec.md §4.5).
pub const TO_END: u64 = u64::MAX;

fn page_round(len: u64, page_size: u64) -> u64 {
    (len + page_size - 1) / page_size * page_size
}

/// One real anonymous `mmap` region backing a maximal run of requested
/// mblocks that share a media class. Two runs of different classes are
/// never placed contiguously with each other, matching "media class
/// selects among backing devices" (glossary): different classes model
/// different physical devices, so the map as a whole is non-contiguous
/// whenever the caller mixes classes.
struct Region {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Drop for Region {
    fn drop(&mut self) {
        if !self.base.is_null() {
            unsafe {
                libc::munmap(self.base as *mut c_void, self.len);
            }
        }
    }
}

/// Where one requested mblock lives within the map.
struct Entry {
    id: ObjectId,
    region: usize,
    local_offset: usize,
    len: usize,
    global_offset: u64,
}

/// A virtual mapping of an ordered vector of committed mblock IDs
/// (spec.md §4.5).
pub struct Mcache {
    backend: Arc<dyn Backend>,
    regions: Vec<Region>,
    entries: Vec<Entry>,
    total_len: u64,
    contiguous: bool,
    page_size: u64,
}

impl Mcache {
    /// Mmap (spec.md §4.5): creates the map and pins every mblock for
    /// its lifetime.
    pub fn mmap(registry: &Registry, backend: Arc<dyn Backend>, mbidv: &[ObjectId], advice: Advice) -> Result<Mcache> {
        if mbidv.is_empty() {
            return Err(Error::invalid_argument(Origin::Mcache, "mmap requires at least one mblock"));
        }
        for id in mbidv {
            registry.find(*id, ObjectKind::Mblock)?;
        }

        let mut props = Vec::with_capacity(mbidv.len());
        for &id in mbidv {
            let p = backend.mblock_properties(id).map_err(|e| Error::from_backend(Origin::Mcache, e))?;
            if !p.committed {
                return Err(Error::invalid_state(Origin::Mcache, format!("mblock {} is not committed", id)));
            }
            props.push(p);
        }
        let page_size = props[0].page_size as u64;

        let mut pinned = Vec::with_capacity(mbidv.len());
        for &id in mbidv {
            if let Err(e) = backend.mblock_pin(id) {
                for done in &pinned {
                    let _ = backend.mblock_unpin(*done);
                }
                return Err(Error::from_backend(Origin::Mcache, e));
            }
            pinned.push(id);
        }

        // Partition into maximal runs sharing a media class; each run
        // gets one real mmap region so it is internally contiguous.
        let mut regions = Vec::new();
        let mut entries = Vec::with_capacity(mbidv.len());
        let mut total_len = 0u64;
        let mut run_start = 0usize;
        while run_start < props.len() {
            let mut run_end = run_start + 1;
            while run_end < props.len() && props[run_end].media_class == props[run_start].media_class {
                run_end += 1;
            }
            let run = &props[run_start..run_end];
            let region_len: u64 = run.iter().map(|p| page_round(p.capacity, page_size)).sum();
            let region = match mmap_anon(region_len as usize) {
                Ok(r) => r,
                Err(e) => {
                    for done in &pinned {
                        let _ = backend.mblock_unpin(*done);
                    }
                    return Err(e);
                }
            };
            let region_idx = regions.len();
            let mut local_offset = 0usize;
            for p in run {
                let rounded = page_round(p.capacity, page_size) as usize;
                let mut remaining = p.write_len as usize;
                let mut read_off = 0u64;
                while remaining > 0 {
                    let chunk = remaining.min(page_size as usize);
                    let dst = unsafe {
                        std::slice::from_raw_parts_mut(region.base.add(local_offset + read_off as usize), chunk)
                    };
                    let n = backend.mblock_read(p.id, read_off, dst).map_err(|e| Error::from_backend(Origin::Mcache, e))?;
                    if n == 0 {
                        break;
                    }
                    read_off += n as u64;
                    remaining -= n;
                }
                entries.push(Entry {
                    id: p.id,
                    region: region_idx,
                    local_offset,
                    len: rounded,
                    global_offset: total_len,
                });
                total_len += rounded as u64;
                local_offset += rounded;
            }
            regions.push(region);
            run_start = run_end;
        }
        let contiguous = regions.len() == 1;
        debug!(
            "mcache: mapped {} mblocks into {} region(s) ({} bytes, contiguous={})",
            mbidv.len(),
            regions.len(),
            total_len,
            contiguous
        );

        let mcache = Mcache { backend, regions, entries, total_len, contiguous, page_size };
        mcache.advise_range(0, mcache.total_len, advice)?;
        Ok(mcache)
    }

    /// Munmap (spec.md §4.5): releases the map and unpins the mblocks.
    pub fn munmap(self) -> Result<()> {
        for entry in &self.entries {
            if let Err(e) = self.backend.mblock_unpin(entry.id) {
                warn!("mcache: failed to unpin mblock {} on munmap: {}", entry.id, e);
            }
        }
        Ok(())
    }

    fn entry(&self, mbidx: usize) -> Result<&Entry> {
        self.entries.get(mbidx).ok_or_else(|| Error::not_found(Origin::Mcache, format!("no mblock at index {}", mbidx)))
    }

    /// Getbase (spec.md §4.5): the virtual base of mblock `mbidx` if the
    /// whole map is contiguous, else `None` ("no-base").
    pub fn getbase(&self, mbidx: usize) -> Result<Option<*const u8>> {
        let entry = self.entry(mbidx)?;
        if !self.contiguous {
            return Ok(None);
        }
        let base = unsafe { self.regions[entry.region].base.add(entry.local_offset) };
        Ok(Some(base as *const u8))
    }

    /// Getpages (spec.md §4.5): resolves page offsets within one mblock
    /// to page pointers.
    pub fn getpages(&self, mbidx: usize, offsets: &[u64], pages: &mut Vec<*const u8>) -> Result<()> {
        let entry = self.entry(mbidx)?;
        for &off in offsets {
            if off as usize >= entry.len {
                return Err(Error::out_of_range(Origin::Mcache, format!("offset {} beyond mblock {}", off, entry.id)));
            }
            let ptr = unsafe { self.regions[entry.region].base.add(entry.local_offset + off as usize) };
            pages.push(ptr as *const u8);
        }
        Ok(())
    }

    /// Getpagesv (spec.md §4.5): same as `getpages` across multiple
    /// mblocks; the i-th offset applies to the i-th `mbidx`.
    pub fn getpagesv(&self, mbidxv: &[usize], offsets: &[u64], pages: &mut Vec<*const u8>) -> Result<()> {
        if mbidxv.len() != offsets.len() {
            return Err(Error::invalid_argument(Origin::Mcache, "mbidxv and offsets must be the same length"));
        }
        for (&mbidx, &off) in mbidxv.iter().zip(offsets.iter()) {
            self.getpages(mbidx, &[off], pages)?;
        }
        Ok(())
    }

    /// Madvise (spec.md §4.5). `length == TO_END` addresses to
    /// end-of-map from `(mbidx, offset)`; `(0, 0, TO_END)` addresses the
    /// whole map.
    pub fn madvise(&self, mbidx: usize, offset: u64, length: u64, advice: Advice) -> Result<()> {
        let entry = self.entry(mbidx)?;
        if offset > entry.len as u64 {
            return Err(Error::invalid_argument(Origin::Mcache, "offset beyond mblock end"));
        }
        let global_start = entry.global_offset + offset;
        let global_end = if length == TO_END { self.total_len } else { (global_start + length).min(self.total_len) };
        self.advise_range(global_start, global_end, advice)
    }

    /// Purge (spec.md §4.5): advises the OS to drop resident pages for
    /// the whole map.
    pub fn purge(&self) -> Result<()> {
        self.advise_range(0, self.total_len, Advice::DontNeed)
    }

    fn advise_range(&self, global_start: u64, global_end: u64, advice: Advice) -> Result<()> {
        if global_start >= global_end {
            return Ok(());
        }
        for e in &self.entries {
            let e_start = e.global_offset;
            let e_end = e.global_offset + e.len as u64;
            let lo = global_start.max(e_start);
            let hi = global_end.min(e_end);
            if lo >= hi {
                continue;
            }
            let region = &self.regions[e.region];
            let local_lo = e.local_offset as u64 + (lo - e_start);
            let len = (hi - lo) as usize;
            let rc = unsafe { libc::madvise(region.base.add(local_lo as usize) as *mut c_void, len, advice.to_libc()) };
            if rc != 0 {
                return Err(Error::new(
                    crate::error::ErrorKind::Io,
                    Origin::Mcache,
                    io::Error::last_os_error().raw_os_error().unwrap_or(0),
                    "madvise failed",
                ));
            }
        }
        Ok(())
    }

    /// Mincore (spec.md §4.5): counts resident (`rss`) and virtual
    /// (`vss`) pages across the whole map, in bytes.
    pub fn mincore(&self) -> Result<(u64, u64)> {
        let mut rss = 0u64;
        let mut vss = 0u64;
        for region in &self.regions {
            vss += region.len as u64;
            if region.len == 0 {
                continue;
            }
            let npages = (region.len as u64 + self.page_size - 1) / self.page_size;
            let mut vec = vec![0u8; npages as usize];
            let rc = unsafe { libc::mincore(region.base as *mut c_void, region.len, vec.as_mut_ptr()) };
            if rc != 0 {
                return Err(Error::new(
                    crate::error::ErrorKind::Io,
                    Origin::Mcache,
                    io::Error::last_os_error().raw_os_error().unwrap_or(0),
                    "mincore failed",
                ));
            }
            let resident = vec.iter().filter(|&&b| b & 1 != 0).count() as u64;
            rss += resident * self.page_size;
        }
        Ok((rss, vss))
    }
}

fn mmap_anon(len: usize) -> Result<Region> {
    if len == 0 {
        return Ok(Region { base: ptr::null_mut(), len: 0 });
    }
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len as size_t,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::new(
            crate::error::ErrorKind::Io,
            Origin::Mcache,
            io::Error::last_os_error().raw_os_error().unwrap_or(0),
            "mmap failed",
        ));
    }
    Ok(Region { base: ptr as *mut u8, len })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mpool_backend::mem::MemBackend;
    use mpool_backend::MediaClass;

    use super::*;
    use crate::mblock::MblockHandle;
    use crate::registry::Registry;

    fn committed_mblock(registry: &Arc<Registry>, backend: &Arc<dyn Backend>, class: MediaClass, byte: u8) -> ObjectId {
        let (h, _) = MblockHandle::allocate(registry.clone(), backend.clone(), class, false).unwrap();
        h.write_sync(&[byte; 4096]).unwrap();
        h.commit().unwrap();
        h.id()
    }

    #[test]
    fn getpages_alias_mblock_read() {
        let registry = Arc::new(Registry::new());
        let backend: Arc<dyn Backend> = Arc::new(MemBackend::new(1024 * 1024));
        let ids: Vec<ObjectId> =
            (0..3).map(|i| committed_mblock(&registry, &backend, MediaClass::Capacity, 0x10 + i)).collect();

        let mcache = Mcache::mmap(&registry, backend.clone(), &ids, Advice::Normal).unwrap();
        assert!(mcache.getbase(0).unwrap().is_some());

        let mut pages = Vec::new();
        mcache.getpages(1, &[0], &mut pages).unwrap();
        let mut expect = [0u8; 4096];
        backend.mblock_read(ids[1], 0, &mut expect).unwrap();
        let got = unsafe { std::slice::from_raw_parts(pages[0], 4096) };
        assert_eq!(got, &expect[..]);

        mcache.munmap().unwrap();
    }

    #[test]
    fn mixed_media_class_is_non_contiguous() {
        let registry = Arc::new(Registry::new());
        let backend: Arc<dyn Backend> = Arc::new(MemBackend::new(1024 * 1024));
        let id0 = committed_mblock(&registry, &backend, MediaClass::Capacity, 0xAA);
        let id1 = committed_mblock(&registry, &backend, MediaClass::Staging, 0xBB);

        let mcache = Mcache::mmap(&registry, backend, &[id0, id1], Advice::Normal).unwrap();
        assert_eq!(mcache.getbase(0).unwrap(), None);
        assert_eq!(mcache.getbase(1).unwrap(), None);
    }

    #[test]
    fn mincore_reports_resident_pages() {
        let registry = Arc::new(Registry::new());
        let backend: Arc<dyn Backend> = Arc::new(MemBackend::new(1024 * 1024));
        let id = committed_mblock(&registry, &backend, MediaClass::Capacity, 0x42);
        let mcache = Mcache::mmap(&registry, backend, &[id], Advice::Normal).unwrap();
        let (rss, vss) = mcache.mincore().unwrap();
        assert!(vss > 0);
        assert!(rss <= vss);
    }
}
