//! End-to-end integration tests exercising the public `Pool`/`Mdc`/
//! `Mcache` surface together, one per spec.md §8 seed scenario plus the
//! boundary behaviors and invariants called out alongside them. Per-unit
//! tests for a single module live in that module's own `#[cfg(test)]`
//! block; this file is for behavior that only shows up when components
//! are wired together through a `Pool`.

use std::sync::Arc;

use mpool_backend::mem::MemBackend;
use mpool_backend::MediaClass;

use crate::config::{MdcOpenFlags, PoolConfig, PoolOpenFlags};
use crate::error::ErrorKind;
use crate::pool::PoolClient;

fn client(extent_capacity: u64) -> PoolClient {
    PoolClient::new(Arc::new(MemBackend::new(extent_capacity)))
}

/// Seed scenario 1: allocate, write a page, commit, read it back.
#[test]
fn scenario_mblock_write_commit_read() {
    let client = client(1024 * 1024);
    let pool = client.open("p0", PoolConfig::default(), PoolOpenFlags::empty()).unwrap();

    let mblock = pool.mblock_alloc(MediaClass::Capacity, false).unwrap();
    let page = vec![0x5Au8; 4096];
    mblock.write_sync(&page).unwrap();
    mblock.commit().unwrap();

    let mut buf = vec![0u8; 4096];
    let n = mblock.read(0, &mut buf).unwrap();
    assert_eq!(n, 4096);
    assert!(buf.iter().all(|&b| b == 0x5A));

    mblock.close().unwrap();
    pool.close().unwrap();
}

/// Seed scenario 2: mlog append/close/reopen round-trip, generation
/// unchanged across a close that performs no erase.
#[test]
fn scenario_mlog_append_close_reopen_round_trip() {
    let client = client(1024 * 1024);
    let pool = client.open("p0", PoolConfig::default(), PoolOpenFlags::empty()).unwrap();

    let mlog = pool.mlog_alloc(1024 * 1024, MediaClass::Capacity).unwrap();
    mlog.commit().unwrap();
    let gen_before = mlog.generation().unwrap();
    let id = mlog.id();

    for rec in [&b"a"[..], &b"bb"[..], &b"ccc"[..]] {
        mlog.append(rec, true).unwrap();
    }
    mlog.close().unwrap();

    let mlog = pool.mlog_open(id).unwrap();
    assert_eq!(mlog.generation().unwrap(), gen_before);
    mlog.read_init();
    let mut buf = [0u8; 16];
    for expect in [&b"a"[..], &b"bb"[..], &b"ccc"[..]] {
        let n = mlog.read_next(&mut buf).unwrap();
        assert_eq!(&buf[..n], expect);
    }
    assert!(mlog.read_next(&mut buf).is_err());

    mlog.close().unwrap();
    pool.close().unwrap();
}

/// Seed scenario 3: MDC with a 4 MiB pair, 1000 records compacted down
/// to 10, surviving close+reopen.
#[test]
fn scenario_mdc_compaction_survives_reopen() {
    let client = client(8 * 1024 * 1024);
    let pool = client.open("p0", PoolConfig::default(), PoolOpenFlags::empty()).unwrap();

    let (id1, id2) = pool.mdc_alloc(MediaClass::Capacity, 4 * 1024 * 1024).unwrap();
    pool.mdc_commit(id1, id2).unwrap();

    let mdc = pool.mdc_open(id1, id2, MdcOpenFlags::empty()).unwrap();
    for _ in 0..1000 {
        mdc.append(&[b'x'; 128], false).unwrap();
    }
    mdc.cstart().unwrap();
    for _ in 0..10 {
        mdc.append(&[b'y'; 128], false).unwrap();
    }
    mdc.cend().unwrap();
    mdc.close().unwrap();

    let mdc = pool.mdc_open(id1, id2, MdcOpenFlags::empty()).unwrap();
    mdc.rewind().unwrap();
    let mut buf = [0u8; 128];
    let mut count = 0;
    while let Ok(n) = mdc.read(&mut buf) {
        assert_eq!(&buf[..n], &[b'y'; 128][..]);
        count += 1;
    }
    assert_eq!(count, 10);

    mdc.close().unwrap();
    pool.mdc_destroy(id1, id2).unwrap();
    pool.close().unwrap();
}

/// Seed scenario 4: a crash mid-compaction (no Cend) recovers the
/// pre-compaction stream on the next open.
#[test]
fn scenario_mdc_crash_during_compaction_recovers_old_stream() {
    let client = client(4 * 1024 * 1024);
    let pool = client.open("p0", PoolConfig::default(), PoolOpenFlags::empty()).unwrap();

    let (id1, id2) = pool.mdc_alloc(MediaClass::Capacity, 1024 * 1024).unwrap();
    pool.mdc_commit(id1, id2).unwrap();

    {
        let mdc = pool.mdc_open(id1, id2, MdcOpenFlags::empty()).unwrap();
        for _ in 0..5 {
            mdc.append(b"old", true).unwrap();
        }
        mdc.cstart().unwrap();
        for _ in 0..3 {
            mdc.append(b"new", true).unwrap();
        }
        // No cend: the handle is simply dropped here, standing in for a
        // crash between Cstart and Cend.
    }

    let mdc = pool.mdc_open(id1, id2, MdcOpenFlags::empty()).unwrap();
    mdc.rewind().unwrap();
    let mut buf = [0u8; 16];
    let mut count = 0;
    while let Ok(n) = mdc.read(&mut buf) {
        assert_eq!(&buf[..n], b"old");
        count += 1;
    }
    assert_eq!(count, 5);
    assert!(!mdc.is_compacting());
}

/// Seed scenario 5: mmap three committed mblocks, getbase + getpages
/// resolve to distinct page-aligned addresses that alias what a direct
/// read returns.
#[test]
fn scenario_mcache_getpages_alias_direct_read() {
    let client = client(1024 * 1024);
    let pool = client.open("p0", PoolConfig::default(), PoolOpenFlags::empty()).unwrap();

    let mut ids = Vec::new();
    for byte in [0x11u8, 0x22, 0x33] {
        let mblock = pool.mblock_alloc(MediaClass::Capacity, false).unwrap();
        mblock.write_sync(&[byte; 4096]).unwrap();
        mblock.commit().unwrap();
        ids.push(mblock.id());
        mblock.close().unwrap();
    }

    let mcache = pool.mcache_mmap(&ids, crate::mcache::Advice::Normal).unwrap();
    let base0 = mcache.getbase(0).unwrap().expect("three same-class mblocks map contiguously");

    let mut pages = Vec::new();
    mcache.getpages(0, &[0, 4096], &mut pages).unwrap();
    assert_ne!(pages[0], pages[1]);
    assert_eq!(pages[0] as *const u8, base0);

    let expect = pool.mblock_open(ids[0]).unwrap();
    let mut direct = [0u8; 4096];
    expect.read(0, &mut direct).unwrap();
    let mapped = unsafe { std::slice::from_raw_parts(pages[0], 4096) };
    assert_eq!(mapped, &direct[..]);
    expect.close().unwrap();

    mcache.munmap().unwrap();
    pool.close().unwrap();
}

/// Seed scenario 6: a second open of an exclusively-held pool fails Busy.
#[test]
fn scenario_exclusive_open_then_second_open_is_busy() {
    let client = client(1024 * 1024);
    let _p0 = client.open("p0", PoolConfig::default(), PoolOpenFlags::EXCLUSIVE).unwrap();
    let err = client.open("p0", PoolConfig::default(), PoolOpenFlags::empty()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
}

/// Boundary: write past extent end fails NoSpace and leaves the mblock
/// writable up to its current offset.
#[test]
fn boundary_write_past_extent_end_is_no_space_and_offset_is_preserved() {
    let client = client(8192);
    let pool = client.open("p0", PoolConfig::default(), PoolOpenFlags::empty()).unwrap();

    let mblock = pool.mblock_alloc(MediaClass::Capacity, false).unwrap();
    mblock.write_sync(&[1u8; 4096]).unwrap();
    let err = mblock.write_sync(&[2u8; 8192]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSpace);

    // The mblock is still writable up to its preserved offset: a
    // second, smaller write at the same (unchanged) offset succeeds.
    mblock.write_sync(&[3u8; 4096]).unwrap();
    mblock.commit().unwrap();

    let mut buf = [0u8; 8192];
    let n = mblock.read(0, &mut buf).unwrap();
    assert_eq!(n, 8192);
    assert!(buf[..4096].iter().all(|&b| b == 1));
    assert!(buf[4096..].iter().all(|&b| b == 3));
}

/// Boundary: erase with a floor below the current generation still
/// strictly increments the generation.
#[test]
fn boundary_erase_below_current_gen_still_increments() {
    let client = client(1024 * 1024);
    let pool = client.open("p0", PoolConfig::default(), PoolOpenFlags::empty()).unwrap();

    let mlog = pool.mlog_alloc(1024 * 1024, MediaClass::Capacity).unwrap();
    mlog.commit().unwrap();
    mlog.append(b"x", true).unwrap();
    let gen1 = mlog.erase(0).unwrap();
    assert_eq!(gen1, 1);
    let gen2 = mlog.erase(0).unwrap();
    assert_eq!(gen2, 2);
    assert!(mlog.is_empty().unwrap());
}

/// Boundary: mcache getbase on a non-contiguous map (mixed media
/// classes) reports no base.
#[test]
fn boundary_mcache_non_contiguous_map_has_no_base() {
    let client = client(1024 * 1024);
    let pool = client.open("p0", PoolConfig::default(), PoolOpenFlags::empty()).unwrap();

    let a = pool.mblock_alloc(MediaClass::Capacity, false).unwrap();
    a.write_sync(&[1u8; 4096]).unwrap();
    a.commit().unwrap();
    let b = pool.mblock_alloc(MediaClass::Staging, false).unwrap();
    b.write_sync(&[2u8; 4096]).unwrap();
    b.commit().unwrap();
    let (id_a, id_b) = (a.id(), b.id());
    a.close().unwrap();
    b.close().unwrap();

    let mcache = pool.mcache_mmap(&[id_a, id_b], crate::mcache::Advice::Normal).unwrap();
    assert_eq!(mcache.getbase(0).unwrap(), None);
    mcache.munmap().unwrap();
}

/// Invariant (spec.md §8 #6): refcounts balance, and closing a pool
/// with an outstanding `find_get` fails Busy rather than silently
/// freeing a live descriptor.
#[test]
fn invariant_refcounts_balance_before_close() {
    let client = client(1024 * 1024);
    let pool = client.open("p0", PoolConfig::default(), PoolOpenFlags::empty()).unwrap();

    let mblock = pool.mblock_alloc(MediaClass::Capacity, false).unwrap();
    mblock.write_sync(&[0u8; 4096]).unwrap();
    mblock.commit().unwrap();
    let id = mblock.id();

    let extra = pool.mblock_open(id).unwrap();
    let err = pool.close().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);

    extra.close().unwrap();
    mblock.close().unwrap();
}

/// Invariant (spec.md §3): a committed mblock is immutable — a write
/// after commit fails, and reads are unaffected by further lifecycle
/// attempts.
#[test]
fn invariant_committed_mblock_is_immutable() {
    let client = client(1024 * 1024);
    let pool = client.open("p0", PoolConfig::default(), PoolOpenFlags::empty()).unwrap();

    let mblock = pool.mblock_alloc(MediaClass::Capacity, false).unwrap();
    mblock.write_sync(&[7u8; 4096]).unwrap();
    mblock.commit().unwrap();

    let err = mblock.write_sync(&[9u8; 4096]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let mut buf = [0u8; 4096];
    mblock.read(0, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 7));

    mblock.delete().unwrap();
}

/// Async write context (spec.md §4.2): chunks queued against distinct
/// mblocks persist in FIFO submission order once flushed.
#[test]
fn async_write_context_spans_multiple_mblocks_in_fifo_order() {
    let client = client(1024 * 1024);
    let pool = client.open("p0", PoolConfig::default(), PoolOpenFlags::empty()).unwrap();

    let m0 = pool.mblock_alloc(MediaClass::Capacity, false).unwrap();
    let m1 = pool.mblock_alloc(MediaClass::Capacity, false).unwrap();

    let ctx = pool.async_write_context();
    ctx.submit(&m0, 0, &[1u8; 4096]).unwrap();
    ctx.submit(&m1, 0, &[2u8; 4096]).unwrap();
    ctx.submit(&m0, 4096, &[3u8; 4096]).unwrap();
    ctx.flush().unwrap();

    m0.commit().unwrap();
    m1.commit().unwrap();

    let mut buf = [0u8; 8192];
    m0.read(0, &mut buf).unwrap();
    assert!(buf[..4096].iter().all(|&b| b == 1));
    assert!(buf[4096..].iter().all(|&b| b == 3));

    let mut buf1 = [0u8; 4096];
    m1.read(0, &mut buf1).unwrap();
    assert!(buf1.iter().all(|&b| b == 2));
}

/// Shared-mode opens stack and only the last close actually releases
/// the pool name for exclusive re-acquisition.
#[test]
fn shared_mode_opens_stack_and_release_on_last_close() {
    let client = client(1024 * 1024);
    let p0 = client.open("p0", PoolConfig::default(), PoolOpenFlags::empty()).unwrap();
    let p1 = client.open("p0", PoolConfig::default(), PoolOpenFlags::empty()).unwrap();

    p0.close().unwrap();
    // p1 still holds the name open shared, so exclusive is still denied.
    let err = client.open("p0", PoolConfig::default(), PoolOpenFlags::EXCLUSIVE).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);

    p1.close().unwrap();
    // Now the name is free.
    let p2 = client.open("p0", PoolConfig::default(), PoolOpenFlags::EXCLUSIVE).unwrap();
    p2.close().unwrap();
}

/// Read-only pool opens reject mutation but still allow reads.
#[test]
fn read_only_pool_rejects_allocation() {
    let client = client(1024 * 1024);
    let pool = client.open("p0", PoolConfig::default(), PoolOpenFlags::READ_ONLY).unwrap();
    let err = pool.mblock_alloc(MediaClass::Capacity, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    pool.close().unwrap();
}

/// Backend-level sanity the engine relies on: an aborted mblock's ID is
/// not left registered, so allocate/abort/allocate cannot collide.
#[test]
fn abort_releases_the_extent_for_reuse() {
    let backend = Arc::new(MemBackend::new(1024 * 1024));
    let client = PoolClient::new(backend);
    let pool = client.open("p0", PoolConfig::default(), PoolOpenFlags::empty()).unwrap();

    let mblock = pool.mblock_alloc(MediaClass::Capacity, false).unwrap();
    mblock.abort().unwrap();

    let mblock2 = pool.mblock_alloc(MediaClass::Capacity, false).unwrap();
    mblock2.write_sync(&[4u8; 4096]).unwrap();
    mblock2.commit().unwrap();
    mblock2.delete().unwrap();
    pool.close().unwrap();
}
