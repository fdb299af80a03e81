//! Ext SHM: the growable shared heap of subscription descriptors.
//!
//! The region starts with a header (magic, init handshake, allocator lock,
//! used size, free-list head) followed by extents handed out by an
//! append-only allocator with free-list coalescing. It holds the descriptor
//! arrays anchored in module SHM plus the selector strings they reference.
//! Descriptor arrays are only mutated under the owning anchor's WRITE lock;
//! the allocator itself is serialized by its own lock (class `ExtAlloc`).
//!
//! The region grows in place: the file is extended and the header's used
//! size bumped, and every process remaps lazily when it notices the file is
//! larger than its mapping. Views are therefore always re-derived from
//! offsets, never cached.

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::liveness::Cid;
use crate::mmap::MmapFile;
use crate::shm::rwlock::{LockClass, LockMode, RwLock};
use crate::{Error, Result};

pub const EXT_MAGIC: u32 = 0x5942_4531; // "YBE1"
const GROW_CHUNK: usize = 64 * 1024;
const MIN_EXTENT: usize = 16;

#[repr(C)]
struct ExtHeader {
    magic: AtomicU32,
    init_state: AtomicU32,
    /// High-water mark of allocated space, including this header.
    size: AtomicU64,
    /// Offset of the first free extent, 0 when the free list is empty.
    first_free: AtomicU64,
    alloc_lock: RwLock,
}

#[repr(C)]
struct FreeNode {
    next: u64,
    len: u64,
}

/// A subscription anchor: one per `(module, kind[, datastore])` object,
/// embedded in module SHM. The descriptor array it points to lives in ext
/// SHM and is only touched under `lock`.
#[repr(C)]
pub struct SubsAnchor {
    pub subs_off: AtomicU64,
    pub sub_count: AtomicU32,
    _pad: AtomicU32,
    pub lock: RwLock,
}

#[repr(C)]
pub struct ChangeSubShm {
    pub cid: u32,
    pub sub_id: u32,
    pub priority: u32,
    pub opts: u32,
    pub xpath_off: u64,
    pub xpath_len: u32,
    pub suspended: AtomicU32,
}

#[repr(C)]
pub struct OperGetSubShm {
    pub cid: u32,
    pub sub_id: u32,
    pub priority: u32,
    /// `OperGetKind` as u32.
    pub sub_type: u32,
    pub path_off: u64,
    pub path_len: u32,
    pub suspended: AtomicU32,
}

#[repr(C)]
pub struct OperPollSubShm {
    pub cid: u32,
    pub sub_id: u32,
    pub valid_ms: u32,
    pub opts: u32,
    pub path_off: u64,
    pub path_len: u32,
    pub suspended: AtomicU32,
}

#[repr(C)]
pub struct NotifSubShm {
    pub cid: u32,
    pub sub_id: u32,
    pub xpath_off: u64,
    pub xpath_len: u32,
    pub suspended: AtomicU32,
}

#[repr(C)]
pub struct RpcSubShm {
    pub cid: u32,
    pub sub_id: u32,
    pub priority: u32,
    pub xpath_len: u32,
    pub xpath_off: u64,
    /// Canonical operation path; disambiguates entries sharing a module's
    /// extension-RPC anchor.
    pub path_off: u64,
    pub path_len: u32,
    pub suspended: AtomicU32,
}

pub struct ExtShm {
    map: MmapFile,
    cid: Cid,
    lock_timeout: Duration,
}

impl ExtShm {
    pub fn create_new(path: &Path, lock_timeout: Duration) -> Result<Self> {
        let mut map = MmapFile::create_new(path, GROW_CHUNK)?;
        let data_start = data_start();
        {
            let hdr: &mut ExtHeader = map.view_mut(0)?;
            hdr.size.store(data_start as u64, Ordering::Relaxed);
            hdr.first_free.store(0, Ordering::Relaxed);
            hdr.magic.store(EXT_MAGIC, Ordering::Relaxed);
            hdr.init_state.store(2, Ordering::Release);
        }
        Ok(Self {
            map,
            cid: 0,
            lock_timeout,
        })
    }

    pub fn open(path: &Path, lock_timeout: Duration) -> Result<Self> {
        let map = MmapFile::open(path)?;
        let ext = Self {
            map,
            cid: 0,
            lock_timeout,
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let hdr = ext.header()?;
            if hdr.init_state.load(Ordering::Acquire) == 2 {
                break;
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout("ext shm never became ready".into()));
            }
            std::thread::yield_now();
        }
        if ext.header()?.magic.load(Ordering::Acquire) != EXT_MAGIC {
            return Err(Error::Internal("ext shm magic mismatch".into()));
        }
        Ok(ext)
    }

    /// Binds the connection id used for allocator locking.
    pub fn set_cid(&mut self, cid: Cid) {
        self.cid = cid;
    }

    /// Remaps if another process grew the file.
    pub fn refresh(&mut self) -> Result<()> {
        self.map.remap()
    }

    fn header(&self) -> Result<&ExtHeader> {
        self.map.view(0)
    }

    pub fn used_size(&self) -> Result<u64> {
        Ok(self.header()?.size.load(Ordering::Acquire))
    }

    /// Validates an offset/length pair against the current used size.
    fn check_extent(&self, off: u64, len: usize) -> Result<()> {
        let size = self.used_size()?;
        let end = off
            .checked_add(len as u64)
            .ok_or_else(|| Error::Internal("ext extent overflow".into()))?;
        if off < data_start() as u64 || end > size {
            return Err(Error::Internal(format!(
                "ext extent {off}+{len} outside used region ({size})"
            )));
        }
        Ok(())
    }

    pub fn str_at(&self, off: u64, len: u32) -> Result<&str> {
        self.check_extent(off, len as usize)?;
        let bytes = self.map.bytes(off as usize, len as usize)?;
        std::str::from_utf8(bytes).map_err(|_| Error::Internal("ext string not utf-8".into()))
    }

    pub fn slice_at<T>(&self, off: u64, count: u32) -> Result<&[T]> {
        if count == 0 {
            return Ok(&[]);
        }
        self.check_extent(off, std::mem::size_of::<T>() * count as usize)?;
        self.map.slice(off as usize, count as usize)
    }

    pub fn slice_at_mut<T>(&mut self, off: u64, count: u32) -> Result<&mut [T]> {
        if count == 0 {
            return Ok(&mut []);
        }
        self.check_extent(off, std::mem::size_of::<T>() * count as usize)?;
        self.map.slice_mut(off as usize, count as usize)
    }

    pub fn alloc_str(&mut self, value: &str) -> Result<(u64, u32)> {
        let off = self.alloc(value.len().max(1))?;
        self.map
            .bytes_mut(off as usize, value.len())?
            .copy_from_slice(value.as_bytes());
        Ok((off, value.len() as u32))
    }

    pub fn free_str(&mut self, off: u64, len: u32) -> Result<()> {
        if off == 0 {
            return Ok(());
        }
        self.free(off, (len as usize).max(1))
    }

    /// Allocates a zeroed extent of at least `len` bytes.
    pub fn alloc(&mut self, len: usize) -> Result<u64> {
        let need = extent_size(len);
        let guard = self.alloc_guard()?;
        let res = self.alloc_locked(need);
        self.unlock_alloc();
        drop(guard);
        res
    }

    fn alloc_locked(&mut self, need: usize) -> Result<u64> {
        // first fit from the free list
        let mut prev: u64 = 0;
        let mut cur = self.header()?.first_free.load(Ordering::Acquire);
        while cur != 0 {
            let node: &FreeNode = self.map.view(cur as usize)?;
            let (node_len, node_next) = (node.len, node.next);
            if node_len as usize >= need {
                let remainder = node_len as usize - need;
                let replacement = if remainder >= MIN_EXTENT {
                    let tail = cur + need as u64;
                    let tail_node: &mut FreeNode = self.map.view_mut(tail as usize)?;
                    tail_node.next = node_next;
                    tail_node.len = remainder as u64;
                    tail
                } else {
                    node_next
                };
                self.set_free_link(prev, replacement)?;
                self.zero(cur, need)?;
                return Ok(cur);
            }
            prev = cur;
            cur = node_next;
        }

        // append at the high-water mark, growing the file if needed
        let off = self.header()?.size.load(Ordering::Acquire);
        let end = off as usize + need;
        if end > self.map.len() {
            let target = end.max(self.map.len() + GROW_CHUNK);
            self.map.grow(target)?;
        }
        self.header()?.size.store(end as u64, Ordering::Release);
        self.zero(off, need)?;
        Ok(off)
    }

    /// Returns an extent to the free list, coalescing with neighbours.
    pub fn free(&mut self, off: u64, len: usize) -> Result<()> {
        let len = extent_size(len);
        self.check_extent(off, len)?;
        let guard = self.alloc_guard()?;
        let res = self.free_locked(off, len);
        self.unlock_alloc();
        drop(guard);
        res
    }

    fn free_locked(&mut self, off: u64, mut len: usize) -> Result<()> {
        // find the insertion point (list is sorted by offset)
        let mut prev: u64 = 0;
        let mut cur = self.header()?.first_free.load(Ordering::Acquire);
        while cur != 0 && cur < off {
            let node: &FreeNode = self.map.view(cur as usize)?;
            prev = cur;
            cur = node.next;
        }

        // coalesce with the following extent
        if cur != 0 && off + len as u64 == cur {
            let node: &FreeNode = self.map.view(cur as usize)?;
            len += node.len as usize;
            let next = node.next;
            let merged: &mut FreeNode = self.map.view_mut(off as usize)?;
            merged.next = next;
            merged.len = len as u64;
        } else {
            let node: &mut FreeNode = self.map.view_mut(off as usize)?;
            node.next = cur;
            node.len = len as u64;
        }

        // coalesce with the preceding extent, or link it in
        if prev != 0 {
            let prev_len = self.map.view::<FreeNode>(prev as usize)?.len;
            if prev + prev_len == off {
                let (new_len, new_next) = {
                    let freed: &FreeNode = self.map.view(off as usize)?;
                    (prev_len + freed.len, freed.next)
                };
                let prev_node: &mut FreeNode = self.map.view_mut(prev as usize)?;
                prev_node.len = new_len;
                prev_node.next = new_next;
            } else {
                let prev_node: &mut FreeNode = self.map.view_mut(prev as usize)?;
                prev_node.next = off;
            }
        } else {
            self.header()?.first_free.store(off, Ordering::Release);
        }
        Ok(())
    }

    /// Moves an extent to a new size, copying the common prefix.
    pub fn realloc(&mut self, off: u64, old_len: usize, new_len: usize) -> Result<u64> {
        if off == 0 {
            return self.alloc(new_len);
        }
        let new_off = self.alloc(new_len)?;
        let copy = old_len.min(new_len);
        self.copy_bytes(off, new_off, copy)?;
        self.free(off, old_len)?;
        Ok(new_off)
    }

    fn copy_bytes(&mut self, from: u64, to: u64, len: usize) -> Result<()> {
        let data = self.map.bytes(from as usize, len)?.to_vec();
        self.map.bytes_mut(to as usize, len)?.copy_from_slice(&data);
        Ok(())
    }

    fn zero(&mut self, off: u64, len: usize) -> Result<()> {
        self.map.bytes_mut(off as usize, len)?.fill(0);
        Ok(())
    }

    fn set_free_link(&mut self, prev: u64, target: u64) -> Result<()> {
        if prev == 0 {
            self.header()?.first_free.store(target, Ordering::Release);
        } else {
            let node: &mut FreeNode = self.map.view_mut(prev as usize)?;
            node.next = target;
        }
        Ok(())
    }

    fn alloc_guard(&self) -> Result<crate::shm::rwlock::LockToken> {
        let cid = if self.cid == 0 { u32::MAX } else { self.cid };
        self.header()?
            .alloc_lock
            .lock(LockMode::Write, self.lock_timeout, cid, LockClass::ExtAlloc)
    }

    fn unlock_alloc(&mut self) {
        let cid = if self.cid == 0 { u32::MAX } else { self.cid };
        if let Ok(hdr) = self.header() {
            hdr.alloc_lock.unlock(LockMode::Write, cid);
        }
    }
}

fn data_start() -> usize {
    (std::mem::size_of::<ExtHeader>() + 7) & !7
}

fn extent_size(len: usize) -> usize {
    ((len + 7) & !7).max(MIN_EXTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext() -> (tempfile::TempDir, ExtShm) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ext.shm");
        let mut ext = ExtShm::create_new(&path, Duration::from_secs(1)).unwrap();
        ext.set_cid(1);
        (dir, ext)
    }

    #[test]
    fn alloc_free_reuses_space() {
        let (_dir, mut ext) = ext();
        let a = ext.alloc(40).unwrap();
        let b = ext.alloc(40).unwrap();
        assert_ne!(a, b);
        ext.free(a, 40).unwrap();
        let c = ext.alloc(24).unwrap();
        // the freed extent is split and reused
        assert_eq!(c, a);
        ext.free(b, 40).unwrap();
        ext.free(c, 24).unwrap();
    }

    #[test]
    fn free_coalesces_neighbours() {
        let (_dir, mut ext) = ext();
        let a = ext.alloc(32).unwrap();
        let b = ext.alloc(32).unwrap();
        let c = ext.alloc(32).unwrap();
        ext.free(a, 32).unwrap();
        ext.free(c, 32).unwrap();
        ext.free(b, 32).unwrap();
        // all three merged: a full-size alloc lands at `a` again
        let merged = ext.alloc(96).unwrap();
        assert_eq!(merged, a);
    }

    #[test]
    fn strings_round_trip() {
        let (_dir, mut ext) = ext();
        let (off, len) = ext.alloc_str("/ietf-interfaces:interfaces").unwrap();
        assert_eq!(ext.str_at(off, len).unwrap(), "/ietf-interfaces:interfaces");
        ext.free_str(off, len).unwrap();
    }

    #[test]
    fn grows_on_demand() {
        let (_dir, mut ext) = ext();
        let big = ext.alloc(3 * GROW_CHUNK).unwrap();
        assert!(ext.used_size().unwrap() > GROW_CHUNK as u64);
        ext.free(big, 3 * GROW_CHUNK).unwrap();
    }

    #[test]
    fn second_mapping_sees_growth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ext.shm");
        let mut writer = ExtShm::create_new(&path, Duration::from_secs(1)).unwrap();
        writer.set_cid(1);
        let mut reader = ExtShm::open(&path, Duration::from_secs(1)).unwrap();
        reader.set_cid(2);

        let (off, len) = writer.alloc_str("hello").unwrap();
        let _big = writer.alloc(2 * GROW_CHUNK).unwrap();
        reader.refresh().unwrap();
        assert_eq!(reader.str_at(off, len).unwrap(), "hello");
    }
}
