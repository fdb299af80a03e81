//! Module SHM: the authoritative directory of modules.
//!
//! Fixed-size region written once when the first connection seeds it from
//! the schema (module installation proper is outside the subscription core).
//! Each module record embeds the per-kind subscription anchors, including
//! their process-shared locks; the per-RPC table follows the module records.
//! Strings live in ext SHM and are referenced by offset, which readers
//! validate against the ext region's current size.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::liveness::Cid;
use crate::mmap::MmapFile;
use crate::session::{Datastore, DS_COUNT};
use crate::shm::ext::{ExtShm, SubsAnchor};
use crate::{Error, Result};

pub const MAIN_MAGIC: u32 = 0x5942_4d31; // "YBM1"
pub const MAIN_VERSION: u32 = 1;

#[repr(C)]
pub struct MainHeader {
    magic: AtomicU32,
    version: AtomicU32,
    init_state: AtomicU32,
    next_cid: AtomicU32,
    next_sub_id: AtomicU32,
    _pad: u32,
    mod_count: u64,
    rpc_count: u64,
}

#[repr(C)]
pub struct ModuleRec {
    pub name_off: u64,
    pub name_len: u32,
    _pad: u32,
    pub change: [SubsAnchor; DS_COUNT],
    pub oper_get: SubsAnchor,
    pub oper_poll: SubsAnchor,
    pub notif: SubsAnchor,
    /// Subscriptions to RPCs defined inside schema extensions of this
    /// module; regular RPCs use the per-RPC table instead.
    pub rpc_ext: SubsAnchor,
    /// Range of this module's entries in the per-RPC table.
    pub rpc_first: u32,
    pub rpc_len: u32,
}

#[repr(C)]
pub struct RpcRec {
    pub path_off: u64,
    pub path_len: u32,
    pub module_idx: u32,
    pub sub: SubsAnchor,
}

/// Seed data for one module record.
pub struct ModuleSpec {
    pub name: String,
    pub rpc_paths: Vec<String>,
}

pub struct MainShm {
    map: MmapFile,
}

impl MainShm {
    pub fn create_new(path: &Path, ext: &mut ExtShm, modules: &[ModuleSpec]) -> Result<Self> {
        let mod_count = modules.len();
        let rpc_count: usize = modules.iter().map(|m| m.rpc_paths.len()).sum();
        let size = rpcs_offset(mod_count) + rpc_count * std::mem::size_of::<RpcRec>();
        let mut map = MmapFile::create_new(path, size)?;

        let mut rpc_idx = 0usize;
        for (idx, spec) in modules.iter().enumerate() {
            let (name_off, name_len) = ext.alloc_str(&spec.name)?;
            let rec: &mut ModuleRec = map.view_mut(module_offset(idx))?;
            rec.name_off = name_off;
            rec.name_len = name_len;
            rec.rpc_first = rpc_idx as u32;
            rec.rpc_len = spec.rpc_paths.len() as u32;
            for rpc_path in &spec.rpc_paths {
                let (path_off, path_len) = ext.alloc_str(rpc_path)?;
                let rpc: &mut RpcRec = map.view_mut(rpc_offset(mod_count, rpc_idx))?;
                rpc.path_off = path_off;
                rpc.path_len = path_len;
                rpc.module_idx = idx as u32;
                rpc_idx += 1;
            }
        }

        {
            let hdr: &mut MainHeader = map.view_mut(0)?;
            hdr.mod_count = mod_count as u64;
            hdr.rpc_count = rpc_count as u64;
            hdr.next_cid.store(1, Ordering::Relaxed);
            hdr.next_sub_id.store(1, Ordering::Relaxed);
            hdr.version.store(MAIN_VERSION, Ordering::Relaxed);
            hdr.magic.store(MAIN_MAGIC, Ordering::Relaxed);
            hdr.init_state.store(2, Ordering::Release);
        }
        Ok(Self { map })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let map = MmapFile::open(path)?;
        let main = Self { map };
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if main.header()?.init_state.load(Ordering::Acquire) == 2 {
                break;
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout("module shm never became ready".into()));
            }
            std::thread::yield_now();
        }
        let hdr = main.header()?;
        if hdr.magic.load(Ordering::Acquire) != MAIN_MAGIC {
            return Err(Error::Internal("module shm magic mismatch".into()));
        }
        let version = hdr.version.load(Ordering::Acquire);
        if version != MAIN_VERSION {
            return Err(Error::Internal(format!(
                "module shm version {version} unsupported"
            )));
        }
        Ok(main)
    }

    fn header(&self) -> Result<&MainHeader> {
        self.map.view(0)
    }

    pub fn module_count(&self) -> usize {
        self.header()
            .map(|h| h.mod_count as usize)
            .unwrap_or_default()
    }

    pub fn rpc_count(&self) -> usize {
        self.header()
            .map(|h| h.rpc_count as usize)
            .unwrap_or_default()
    }

    pub fn new_cid(&self) -> Result<Cid> {
        Ok(self.header()?.next_cid.fetch_add(1, Ordering::AcqRel))
    }

    pub fn new_sub_id(&self) -> Result<u32> {
        Ok(self.header()?.next_sub_id.fetch_add(1, Ordering::AcqRel))
    }

    pub fn module(&self, idx: usize) -> Result<&ModuleRec> {
        if idx >= self.module_count() {
            return Err(Error::Internal(format!("module index {idx} out of range")));
        }
        self.map.view(module_offset(idx))
    }

    pub fn rpc(&self, idx: usize) -> Result<&RpcRec> {
        if idx >= self.rpc_count() {
            return Err(Error::Internal(format!("rpc index {idx} out of range")));
        }
        self.map.view(rpc_offset(self.module_count(), idx))
    }

    pub fn module_name(&self, ext: &ExtShm, idx: usize) -> Result<String> {
        let rec = self.module(idx)?;
        Ok(ext.str_at(rec.name_off, rec.name_len)?.to_string())
    }

    pub fn find_module(&self, ext: &ExtShm, name: &str) -> Result<Option<usize>> {
        for idx in 0..self.module_count() {
            let rec = self.module(idx)?;
            if ext.str_at(rec.name_off, rec.name_len)? == name {
                return Ok(Some(idx));
            }
        }
        Ok(None)
    }

    /// Finds a per-RPC table entry by canonical operation path.
    pub fn find_rpc(&self, ext: &ExtShm, path: &str) -> Result<Option<usize>> {
        for idx in 0..self.rpc_count() {
            let rec = self.rpc(idx)?;
            if ext.str_at(rec.path_off, rec.path_len)? == path {
                return Ok(Some(idx));
            }
        }
        Ok(None)
    }

    pub fn change_anchor(&self, mod_idx: usize, ds: Datastore) -> Result<&SubsAnchor> {
        Ok(&self.module(mod_idx)?.change[ds as usize])
    }

    pub fn oper_get_anchor(&self, mod_idx: usize) -> Result<&SubsAnchor> {
        Ok(&self.module(mod_idx)?.oper_get)
    }

    pub fn oper_poll_anchor(&self, mod_idx: usize) -> Result<&SubsAnchor> {
        Ok(&self.module(mod_idx)?.oper_poll)
    }

    pub fn notif_anchor(&self, mod_idx: usize) -> Result<&SubsAnchor> {
        Ok(&self.module(mod_idx)?.notif)
    }

    pub fn rpc_ext_anchor(&self, mod_idx: usize) -> Result<&SubsAnchor> {
        Ok(&self.module(mod_idx)?.rpc_ext)
    }

    pub fn rpc_anchor(&self, rpc_idx: usize) -> Result<&SubsAnchor> {
        Ok(&self.rpc(rpc_idx)?.sub)
    }
}

fn module_offset(idx: usize) -> usize {
    align8(std::mem::size_of::<MainHeader>()) + idx * std::mem::size_of::<ModuleRec>()
}

fn rpcs_offset(mod_count: usize) -> usize {
    module_offset(mod_count)
}

fn rpc_offset(mod_count: usize, idx: usize) -> usize {
    rpcs_offset(mod_count) + idx * std::mem::size_of::<RpcRec>()
}

fn align8(value: usize) -> usize {
    (value + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> Vec<ModuleSpec> {
        vec![
            ModuleSpec {
                name: "ietf-interfaces".into(),
                rpc_paths: vec![],
            },
            ModuleSpec {
                name: "my-mod".into(),
                rpc_paths: vec!["/my-mod:reset".into(), "/my-mod:reboot".into()],
            },
        ]
    }

    #[test]
    fn create_seed_and_open() {
        let dir = tempfile::tempdir().unwrap();
        let ext_path = dir.path().join("ext.shm");
        let main_path = dir.path().join("main.shm");
        let mut ext = ExtShm::create_new(&ext_path, Duration::from_secs(1)).unwrap();
        let main = MainShm::create_new(&main_path, &mut ext, &specs()).unwrap();

        assert_eq!(main.module_count(), 2);
        assert_eq!(main.rpc_count(), 2);
        assert_eq!(main.find_module(&ext, "my-mod").unwrap(), Some(1));
        assert_eq!(main.find_module(&ext, "nope").unwrap(), None);
        let rpc_idx = main.find_rpc(&ext, "/my-mod:reset").unwrap().unwrap();
        assert_eq!(main.rpc(rpc_idx).unwrap().module_idx, 1);

        let reopened = MainShm::open(&main_path).unwrap();
        assert_eq!(reopened.module_name(&ext, 0).unwrap(), "ietf-interfaces");
    }

    #[test]
    fn id_counters_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let mut ext = ExtShm::create_new(&dir.path().join("ext.shm"), Duration::from_secs(1))
            .unwrap();
        let main = MainShm::create_new(&dir.path().join("main.shm"), &mut ext, &specs()).unwrap();
        let a = main.new_cid().unwrap();
        let b = main.new_cid().unwrap();
        assert!(b > a);
        assert!(a >= 1);
        let s1 = main.new_sub_id().unwrap();
        let s2 = main.new_sub_id().unwrap();
        assert!(s2 > s1);
    }
}
