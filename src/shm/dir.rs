//! Ext-SHM subscription directory operations.
//!
//! The registry mirrors every subscription into a descriptor array in ext
//! SHM so event producers in other processes can see it. All mutations here
//! run under the owning anchor's WRITE lock; walkers hold READ-UPGRADE so
//! they can reclaim descriptors of dead connections in place.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::liveness::Cid;
use crate::shm::ext::{
    ChangeSubShm, ExtShm, NotifSubShm, OperGetSubShm, OperPollSubShm, RpcSubShm, SubsAnchor,
};
use crate::shm::rwlock::{LockClass, LockMode};
use crate::{Error, Result};

/// Snapshot of one live descriptor, copied out under the anchor lock.
#[derive(Debug, Clone)]
pub struct LiveSub {
    pub cid: Cid,
    pub sub_id: u32,
    pub priority: u32,
    pub opts: u32,
    pub suspended: bool,
    pub selector: Option<String>,
}

/// Result of a directory removal.
#[derive(Debug, Clone, Copy)]
pub struct DelOutcome {
    pub found: bool,
    /// The descriptor array became empty; the caller unlinks the mailbox.
    pub emptied: bool,
}

/// Result of a walk: live descriptors plus the number of dead ones that
/// were reclaimed along the way.
#[derive(Debug)]
pub struct CollectOutcome {
    pub live: Vec<LiveSub>,
    pub reclaimed: u32,
}

/// Field accessors shared by the five descriptor layouts.
pub(crate) trait SubDesc {
    fn cid(&self) -> Cid;
    fn sub_id(&self) -> u32;
    fn selector(&self) -> (u64, u32);
    fn extra_selector(&self) -> (u64, u32) {
        (0, 0)
    }
    fn suspended(&self) -> &AtomicU32;
    fn priority(&self) -> u32 {
        0
    }
    fn opts(&self) -> u32 {
        0
    }
}

impl SubDesc for ChangeSubShm {
    fn cid(&self) -> Cid {
        self.cid
    }
    fn sub_id(&self) -> u32 {
        self.sub_id
    }
    fn selector(&self) -> (u64, u32) {
        (self.xpath_off, self.xpath_len)
    }
    fn suspended(&self) -> &AtomicU32 {
        &self.suspended
    }
    fn priority(&self) -> u32 {
        self.priority
    }
    fn opts(&self) -> u32 {
        self.opts
    }
}

impl SubDesc for OperGetSubShm {
    fn cid(&self) -> Cid {
        self.cid
    }
    fn sub_id(&self) -> u32 {
        self.sub_id
    }
    fn selector(&self) -> (u64, u32) {
        (self.path_off, self.path_len)
    }
    fn suspended(&self) -> &AtomicU32 {
        &self.suspended
    }
    fn priority(&self) -> u32 {
        self.priority
    }
}

impl SubDesc for OperPollSubShm {
    fn cid(&self) -> Cid {
        self.cid
    }
    fn sub_id(&self) -> u32 {
        self.sub_id
    }
    fn selector(&self) -> (u64, u32) {
        (self.path_off, self.path_len)
    }
    fn suspended(&self) -> &AtomicU32 {
        &self.suspended
    }
    fn opts(&self) -> u32 {
        self.opts
    }
}

impl SubDesc for NotifSubShm {
    fn cid(&self) -> Cid {
        self.cid
    }
    fn sub_id(&self) -> u32 {
        self.sub_id
    }
    fn selector(&self) -> (u64, u32) {
        (self.xpath_off, self.xpath_len)
    }
    fn suspended(&self) -> &AtomicU32 {
        &self.suspended
    }
}

impl SubDesc for RpcSubShm {
    fn cid(&self) -> Cid {
        self.cid
    }
    fn sub_id(&self) -> u32 {
        self.sub_id
    }
    fn selector(&self) -> (u64, u32) {
        (self.xpath_off, self.xpath_len)
    }
    fn extra_selector(&self) -> (u64, u32) {
        (self.path_off, self.path_len)
    }
    fn suspended(&self) -> &AtomicU32 {
        &self.suspended
    }
    fn priority(&self) -> u32 {
        self.priority
    }
}

fn with_anchor<R>(
    anchor: &SubsAnchor,
    mode: LockMode,
    cid: Cid,
    timeout: Duration,
    f: impl FnOnce() -> Result<R>,
) -> Result<R> {
    let token = anchor.lock.lock(mode, timeout, cid, LockClass::ExtObject)?;
    let res = f();
    anchor.lock.unlock(mode, cid);
    drop(token);
    res
}

/// Appends a descriptor to the anchor's array. The build closure fills the
/// zeroed tail record; selector strings must already be allocated so a
/// failed realloc leaves nothing behind for the caller to roll back except
/// those strings.
fn push_desc<T: SubDesc>(
    ext: &mut ExtShm,
    anchor: &SubsAnchor,
    build: impl FnOnce(&mut T),
) -> Result<()> {
    let size = std::mem::size_of::<T>();
    let count = anchor.sub_count.load(Ordering::Acquire);
    let old_off = anchor.subs_off.load(Ordering::Acquire);
    let new_off = ext.realloc(old_off, count as usize * size, (count as usize + 1) * size)?;
    {
        let slice = ext.slice_at_mut::<T>(new_off, count + 1)?;
        build(&mut slice[count as usize]);
    }
    anchor.subs_off.store(new_off, Ordering::Release);
    anchor.sub_count.store(count + 1, Ordering::Release);
    Ok(())
}

/// Removes the descriptor with `sub_id`, swap-removing its slot.
fn remove_desc<T: SubDesc>(ext: &mut ExtShm, anchor: &SubsAnchor, sub_id: u32) -> Result<DelOutcome> {
    let size = std::mem::size_of::<T>();
    let count = anchor.sub_count.load(Ordering::Acquire);
    let off = anchor.subs_off.load(Ordering::Acquire);
    let mut found_idx = None;
    let mut selector = (0u64, 0u32);
    let mut extra = (0u64, 0u32);
    {
        let slice = ext.slice_at::<T>(off, count)?;
        for (idx, rec) in slice.iter().enumerate() {
            if rec.sub_id() == sub_id {
                found_idx = Some(idx);
                selector = rec.selector();
                extra = rec.extra_selector();
                break;
            }
        }
    }
    let Some(idx) = found_idx else {
        return Ok(DelOutcome {
            found: false,
            emptied: false,
        });
    };

    ext.free_str(selector.0, selector.1)?;
    ext.free_str(extra.0, extra.1)?;

    if count == 1 {
        ext.free(off, size)?;
        anchor.subs_off.store(0, Ordering::Release);
        anchor.sub_count.store(0, Ordering::Release);
        return Ok(DelOutcome {
            found: true,
            emptied: true,
        });
    }

    // swap-remove: copy the last record over the hole, shrink the array
    if idx != count as usize - 1 {
        let from = off + (count as u64 - 1) * size as u64;
        let to = off + idx as u64 * size as u64;
        let data = ext.slice_at::<u8>(from, size as u32)?.to_vec();
        ext.slice_at_mut::<u8>(to, size as u32)?.copy_from_slice(&data);
    }
    let new_off = ext.realloc(off, count as usize * size, (count as usize - 1) * size)?;
    anchor.subs_off.store(new_off, Ordering::Release);
    anchor.sub_count.store(count - 1, Ordering::Release);
    Ok(DelOutcome {
        found: true,
        emptied: false,
    })
}

fn snapshot<T: SubDesc>(ext: &ExtShm, rec: &T) -> Result<LiveSub> {
    let (off, len) = rec.selector();
    let selector = if off == 0 {
        None
    } else {
        Some(ext.str_at(off, len)?.to_string())
    };
    Ok(LiveSub {
        cid: rec.cid(),
        sub_id: rec.sub_id(),
        priority: rec.priority(),
        opts: rec.opts(),
        suspended: rec.suspended().load(Ordering::Relaxed) != 0,
        selector,
    })
}

/// Walks an anchor's descriptor array, reclaiming descriptors of dead
/// connections. Enters in READ-UPGRADE and upgrades to WRITE per reclaim;
/// if the upgrade times out the dead descriptor is merely skipped this
/// pass. Suspended descriptors are reported but never removed here.
fn collect_desc<T: SubDesc>(
    ext: &mut ExtShm,
    anchor: &SubsAnchor,
    lock_cid: Cid,
    timeout: Duration,
    is_alive: &dyn Fn(Cid) -> bool,
    keep: &dyn Fn(&T, &ExtShm) -> bool,
) -> Result<CollectOutcome> {
    let token = anchor
        .lock
        .lock(LockMode::ReadUpgr, timeout, lock_cid, LockClass::ExtObject)?;
    let mut mode = LockMode::ReadUpgr;
    let mut live = Vec::new();
    let mut reclaimed = 0u32;

    let result = (|| -> Result<()> {
        let mut idx = 0u32;
        loop {
            let count = anchor.sub_count.load(Ordering::Acquire);
            if idx >= count {
                break;
            }
            let off = anchor.subs_off.load(Ordering::Acquire);
            let (cid, sub_id, matches) = {
                let slice = ext.slice_at::<T>(off, count)?;
                let rec = &slice[idx as usize];
                (rec.cid(), rec.sub_id(), keep(rec, ext))
            };

            if !is_alive(cid) {
                // dead subscriber: reclaim under WRITE, do not advance
                if mode != LockMode::Write {
                    match anchor.lock.relock(mode, LockMode::Write, timeout, lock_cid) {
                        Ok(()) => mode = LockMode::Write,
                        Err(err) => {
                            log::warn!(
                                "skipping recovery of sub {sub_id} (dead cid {cid}): {err}"
                            );
                            idx += 1;
                            continue;
                        }
                    }
                }
                log::info!("reclaiming subscription {sub_id} of dead connection {cid}");
                remove_desc::<T>(ext, anchor, sub_id)?;
                reclaimed += 1;
                continue;
            }

            if matches {
                let slice = ext.slice_at::<T>(off, count)?;
                live.push(snapshot(ext, &slice[idx as usize])?);
            }
            idx += 1;
        }
        Ok(())
    })();

    if mode != LockMode::ReadUpgr {
        if let Err(err) = anchor.lock.relock(mode, LockMode::ReadUpgr, timeout, lock_cid) {
            log::warn!("relock after recovery failed: {err}");
            anchor.lock.unlock(mode, lock_cid);
            drop(token);
            result?;
            return Ok(CollectOutcome { live, reclaimed });
        }
    }
    anchor.lock.unlock(LockMode::ReadUpgr, lock_cid);
    drop(token);
    result?;
    Ok(CollectOutcome { live, reclaimed })
}

pub fn change_sub_add(
    ext: &mut ExtShm,
    anchor: &SubsAnchor,
    cid: Cid,
    sub_id: u32,
    priority: u32,
    opts: u32,
    xpath: Option<&str>,
    timeout: Duration,
) -> Result<()> {
    with_anchor(anchor, LockMode::Write, cid, timeout, || {
        let (xpath_off, xpath_len) = match xpath {
            Some(xpath) => ext.alloc_str(xpath)?,
            None => (0, 0),
        };
        let pushed = push_desc::<ChangeSubShm>(ext, anchor, |rec| {
            rec.cid = cid;
            rec.sub_id = sub_id;
            rec.priority = priority;
            rec.opts = opts;
            rec.xpath_off = xpath_off;
            rec.xpath_len = xpath_len;
        });
        if pushed.is_err() {
            let _ = ext.free_str(xpath_off, xpath_len);
        }
        pushed
    })
}

pub fn change_sub_del(
    ext: &mut ExtShm,
    anchor: &SubsAnchor,
    cid: Cid,
    sub_id: u32,
    timeout: Duration,
) -> Result<DelOutcome> {
    with_anchor(anchor, LockMode::Write, cid, timeout, || {
        remove_desc::<ChangeSubShm>(ext, anchor, sub_id)
    })
}

pub fn collect_change_subs(
    ext: &mut ExtShm,
    anchor: &SubsAnchor,
    cid: Cid,
    timeout: Duration,
    is_alive: &dyn Fn(Cid) -> bool,
) -> Result<CollectOutcome> {
    collect_desc::<ChangeSubShm>(ext, anchor, cid, timeout, is_alive, &|_, _| true)
}

pub fn oper_get_sub_add(
    ext: &mut ExtShm,
    anchor: &SubsAnchor,
    cid: Cid,
    sub_id: u32,
    priority: u32,
    sub_type: u32,
    path: &str,
    timeout: Duration,
) -> Result<()> {
    with_anchor(anchor, LockMode::Write, cid, timeout, || {
        // two oper-get subscriptions with the same path and priority would
        // collide on one mailbox file
        let count = anchor.sub_count.load(Ordering::Acquire);
        let off = anchor.subs_off.load(Ordering::Acquire);
        if count > 0 {
            let slice = ext.slice_at::<OperGetSubShm>(off, count)?;
            for rec in slice {
                if rec.priority == priority && ext.str_at(rec.path_off, rec.path_len)? == path {
                    return Err(Error::Exists(format!(
                        "operational get subscription for \"{path}\" priority {priority}"
                    )));
                }
            }
        }
        let (path_off, path_len) = ext.alloc_str(path)?;
        let pushed = push_desc::<OperGetSubShm>(ext, anchor, |rec| {
            rec.cid = cid;
            rec.sub_id = sub_id;
            rec.priority = priority;
            rec.sub_type = sub_type;
            rec.path_off = path_off;
            rec.path_len = path_len;
        });
        if pushed.is_err() {
            let _ = ext.free_str(path_off, path_len);
        }
        pushed
    })
}

pub fn oper_get_sub_del(
    ext: &mut ExtShm,
    anchor: &SubsAnchor,
    cid: Cid,
    sub_id: u32,
    timeout: Duration,
) -> Result<DelOutcome> {
    with_anchor(anchor, LockMode::Write, cid, timeout, || {
        remove_desc::<OperGetSubShm>(ext, anchor, sub_id)
    })
}

pub fn collect_oper_get_subs(
    ext: &mut ExtShm,
    anchor: &SubsAnchor,
    cid: Cid,
    timeout: Duration,
    is_alive: &dyn Fn(Cid) -> bool,
    path: &str,
) -> Result<CollectOutcome> {
    let wanted = path.to_string();
    collect_desc::<OperGetSubShm>(ext, anchor, cid, timeout, is_alive, &move |rec, ext| {
        ext.str_at(rec.path_off, rec.path_len)
            .map(|p| p == wanted)
            .unwrap_or(false)
    })
}

pub fn oper_poll_sub_add(
    ext: &mut ExtShm,
    anchor: &SubsAnchor,
    cid: Cid,
    sub_id: u32,
    valid_ms: u32,
    opts: u32,
    path: &str,
    timeout: Duration,
) -> Result<()> {
    with_anchor(anchor, LockMode::Write, cid, timeout, || {
        let (path_off, path_len) = ext.alloc_str(path)?;
        let pushed = push_desc::<OperPollSubShm>(ext, anchor, |rec| {
            rec.cid = cid;
            rec.sub_id = sub_id;
            rec.valid_ms = valid_ms;
            rec.opts = opts;
            rec.path_off = path_off;
            rec.path_len = path_len;
        });
        if pushed.is_err() {
            let _ = ext.free_str(path_off, path_len);
        }
        pushed
    })
}

pub fn oper_poll_sub_del(
    ext: &mut ExtShm,
    anchor: &SubsAnchor,
    cid: Cid,
    sub_id: u32,
    timeout: Duration,
) -> Result<DelOutcome> {
    with_anchor(anchor, LockMode::Write, cid, timeout, || {
        remove_desc::<OperPollSubShm>(ext, anchor, sub_id)
    })
}

pub fn notif_sub_add(
    ext: &mut ExtShm,
    anchor: &SubsAnchor,
    cid: Cid,
    sub_id: u32,
    xpath: Option<&str>,
    timeout: Duration,
) -> Result<()> {
    with_anchor(anchor, LockMode::Write, cid, timeout, || {
        let (xpath_off, xpath_len) = match xpath {
            Some(xpath) => ext.alloc_str(xpath)?,
            None => (0, 0),
        };
        let pushed = push_desc::<NotifSubShm>(ext, anchor, |rec| {
            rec.cid = cid;
            rec.sub_id = sub_id;
            rec.xpath_off = xpath_off;
            rec.xpath_len = xpath_len;
        });
        if pushed.is_err() {
            let _ = ext.free_str(xpath_off, xpath_len);
        }
        pushed
    })
}

pub fn notif_sub_del(
    ext: &mut ExtShm,
    anchor: &SubsAnchor,
    cid: Cid,
    sub_id: u32,
    timeout: Duration,
) -> Result<DelOutcome> {
    with_anchor(anchor, LockMode::Write, cid, timeout, || {
        remove_desc::<NotifSubShm>(ext, anchor, sub_id)
    })
}

pub fn collect_notif_subs(
    ext: &mut ExtShm,
    anchor: &SubsAnchor,
    cid: Cid,
    timeout: Duration,
    is_alive: &dyn Fn(Cid) -> bool,
) -> Result<CollectOutcome> {
    collect_desc::<NotifSubShm>(ext, anchor, cid, timeout, is_alive, &|_, _| true)
}

pub fn rpc_sub_add(
    ext: &mut ExtShm,
    anchor: &SubsAnchor,
    cid: Cid,
    sub_id: u32,
    priority: u32,
    xpath: &str,
    path: &str,
    timeout: Duration,
) -> Result<()> {
    with_anchor(anchor, LockMode::Write, cid, timeout, || {
        // same operation and priority would collide on one mailbox
        let count = anchor.sub_count.load(Ordering::Acquire);
        let off = anchor.subs_off.load(Ordering::Acquire);
        if count > 0 {
            let slice = ext.slice_at::<RpcSubShm>(off, count)?;
            for rec in slice {
                if rec.priority == priority && ext.str_at(rec.path_off, rec.path_len)? == path {
                    return Err(Error::Exists(format!(
                        "RPC subscription for \"{path}\" priority {priority}"
                    )));
                }
            }
        }
        let (xpath_off, xpath_len) = ext.alloc_str(xpath)?;
        let (path_off, path_len) = match ext.alloc_str(path) {
            Ok(pair) => pair,
            Err(err) => {
                let _ = ext.free_str(xpath_off, xpath_len);
                return Err(err);
            }
        };
        let pushed = push_desc::<RpcSubShm>(ext, anchor, |rec| {
            rec.cid = cid;
            rec.sub_id = sub_id;
            rec.priority = priority;
            rec.xpath_off = xpath_off;
            rec.xpath_len = xpath_len;
            rec.path_off = path_off;
            rec.path_len = path_len;
        });
        if pushed.is_err() {
            let _ = ext.free_str(xpath_off, xpath_len);
            let _ = ext.free_str(path_off, path_len);
        }
        pushed
    })
}

pub fn rpc_sub_del(
    ext: &mut ExtShm,
    anchor: &SubsAnchor,
    cid: Cid,
    sub_id: u32,
    timeout: Duration,
) -> Result<DelOutcome> {
    with_anchor(anchor, LockMode::Write, cid, timeout, || {
        remove_desc::<RpcSubShm>(ext, anchor, sub_id)
    })
}

pub fn collect_rpc_subs(
    ext: &mut ExtShm,
    anchor: &SubsAnchor,
    cid: Cid,
    timeout: Duration,
    is_alive: &dyn Fn(Cid) -> bool,
    path: &str,
) -> Result<CollectOutcome> {
    let wanted = path.to_string();
    collect_desc::<RpcSubShm>(ext, anchor, cid, timeout, is_alive, &move |rec, ext| {
        ext.str_at(rec.path_off, rec.path_len)
            .map(|p| p == wanted)
            .unwrap_or(false)
    })
}

/// Flips the atomic suspended flag of a descriptor. Returns `false` when the
/// flag already had the requested value.
pub fn set_suspended<T: SubDesc>(
    ext: &mut ExtShm,
    anchor: &SubsAnchor,
    cid: Cid,
    sub_id: u32,
    value: bool,
    timeout: Duration,
) -> Result<bool> {
    with_anchor(anchor, LockMode::Read, cid, timeout, || {
        let count = anchor.sub_count.load(Ordering::Acquire);
        let off = anchor.subs_off.load(Ordering::Acquire);
        let slice = ext.slice_at::<T>(off, count)?;
        for rec in slice {
            if rec.sub_id() == sub_id {
                let previous = rec.suspended().swap(value as u32, Ordering::AcqRel);
                return Ok(previous != value as u32);
            }
        }
        Err(Error::Internal(format!(
            "subscription {sub_id} missing from ext shm"
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap::MmapFile;

    struct Fixture {
        _dir: tempfile::TempDir,
        ext: ExtShm,
        // a standalone anchor region standing in for a module record
        anchor_map: MmapFile,
    }

    const T: Duration = Duration::from_millis(500);

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut ext =
            ExtShm::create_new(&dir.path().join("ext.shm"), T).unwrap();
        ext.set_cid(1);
        let anchor_map = MmapFile::create_new(
            &dir.path().join("anchor.shm"),
            std::mem::size_of::<SubsAnchor>(),
        )
        .unwrap();
        Fixture {
            _dir: dir,
            ext,
            anchor_map,
        }
    }

    impl Fixture {
        fn anchor(&self) -> &SubsAnchor {
            self.anchor_map.view(0).unwrap()
        }
    }

    #[test]
    fn add_find_del_round_trip() {
        let mut fx = fixture();
        let anchor = fx.anchor_map.view::<SubsAnchor>(0).unwrap();
        change_sub_add(&mut fx.ext, anchor, 1, 10, 5, 0, Some("/m:a"), T).unwrap();
        change_sub_add(&mut fx.ext, anchor, 1, 11, 7, 0, None, T).unwrap();
        assert_eq!(anchor.sub_count.load(Ordering::Acquire), 2);

        let out = collect_change_subs(&mut fx.ext, anchor, 1, T, &|_| true).unwrap();
        assert_eq!(out.live.len(), 2);
        assert_eq!(out.reclaimed, 0);
        let first = out.live.iter().find(|s| s.sub_id == 10).unwrap();
        assert_eq!(first.selector.as_deref(), Some("/m:a"));
        assert_eq!(first.priority, 5);

        let del = change_sub_del(&mut fx.ext, anchor, 1, 10, T).unwrap();
        assert!(del.found);
        assert!(!del.emptied);
        let del = change_sub_del(&mut fx.ext, anchor, 1, 11, T).unwrap();
        assert!(del.emptied);
        assert_eq!(anchor.subs_off.load(Ordering::Acquire), 0);

        let missing = change_sub_del(&mut fx.ext, anchor, 1, 99, T).unwrap();
        assert!(!missing.found);
    }

    #[test]
    fn dead_descriptors_are_reclaimed() {
        let mut fx = fixture();
        let anchor = fx.anchor_map.view::<SubsAnchor>(0).unwrap();
        change_sub_add(&mut fx.ext, anchor, 1, 1, 0, 0, None, T).unwrap();
        change_sub_add(&mut fx.ext, anchor, 2, 2, 0, 0, None, T).unwrap();
        change_sub_add(&mut fx.ext, anchor, 3, 3, 0, 0, None, T).unwrap();

        // connection 2 is dead
        let out = collect_change_subs(&mut fx.ext, anchor, 1, T, &|cid| cid != 2).unwrap();
        assert_eq!(out.reclaimed, 1);
        assert_eq!(out.live.len(), 2);
        assert_eq!(anchor.sub_count.load(Ordering::Acquire), 2);
        assert!(out.live.iter().all(|s| s.cid != 2));
    }

    #[test]
    fn suspended_flag_is_reported_not_removed() {
        let mut fx = fixture();
        let anchor = fx.anchor_map.view::<SubsAnchor>(0).unwrap();
        notif_sub_add(&mut fx.ext, anchor, 1, 5, None, T).unwrap();
        assert!(set_suspended::<NotifSubShm>(&mut fx.ext, anchor, 1, 5, true, T).unwrap());
        // second suspend is a no-op
        assert!(!set_suspended::<NotifSubShm>(&mut fx.ext, anchor, 1, 5, true, T).unwrap());

        let out = collect_notif_subs(&mut fx.ext, anchor, 1, T, &|_| true).unwrap();
        assert_eq!(out.live.len(), 1);
        assert!(out.live[0].suspended);
        assert_eq!(fx.anchor().sub_count.load(Ordering::Acquire), 1);
    }

    #[test]
    fn duplicate_oper_get_path_priority_rejected() {
        let mut fx = fixture();
        let anchor = fx.anchor_map.view::<SubsAnchor>(0).unwrap();
        oper_get_sub_add(&mut fx.ext, anchor, 1, 1, 3, 0, "/m:state", T).unwrap();
        let dup = oper_get_sub_add(&mut fx.ext, anchor, 1, 2, 3, 0, "/m:state", T);
        assert!(matches!(dup, Err(Error::Exists(_))));
        oper_get_sub_add(&mut fx.ext, anchor, 1, 3, 4, 0, "/m:state", T).unwrap();
    }

    #[test]
    fn rpc_collect_filters_by_path() {
        let mut fx = fixture();
        let anchor = fx.anchor_map.view::<SubsAnchor>(0).unwrap();
        rpc_sub_add(&mut fx.ext, anchor, 1, 1, 0, "/m:reset", "/m:reset", T).unwrap();
        rpc_sub_add(&mut fx.ext, anchor, 1, 2, 0, "/m:reboot", "/m:reboot", T).unwrap();
        let out = collect_rpc_subs(&mut fx.ext, anchor, 1, T, &|_| true, "/m:reset").unwrap();
        assert_eq!(out.live.len(), 1);
        assert_eq!(out.live[0].sub_id, 1);
    }
}
