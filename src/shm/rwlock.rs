//! Process-shared reader-writer lock.
//!
//! The lock is a `#[repr(C)]` block of atomics that lives either inside a
//! shared-memory region or in process-local memory (the SUBS lock uses the
//! same kernel). Four states: UNLOCKED, READ (many holders), READ-UPGRADE
//! (one upgradable reader coexisting with readers) and WRITE (exclusive).
//!
//! Holders are identified by connection id so stale holders of a crashed
//! process can be force-released by `recover`. Reader holders occupy cid
//! slots; the single upgrade claim and the writer are dedicated words.
//!
//! `relock` transitions between any two of READ / READ-UPGRADE / WRITE. It
//! can fail with `Timeout` **without releasing the caller's current mode**;
//! every caller must re-check which mode it actually holds afterwards.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::{wait, Error, Result};

/// Number of concurrent reader slots. Connections beyond this wait for a
/// free slot; the same cid may occupy several slots (one per thread).
pub const READER_SLOTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    None,
    Read,
    ReadUpgr,
    Write,
}

/// Lock classes in global acquisition order. The order checker (debug
/// builds) asserts that no thread acquires a class lower or equal to one it
/// already holds: SUBS -> per-object ext lock -> ext allocator -> mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockClass {
    Subs = 0,
    ExtObject = 1,
    ExtAlloc = 2,
    Mailbox = 3,
}

#[repr(C)]
pub struct RwLock {
    /// Futex word bumped on every state transition that can unblock waiters.
    seq: AtomicU32,
    /// Cid of the WRITE holder, 0 when unlocked.
    writer: AtomicU32,
    /// Cid of the READ-UPGRADE claim holder, 0 when free.
    upgr: AtomicU32,
    /// Cids of READ holders (0 = free slot).
    readers: [AtomicU32; READER_SLOTS],
}

impl RwLock {
    /// Zero state is the unlocked state, so freshly mapped (zero-filled)
    /// shared memory needs no initialization call.
    pub const fn new() -> Self {
        const FREE: AtomicU32 = AtomicU32::new(0);
        RwLock {
            seq: AtomicU32::new(0),
            writer: AtomicU32::new(0),
            upgr: AtomicU32::new(0),
            readers: [FREE; READER_SLOTS],
        }
    }

    pub fn lock(&self, mode: LockMode, timeout: Duration, cid: u32, class: LockClass) -> Result<LockToken> {
        debug_assert!(cid != 0);
        let deadline = Instant::now() + timeout;
        match mode {
            LockMode::Read => self.lock_read(deadline, cid)?,
            LockMode::ReadUpgr => self.lock_read_upgr(deadline, cid)?,
            LockMode::Write => self.lock_write(deadline, cid)?,
            LockMode::None => return Err(Error::Internal("cannot lock in mode NONE".into())),
        }
        Ok(order::enter(class))
    }

    /// Releases the lock held in `mode`. Inconsistencies (releasing a mode
    /// that is not held) are logged and otherwise ignored so that cleanup
    /// paths always make progress.
    pub fn unlock(&self, mode: LockMode, cid: u32) {
        match mode {
            LockMode::Read => {
                if !self.clear_reader(cid) {
                    log::warn!("rwlock: no READ slot held by cid {cid} on unlock");
                }
            }
            LockMode::ReadUpgr => {
                self.clear_upgr(cid);
                if !self.clear_reader(cid) {
                    log::warn!("rwlock: no READ slot held by cid {cid} on unlock");
                }
            }
            LockMode::Write => {
                self.clear_upgr(cid);
                if self
                    .writer
                    .compare_exchange(cid, 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    log::warn!("rwlock: WRITE not held by cid {cid} on unlock");
                }
            }
            LockMode::None => {}
        }
        self.bump();
    }

    /// Atomic transition between two of {READ, READ-UPGRADE, WRITE}.
    ///
    /// On `Timeout` the caller still holds `from`, untouched. Callers must
    /// re-check their mode variable after every relock.
    pub fn relock(&self, from: LockMode, to: LockMode, timeout: Duration, cid: u32) -> Result<()> {
        let deadline = Instant::now() + timeout;
        match (from, to) {
            (LockMode::Read, LockMode::ReadUpgr) => self.claim_upgr(deadline, cid),
            (LockMode::ReadUpgr, LockMode::Read) => {
                self.clear_upgr(cid);
                self.bump();
                Ok(())
            }
            (LockMode::ReadUpgr, LockMode::Write) => self.upgrade_to_write(deadline, cid),
            (LockMode::Write, LockMode::ReadUpgr) => {
                // the upgrade claim is kept (or taken) so a later upgrade of
                // this holder cannot be starved by another claimant
                self.upgr.store(cid, Ordering::Release);
                self.set_reader(deadline, cid)?;
                self.writer.store(0, Ordering::Release);
                self.bump();
                Ok(())
            }
            (LockMode::Write, LockMode::Read) => {
                self.set_reader(deadline, cid)?;
                self.clear_upgr(cid);
                self.writer.store(0, Ordering::Release);
                self.bump();
                Ok(())
            }
            (LockMode::Read, LockMode::Write) => {
                self.claim_upgr(deadline, cid)?;
                match self.upgrade_to_write(deadline, cid) {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        // roll back to plain READ
                        self.clear_upgr(cid);
                        self.bump();
                        Err(err)
                    }
                }
            }
            _ => Err(Error::Internal(format!("invalid relock {from:?} -> {to:?}"))),
        }
    }

    /// Force-releases every holding whose owner is dead. Used by descriptor
    /// walkers to reclaim locks of crashed connections.
    pub fn recover(&self, mut is_alive: impl FnMut(u32) -> bool) {
        let writer = self.writer.load(Ordering::Acquire);
        if writer != 0 && !is_alive(writer) {
            log::warn!("rwlock: recovering WRITE held by dead cid {writer}");
            let _ = self
                .writer
                .compare_exchange(writer, 0, Ordering::AcqRel, Ordering::Acquire);
        }
        let upgr = self.upgr.load(Ordering::Acquire);
        if upgr != 0 && !is_alive(upgr) {
            log::warn!("rwlock: recovering READ-UPGR claim of dead cid {upgr}");
            let _ = self
                .upgr
                .compare_exchange(upgr, 0, Ordering::AcqRel, Ordering::Acquire);
        }
        for slot in &self.readers {
            let holder = slot.load(Ordering::Acquire);
            if holder != 0 && !is_alive(holder) {
                log::warn!("rwlock: recovering READ slot of dead cid {holder}");
                let _ = slot.compare_exchange(holder, 0, Ordering::AcqRel, Ordering::Acquire);
            }
        }
        self.bump();
    }

    fn lock_read(&self, deadline: Instant, cid: u32) -> Result<()> {
        loop {
            let seq = self.seq.load(Ordering::Acquire);
            if self.writer.load(Ordering::Acquire) == 0 {
                if self.try_set_reader(cid) {
                    if self.writer.load(Ordering::Acquire) == 0 {
                        return Ok(());
                    }
                    // a writer slipped in between the check and the slot
                    self.clear_reader(cid);
                    self.bump();
                }
            }
            self.wait(seq, deadline, "READ")?;
        }
    }

    fn lock_read_upgr(&self, deadline: Instant, cid: u32) -> Result<()> {
        loop {
            let seq = self.seq.load(Ordering::Acquire);
            if self.writer.load(Ordering::Acquire) == 0
                && self
                    .upgr
                    .compare_exchange(0, cid, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                if self.try_set_reader(cid) {
                    if self.writer.load(Ordering::Acquire) == 0 {
                        return Ok(());
                    }
                    self.clear_reader(cid);
                }
                self.clear_upgr(cid);
                self.bump();
            }
            self.wait(seq, deadline, "READ-UPGR")?;
        }
    }

    fn lock_write(&self, deadline: Instant, cid: u32) -> Result<()> {
        // claim the writer word first: new readers are shut out while we
        // drain the existing ones
        loop {
            let seq = self.seq.load(Ordering::Acquire);
            if self.upgr.load(Ordering::Acquire) == 0
                && self
                    .writer
                    .compare_exchange(0, cid, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                break;
            }
            self.wait(seq, deadline, "WRITE")?;
        }
        match self.drain_readers(deadline, 0) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.writer.store(0, Ordering::Release);
                self.bump();
                Err(err)
            }
        }
    }

    fn upgrade_to_write(&self, deadline: Instant, cid: u32) -> Result<()> {
        debug_assert_eq!(self.upgr.load(Ordering::Acquire), cid);
        loop {
            let seq = self.seq.load(Ordering::Acquire);
            if self
                .writer
                .compare_exchange(0, cid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
            self.wait(seq, deadline, "WRITE upgrade")?;
        }
        // wait until we are the only reader left, then drop our slot
        match self.drain_readers(deadline, 1) {
            Ok(()) => {
                self.clear_reader(cid);
                self.bump();
                Ok(())
            }
            Err(err) => {
                self.writer.store(0, Ordering::Release);
                self.bump();
                Err(err)
            }
        }
    }

    fn drain_readers(&self, deadline: Instant, allowed: usize) -> Result<()> {
        loop {
            let seq = self.seq.load(Ordering::Acquire);
            let held = self
                .readers
                .iter()
                .filter(|slot| slot.load(Ordering::Acquire) != 0)
                .count();
            if held <= allowed {
                return Ok(());
            }
            self.wait(seq, deadline, "reader drain")?;
        }
    }

    fn claim_upgr(&self, deadline: Instant, cid: u32) -> Result<()> {
        loop {
            let seq = self.seq.load(Ordering::Acquire);
            if self
                .upgr
                .compare_exchange(0, cid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
            self.wait(seq, deadline, "READ-UPGR claim")?;
        }
    }

    fn try_set_reader(&self, cid: u32) -> bool {
        for slot in &self.readers {
            if slot
                .compare_exchange(0, cid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    fn set_reader(&self, deadline: Instant, cid: u32) -> Result<()> {
        loop {
            let seq = self.seq.load(Ordering::Acquire);
            if self.try_set_reader(cid) {
                return Ok(());
            }
            self.wait(seq, deadline, "reader slot")?;
        }
    }

    fn clear_reader(&self, cid: u32) -> bool {
        for slot in &self.readers {
            if slot
                .compare_exchange(cid, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.bump();
                return true;
            }
        }
        false
    }

    fn clear_upgr(&self, cid: u32) {
        let _ = self
            .upgr
            .compare_exchange(cid, 0, Ordering::AcqRel, Ordering::Acquire);
    }

    fn bump(&self) {
        self.seq.fetch_add(1, Ordering::AcqRel);
        let _ = wait::wake_all(&self.seq);
    }

    fn wait(&self, seen_seq: u32, deadline: Instant, what: &str) -> Result<()> {
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout(format!("rwlock {what} timed out")));
        }
        wait::wait_u32(&self.seq, seen_seq, Some(deadline - now))
    }
}

impl Default for RwLock {
    fn default() -> Self {
        RwLock::new()
    }
}

/// Token proving lock-order conformance; drop order does not matter, the
/// checker tracks held classes per thread.
pub struct LockToken {
    class: LockClass,
}

impl Drop for LockToken {
    fn drop(&mut self) {
        order::leave(self.class);
    }
}

/// Thread-local lock-order checker, active in debug builds. Acquiring a
/// class lower than one already held panics, which is how the test suite
/// enforces the SUBS -> ext object -> allocator -> mailbox order.
mod order {
    use super::{LockClass, LockToken};
    use std::cell::RefCell;

    thread_local! {
        static HELD: RefCell<Vec<LockClass>> = const { RefCell::new(Vec::new()) };
    }

    pub(super) fn enter(class: LockClass) -> LockToken {
        if cfg!(debug_assertions) {
            HELD.with(|held| {
                let mut held = held.borrow_mut();
                if let Some(&top) = held.last() {
                    assert!(
                        class >= top,
                        "lock order violation: acquiring {class:?} while holding {top:?}"
                    );
                }
                held.push(class);
            });
        }
        LockToken { class }
    }

    pub(super) fn leave(class: LockClass) {
        if cfg!(debug_assertions) {
            HELD.with(|held| {
                let mut held = held.borrow_mut();
                if let Some(pos) = held.iter().rposition(|&c| c == class) {
                    held.remove(pos);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const T: Duration = Duration::from_millis(200);

    #[test]
    fn read_is_shared_write_is_exclusive() {
        let lock = RwLock::new();
        let a = lock.lock(LockMode::Read, T, 1, LockClass::Subs).unwrap();
        let b = lock.lock(LockMode::Read, T, 2, LockClass::Subs).unwrap();
        assert!(matches!(
            lock.lock(LockMode::Write, Duration::from_millis(30), 3, LockClass::Subs),
            Err(Error::Timeout(_))
        ));
        lock.unlock(LockMode::Read, 1);
        drop(a);
        lock.unlock(LockMode::Read, 2);
        drop(b);
        let w = lock.lock(LockMode::Write, T, 3, LockClass::Subs).unwrap();
        lock.unlock(LockMode::Write, 3);
        drop(w);
    }

    #[test]
    fn single_upgrade_claim() {
        let lock = RwLock::new();
        let a = lock.lock(LockMode::ReadUpgr, T, 1, LockClass::Subs).unwrap();
        assert!(matches!(
            lock.lock(LockMode::ReadUpgr, Duration::from_millis(30), 2, LockClass::Subs),
            Err(Error::Timeout(_))
        ));
        // plain readers still get in
        let b = lock.lock(LockMode::Read, T, 2, LockClass::Subs).unwrap();
        lock.unlock(LockMode::Read, 2);
        drop(b);
        lock.unlock(LockMode::ReadUpgr, 1);
        drop(a);
    }

    #[test]
    fn relock_upgrade_fails_while_reader_held_and_keeps_mode() {
        let lock = Arc::new(RwLock::new());
        let _u = lock.lock(LockMode::ReadUpgr, T, 1, LockClass::Subs).unwrap();
        let _r = lock.lock(LockMode::Read, T, 2, LockClass::Subs).unwrap();

        // reader 2 blocks the upgrade; the claim must survive the failure
        let err = lock.relock(LockMode::ReadUpgr, LockMode::Write, Duration::from_millis(30), 1);
        assert!(matches!(err, Err(Error::Timeout(_))));

        lock.unlock(LockMode::Read, 2);
        lock.relock(LockMode::ReadUpgr, LockMode::Write, T, 1).unwrap();
        lock.relock(LockMode::Write, LockMode::ReadUpgr, T, 1).unwrap();
        lock.unlock(LockMode::ReadUpgr, 1);
    }

    #[test]
    fn write_blocks_until_readers_drain() {
        let lock = Arc::new(RwLock::new());
        let held = lock.lock(LockMode::Read, T, 1, LockClass::Subs).unwrap();

        let contender = Arc::clone(&lock);
        let handle = std::thread::spawn(move || {
            let token = contender
                .lock(LockMode::Write, Duration::from_secs(2), 2, LockClass::Subs)
                .unwrap();
            contender.unlock(LockMode::Write, 2);
            drop(token);
        });

        std::thread::sleep(Duration::from_millis(30));
        lock.unlock(LockMode::Read, 1);
        drop(held);
        handle.join().unwrap();
    }

    #[test]
    fn recover_clears_dead_holders() {
        let lock = RwLock::new();
        let token = lock.lock(LockMode::Write, T, 9, LockClass::Subs).unwrap();
        drop(token);
        // cid 9 "died" without unlocking
        lock.recover(|cid| cid != 9);
        let w = lock.lock(LockMode::Write, T, 1, LockClass::Subs).unwrap();
        lock.unlock(LockMode::Write, 1);
        drop(w);
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    fn order_checker_rejects_inversion() {
        let outer = RwLock::new();
        let inner = RwLock::new();
        let _m = inner.lock(LockMode::Read, T, 1, LockClass::Mailbox).unwrap();
        let _s = outer.lock(LockMode::Read, T, 1, LockClass::Subs).unwrap();
    }
}
