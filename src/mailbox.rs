//! Per-subscription shared-memory mailbox.
//!
//! One page per subscription group, used as a bounded event channel between
//! producers and the subscriber listeners of every connected process. The
//! header carries the event state machine; the rest of the page is the
//! inline payload area.
//!
//! Protocol: a producer takes the internal lock (class `Mailbox`, always
//! last in the global order), writes payload and counters and finally the
//! `(event, request_id)` pair, then waits on the `replied` word. Listeners
//! poll `(event, request_id, priority)`, process their local subscribers
//! and fold an aggregate reply back: `replied` accounts every handled
//! subscriber, `failed` the non-successes, `err_code` the first error. The
//! pair evolves monotonically; a consumer that has already served a request
//! id ignores stale rewrites.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::liveness::Cid;
use crate::mmap::MmapFile;
use crate::paths::{MailboxTag, ShmLayout};
use crate::shm::rwlock::{LockClass, LockMode, RwLock};
use crate::{wait, Error, ErrorCode, Result};

pub const MAILBOX_SIZE: usize = 4096;
pub const MAILBOX_MAGIC: u32 = 0x5942_5331; // "YBS1"

/// Event tag stored in the mailbox word. The synthetic IGNORED / TERMINATED
/// signals never appear here; they exist only as callback-side
/// notifications.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    None = 0,
    Update = 1,
    Change = 2,
    Done = 3,
    Abort = 4,
    Oper = 5,
    Rpc = 6,
    Notif = 7,
}

impl EventKind {
    pub fn from_u32(value: u32) -> EventKind {
        match value {
            1 => EventKind::Update,
            2 => EventKind::Change,
            3 => EventKind::Done,
            4 => EventKind::Abort,
            5 => EventKind::Oper,
            6 => EventKind::Rpc,
            7 => EventKind::Notif,
            _ => EventKind::None,
        }
    }
}

#[repr(C)]
struct MailboxHdr {
    magic: AtomicU32,
    init_state: AtomicU32,
    event: AtomicU32,
    request_id: AtomicU32,
    /// Priority bucket currently being served.
    priority: AtomicU32,
    /// Subscribers expected to account for this delivery.
    expected: AtomicU32,
    /// Subscribers accounted so far (successes + failures).
    replied: AtomicU32,
    failed: AtomicU32,
    err_code: AtomicU32,
    /// Producer connection of the in-flight event.
    orig_cid: AtomicU32,
    data_len: AtomicU32,
    _pad: u32,
    lock: RwLock,
}

const HDR_SIZE: usize = std::mem::size_of::<MailboxHdr>();
pub const MAX_PAYLOAD: usize = MAILBOX_SIZE - HDR_SIZE;

/// Snapshot of the in-flight event, taken without the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSnapshot {
    pub event: EventKind,
    pub request_id: u32,
    pub priority: u32,
    pub expected: u32,
}

/// Aggregate outcome of one delivery, read back by the producer.
#[derive(Debug)]
pub struct DeliveryOutcome {
    pub code: ErrorCode,
    pub succeeded: u32,
    pub failed: u32,
    pub payload: Vec<u8>,
}

pub struct Mailbox {
    _map: MmapFile,
    base: *mut u8,
    path: PathBuf,
    lock_timeout: Duration,
}

// The mailbox page is only mutated under its internal process-shared lock.
unsafe impl Send for Mailbox {}
unsafe impl Sync for Mailbox {}

impl Mailbox {
    /// Opens (creating if needed) the mailbox for `(module, tag, hash)`.
    pub fn open_map(
        layout: &ShmLayout,
        module: &str,
        tag: MailboxTag,
        hash: Option<u32>,
        lock_timeout: Duration,
    ) -> Result<Mailbox> {
        let path = layout.mailbox(module, tag, hash)?;
        std::fs::create_dir_all(layout.subscriptions_dir())?;
        let map = match MmapFile::create_new(&path, MAILBOX_SIZE) {
            Ok(map) => {
                let mailbox = Self::from_map(map, path, lock_timeout)?;
                let hdr = mailbox.hdr();
                hdr.magic.store(MAILBOX_MAGIC, Ordering::Relaxed);
                hdr.init_state.store(2, Ordering::Release);
                return Ok(mailbox);
            }
            Err(Error::Exists(_)) => MmapFile::open(&path)?,
            Err(err) => return Err(err),
        };
        let mailbox = Self::from_map(map, path, lock_timeout)?;
        let deadline = Instant::now() + Duration::from_secs(5);
        while mailbox.hdr().init_state.load(Ordering::Acquire) != 2 {
            if Instant::now() >= deadline {
                return Err(Error::Timeout("mailbox never became ready".into()));
            }
            std::thread::yield_now();
        }
        if mailbox.hdr().magic.load(Ordering::Acquire) != MAILBOX_MAGIC {
            return Err(Error::Internal("mailbox magic mismatch".into()));
        }
        Ok(mailbox)
    }

    fn from_map(mut map: MmapFile, path: PathBuf, lock_timeout: Duration) -> Result<Mailbox> {
        if map.len() < MAILBOX_SIZE {
            return Err(Error::Internal("mailbox region too small".into()));
        }
        let base = map.bytes_mut(0, MAILBOX_SIZE)?.as_mut_ptr();
        Ok(Mailbox {
            _map: map,
            base,
            path,
            lock_timeout,
        })
    }

    fn hdr(&self) -> &MailboxHdr {
        unsafe { &*(self.base as *const MailboxHdr) }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Removes the mailbox file; called when the last descriptor using it is
    /// gone (under the owning anchor's WRITE lock).
    pub fn unlink(&self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!("unlinking mailbox {}: {err}", self.path.display());
            }
        }
    }

    /// Next request id for a fresh delivery; monotonic per mailbox.
    pub fn next_request_id(&self) -> u32 {
        self.hdr().request_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn snapshot(&self) -> EventSnapshot {
        let hdr = self.hdr();
        EventSnapshot {
            event: EventKind::from_u32(hdr.event.load(Ordering::Acquire)),
            request_id: hdr.request_id.load(Ordering::Acquire),
            priority: hdr.priority.load(Ordering::Acquire),
            expected: hdr.expected.load(Ordering::Acquire),
        }
    }

    /// Whether an event is currently in flight.
    pub fn in_flight(&self) -> Option<(EventKind, u32)> {
        let snap = self.snapshot();
        match snap.event {
            EventKind::None => None,
            event => Some((event, snap.request_id)),
        }
    }

    /// Publishes one delivery. `request_id` must come from
    /// `next_request_id` (one id spans all phases of a commit). Blocks while
    /// another producer's event is still in flight.
    pub fn publish(
        &self,
        cid: Cid,
        event: EventKind,
        request_id: u32,
        priority: u32,
        expected: u32,
        payload: &[u8],
    ) -> Result<()> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::NoMemory(format!(
                "event payload of {} bytes exceeds the mailbox capacity",
                payload.len()
            )));
        }
        self.wait_idle(request_id)?;
        let hdr = self.hdr();
        let token = hdr
            .lock
            .lock(LockMode::Write, self.lock_timeout, cid, LockClass::Mailbox)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                self.base.add(HDR_SIZE),
                payload.len(),
            );
        }
        hdr.data_len.store(payload.len() as u32, Ordering::Release);
        hdr.priority.store(priority, Ordering::Release);
        hdr.expected.store(expected, Ordering::Release);
        hdr.replied.store(0, Ordering::Release);
        hdr.failed.store(0, Ordering::Release);
        hdr.err_code.store(ErrorCode::Ok.as_u32(), Ordering::Release);
        hdr.orig_cid.store(cid, Ordering::Release);
        hdr.request_id.store(request_id, Ordering::Release);
        hdr.event.store(event as u32, Ordering::Release);
        hdr.lock.unlock(LockMode::Write, cid);
        drop(token);
        let _ = wait::wake_all(&hdr.event);
        Ok(())
    }

    /// Waits until every expected subscriber has accounted for the event,
    /// then reads the aggregate outcome. The event word is left in place;
    /// the producer clears it with `finish`.
    pub fn await_replies(&self, cid: Cid, timeout: Duration) -> Result<DeliveryOutcome> {
        let hdr = self.hdr();
        let expected = hdr.expected.load(Ordering::Acquire);
        let deadline = Instant::now() + timeout;
        loop {
            let replied = hdr.replied.load(Ordering::Acquire);
            if replied >= expected {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(format!(
                    "event replies missing ({replied}/{expected})"
                )));
            }
            let chunk = (deadline - now).min(Duration::from_millis(50));
            wait::wait_u32(&hdr.replied, replied, Some(chunk))?;
        }
        let token = hdr
            .lock
            .lock(LockMode::Read, self.lock_timeout, cid, LockClass::Mailbox)?;
        let failed = hdr.failed.load(Ordering::Acquire);
        let replied = hdr.replied.load(Ordering::Acquire);
        let code = ErrorCode::from_u32(hdr.err_code.load(Ordering::Acquire));
        let payload = self.payload_copy();
        hdr.lock.unlock(LockMode::Read, cid);
        drop(token);
        Ok(DeliveryOutcome {
            code,
            succeeded: replied.saturating_sub(failed),
            failed,
            payload,
        })
    }

    /// Clears the event word after a completed delivery.
    pub fn finish(&self, cid: Cid) -> Result<()> {
        let hdr = self.hdr();
        let token = hdr
            .lock
            .lock(LockMode::Write, self.lock_timeout, cid, LockClass::Mailbox)?;
        hdr.event.store(EventKind::None as u32, Ordering::Release);
        hdr.lock.unlock(LockMode::Write, cid);
        drop(token);
        let _ = wait::wake_all(&hdr.event);
        Ok(())
    }

    /// Copies the in-flight payload out (listener side).
    pub fn read_payload(&self, cid: Cid) -> Result<Vec<u8>> {
        let hdr = self.hdr();
        let token = hdr
            .lock
            .lock(LockMode::Read, self.lock_timeout, cid, LockClass::Mailbox)?;
        let payload = self.payload_copy();
        hdr.lock.unlock(LockMode::Read, cid);
        drop(token);
        Ok(payload)
    }

    /// Folds a listener's aggregate reply into the event: `succeeded` and
    /// `failed` local subscribers, the first error code, and optionally a
    /// reply payload (edited diff for UPDATE, output for RPC / oper-get).
    pub fn reply(
        &self,
        cid: Cid,
        succeeded: u32,
        failed: u32,
        code: ErrorCode,
        payload: Option<&[u8]>,
    ) -> Result<()> {
        let hdr = self.hdr();
        let token = hdr
            .lock
            .lock(LockMode::Write, self.lock_timeout, cid, LockClass::Mailbox)?;
        if let Some(payload) = payload {
            if payload.len() > MAX_PAYLOAD {
                hdr.lock.unlock(LockMode::Write, cid);
                drop(token);
                return Err(Error::NoMemory(format!(
                    "reply payload of {} bytes exceeds the mailbox capacity",
                    payload.len()
                )));
            }
            unsafe {
                std::ptr::copy_nonoverlapping(
                    payload.as_ptr(),
                    self.base.add(HDR_SIZE),
                    payload.len(),
                );
            }
            hdr.data_len.store(payload.len() as u32, Ordering::Release);
        }
        if code != ErrorCode::Ok {
            let _ = hdr.err_code.compare_exchange(
                ErrorCode::Ok.as_u32(),
                code.as_u32(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        if failed > 0 {
            hdr.failed.fetch_add(failed, Ordering::AcqRel);
        }
        hdr.replied.fetch_add(succeeded + failed, Ordering::AcqRel);
        hdr.lock.unlock(LockMode::Write, cid);
        drop(token);
        let _ = wait::wake_all(&hdr.replied);
        Ok(())
    }

    /// Accounts subscribers that will never process the event (unsubscribe
    /// while in flight, dead-connection recovery). Logged, never an error.
    pub fn reply_ignored(&self, cid: Cid, count: u32, who: &str) {
        if count == 0 {
            return;
        }
        log::debug!("marking event ignored for {count} subscriber(s) of {who}");
        if let Err(err) = self.reply(cid, 0, count, ErrorCode::Ok, None) {
            log::warn!("writing ignored reply for {who}: {err}");
        }
    }

    /// Waits until no foreign event is in flight. Events of our own commit
    /// (same request id) do not block: phases of one commit reuse the slot.
    fn wait_idle(&self, request_id: u32) -> Result<()> {
        let hdr = self.hdr();
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            let event = hdr.event.load(Ordering::Acquire);
            if event == EventKind::None as u32
                || hdr.request_id.load(Ordering::Acquire) == request_id
            {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout("mailbox busy with another event".into()));
            }
            let chunk = (deadline - now).min(Duration::from_millis(50));
            wait::wait_u32(&hdr.event, event, Some(chunk))?;
        }
    }

    fn payload_copy(&self) -> Vec<u8> {
        let len = (self.hdr().data_len.load(Ordering::Acquire) as usize).min(MAX_PAYLOAD);
        let mut buf = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.add(HDR_SIZE), buf.as_mut_ptr(), len);
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn mailbox() -> (tempfile::TempDir, Arc<Mailbox>) {
        let dir = tempfile::tempdir().unwrap();
        let layout = ShmLayout::new(dir.path());
        layout.ensure_dirs().unwrap();
        let mailbox = Mailbox::open_map(
            &layout,
            "mod",
            MailboxTag::Running,
            None,
            Duration::from_secs(1),
        )
        .unwrap();
        (dir, Arc::new(mailbox))
    }

    #[test]
    fn header_fits_a_page() {
        assert!(HDR_SIZE < MAILBOX_SIZE / 4);
        assert!(MAX_PAYLOAD > 3000);
    }

    #[test]
    fn publish_reply_round_trip() {
        let (_dir, mailbox) = mailbox();
        let rid = mailbox.next_request_id();
        mailbox
            .publish(1, EventKind::Change, rid, 10, 2, b"diff")
            .unwrap();

        let snap = mailbox.snapshot();
        assert_eq!(snap.event, EventKind::Change);
        assert_eq!(snap.request_id, rid);
        assert_eq!(snap.priority, 10);
        assert_eq!(mailbox.read_payload(2).unwrap(), b"diff");

        mailbox.reply(2, 1, 0, ErrorCode::Ok, None).unwrap();
        mailbox.reply(3, 1, 0, ErrorCode::Ok, None).unwrap();
        let outcome = mailbox.await_replies(1, Duration::from_secs(1)).unwrap();
        assert_eq!(outcome.code, ErrorCode::Ok);
        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.failed, 0);
        mailbox.finish(1).unwrap();
        assert!(mailbox.in_flight().is_none());
    }

    #[test]
    fn first_error_code_wins() {
        let (_dir, mailbox) = mailbox();
        let rid = mailbox.next_request_id();
        mailbox
            .publish(1, EventKind::Rpc, rid, 0, 3, b"input")
            .unwrap();
        mailbox.reply(2, 1, 0, ErrorCode::Ok, None).unwrap();
        mailbox
            .reply(2, 0, 1, ErrorCode::OperationFailed, None)
            .unwrap();
        mailbox.reply(3, 0, 1, ErrorCode::Internal, None).unwrap();
        let outcome = mailbox.await_replies(1, Duration::from_secs(1)).unwrap();
        assert_eq!(outcome.code, ErrorCode::OperationFailed);
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.failed, 2);
    }

    #[test]
    fn await_times_out_without_replies() {
        let (_dir, mailbox) = mailbox();
        let rid = mailbox.next_request_id();
        mailbox
            .publish(1, EventKind::Notif, rid, 0, 1, b"n")
            .unwrap();
        let err = mailbox.await_replies(1, Duration::from_millis(40));
        assert!(matches!(err, Err(Error::Timeout(_))));
    }

    #[test]
    fn request_ids_are_monotonic_across_openers() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ShmLayout::new(dir.path());
        layout.ensure_dirs().unwrap();
        let t = Duration::from_secs(1);
        let a = Mailbox::open_map(&layout, "m", MailboxTag::Notif, None, t).unwrap();
        let b = Mailbox::open_map(&layout, "m", MailboxTag::Notif, None, t).unwrap();
        let r1 = a.next_request_id();
        let r2 = b.next_request_id();
        let r3 = a.next_request_id();
        assert!(r2 > r1);
        assert!(r3 > r2);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let (_dir, mailbox) = mailbox();
        let rid = mailbox.next_request_id();
        let big = vec![0u8; MAX_PAYLOAD + 1];
        assert!(matches!(
            mailbox.publish(1, EventKind::Change, rid, 0, 1, &big),
            Err(Error::NoMemory(_))
        ));
    }

    #[test]
    fn reply_payload_flows_back() {
        let (_dir, mailbox) = mailbox();
        let rid = mailbox.next_request_id();
        mailbox
            .publish(1, EventKind::Update, rid, 5, 1, b"old-diff")
            .unwrap();
        mailbox
            .reply(2, 1, 0, ErrorCode::Ok, Some(b"edited-diff"))
            .unwrap();
        let outcome = mailbox.await_replies(1, Duration::from_secs(1)).unwrap();
        assert_eq!(outcome.payload, b"edited-diff");
    }
}
