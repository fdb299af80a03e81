//! The subscription registry: per-client aggregate of every active
//! subscription, grouped by kind and module (or RPC path), protected by the
//! SUBS lock.
//!
//! Additions require SUBS WRITE, removals READ-UPGRADE or WRITE, lookups any
//! mode; the mode-checked guard makes a mutation without WRITE impossible to
//! express. Every subscription is mirrored into ext SHM before the local
//! bookkeeping is created, and the mirror is rolled back if the local step
//! fails, so the two sides never diverge (except transiently during
//! dead-connection recovery).
//!
//! Removal follows the relock protocol: briefly upgrade to WRITE, drain an
//! in-flight mailbox event with an "ignored" reply, downgrade for the
//! synthetic terminal callback (notifications), upgrade again to finalize.
//! Relock can time out without changing the held mode, so the current mode
//! is re-read after every step.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use crate::housekeeper;
use crate::liveness::Cid;
use crate::mailbox::{EventKind, EventSnapshot, Mailbox};
use crate::paths::{path_hash, MailboxTag};
use crate::schema::{self, OperGetKind};
use crate::session::{Datastore, Session};
use crate::shm::dir;
use crate::shm::ext::{ChangeSubShm, NotifSubShm, OperGetSubShm, OperPollSubShm, RpcSubShm};
use crate::shm::rwlock::{LockClass, LockMode, LockToken, RwLock};
use crate::{Error, Result};

pub type SubId = u32;

/// Subscription option flags, stored as a plain u32 in ext SHM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubOpts(pub u32);

impl SubOpts {
    pub const NONE: SubOpts = SubOpts(0);
    /// Subscriber wants the UPDATE phase and may extend the diff.
    pub const UPDATE: SubOpts = SubOpts(0x1);
    /// Subscriber is only interested in DONE events.
    pub const DONE_ONLY: SubOpts = SubOpts(0x2);
    /// Oper-poll subscriber also wants diffs between refreshes.
    pub const OPER_POLL_DIFF: SubOpts = SubOpts(0x4);

    pub fn contains(self, other: SubOpts) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for SubOpts {
    type Output = SubOpts;
    fn bitor(self, rhs: SubOpts) -> SubOpts {
        SubOpts(self.0 | rhs.0)
    }
}

/// Phase of a change commit handed to change callbacks.
#[derive(Debug, Clone, Copy)]
pub enum ChangeEvent<'a> {
    Update { diff: &'a [u8] },
    Change { diff: &'a [u8] },
    Done,
    Abort,
}

/// Notification type handed to notification callbacks. Only `Realtime`
/// carries data; the rest are synthetic signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifType {
    Realtime,
    Terminated,
    Suspended,
    Resumed,
}

/// RPC event handed to tree-flavoured RPC callbacks.
#[derive(Debug, Clone, Copy)]
pub enum RpcEvent<'a> {
    Rpc { input: &'a [u8] },
    Abort,
}

/// RPC event handed to value-flavoured RPC callbacks, input decoded.
#[derive(Debug, Clone, Copy)]
pub enum RpcValsEvent<'a> {
    Rpc { input: &'a [PathValue] },
    Abort,
}

/// A `(path, value)` pair of the value-flavoured callback payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathValue {
    pub xpath: String,
    pub value: Vec<u8>,
}

/// Change callback: `(session, sub id, module, xpath, event, request id)`.
/// For UPDATE events the returned payload replaces the diff; for every
/// other event the return payload is ignored.
pub type ChangeCallback = Box<
    dyn Fn(&Session, SubId, &str, Option<&str>, ChangeEvent<'_>, u32) -> Result<Option<Vec<u8>>>
        + Send
        + Sync,
>;

/// Operational get callback: produces the data for the requested path.
pub type OperGetCallback =
    Box<dyn Fn(&Session, SubId, &str, &str, u32) -> Result<Vec<u8>> + Send + Sync>;

/// Notification callback, in the value or tree flavour.
pub enum NotifCallback {
    Values(
        Box<dyn Fn(&Session, SubId, NotifType, Option<&str>, &[PathValue], SystemTime) + Send + Sync>,
    ),
    Tree(Box<dyn Fn(&Session, SubId, NotifType, Option<&str>, &[u8], SystemTime) + Send + Sync>),
}

/// RPC callback, in the value or tree flavour; returns the RPC output.
pub enum RpcCallback {
    Values(
        Box<
            dyn Fn(&Session, SubId, &str, RpcValsEvent<'_>, u32) -> Result<Vec<PathValue>>
                + Send
                + Sync,
        >,
    ),
    Tree(Box<dyn Fn(&Session, SubId, &str, RpcEvent<'_>, u32) -> Result<Vec<u8>> + Send + Sync>),
}

/// Last `(request id, event, priority)` tuple a listener served for a
/// mailbox; stale rewrites of the same tuple are ignored.
pub(crate) struct Seen {
    rid: AtomicU32,
    ev: AtomicU32,
    prio: AtomicU32,
}

impl Seen {
    fn new() -> Seen {
        Seen {
            rid: AtomicU32::new(0),
            ev: AtomicU32::new(0),
            prio: AtomicU32::new(0),
        }
    }

    pub(crate) fn matches(&self, snap: &EventSnapshot) -> bool {
        self.rid.load(Ordering::Acquire) == snap.request_id
            && self.ev.load(Ordering::Acquire) == snap.event as u32
            && self.prio.load(Ordering::Acquire) == snap.priority
    }

    pub(crate) fn store(&self, snap: &EventSnapshot) {
        self.rid.store(snap.request_id, Ordering::Release);
        self.ev.store(snap.event as u32, Ordering::Release);
        self.prio.store(snap.priority, Ordering::Release);
    }

    pub(crate) fn rid(&self) -> u32 {
        self.rid.load(Ordering::Acquire)
    }
}

pub(crate) struct ChangeSub {
    pub sub_id: SubId,
    pub sess: Arc<Session>,
    pub xpath: Option<String>,
    pub priority: u32,
    pub opts: SubOpts,
    pub cb: ChangeCallback,
    pub suspended: AtomicBool,
    /// Request id of the last successfully processed CHANGE / RPC; abort
    /// events target exactly these subscribers.
    pub done_rid: AtomicU32,
    /// Request id this subscriber shelved (0 = none).
    pub shelved_rid: AtomicU32,
}

pub(crate) struct ChangeGroup {
    pub module: String,
    pub mod_idx: usize,
    pub ds: Datastore,
    pub mailbox: Arc<Mailbox>,
    pub seen: Seen,
    pub subs: Vec<ChangeSub>,
}

pub(crate) struct OperGetSub {
    pub sub_id: SubId,
    pub sess: Arc<Session>,
    pub path: String,
    pub priority: u32,
    pub sub_type: OperGetKind,
    pub cb: OperGetCallback,
    pub mailbox: Arc<Mailbox>,
    pub seen: Seen,
    pub suspended: AtomicBool,
}

pub(crate) struct OperGetGroup {
    pub module: String,
    pub mod_idx: usize,
    pub subs: Vec<OperGetSub>,
}

pub(crate) struct OperPollSub {
    pub sub_id: SubId,
    pub sess: Arc<Session>,
    pub path: String,
    pub valid_ms: u32,
    pub opts: SubOpts,
    pub suspended: AtomicBool,
    /// `quanta` raw timestamp of the last cache refresh, 0 = never.
    pub last_refresh: AtomicU64,
}

pub(crate) struct OperPollGroup {
    pub module: String,
    pub mod_idx: usize,
    pub subs: Vec<OperPollSub>,
}

pub(crate) struct NotifSub {
    pub sub_id: SubId,
    pub sess: Arc<Session>,
    pub xpath: Option<String>,
    pub listen_since_mono: u64,
    pub listen_since_real: SystemTime,
    pub start_time: Option<SystemTime>,
    pub stop_time: Option<SystemTime>,
    pub cb: NotifCallback,
    pub suspended: AtomicBool,
}

impl NotifSub {
    /// Whether a notification with timestamp `ts` falls into this
    /// subscription's delivery window. Without an explicit start time only
    /// notifications emitted after the subscription was created qualify.
    pub(crate) fn accepts(&self, ts: SystemTime) -> bool {
        if let Some(start) = self.start_time {
            if ts < start {
                return false;
            }
        } else if ts < self.listen_since_real {
            return false;
        }
        if let Some(stop) = self.stop_time {
            if ts > stop {
                return false;
            }
        }
        true
    }
}

pub(crate) struct NotifGroup {
    pub module: String,
    pub mod_idx: usize,
    pub mailbox: Arc<Mailbox>,
    pub seen: Seen,
    pub subs: Vec<NotifSub>,
}

pub(crate) struct RpcSub {
    pub sub_id: SubId,
    pub sess: Arc<Session>,
    pub xpath: String,
    pub priority: u32,
    pub cb: RpcCallback,
    pub suspended: AtomicBool,
    pub done_rid: AtomicU32,
}

pub(crate) struct RpcGroup {
    pub path: String,
    pub is_ext: bool,
    pub mod_idx: usize,
    pub rpc_idx: Option<usize>,
    pub mailbox: Arc<Mailbox>,
    pub seen: Seen,
    pub subs: Vec<RpcSub>,
}

#[derive(Default)]
pub(crate) struct Registry {
    pub change: Vec<ChangeGroup>,
    pub oper_get: Vec<OperGetGroup>,
    pub oper_poll: Vec<OperPollGroup>,
    pub notif: Vec<NotifGroup>,
    pub rpc: Vec<RpcGroup>,
    pub last_sub_id: SubId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Found {
    Change(usize, usize),
    OperGet(usize, usize),
    OperPoll(usize, usize),
    Notif(usize, usize),
    Rpc(usize, usize),
}

impl Registry {
    fn find(&self, sub_id: SubId) -> Option<Found> {
        for (gi, group) in self.change.iter().enumerate() {
            if let Some(si) = group.subs.iter().position(|s| s.sub_id == sub_id) {
                return Some(Found::Change(gi, si));
            }
        }
        for (gi, group) in self.oper_get.iter().enumerate() {
            if let Some(si) = group.subs.iter().position(|s| s.sub_id == sub_id) {
                return Some(Found::OperGet(gi, si));
            }
        }
        for (gi, group) in self.oper_poll.iter().enumerate() {
            if let Some(si) = group.subs.iter().position(|s| s.sub_id == sub_id) {
                return Some(Found::OperPoll(gi, si));
            }
        }
        for (gi, group) in self.notif.iter().enumerate() {
            if let Some(si) = group.subs.iter().position(|s| s.sub_id == sub_id) {
                return Some(Found::Notif(gi, si));
            }
        }
        for (gi, group) in self.rpc.iter().enumerate() {
            if let Some(si) = group.subs.iter().position(|s| s.sub_id == sub_id) {
                return Some(Found::Rpc(gi, si));
            }
        }
        None
    }

    fn find_session_sub(&self, sess: &Arc<Session>) -> Option<SubId> {
        for group in &self.change {
            for sub in &group.subs {
                if Arc::ptr_eq(&sub.sess, sess) {
                    return Some(sub.sub_id);
                }
            }
        }
        for group in &self.oper_get {
            for sub in &group.subs {
                if Arc::ptr_eq(&sub.sess, sess) {
                    return Some(sub.sub_id);
                }
            }
        }
        for group in &self.oper_poll {
            for sub in &group.subs {
                if Arc::ptr_eq(&sub.sess, sess) {
                    return Some(sub.sub_id);
                }
            }
        }
        for group in &self.notif {
            for sub in &group.subs {
                if Arc::ptr_eq(&sub.sess, sess) {
                    return Some(sub.sub_id);
                }
            }
        }
        for group in &self.rpc {
            for sub in &group.subs {
                if Arc::ptr_eq(&sub.sess, sess) {
                    return Some(sub.sub_id);
                }
            }
        }
        None
    }

    fn any_session(&self) -> Option<Arc<Session>> {
        self.change
            .iter()
            .flat_map(|g| g.subs.iter().map(|s| &s.sess))
            .chain(self.oper_get.iter().flat_map(|g| g.subs.iter().map(|s| &s.sess)))
            .chain(self.oper_poll.iter().flat_map(|g| g.subs.iter().map(|s| &s.sess)))
            .chain(self.notif.iter().flat_map(|g| g.subs.iter().map(|s| &s.sess)))
            .chain(self.rpc.iter().flat_map(|g| g.subs.iter().map(|s| &s.sess)))
            .next()
            .cloned()
    }

    fn session_count(&self, sess: &Arc<Session>) -> u32 {
        let mut count = 0u32;
        for group in &self.change {
            count += group.subs.iter().filter(|s| Arc::ptr_eq(&s.sess, sess)).count() as u32;
        }
        for group in &self.oper_get {
            count += group.subs.iter().filter(|s| Arc::ptr_eq(&s.sess, sess)).count() as u32;
        }
        for group in &self.oper_poll {
            count += group.subs.iter().filter(|s| Arc::ptr_eq(&s.sess, sess)).count() as u32;
        }
        for group in &self.notif {
            count += group.subs.iter().filter(|s| Arc::ptr_eq(&s.sess, sess)).count() as u32;
        }
        for group in &self.rpc {
            count += group.subs.iter().filter(|s| Arc::ptr_eq(&s.sess, sess)).count() as u32;
        }
        count
    }

    fn total(&self) -> usize {
        self.change.iter().map(|g| g.subs.len()).sum::<usize>()
            + self.oper_get.iter().map(|g| g.subs.len()).sum::<usize>()
            + self.oper_poll.iter().map(|g| g.subs.len()).sum::<usize>()
            + self.notif.iter().map(|g| g.subs.len()).sum::<usize>()
            + self.rpc.iter().map(|g| g.subs.len()).sum::<usize>()
    }
}

/// The SUBS lock: the rwlock kernel over the registry, with a guard that
/// tracks the held mode and refuses mutable access outside WRITE.
pub(crate) struct SubsLock<T> {
    kernel: RwLock,
    cell: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SubsLock<T> {}
unsafe impl<T: Send> Sync for SubsLock<T> {}

impl<T> SubsLock<T> {
    fn new(value: T) -> SubsLock<T> {
        SubsLock {
            kernel: RwLock::new(),
            cell: UnsafeCell::new(value),
        }
    }

    pub(crate) fn lock(
        &self,
        mode: LockMode,
        timeout: Duration,
        cid: Cid,
    ) -> Result<SubsGuard<'_, T>> {
        let token = self.kernel.lock(mode, timeout, cid, LockClass::Subs)?;
        Ok(SubsGuard {
            owner: self,
            mode,
            cid,
            timeout,
            _token: token,
        })
    }
}

pub(crate) struct SubsGuard<'a, T> {
    owner: &'a SubsLock<T>,
    mode: LockMode,
    cid: Cid,
    timeout: Duration,
    _token: LockToken,
}

impl<'a, T> SubsGuard<'a, T> {
    pub(crate) fn mode(&self) -> LockMode {
        self.mode
    }

    /// Relock to `mode`. On error the previously held mode is untouched;
    /// callers branch on `mode()` afterwards.
    pub(crate) fn relock(&mut self, mode: LockMode) -> Result<()> {
        if self.mode == mode {
            return Ok(());
        }
        self.owner.kernel.relock(self.mode, mode, self.timeout, self.cid)?;
        self.mode = mode;
        Ok(())
    }

    pub(crate) fn get(&self) -> &T {
        unsafe { &*self.owner.cell.get() }
    }

    pub(crate) fn get_mut(&mut self) -> Result<&mut T> {
        if self.mode != LockMode::Write {
            return Err(Error::Internal(format!(
                "registry mutation requires WRITE, holding {:?}",
                self.mode
            )));
        }
        Ok(unsafe { &mut *self.owner.cell.get() })
    }
}

impl<'a, T> Drop for SubsGuard<'a, T> {
    fn drop(&mut self) {
        self.owner.kernel.unlock(self.mode, self.cid);
    }
}

/// Kind of a subscription, as reported by `sub_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubKind {
    Change,
    OperGet,
    OperPoll,
    Notif,
    Rpc,
}

/// Public snapshot of one subscription.
#[derive(Debug, Clone)]
pub struct SubInfo {
    pub sub_id: SubId,
    pub kind: SubKind,
    /// Module name, or the canonical operation path for RPC subscriptions.
    pub target: String,
    pub datastore: Option<Datastore>,
    pub priority: u32,
    pub suspended: bool,
    pub session_id: u32,
    /// CONFIG / STATE / MIXED classification of oper-get subscriptions.
    pub oper_kind: Option<OperGetKind>,
}

/// An oper-poll subscription whose cached data has expired.
#[derive(Debug, Clone)]
pub struct OperPollDue {
    pub sub_id: SubId,
    pub path: String,
    /// Subscriber also wants a diff against the previous refresh.
    pub diff: bool,
}

struct ListenerState {
    shutdown: Option<Arc<AtomicBool>>,
    listen: Option<JoinHandle<()>>,
    housekeep: Option<JoinHandle<()>>,
}

/// Per-client subscription context.
pub struct Subscriptions {
    conn: Arc<crate::session::Connection>,
    pub(crate) inner: SubsLock<Registry>,
    pub(crate) clock: quanta::Clock,
    listener: Mutex<ListenerState>,
}

impl Subscriptions {
    pub fn new(conn: &Arc<crate::session::Connection>) -> Arc<Subscriptions> {
        Arc::new(Subscriptions {
            conn: Arc::clone(conn),
            inner: SubsLock::new(Registry::default()),
            clock: quanta::Clock::new(),
            listener: Mutex::new(ListenerState {
                shutdown: None,
                listen: None,
                housekeep: None,
            }),
        })
    }

    pub fn connection(&self) -> &Arc<crate::session::Connection> {
        &self.conn
    }

    fn cid(&self) -> Cid {
        self.conn.cid()
    }

    fn subs_timeout(&self) -> Duration {
        self.conn.config().subscr_lock_timeout
    }

    fn ext_timeout(&self) -> Duration {
        self.conn.config().ext_sub_lock_timeout
    }

    /// Subscribes to configuration changes of `module` in the session's
    /// datastore.
    pub fn change_subscribe(
        self: &Arc<Self>,
        sess: &Arc<Session>,
        module: &str,
        xpath: Option<&str>,
        priority: u32,
        opts: SubOpts,
        cb: impl Fn(
                &Session,
                SubId,
                &str,
                Option<&str>,
                ChangeEvent<'_>,
                u32,
            ) -> Result<Option<Vec<u8>>>
            + Send
            + Sync
            + 'static,
    ) -> Result<SubId> {
        if self.conn.schema().module(module).is_none() {
            return Err(Error::NotFound(format!(
                "module \"{module}\" is not in the schema"
            )));
        }
        if let Some(xpath) = xpath {
            schema::change_xpath_check(self.conn.schema(), xpath)?;
        }
        let ds = sess.datastore();
        let mod_idx = self.module_index(module)?;
        let sub_id = self.conn.main_shm().new_sub_id()?;

        // publish the descriptor, then create the local bookkeeping; roll
        // the descriptor back if the local step fails
        self.conn.with_ext(|main, ext| {
            let anchor = main.change_anchor(mod_idx, ds)?;
            dir::change_sub_add(
                ext,
                anchor,
                self.conn.cid(),
                sub_id,
                priority,
                opts.0,
                xpath,
                self.conn.config().ext_sub_lock_timeout,
            )
        })?;

        let local = (|| -> Result<()> {
            let mut guard = self.inner.lock(LockMode::Write, self.subs_timeout(), self.cid())?;
            let reg = guard.get_mut()?;
            let gi = match reg
                .change
                .iter()
                .position(|g| g.module == module && g.ds == ds)
            {
                Some(gi) => gi,
                None => {
                    let mailbox = Mailbox::open_map(
                        self.conn.layout(),
                        module,
                        ds.mailbox_tag(),
                        None,
                        self.ext_timeout(),
                    )?;
                    reg.change.push(ChangeGroup {
                        module: module.to_string(),
                        mod_idx,
                        ds,
                        mailbox: Arc::new(mailbox),
                        seen: Seen::new(),
                        subs: Vec::new(),
                    });
                    reg.change.len() - 1
                }
            };
            reg.change[gi].subs.push(ChangeSub {
                sub_id,
                sess: Arc::clone(sess),
                xpath: xpath.map(str::to_string),
                priority,
                opts,
                cb: Box::new(cb),
                suspended: AtomicBool::new(false),
                done_rid: AtomicU32::new(0),
                shelved_rid: AtomicU32::new(0),
            });
            reg.last_sub_id = sub_id;
            Ok(())
        })();

        if let Err(err) = local {
            let _ = self.conn.with_ext(|main, ext| {
                let anchor = main.change_anchor(mod_idx, ds)?;
                dir::change_sub_del(ext, anchor, self.conn.cid(), sub_id, self.ext_timeout())
            });
            return Err(err);
        }
        sess.link_subscriptions(self);
        Ok(sub_id)
    }

    /// Subscribes as an operational data provider for `path`.
    pub fn oper_get_subscribe(
        self: &Arc<Self>,
        sess: &Arc<Session>,
        path: &str,
        priority: u32,
        cb: impl Fn(&Session, SubId, &str, &str, u32) -> Result<Vec<u8>> + Send + Sync + 'static,
    ) -> Result<SubId> {
        let sub_type = schema::oper_path_check(self.conn.schema(), path)?;
        let module = schema::first_module(path)?;
        let mod_idx = self.module_index(&module)?;
        let sub_id = self.conn.main_shm().new_sub_id()?;

        self.conn.with_ext(|main, ext| {
            let anchor = main.oper_get_anchor(mod_idx)?;
            dir::oper_get_sub_add(
                ext,
                anchor,
                self.conn.cid(),
                sub_id,
                priority,
                sub_type as u32,
                path,
                self.conn.config().ext_sub_lock_timeout,
            )
        })?;

        let local = (|| -> Result<()> {
            let mailbox = Mailbox::open_map(
                self.conn.layout(),
                &module,
                MailboxTag::Oper,
                Some(path_hash(path, priority)),
                self.ext_timeout(),
            )?;
            let mut guard = self.inner.lock(LockMode::Write, self.subs_timeout(), self.cid())?;
            let reg = guard.get_mut()?;
            let gi = match reg.oper_get.iter().position(|g| g.module == module) {
                Some(gi) => gi,
                None => {
                    reg.oper_get.push(OperGetGroup {
                        module: module.clone(),
                        mod_idx,
                        subs: Vec::new(),
                    });
                    reg.oper_get.len() - 1
                }
            };
            reg.oper_get[gi].subs.push(OperGetSub {
                sub_id,
                sess: Arc::clone(sess),
                path: path.to_string(),
                priority,
                sub_type,
                cb: Box::new(cb),
                mailbox: Arc::new(mailbox),
                seen: Seen::new(),
                suspended: AtomicBool::new(false),
            });
            reg.last_sub_id = sub_id;
            Ok(())
        })();

        if let Err(err) = local {
            let _ = self.conn.with_ext(|main, ext| {
                let anchor = main.oper_get_anchor(mod_idx)?;
                dir::oper_get_sub_del(ext, anchor, self.conn.cid(), sub_id, self.ext_timeout())
            });
            return Err(err);
        }
        sess.link_subscriptions(self);
        Ok(sub_id)
    }

    /// Subscribes as an operational data poller: the client refreshes a
    /// cache on its own timer, so no mailbox is opened for this kind.
    pub fn oper_poll_subscribe(
        self: &Arc<Self>,
        sess: &Arc<Session>,
        path: &str,
        valid: Duration,
        opts: SubOpts,
    ) -> Result<SubId> {
        schema::oper_path_check(self.conn.schema(), path)?;
        let valid_ms = u32::try_from(valid.as_millis())
            .map_err(|_| Error::InvalArg("cache validity out of range".into()))?;
        if valid_ms == 0 {
            return Err(Error::InvalArg("cache validity must be non-zero".into()));
        }
        let module = schema::first_module(path)?;
        let mod_idx = self.module_index(&module)?;
        let sub_id = self.conn.main_shm().new_sub_id()?;

        self.conn.with_ext(|main, ext| {
            let anchor = main.oper_poll_anchor(mod_idx)?;
            dir::oper_poll_sub_add(
                ext,
                anchor,
                self.conn.cid(),
                sub_id,
                valid_ms,
                opts.0,
                path,
                self.conn.config().ext_sub_lock_timeout,
            )
        })?;

        let local = (|| -> Result<()> {
            let mut guard = self.inner.lock(LockMode::Write, self.subs_timeout(), self.cid())?;
            let reg = guard.get_mut()?;
            let gi = match reg.oper_poll.iter().position(|g| g.module == module) {
                Some(gi) => gi,
                None => {
                    reg.oper_poll.push(OperPollGroup {
                        module: module.clone(),
                        mod_idx,
                        subs: Vec::new(),
                    });
                    reg.oper_poll.len() - 1
                }
            };
            reg.oper_poll[gi].subs.push(OperPollSub {
                sub_id,
                sess: Arc::clone(sess),
                path: path.to_string(),
                valid_ms,
                opts,
                suspended: AtomicBool::new(false),
                last_refresh: AtomicU64::new(0),
            });
            reg.last_sub_id = sub_id;
            Ok(())
        })();

        if let Err(err) = local {
            let _ = self.conn.with_ext(|main, ext| {
                let anchor = main.oper_poll_anchor(mod_idx)?;
                dir::oper_poll_sub_del(ext, anchor, self.conn.cid(), sub_id, self.ext_timeout())
            });
            return Err(err);
        }
        sess.link_subscriptions(self);
        Ok(sub_id)
    }

    /// Subscribes to notifications of `module`, optionally filtered by
    /// xpath and bounded by `start_time` / `stop_time`.
    pub fn notif_subscribe(
        self: &Arc<Self>,
        sess: &Arc<Session>,
        module: &str,
        xpath: Option<&str>,
        start_time: Option<SystemTime>,
        stop_time: Option<SystemTime>,
        cb: NotifCallback,
    ) -> Result<SubId> {
        schema::notif_xpath_check(self.conn.schema(), module, xpath)?;
        let now = SystemTime::now();
        if let Some(stop) = stop_time {
            if stop < now {
                return Err(Error::InvalArg("stop time is in the past".into()));
            }
            if let Some(start) = start_time {
                if start > stop {
                    return Err(Error::InvalArg("start time is after stop time".into()));
                }
            }
        }
        let mod_idx = self.module_index(module)?;
        let sub_id = self.conn.main_shm().new_sub_id()?;

        self.conn.with_ext(|main, ext| {
            let anchor = main.notif_anchor(mod_idx)?;
            dir::notif_sub_add(
                ext,
                anchor,
                self.conn.cid(),
                sub_id,
                xpath,
                self.conn.config().ext_sub_lock_timeout,
            )
        })?;

        let local = (|| -> Result<()> {
            let mut guard = self.inner.lock(LockMode::Write, self.subs_timeout(), self.cid())?;
            let reg = guard.get_mut()?;
            let gi = match reg.notif.iter().position(|g| g.module == module) {
                Some(gi) => gi,
                None => {
                    let mailbox = Mailbox::open_map(
                        self.conn.layout(),
                        module,
                        MailboxTag::Notif,
                        None,
                        self.ext_timeout(),
                    )?;
                    reg.notif.push(NotifGroup {
                        module: module.to_string(),
                        mod_idx,
                        mailbox: Arc::new(mailbox),
                        seen: Seen::new(),
                        subs: Vec::new(),
                    });
                    reg.notif.len() - 1
                }
            };
            reg.notif[gi].subs.push(NotifSub {
                sub_id,
                sess: Arc::clone(sess),
                xpath: xpath.map(str::to_string),
                listen_since_mono: self.clock.raw(),
                listen_since_real: now,
                start_time,
                stop_time,
                cb,
                suspended: AtomicBool::new(false),
            });
            reg.last_sub_id = sub_id;
            Ok(())
        })();

        if let Err(err) = local {
            let _ = self.conn.with_ext(|main, ext| {
                let anchor = main.notif_anchor(mod_idx)?;
                dir::notif_sub_del(ext, anchor, self.conn.cid(), sub_id, self.ext_timeout())
            });
            return Err(err);
        }
        sess.link_subscriptions(self);
        Ok(sub_id)
    }

    /// Subscribes an RPC/action handler for `xpath`.
    pub fn rpc_subscribe(
        self: &Arc<Self>,
        sess: &Arc<Session>,
        xpath: &str,
        priority: u32,
        cb: RpcCallback,
    ) -> Result<SubId> {
        let (path, is_ext) = schema::rpc_xpath_check(self.conn.schema(), xpath)?;
        let module = schema::first_module(&path)?;
        let mod_idx = self.module_index(&module)?;
        let rpc_idx = if is_ext {
            None
        } else {
            let found = self
                .conn
                .with_ext(|main, ext| main.find_rpc(ext, &path))?;
            Some(found.ok_or_else(|| {
                Error::Internal(format!("operation \"{path}\" missing from module shm"))
            })?)
        };
        let sub_id = self.conn.main_shm().new_sub_id()?;

        self.conn.with_ext(|main, ext| {
            let anchor = match rpc_idx {
                Some(idx) => main.rpc_anchor(idx)?,
                None => main.rpc_ext_anchor(mod_idx)?,
            };
            dir::rpc_sub_add(
                ext,
                anchor,
                self.conn.cid(),
                sub_id,
                priority,
                xpath,
                &path,
                self.conn.config().ext_sub_lock_timeout,
            )
        })?;

        let local = (|| -> Result<()> {
            let mut guard = self.inner.lock(LockMode::Write, self.subs_timeout(), self.cid())?;
            let reg = guard.get_mut()?;
            let gi = match reg.rpc.iter().position(|g| g.path == path) {
                Some(gi) => gi,
                None => {
                    let mailbox = Mailbox::open_map(
                        self.conn.layout(),
                        &module,
                        MailboxTag::Rpc,
                        Some(path_hash(&path, 0)),
                        self.ext_timeout(),
                    )?;
                    reg.rpc.push(RpcGroup {
                        path: path.clone(),
                        is_ext,
                        mod_idx,
                        rpc_idx,
                        mailbox: Arc::new(mailbox),
                        seen: Seen::new(),
                        subs: Vec::new(),
                    });
                    reg.rpc.len() - 1
                }
            };
            reg.rpc[gi].subs.push(RpcSub {
                sub_id,
                sess: Arc::clone(sess),
                xpath: xpath.to_string(),
                priority,
                cb,
                suspended: AtomicBool::new(false),
                done_rid: AtomicU32::new(0),
            });
            reg.last_sub_id = sub_id;
            Ok(())
        })();

        if let Err(err) = local {
            let _ = self.conn.with_ext(|main, ext| {
                let anchor = match rpc_idx {
                    Some(idx) => main.rpc_anchor(idx)?,
                    None => main.rpc_ext_anchor(mod_idx)?,
                };
                dir::rpc_sub_del(ext, anchor, self.conn.cid(), sub_id, self.ext_timeout())
            });
            return Err(err);
        }
        sess.link_subscriptions(self);
        Ok(sub_id)
    }

    /// Removes the subscription with `sub_id`.
    pub fn unsubscribe(&self, sub_id: SubId) -> Result<()> {
        let mut guard = self
            .inner
            .lock(LockMode::ReadUpgr, self.subs_timeout(), self.cid())?;
        let sess = self.del_locked(&mut guard, sub_id)?;
        if guard.get().session_count(&sess) == 0 {
            sess.unlink_subscriptions(self);
        }
        Ok(())
    }

    /// Removes every subscription of `sess` from this context.
    pub fn session_unsubscribe(&self, sess: &Arc<Session>) -> Result<()> {
        {
            let mut guard = self
                .inner
                .lock(LockMode::ReadUpgr, self.subs_timeout(), self.cid())?;
            loop {
                let Some(sub_id) = guard.get().find_session_sub(sess) else {
                    break;
                };
                self.del_locked(&mut guard, sub_id)?;
            }
        }
        sess.unlink_subscriptions(self);
        Ok(())
    }

    /// Removes everything: the full unsubscribe of the context. Every
    /// notification subscription receives a synthetic TERMINATED signal.
    pub fn unsubscribe_all(&self) -> Result<()> {
        loop {
            let sess = {
                let guard = self
                    .inner
                    .lock(LockMode::Read, self.subs_timeout(), self.cid())?;
                guard.get().any_session()
            };
            match sess {
                Some(sess) => self.session_unsubscribe(&sess)?,
                None => break,
            }
        }
        Ok(())
    }

    /// Number of subscriptions owned by `sess` in this context.
    pub fn session_count(&self, sess: &Arc<Session>) -> Result<u32> {
        let guard = self
            .inner
            .lock(LockMode::Read, self.subs_timeout(), self.cid())?;
        Ok(guard.get().session_count(sess))
    }

    /// Total number of subscriptions in this context.
    pub fn len(&self) -> Result<usize> {
        let guard = self
            .inner
            .lock(LockMode::Read, self.subs_timeout(), self.cid())?;
        Ok(guard.get().total())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Highest subscription id ever created in this context.
    pub fn last_sub_id(&self) -> Result<SubId> {
        let guard = self
            .inner
            .lock(LockMode::Read, self.subs_timeout(), self.cid())?;
        Ok(guard.get().last_sub_id)
    }

    /// Looks a subscription up by id.
    pub fn sub_info(&self, sub_id: SubId) -> Result<SubInfo> {
        let guard = self
            .inner
            .lock(LockMode::Read, self.subs_timeout(), self.cid())?;
        let reg = guard.get();
        let info = match reg.find(sub_id) {
            Some(Found::Change(gi, si)) => {
                let (g, s) = (&reg.change[gi], &reg.change[gi].subs[si]);
                SubInfo {
                    sub_id,
                    kind: SubKind::Change,
                    target: g.module.clone(),
                    datastore: Some(g.ds),
                    priority: s.priority,
                    suspended: s.suspended.load(Ordering::Acquire),
                    session_id: s.sess.id(),
                    oper_kind: None,
                }
            }
            Some(Found::OperGet(gi, si)) => {
                let (g, s) = (&reg.oper_get[gi], &reg.oper_get[gi].subs[si]);
                SubInfo {
                    sub_id,
                    kind: SubKind::OperGet,
                    target: g.module.clone(),
                    datastore: None,
                    priority: s.priority,
                    suspended: s.suspended.load(Ordering::Acquire),
                    session_id: s.sess.id(),
                    oper_kind: Some(s.sub_type),
                }
            }
            Some(Found::OperPoll(gi, si)) => {
                let (g, s) = (&reg.oper_poll[gi], &reg.oper_poll[gi].subs[si]);
                SubInfo {
                    sub_id,
                    kind: SubKind::OperPoll,
                    target: g.module.clone(),
                    datastore: None,
                    priority: 0,
                    suspended: s.suspended.load(Ordering::Acquire),
                    session_id: s.sess.id(),
                    oper_kind: None,
                }
            }
            Some(Found::Notif(gi, si)) => {
                let (g, s) = (&reg.notif[gi], &reg.notif[gi].subs[si]);
                SubInfo {
                    sub_id,
                    kind: SubKind::Notif,
                    target: g.module.clone(),
                    datastore: None,
                    priority: 0,
                    suspended: s.suspended.load(Ordering::Acquire),
                    session_id: s.sess.id(),
                    oper_kind: None,
                }
            }
            Some(Found::Rpc(gi, si)) => {
                let (g, s) = (&reg.rpc[gi], &reg.rpc[gi].subs[si]);
                SubInfo {
                    sub_id,
                    kind: SubKind::Rpc,
                    target: g.path.clone(),
                    datastore: None,
                    priority: s.priority,
                    suspended: s.suspended.load(Ordering::Acquire),
                    session_id: s.sess.id(),
                    oper_kind: None,
                }
            }
            None => {
                return Err(Error::NotFound(format!(
                    "subscription with ID {sub_id} was not found"
                )))
            }
        };
        Ok(info)
    }

    /// Suspends event delivery for `sub_id`; missed events are lost.
    pub fn suspend(&self, sub_id: SubId) -> Result<()> {
        self.set_suspended(sub_id, true)
    }

    /// Resumes event delivery for `sub_id`; nothing is replayed.
    pub fn resume(&self, sub_id: SubId) -> Result<()> {
        self.set_suspended(sub_id, false)
    }

    fn set_suspended(&self, sub_id: SubId, value: bool) -> Result<()> {
        let guard = self
            .inner
            .lock(LockMode::Read, self.subs_timeout(), self.cid())?;
        let reg = guard.get();
        let found = reg.find(sub_id).ok_or_else(|| {
            Error::NotFound(format!("subscription with ID {sub_id} was not found"))
        })?;
        let t = self.ext_timeout();
        let cid = self.cid();
        let changed = match found {
            Found::Change(gi, _) => {
                let g = &reg.change[gi];
                self.conn.with_ext(|main, ext| {
                    let anchor = main.change_anchor(g.mod_idx, g.ds)?;
                    dir::set_suspended::<ChangeSubShm>(ext, anchor, cid, sub_id, value, t)
                })?
            }
            Found::OperGet(gi, _) => {
                let g = &reg.oper_get[gi];
                self.conn.with_ext(|main, ext| {
                    let anchor = main.oper_get_anchor(g.mod_idx)?;
                    dir::set_suspended::<OperGetSubShm>(ext, anchor, cid, sub_id, value, t)
                })?
            }
            Found::OperPoll(gi, _) => {
                let g = &reg.oper_poll[gi];
                self.conn.with_ext(|main, ext| {
                    let anchor = main.oper_poll_anchor(g.mod_idx)?;
                    dir::set_suspended::<OperPollSubShm>(ext, anchor, cid, sub_id, value, t)
                })?
            }
            Found::Notif(gi, _) => {
                let g = &reg.notif[gi];
                self.conn.with_ext(|main, ext| {
                    let anchor = main.notif_anchor(g.mod_idx)?;
                    dir::set_suspended::<NotifSubShm>(ext, anchor, cid, sub_id, value, t)
                })?
            }
            Found::Rpc(gi, _) => {
                let g = &reg.rpc[gi];
                self.conn.with_ext(|main, ext| {
                    let anchor = match g.rpc_idx {
                        Some(idx) => main.rpc_anchor(idx)?,
                        None => main.rpc_ext_anchor(g.mod_idx)?,
                    };
                    dir::set_suspended::<RpcSubShm>(ext, anchor, cid, sub_id, value, t)
                })?
            }
        };
        if !changed {
            return Err(Error::InvalArg(format!(
                "subscription {sub_id} is already {}",
                if value { "suspended" } else { "resumed" }
            )));
        }

        // mirror locally and signal notification subscribers
        match found {
            Found::Change(gi, si) => reg.change[gi].subs[si]
                .suspended
                .store(value, Ordering::Release),
            Found::OperGet(gi, si) => reg.oper_get[gi].subs[si]
                .suspended
                .store(value, Ordering::Release),
            Found::OperPoll(gi, si) => reg.oper_poll[gi].subs[si]
                .suspended
                .store(value, Ordering::Release),
            Found::Rpc(gi, si) => reg.rpc[gi].subs[si]
                .suspended
                .store(value, Ordering::Release),
            Found::Notif(gi, si) => {
                let sub = &reg.notif[gi].subs[si];
                sub.suspended.store(value, Ordering::Release);
                let signal = if value {
                    NotifType::Suspended
                } else {
                    NotifType::Resumed
                };
                let ev_sess = self
                    .conn
                    .implicit_session(Datastore::Operational, EventKind::Notif);
                invoke_notif_cb(&sub.cb, &ev_sess, sub_id, signal, None, &[], SystemTime::now());
            }
        }
        Ok(())
    }

    /// Oper-poll subscriptions whose cached data has expired.
    pub fn oper_poll_due(&self) -> Result<Vec<OperPollDue>> {
        let guard = self
            .inner
            .lock(LockMode::Read, self.subs_timeout(), self.cid())?;
        let now = self.clock.raw();
        let mut due = Vec::new();
        for group in &guard.get().oper_poll {
            for sub in &group.subs {
                if sub.suspended.load(Ordering::Acquire) {
                    continue;
                }
                let last = sub.last_refresh.load(Ordering::Acquire);
                let expired = last == 0
                    || self.clock.delta(last, now)
                        >= Duration::from_millis(u64::from(sub.valid_ms));
                if expired {
                    due.push(OperPollDue {
                        sub_id: sub.sub_id,
                        path: sub.path.clone(),
                        diff: sub.opts.contains(SubOpts::OPER_POLL_DIFF),
                    });
                }
            }
        }
        Ok(due)
    }

    /// Marks an oper-poll subscription's cache as refreshed now.
    pub fn oper_poll_refreshed(&self, sub_id: SubId) -> Result<()> {
        let guard = self
            .inner
            .lock(LockMode::Read, self.subs_timeout(), self.cid())?;
        for group in &guard.get().oper_poll {
            for sub in &group.subs {
                if sub.sub_id == sub_id {
                    sub.last_refresh.store(self.clock.raw(), Ordering::Release);
                    return Ok(());
                }
            }
        }
        Err(Error::NotFound(format!(
            "subscription with ID {sub_id} was not found"
        )))
    }

    /// Removes notification subscriptions whose stop time has passed; each
    /// one gets the synthetic TERMINATED signal through the normal removal
    /// path. Returns how many were removed.
    pub fn expire_notifs(&self) -> Result<u32> {
        let now = SystemTime::now();
        let expired: Vec<SubId> = {
            let guard = self
                .inner
                .lock(LockMode::Read, self.subs_timeout(), self.cid())?;
            guard
                .get()
                .notif
                .iter()
                .flat_map(|g| g.subs.iter())
                .filter(|s| s.stop_time.is_some_and(|stop| stop <= now))
                .map(|s| s.sub_id)
                .collect()
        };
        let mut removed = 0;
        for sub_id in expired {
            match self.unsubscribe(sub_id) {
                Ok(()) => removed += 1,
                // someone else removed it first
                Err(Error::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(removed)
    }

    /// Starts the background listener and the stop-time housekeeper.
    pub fn start_listen(self: &Arc<Self>) -> Result<()> {
        let mut state = self
            .listener
            .lock()
            .map_err(|_| Error::Internal("listener state poisoned".into()))?;
        if state.listen.is_some() {
            return Err(Error::Exists("listener thread already running".into()));
        }
        let shutdown = Arc::new(AtomicBool::new(false));
        let poll = self.conn.config().listen_poll;

        let weak = Arc::downgrade(self);
        let flag = Arc::clone(&shutdown);
        let listen = std::thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                match weak.upgrade() {
                    Some(subscr) => {
                        if let Err(err) = subscr.process_events() {
                            log::warn!("event processing failed: {err}");
                        }
                    }
                    None => break,
                }
                std::thread::sleep(poll);
            }
        });
        let housekeep = housekeeper::spawn(
            Arc::downgrade(self),
            Arc::clone(&shutdown),
            self.conn.config().housekeeper_poll,
        );

        state.shutdown = Some(shutdown);
        state.listen = Some(listen);
        state.housekeep = Some(housekeep);
        Ok(())
    }

    /// Stops the background threads; idempotent.
    pub fn stop_listen(&self) {
        let (shutdown, listen, housekeep) = match self.listener.lock() {
            Ok(mut state) => (
                state.shutdown.take(),
                state.listen.take(),
                state.housekeep.take(),
            ),
            Err(_) => return,
        };
        if let Some(flag) = shutdown {
            flag.store(true, Ordering::Release);
        }
        if let Some(handle) = listen {
            let _ = handle.join();
        }
        if let Some(handle) = housekeep {
            let _ = handle.join();
        }
    }

    fn module_index(&self, module: &str) -> Result<usize> {
        self.conn
            .with_ext(|main, ext| main.find_module(ext, module))?
            .ok_or_else(|| Error::NotFound(format!("module \"{module}\" is not installed")))
    }

    /// Kind dispatch for a removal with SUBS held in READ-UPGRADE. Returns
    /// the owning session.
    fn del_locked(
        &self,
        guard: &mut SubsGuard<'_, Registry>,
        sub_id: SubId,
    ) -> Result<Arc<Session>> {
        let found = guard.get().find(sub_id).ok_or_else(|| {
            Error::NotFound(format!("subscription with ID {sub_id} was not found"))
        })?;
        let cid = self.cid();
        let t = self.ext_timeout();

        match found {
            Found::Change(gi, si) => {
                let (mod_idx, ds, sess) = {
                    let g = &guard.get().change[gi];
                    (g.mod_idx, g.ds, Arc::clone(&g.subs[si].sess))
                };
                let outcome = self.conn.with_ext(|main, ext| {
                    let anchor = main.change_anchor(mod_idx, ds)?;
                    dir::change_sub_del(ext, anchor, cid, sub_id, t)
                })?;
                if !outcome.found {
                    log::warn!("change subscription {sub_id} already gone from ext shm");
                }
                self.registry_del(guard, found, sub_id, outcome.emptied)?;
                Ok(sess)
            }
            Found::OperGet(gi, si) => {
                let (mod_idx, sess) = {
                    let g = &guard.get().oper_get[gi];
                    (g.mod_idx, Arc::clone(&g.subs[si].sess))
                };
                let outcome = self.conn.with_ext(|main, ext| {
                    let anchor = main.oper_get_anchor(mod_idx)?;
                    dir::oper_get_sub_del(ext, anchor, cid, sub_id, t)
                })?;
                if !outcome.found {
                    log::warn!("oper get subscription {sub_id} already gone from ext shm");
                }
                self.registry_del(guard, found, sub_id, outcome.emptied)?;
                Ok(sess)
            }
            Found::OperPoll(gi, si) => {
                let (mod_idx, sess) = {
                    let g = &guard.get().oper_poll[gi];
                    (g.mod_idx, Arc::clone(&g.subs[si].sess))
                };
                let outcome = self.conn.with_ext(|main, ext| {
                    let anchor = main.oper_poll_anchor(mod_idx)?;
                    dir::oper_poll_sub_del(ext, anchor, cid, sub_id, t)
                })?;
                if !outcome.found {
                    log::warn!("oper poll subscription {sub_id} already gone from ext shm");
                }
                self.registry_del(guard, found, sub_id, outcome.emptied)?;
                Ok(sess)
            }
            Found::Notif(gi, si) => {
                let (mod_idx, sess) = {
                    let g = &guard.get().notif[gi];
                    (g.mod_idx, Arc::clone(&g.subs[si].sess))
                };
                let outcome = self.conn.with_ext(|main, ext| {
                    let anchor = main.notif_anchor(mod_idx)?;
                    dir::notif_sub_del(ext, anchor, cid, sub_id, t)
                })?;
                if !outcome.found {
                    log::warn!("notif subscription {sub_id} already gone from ext shm");
                }
                self.registry_notif_del(guard, sub_id, outcome.emptied)?;
                Ok(sess)
            }
            Found::Rpc(gi, si) => {
                let (mod_idx, rpc_idx, is_ext, sess) = {
                    let g = &guard.get().rpc[gi];
                    (g.mod_idx, g.rpc_idx, g.is_ext, Arc::clone(&g.subs[si].sess))
                };
                let outcome = self.conn.with_ext(|main, ext| {
                    // extension RPCs share the module anchor, regular ones
                    // have their own table entry
                    let anchor = if is_ext {
                        main.rpc_ext_anchor(mod_idx)?
                    } else {
                        let idx = rpc_idx.ok_or_else(|| {
                            Error::Internal("regular RPC without a table index".into())
                        })?;
                        main.rpc_anchor(idx)?
                    };
                    dir::rpc_sub_del(ext, anchor, cid, sub_id, t)
                })?;
                if !outcome.found {
                    log::warn!("RPC subscription {sub_id} already gone from ext shm");
                }
                self.registry_del(guard, found, sub_id, outcome.emptied)?;
                Ok(sess)
            }
        }
    }

    /// Local removal for the non-notification kinds: upgrade, drain an
    /// in-flight event, swap-remove, restore the entry mode.
    fn registry_del(
        &self,
        guard: &mut SubsGuard<'_, Registry>,
        found: Found,
        sub_id: SubId,
        ext_emptied: bool,
    ) -> Result<()> {
        let entry_mode = guard.mode();
        guard.relock(LockMode::Write)?;
        let cid = self.cid();

        let result = (|| -> Result<()> {
            let reg = guard.get_mut()?;
            match found {
                Found::Change(..) => {
                    let Some(gi) = reg
                        .change
                        .iter()
                        .position(|g| g.subs.iter().any(|s| s.sub_id == sub_id))
                    else {
                        return Err(Error::Internal(format!(
                            "change subscription {sub_id} vanished from the registry"
                        )));
                    };
                    let group = &mut reg.change[gi];
                    drain_group_event(&group.mailbox, &group.seen, cid, &group.module);
                    let si = group
                        .subs
                        .iter()
                        .position(|s| s.sub_id == sub_id)
                        .expect("position checked above");
                    group.subs.swap_remove(si);
                    if group.subs.is_empty() {
                        let group = reg.change.swap_remove(gi);
                        if ext_emptied {
                            group.mailbox.unlink();
                        }
                    }
                }
                Found::OperGet(..) => {
                    let Some(gi) = reg
                        .oper_get
                        .iter()
                        .position(|g| g.subs.iter().any(|s| s.sub_id == sub_id))
                    else {
                        return Err(Error::Internal(format!(
                            "oper get subscription {sub_id} vanished from the registry"
                        )));
                    };
                    let group = &mut reg.oper_get[gi];
                    let si = group
                        .subs
                        .iter()
                        .position(|s| s.sub_id == sub_id)
                        .expect("position checked above");
                    let sub = group.subs.swap_remove(si);
                    // the mailbox is per-subscription for this kind
                    if let Some((_, rid)) = sub.mailbox.in_flight() {
                        if sub.seen.rid() != rid {
                            sub.mailbox.reply_ignored(cid, 1, &sub.path);
                        }
                    }
                    sub.mailbox.unlink();
                    if group.subs.is_empty() {
                        reg.oper_get.swap_remove(gi);
                    }
                }
                Found::OperPoll(..) => {
                    let Some(gi) = reg
                        .oper_poll
                        .iter()
                        .position(|g| g.subs.iter().any(|s| s.sub_id == sub_id))
                    else {
                        return Err(Error::Internal(format!(
                            "oper poll subscription {sub_id} vanished from the registry"
                        )));
                    };
                    let group = &mut reg.oper_poll[gi];
                    let si = group
                        .subs
                        .iter()
                        .position(|s| s.sub_id == sub_id)
                        .expect("position checked above");
                    group.subs.swap_remove(si);
                    if group.subs.is_empty() {
                        reg.oper_poll.swap_remove(gi);
                    }
                }
                Found::Rpc(..) => {
                    let Some(gi) = reg
                        .rpc
                        .iter()
                        .position(|g| g.subs.iter().any(|s| s.sub_id == sub_id))
                    else {
                        return Err(Error::Internal(format!(
                            "RPC subscription {sub_id} vanished from the registry"
                        )));
                    };
                    let group = &mut reg.rpc[gi];
                    drain_group_event(&group.mailbox, &group.seen, cid, &group.path);
                    let si = group
                        .subs
                        .iter()
                        .position(|s| s.sub_id == sub_id)
                        .expect("position checked above");
                    group.subs.swap_remove(si);
                    if group.subs.is_empty() {
                        let group = reg.rpc.swap_remove(gi);
                        if ext_emptied {
                            group.mailbox.unlink();
                        }
                    }
                }
                Found::Notif(..) => {
                    return Err(Error::Internal(
                        "notif removal must go through its own path".into(),
                    ))
                }
            }
            Ok(())
        })();

        if guard.mode() != entry_mode {
            if let Err(err) = guard.relock(entry_mode) {
                log::warn!("restoring SUBS lock mode after removal: {err}");
            }
        }
        result
    }

    /// Local removal for notification subscriptions: upgrade and drain,
    /// downgrade for the synthetic TERMINATED callback, upgrade again to
    /// finalize, then restore the entry mode. The held mode is re-read
    /// after every relock since relock may fail without changing it.
    fn registry_notif_del(
        &self,
        guard: &mut SubsGuard<'_, Registry>,
        sub_id: SubId,
        ext_emptied: bool,
    ) -> Result<()> {
        let entry_mode = guard.mode();
        let cid = self.cid();

        // drain under WRITE
        guard.relock(LockMode::Write)?;
        {
            let reg = guard.get_mut()?;
            let Some(gi) = reg
                .notif
                .iter()
                .position(|g| g.subs.iter().any(|s| s.sub_id == sub_id))
            else {
                if let Err(err) = guard.relock(entry_mode) {
                    log::warn!("restoring SUBS lock mode: {err}");
                }
                return Err(Error::Internal(format!(
                    "notif subscription {sub_id} vanished from the registry"
                )));
            };
            let group = &reg.notif[gi];
            drain_group_event(&group.mailbox, &group.seen, cid, &group.module);
        }

        // downgrade for the callback; on failure the signal is sent under
        // WRITE, which is merely more exclusive than needed
        if let Err(err) = guard.relock(LockMode::ReadUpgr) {
            log::warn!("downgrade before TERMINATED signal failed: {err}");
        }
        {
            let reg = guard.get();
            if let Some(Found::Notif(gi, si)) = reg.find(sub_id) {
                let sub = &reg.notif[gi].subs[si];
                log::debug!(
                    "terminating notif subscription {sub_id} after {:?} listening",
                    self.clock.delta(sub.listen_since_mono, self.clock.raw())
                );
                let ev_sess = self
                    .conn
                    .implicit_session(Datastore::Operational, EventKind::Notif);
                invoke_notif_cb(
                    &sub.cb,
                    &ev_sess,
                    sub_id,
                    NotifType::Terminated,
                    None,
                    &[],
                    SystemTime::now(),
                );
            }
        }

        // finalize under WRITE
        let result = (|| -> Result<()> {
            guard.relock(LockMode::Write)?;
            let reg = guard.get_mut()?;
            let Some(gi) = reg
                .notif
                .iter()
                .position(|g| g.subs.iter().any(|s| s.sub_id == sub_id))
            else {
                return Err(Error::Internal(format!(
                    "notif subscription {sub_id} vanished during removal"
                )));
            };
            let group = &mut reg.notif[gi];
            let si = group
                .subs
                .iter()
                .position(|s| s.sub_id == sub_id)
                .expect("position checked above");
            group.subs.swap_remove(si);
            if group.subs.is_empty() {
                let group = reg.notif.swap_remove(gi);
                if ext_emptied {
                    group.mailbox.unlink();
                }
            }
            Ok(())
        })();

        if guard.mode() != entry_mode {
            if let Err(err) = guard.relock(entry_mode) {
                log::warn!("restoring SUBS lock mode after notif removal: {err}");
            }
        }
        result
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        self.stop_listen();
        if let Err(err) = self.unsubscribe_all() {
            log::warn!("tearing down subscriptions: {err}");
        }
    }
}

/// Writes an "ignored" reply if the group's mailbox holds an event the
/// group was expected to serve but has not yet processed, so producers are
/// not left waiting for a subscriber that is going away.
fn drain_group_event(mailbox: &Mailbox, seen: &Seen, cid: Cid, who: &str) {
    if let Some((_, rid)) = mailbox.in_flight() {
        if seen.rid() != rid {
            mailbox.reply_ignored(cid, 1, who);
        }
    }
}

pub(crate) fn invoke_notif_cb(
    cb: &NotifCallback,
    sess: &Session,
    sub_id: SubId,
    notif_type: NotifType,
    xpath: Option<&str>,
    payload: &[u8],
    timestamp: SystemTime,
) {
    match cb {
        NotifCallback::Values(cb) => {
            let values = if payload.is_empty() {
                Vec::new()
            } else {
                match crate::dispatch::decode_values(payload) {
                    Ok(values) => values,
                    Err(err) => {
                        log::warn!("undecodable notification payload: {err}");
                        return;
                    }
                }
            };
            cb(sess, sub_id, notif_type, xpath, &values, timestamp);
        }
        NotifCallback::Tree(cb) => cb(sess, sub_id, notif_type, xpath, payload, timestamp),
    }
}
