//! Event delivery: producers fan events out through the mailboxes, the
//! listener side of a subscription context serves them.
//!
//! A change commit walks the ext-SHM directory under the per-object lock,
//! buckets live subscribers by priority and runs the UPDATE, CHANGE and
//! DONE phases; a callback failure in CHANGE triggers the ABORT fan-out to
//! exactly the subscribers that already succeeded. RPCs deliver in
//! ascending priority order with the same abort rule; notifications are
//! fire-and-forget once the reply count is reached. Dead subscribers found
//! while walking the directory are reclaimed on the spot and their share of
//! any in-flight event is marked ignored so no producer blocks on them.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::liveness::Cid;
use crate::mailbox::{EventKind, EventSnapshot, Mailbox};
use crate::paths::{path_hash, MailboxTag};
use crate::registry::{
    invoke_notif_cb, ChangeEvent, ChangeGroup, ChangeSub, NotifGroup, NotifType, OperGetSub,
    PathValue, RpcCallback, RpcEvent, RpcGroup, RpcValsEvent, SubId, SubOpts, Subscriptions,
};
use crate::schema;
use crate::session::{Connection, Datastore};
use crate::shm::dir::{self, LiveSub};
use crate::shm::rwlock::LockMode;
use crate::{Error, ErrorCode, Result};

/// One provider's contribution to an operational get.
#[derive(Debug, Clone)]
pub struct OperChunk {
    pub sub_id: SubId,
    pub priority: u32,
    pub data: Vec<u8>,
}

/// Commits a configuration change of `module` in `ds`: runs the UPDATE
/// phase (highest priority first, sequential), the CHANGE phase (parallel
/// within a priority bucket), and on full success the DONE phase. Returns
/// the final diff, which UPDATE subscribers may have extended.
pub fn change_notify(
    conn: &Arc<Connection>,
    module: &str,
    ds: Datastore,
    diff: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>> {
    let cid = conn.cid();
    let ext_t = conn.config().ext_sub_lock_timeout;
    let mod_idx = module_index(conn, module)?;
    let mailbox = Mailbox::open_map(conn.layout(), module, ds.mailbox_tag(), None, ext_t)?;

    let out = conn.with_ext(|main, ext| {
        let anchor = main.change_anchor(mod_idx, ds)?;
        dir::collect_change_subs(ext, anchor, cid, ext_t, &|c| conn.is_alive(c))
    })?;
    drain_reclaimed(&mailbox, cid, out.reclaimed);
    let live: Vec<LiveSub> = out.live.into_iter().filter(|s| !s.suspended).collect();
    if live.is_empty() {
        return Ok(diff.to_vec());
    }

    let rid = mailbox.next_request_id();
    let buckets = buckets(&live, false);
    let mut diff = diff.to_vec();

    // UPDATE: sequential, highest priority first; errors cancel the commit
    for (prio, subs) in &buckets {
        let updaters = subs
            .iter()
            .filter(|s| SubOpts(s.opts).contains(SubOpts::UPDATE))
            .count() as u32;
        if updaters == 0 {
            continue;
        }
        mailbox.publish(cid, EventKind::Update, rid, *prio, updaters, &diff)?;
        let outcome = mailbox.await_replies(cid, timeout);
        let _ = mailbox.finish(cid);
        let outcome = outcome?;
        if outcome.code != ErrorCode::Ok {
            return Err(Error::from_code(
                outcome.code,
                &format!("update of \"{module}\" was rejected"),
            ));
        }
        diff = outcome.payload;
    }

    // CHANGE: per priority bucket; the first failure aborts the commit and
    // fans ABORT out to the subscribers that already succeeded
    let mut processed: Vec<(u32, u32)> = Vec::new();
    for (prio, subs) in &buckets {
        let changers = subs
            .iter()
            .filter(|s| !SubOpts(s.opts).contains(SubOpts::DONE_ONLY))
            .count() as u32;
        if changers == 0 {
            processed.push((*prio, 0));
            continue;
        }
        mailbox.publish(cid, EventKind::Change, rid, *prio, changers, &diff)?;
        let outcome = mailbox.await_replies(cid, timeout);
        let _ = mailbox.finish(cid);
        let outcome = outcome?;
        processed.push((*prio, outcome.succeeded));
        if outcome.code != ErrorCode::Ok {
            abort_fanout(&mailbox, cid, rid, &processed, timeout);
            return Err(Error::from_code(
                outcome.code,
                &format!("change of \"{module}\" failed"),
            ));
        }
    }

    // DONE: errors are logged and ignored
    for (prio, subs) in &buckets {
        let expected = subs.len() as u32;
        if let Err(err) = deliver_logged(
            &mailbox,
            cid,
            EventKind::Done,
            rid,
            *prio,
            expected,
            &diff,
            timeout,
        ) {
            log::warn!("done event of \"{module}\" priority {prio}: {err}");
        }
    }
    Ok(diff)
}

/// Sends a notification of `module`. Fire-and-forget: the call returns once
/// every live subscriber context accounted for the event; subscriber errors
/// are logged only. Returns the number of subscribers notified.
pub fn notif_send(
    conn: &Arc<Connection>,
    module: &str,
    path: &str,
    body: &[u8],
    timestamp: SystemTime,
    timeout: Duration,
) -> Result<u32> {
    if schema::first_module(path)? != module {
        return Err(Error::InvalArg(format!(
            "notification \"{path}\" does not belong to module \"{module}\""
        )));
    }
    let cid = conn.cid();
    let ext_t = conn.config().ext_sub_lock_timeout;
    let mod_idx = module_index(conn, module)?;
    let mailbox = Mailbox::open_map(conn.layout(), module, MailboxTag::Notif, None, ext_t)?;

    let out = conn.with_ext(|main, ext| {
        let anchor = main.notif_anchor(mod_idx)?;
        dir::collect_notif_subs(ext, anchor, cid, ext_t, &|c| conn.is_alive(c))
    })?;
    drain_reclaimed(&mailbox, cid, out.reclaimed);
    let expected = out.live.iter().filter(|s| !s.suspended).count() as u32;
    if expected == 0 {
        return Ok(0);
    }

    let payload = encode_notif(path, timestamp, body)?;
    let rid = mailbox.next_request_id();
    mailbox.publish(cid, EventKind::Notif, rid, 0, expected, &payload)?;
    let outcome = mailbox.await_replies(cid, timeout);
    let _ = mailbox.finish(cid);
    let outcome = outcome?;
    if outcome.code != ErrorCode::Ok {
        log::warn!("notification \"{path}\" subscriber reported {:?}", outcome.code);
    }
    Ok(expected)
}

/// Executes an RPC/action: delivers the single RPC event per priority
/// bucket in ascending priority order. The first non-success skips the
/// remaining subscribers and sends ABORT to the earlier successful ones,
/// highest priority first; the failing subscriber is never aborted.
/// Returns the output of the last callback.
pub fn rpc_send(
    conn: &Arc<Connection>,
    xpath: &str,
    input: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>> {
    let (path, is_ext) = schema::rpc_xpath_check(conn.schema(), xpath)?;
    let module = schema::first_module(&path)?;
    let cid = conn.cid();
    let ext_t = conn.config().ext_sub_lock_timeout;
    let mod_idx = module_index(conn, &module)?;
    let mailbox = Mailbox::open_map(
        conn.layout(),
        &module,
        MailboxTag::Rpc,
        Some(path_hash(&path, 0)),
        ext_t,
    )?;

    let out = conn.with_ext(|main, ext| {
        let anchor = if is_ext {
            main.rpc_ext_anchor(mod_idx)?
        } else {
            let idx = main.find_rpc(ext, &path)?.ok_or_else(|| {
                Error::Internal(format!("operation \"{path}\" missing from module shm"))
            })?;
            main.rpc_anchor(idx)?
        };
        dir::collect_rpc_subs(ext, anchor, cid, ext_t, &|c| conn.is_alive(c), &path)
    })?;
    drain_reclaimed(&mailbox, cid, out.reclaimed);
    let live: Vec<LiveSub> = out.live.into_iter().filter(|s| !s.suspended).collect();
    if live.is_empty() {
        return Err(Error::NotFound(format!(
            "no subscribers for RPC \"{path}\""
        )));
    }

    let rid = mailbox.next_request_id();
    let mut processed: Vec<(u32, u32)> = Vec::new();
    let mut output = Vec::new();
    for (prio, subs) in &buckets(&live, true) {
        mailbox.publish(cid, EventKind::Rpc, rid, *prio, subs.len() as u32, input)?;
        let outcome = mailbox.await_replies(cid, timeout);
        let _ = mailbox.finish(cid);
        let outcome = outcome?;
        processed.push((*prio, outcome.succeeded));
        if outcome.code != ErrorCode::Ok {
            // earlier successes have lower priorities; abort highest first
            processed.reverse();
            abort_fanout(&mailbox, cid, rid, &processed, timeout);
            return Err(Error::from_code(
                outcome.code,
                &format!("RPC \"{path}\" failed"),
            ));
        }
        output = outcome.payload;
    }
    Ok(output)
}

/// Pulls operational data for `path` from every matching provider, highest
/// priority first. The caller merges the returned chunks.
pub fn oper_get_fetch(
    conn: &Arc<Connection>,
    path: &str,
    timeout: Duration,
) -> Result<Vec<OperChunk>> {
    let module = schema::first_module(path)?;
    let cid = conn.cid();
    let ext_t = conn.config().ext_sub_lock_timeout;
    let mod_idx = module_index(conn, &module)?;

    let out = conn.with_ext(|main, ext| {
        let anchor = main.oper_get_anchor(mod_idx)?;
        dir::collect_oper_get_subs(ext, anchor, cid, ext_t, &|c| conn.is_alive(c), path)
    })?;
    let mut live: Vec<LiveSub> = out.live.into_iter().filter(|s| !s.suspended).collect();
    live.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut chunks = Vec::with_capacity(live.len());
    for sub in live {
        let mailbox = Mailbox::open_map(
            conn.layout(),
            &module,
            MailboxTag::Oper,
            Some(path_hash(path, sub.priority)),
            ext_t,
        )?;
        let rid = mailbox.next_request_id();
        mailbox.publish(cid, EventKind::Oper, rid, sub.priority, 1, path.as_bytes())?;
        let outcome = mailbox.await_replies(cid, timeout);
        let _ = mailbox.finish(cid);
        let outcome = outcome?;
        if outcome.code != ErrorCode::Ok {
            return Err(Error::from_code(
                outcome.code,
                &format!("operational get on \"{path}\""),
            ));
        }
        chunks.push(OperChunk {
            sub_id: sub.sub_id,
            priority: sub.priority,
            data: outcome.payload,
        });
    }
    Ok(chunks)
}

impl Subscriptions {
    /// Serves pending events on every mailbox of this context and returns
    /// how many were handled. `start_listen` drives this from a background
    /// thread; clients running their own loop call it directly.
    pub fn process_events(&self) -> Result<u32> {
        let conn = Arc::clone(self.connection());
        let guard = self.inner.lock(
            LockMode::Read,
            conn.config().subscr_lock_timeout,
            conn.cid(),
        )?;
        let reg = guard.get();
        let mut handled = 0u32;
        for group in &reg.change {
            handled += process_change_group(&conn, group)?;
        }
        for group in &reg.oper_get {
            for sub in &group.subs {
                handled += process_oper_sub(&conn, &group.module, sub)?;
            }
        }
        for group in &reg.notif {
            handled += process_notif_group(&conn, group)?;
        }
        for group in &reg.rpc {
            handled += process_rpc_group(&conn, group)?;
        }
        Ok(handled)
    }
}

fn module_index(conn: &Arc<Connection>, module: &str) -> Result<usize> {
    conn.with_ext(|main, ext| main.find_module(ext, module))?
        .ok_or_else(|| Error::NotFound(format!("module \"{module}\" is not installed")))
}

/// Priority buckets, descending for change and ascending for RPC; the
/// subscriber order within a bucket follows the directory (insertion)
/// order.
fn buckets(subs: &[LiveSub], ascending: bool) -> Vec<(u32, Vec<&LiveSub>)> {
    let mut prios: Vec<u32> = subs.iter().map(|s| s.priority).collect();
    if ascending {
        prios.sort_unstable();
    } else {
        prios.sort_unstable_by(|a, b| b.cmp(a));
    }
    prios.dedup();
    prios
        .into_iter()
        .map(|p| (p, subs.iter().filter(|s| s.priority == p).collect()))
        .collect()
}

/// ABORT fan-out to the buckets in `processed` order; entries carry the
/// number of subscribers that succeeded and therefore must see the abort.
fn abort_fanout(mailbox: &Mailbox, cid: Cid, rid: u32, processed: &[(u32, u32)], timeout: Duration) {
    for (prio, succeeded) in processed {
        if *succeeded == 0 {
            continue;
        }
        if let Err(err) = deliver_logged(
            mailbox,
            cid,
            EventKind::Abort,
            rid,
            *prio,
            *succeeded,
            &[],
            timeout,
        ) {
            log::warn!("abort fan-out priority {prio}: {err}");
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn deliver_logged(
    mailbox: &Mailbox,
    cid: Cid,
    event: EventKind,
    rid: u32,
    priority: u32,
    expected: u32,
    payload: &[u8],
    timeout: Duration,
) -> Result<()> {
    if expected == 0 {
        return Ok(());
    }
    mailbox.publish(cid, event, rid, priority, expected, payload)?;
    let outcome = mailbox.await_replies(cid, timeout);
    let _ = mailbox.finish(cid);
    let outcome = outcome?;
    if outcome.code != ErrorCode::Ok {
        log::warn!("{event:?} event reported {:?}", outcome.code);
    }
    Ok(())
}

/// Accounts the reclaimed descriptors' share of an event that is still in
/// flight, so its producer is not left waiting for dead subscribers.
fn drain_reclaimed(mailbox: &Mailbox, cid: Cid, reclaimed: u32) {
    if reclaimed > 0 && mailbox.in_flight().is_some() {
        mailbox.reply_ignored(cid, reclaimed, "dead subscriber recovery");
    }
}

fn process_change_group(conn: &Arc<Connection>, group: &ChangeGroup) -> Result<u32> {
    let cid = conn.cid();
    let snap = group.mailbox.snapshot();
    if snap.event == EventKind::None {
        return Ok(0);
    }
    if group.seen.matches(&snap) {
        if snap.event == EventKind::Change {
            return retry_shelved(conn, group, &snap);
        }
        return Ok(0);
    }

    let rid = snap.request_id;
    let locals: Vec<&ChangeSub> = group
        .subs
        .iter()
        .filter(|s| s.priority == snap.priority)
        .collect();
    let relevant: Vec<&ChangeSub> = match snap.event {
        EventKind::Update => locals
            .into_iter()
            .filter(|s| s.opts.contains(SubOpts::UPDATE))
            .collect(),
        EventKind::Change => locals
            .into_iter()
            .filter(|s| !s.opts.contains(SubOpts::DONE_ONLY))
            .collect(),
        EventKind::Done => locals,
        EventKind::Abort => locals
            .into_iter()
            .filter(|s| s.done_rid.load(Ordering::Acquire) == rid)
            .collect(),
        _ => Vec::new(),
    };
    if relevant.is_empty() {
        group.seen.store(&snap);
        return Ok(0);
    }

    let payload = group.mailbox.read_payload(cid)?;
    let ev_sess = conn.implicit_session(group.ds, snap.event);
    let mut current = payload;
    let mut succeeded = 0u32;
    let mut failed = 0u32;
    let mut code = ErrorCode::Ok;
    let mut reply_payload: Option<Vec<u8>> = None;
    let mut halted = false;

    for sub in &relevant {
        if halted || sub.suspended.load(Ordering::Acquire) {
            failed += 1;
            continue;
        }
        let event = match snap.event {
            EventKind::Update => ChangeEvent::Update { diff: &current },
            EventKind::Change => ChangeEvent::Change { diff: &current },
            EventKind::Done => ChangeEvent::Done,
            _ => ChangeEvent::Abort,
        };
        let result = (sub.cb)(
            &ev_sess,
            sub.sub_id,
            &group.module,
            sub.xpath.as_deref(),
            event,
            rid,
        );
        match result {
            Ok(edited) => {
                succeeded += 1;
                match snap.event {
                    EventKind::Update => {
                        if let Some(new_diff) = edited {
                            current = new_diff;
                        }
                        reply_payload = Some(current.clone());
                    }
                    EventKind::Change => sub.done_rid.store(rid, Ordering::Release),
                    _ => {}
                }
            }
            Err(Error::CallbackShelve) if snap.event == EventKind::Change => {
                // no reply for this subscriber; retried on a later poll
                sub.shelved_rid.store(rid, Ordering::Release);
            }
            Err(err) => match snap.event {
                EventKind::Done | EventKind::Abort => {
                    log::warn!(
                        "{:?} callback of subscription {} failed: {err}",
                        snap.event,
                        sub.sub_id
                    );
                    succeeded += 1;
                }
                _ => {
                    log::warn!(
                        "{:?} callback of subscription {} failed: {err}",
                        snap.event,
                        sub.sub_id
                    );
                    failed += 1;
                    if code == ErrorCode::Ok {
                        code = match err.code() {
                            ErrorCode::Ok | ErrorCode::CallbackShelve => ErrorCode::CallbackFailed,
                            other => other,
                        };
                    }
                    halted = true;
                }
            },
        }
    }

    group.seen.store(&snap);
    group
        .mailbox
        .reply(cid, succeeded, failed, code, reply_payload.as_deref())?;
    Ok(1)
}

/// Re-dispatches subscribers that shelved the current CHANGE event.
fn retry_shelved(conn: &Arc<Connection>, group: &ChangeGroup, snap: &EventSnapshot) -> Result<u32> {
    let cid = conn.cid();
    let rid = snap.request_id;
    let pending: Vec<&ChangeSub> = group
        .subs
        .iter()
        .filter(|s| s.priority == snap.priority && s.shelved_rid.load(Ordering::Acquire) == rid)
        .collect();
    if pending.is_empty() {
        return Ok(0);
    }
    let payload = group.mailbox.read_payload(cid)?;
    let ev_sess = conn.implicit_session(group.ds, EventKind::Change);
    let mut succeeded = 0u32;
    let mut failed = 0u32;
    let mut code = ErrorCode::Ok;
    for sub in pending {
        let result = (sub.cb)(
            &ev_sess,
            sub.sub_id,
            &group.module,
            sub.xpath.as_deref(),
            ChangeEvent::Change { diff: &payload },
            rid,
        );
        match result {
            Ok(_) => {
                sub.shelved_rid.store(0, Ordering::Release);
                sub.done_rid.store(rid, Ordering::Release);
                succeeded += 1;
            }
            Err(Error::CallbackShelve) => {}
            Err(err) => {
                log::warn!(
                    "shelved change callback of subscription {} failed: {err}",
                    sub.sub_id
                );
                sub.shelved_rid.store(0, Ordering::Release);
                failed += 1;
                if code == ErrorCode::Ok {
                    code = err.code();
                }
            }
        }
    }
    if succeeded + failed > 0 {
        group.mailbox.reply(cid, succeeded, failed, code, None)?;
    }
    Ok(succeeded + failed)
}

fn process_oper_sub(conn: &Arc<Connection>, module: &str, sub: &OperGetSub) -> Result<u32> {
    let cid = conn.cid();
    let snap = sub.mailbox.snapshot();
    if snap.event != EventKind::Oper || sub.seen.matches(&snap) {
        return Ok(0);
    }
    let payload = sub.mailbox.read_payload(cid)?;
    sub.seen.store(&snap);
    if sub.suspended.load(Ordering::Acquire) {
        sub.mailbox.reply(cid, 0, 1, ErrorCode::Ok, None)?;
        return Ok(1);
    }
    let requested = String::from_utf8_lossy(&payload).into_owned();
    let ev_sess = conn.implicit_session(Datastore::Operational, EventKind::Oper);
    match (sub.cb)(&ev_sess, sub.sub_id, module, &requested, snap.request_id) {
        Ok(data) => sub.mailbox.reply(cid, 1, 0, ErrorCode::Ok, Some(&data))?,
        Err(err) => {
            log::warn!(
                "oper get callback of subscription {} failed: {err}",
                sub.sub_id
            );
            sub.mailbox.reply(cid, 0, 1, err.code(), None)?;
        }
    }
    Ok(1)
}

fn process_notif_group(conn: &Arc<Connection>, group: &NotifGroup) -> Result<u32> {
    let cid = conn.cid();
    let snap = group.mailbox.snapshot();
    if snap.event != EventKind::Notif || group.seen.matches(&snap) {
        return Ok(0);
    }
    let payload = group.mailbox.read_payload(cid)?;
    group.seen.store(&snap);
    let (path, timestamp, body) = decode_notif(&payload)?;
    let ev_sess = conn.implicit_session(Datastore::Operational, EventKind::Notif);

    let mut accounted = 0u32;
    let mut ignored = 0u32;
    for sub in &group.subs {
        if sub.suspended.load(Ordering::Acquire) {
            ignored += 1;
            continue;
        }
        let selected = sub
            .xpath
            .as_deref()
            .map_or(true, |xpath| schema::xpath_selects_path(xpath, &path));
        if selected && sub.accepts(timestamp) {
            invoke_notif_cb(
                &sub.cb,
                &ev_sess,
                sub.sub_id,
                NotifType::Realtime,
                Some(&path),
                &body,
                timestamp,
            );
        }
        accounted += 1;
    }
    group.mailbox.reply(cid, accounted, ignored, ErrorCode::Ok, None)?;
    Ok(1)
}

fn process_rpc_group(conn: &Arc<Connection>, group: &RpcGroup) -> Result<u32> {
    let cid = conn.cid();
    let snap = group.mailbox.snapshot();
    if !matches!(snap.event, EventKind::Rpc | EventKind::Abort) || group.seen.matches(&snap) {
        return Ok(0);
    }
    let rid = snap.request_id;
    let locals: Vec<_> = group
        .subs
        .iter()
        .filter(|s| s.priority == snap.priority)
        .collect();
    let relevant: Vec<_> = match snap.event {
        EventKind::Rpc => locals,
        _ => locals
            .into_iter()
            .filter(|s| s.done_rid.load(Ordering::Acquire) == rid)
            .collect(),
    };
    group.seen.store(&snap);
    if relevant.is_empty() {
        return Ok(0);
    }

    let payload = group.mailbox.read_payload(cid)?;
    let ev_sess = conn.implicit_session(Datastore::Operational, snap.event);
    let mut succeeded = 0u32;
    let mut failed = 0u32;
    let mut code = ErrorCode::Ok;
    let mut output: Option<Vec<u8>> = None;
    let mut halted = false;

    for sub in relevant {
        if halted || sub.suspended.load(Ordering::Acquire) {
            failed += 1;
            continue;
        }
        let event = match snap.event {
            EventKind::Rpc => RpcEvent::Rpc { input: &payload },
            _ => RpcEvent::Abort,
        };
        match invoke_rpc_cb(&sub.cb, &ev_sess, sub.sub_id, &group.path, event, rid) {
            Ok(out) => {
                succeeded += 1;
                if snap.event == EventKind::Rpc {
                    sub.done_rid.store(rid, Ordering::Release);
                    output = Some(out);
                }
            }
            Err(err) => {
                if snap.event == EventKind::Abort {
                    log::warn!(
                        "abort callback of RPC subscription {} failed: {err}",
                        sub.sub_id
                    );
                    succeeded += 1;
                } else {
                    log::warn!("RPC callback of subscription {} failed: {err}", sub.sub_id);
                    failed += 1;
                    if code == ErrorCode::Ok {
                        code = match err.code() {
                            ErrorCode::Ok | ErrorCode::CallbackShelve => ErrorCode::CallbackFailed,
                            other => other,
                        };
                    }
                    halted = true;
                }
            }
        }
    }
    group
        .mailbox
        .reply(cid, succeeded, failed, code, output.as_deref())?;
    Ok(1)
}

fn invoke_rpc_cb(
    cb: &RpcCallback,
    sess: &crate::session::Session,
    sub_id: SubId,
    path: &str,
    event: RpcEvent<'_>,
    rid: u32,
) -> Result<Vec<u8>> {
    match cb {
        RpcCallback::Tree(cb) => cb(sess, sub_id, path, event, rid),
        RpcCallback::Values(cb) => match event {
            RpcEvent::Rpc { input } => {
                let values = if input.is_empty() {
                    Vec::new()
                } else {
                    decode_values(input)?
                };
                let out = cb(sess, sub_id, path, RpcValsEvent::Rpc { input: &values }, rid)?;
                Ok(encode_values(&out))
            }
            RpcEvent::Abort => {
                cb(sess, sub_id, path, RpcValsEvent::Abort, rid)?;
                Ok(Vec::new())
            }
        },
    }
}

/// Encodes a `(path, value)` list for the value-flavoured callbacks.
pub fn encode_values(values: &[PathValue]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for value in values {
        buf.extend_from_slice(&(value.xpath.len() as u32).to_le_bytes());
        buf.extend_from_slice(value.xpath.as_bytes());
        buf.extend_from_slice(&(value.value.len() as u32).to_le_bytes());
        buf.extend_from_slice(&value.value);
    }
    buf
}

pub fn decode_values(buf: &[u8]) -> Result<Vec<PathValue>> {
    let mut cursor = Cursor::new(buf);
    let count = cursor.read_u32()?;
    let mut values = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let xpath_len = cursor.read_u32()?;
        let xpath = String::from_utf8(cursor.read_bytes(xpath_len as usize)?.to_vec())
            .map_err(|_| Error::Internal("value path is not utf-8".into()))?;
        let value_len = cursor.read_u32()?;
        let value = cursor.read_bytes(value_len as usize)?.to_vec();
        values.push(PathValue { xpath, value });
    }
    Ok(values)
}

/// Notification envelope: `[path len][path][secs][nanos][body]`.
fn encode_notif(path: &str, timestamp: SystemTime, body: &[u8]) -> Result<Vec<u8>> {
    let since_epoch = timestamp
        .duration_since(UNIX_EPOCH)
        .map_err(|_| Error::InvalArg("notification timestamp precedes the epoch".into()))?;
    let mut buf = Vec::with_capacity(4 + path.len() + 12 + body.len());
    buf.extend_from_slice(&(path.len() as u32).to_le_bytes());
    buf.extend_from_slice(path.as_bytes());
    buf.extend_from_slice(&since_epoch.as_secs().to_le_bytes());
    buf.extend_from_slice(&since_epoch.subsec_nanos().to_le_bytes());
    buf.extend_from_slice(body);
    Ok(buf)
}

fn decode_notif(buf: &[u8]) -> Result<(String, SystemTime, Vec<u8>)> {
    let mut cursor = Cursor::new(buf);
    let path_len = cursor.read_u32()?;
    let path = String::from_utf8(cursor.read_bytes(path_len as usize)?.to_vec())
        .map_err(|_| Error::Internal("notification path is not utf-8".into()))?;
    let secs = cursor.read_u64()?;
    let nanos = cursor.read_u32()?;
    let timestamp = UNIX_EPOCH + Duration::new(secs, nanos);
    let body = cursor.rest().to_vec();
    Ok((path, timestamp, body))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Cursor<'a> {
        Cursor { buf, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Error::Internal("truncated event payload".into()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_round_trip() {
        let values = vec![
            PathValue {
                xpath: "/m:alarm/severity".into(),
                value: b"critical".to_vec(),
            },
            PathValue {
                xpath: "/m:alarm/source".into(),
                value: b"eth0".to_vec(),
            },
        ];
        let encoded = encode_values(&values);
        assert_eq!(decode_values(&encoded).unwrap(), values);
    }

    #[test]
    fn notif_envelope_round_trip() {
        let ts = UNIX_EPOCH + Duration::new(1_700_000_000, 123);
        let encoded = encode_notif("/m:alarm", ts, b"payload").unwrap();
        let (path, decoded_ts, body) = decode_notif(&encoded).unwrap();
        assert_eq!(path, "/m:alarm");
        assert_eq!(decoded_ts, ts);
        assert_eq!(body, b"payload");
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let encoded = encode_values(&[PathValue {
            xpath: "/m:x".into(),
            value: vec![1, 2, 3],
        }]);
        assert!(decode_values(&encoded[..encoded.len() - 2]).is_err());
    }

    #[test]
    fn buckets_order_and_ties() {
        let sub = |sub_id, priority| LiveSub {
            cid: 1,
            sub_id,
            priority,
            opts: 0,
            suspended: false,
            selector: None,
        };
        let subs = vec![sub(1, 10), sub(2, 5), sub(3, 10)];
        let desc = buckets(&subs, false);
        assert_eq!(desc.len(), 2);
        assert_eq!(desc[0].0, 10);
        // ties keep directory order
        assert_eq!(desc[0].1[0].sub_id, 1);
        assert_eq!(desc[0].1[1].sub_id, 3);
        assert_eq!(desc[1].0, 5);
        let asc = buckets(&subs, true);
        assert_eq!(asc[0].0, 5);
        assert_eq!(asc[1].0, 10);
    }
}
