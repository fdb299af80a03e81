//! Registry bookkeeping: lookups, add/remove round trips, session
//! cascades and the oper-poll timer path.

mod common;

use std::time::Duration;

use yangbus::{Datastore, Error, SubKind, SubOpts};

#[test]
fn sub_ids_are_unique_and_looked_up_unambiguously() {
    let dir = tempfile::tempdir().unwrap();
    let (conn, subscr) = common::establish(&dir);
    let sess = conn.session_start(Datastore::Running);

    let a = subscr
        .change_subscribe(&sess, "my-mod", None, 1, SubOpts::NONE, |_s, _i, _m, _x, _e, _r| {
            Ok(None)
        })
        .unwrap();
    let b = subscr
        .change_subscribe(&sess, "ietf-interfaces", None, 2, SubOpts::NONE, |_s, _i, _m, _x, _e, _r| {
            Ok(None)
        })
        .unwrap();
    let c = subscr
        .oper_poll_subscribe(&sess, "/my-mod:state-tree", Duration::from_secs(1), SubOpts::NONE)
        .unwrap();
    assert!(a < b && b < c);
    assert_eq!(subscr.last_sub_id().unwrap(), c);

    let info = subscr.sub_info(b).unwrap();
    assert_eq!(info.kind, SubKind::Change);
    assert_eq!(info.target, "ietf-interfaces");
    assert_eq!(info.datastore, Some(Datastore::Running));
    assert_eq!(info.priority, 2);
    assert_eq!(info.session_id, sess.id());

    let info = subscr.sub_info(c).unwrap();
    assert_eq!(info.kind, SubKind::OperPoll);
    assert_eq!(info.target, "my-mod");
}

#[test]
fn add_then_remove_restores_the_registry() {
    let dir = tempfile::tempdir().unwrap();
    let (conn, subscr) = common::establish(&dir);
    let sess = conn.session_start(Datastore::Candidate);

    assert_eq!(subscr.len().unwrap(), 0);
    let sub_id = subscr
        .change_subscribe(&sess, "my-mod", None, 0, SubOpts::NONE, |_s, _i, _m, _x, _e, _r| {
            Ok(None)
        })
        .unwrap();
    assert_eq!(subscr.len().unwrap(), 1);
    assert_eq!(subscr.session_count(&sess).unwrap(), 1);

    subscr.unsubscribe(sub_id).unwrap();
    assert_eq!(subscr.len().unwrap(), 0);
    assert_eq!(subscr.session_count(&sess).unwrap(), 0);
    assert!(matches!(subscr.sub_info(sub_id), Err(Error::NotFound(_))));
    // only the last-sub-id marker differs from a fresh registry
    assert_eq!(subscr.last_sub_id().unwrap(), sub_id);

    // removing again is reported, not silently accepted
    assert!(matches!(
        subscr.unsubscribe(sub_id),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn mailbox_files_follow_group_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let (conn, subscr) = common::establish(&dir);
    let sess = conn.session_start(Datastore::Running);
    let subs_dir = conn.layout().subscriptions_dir();

    let a = subscr
        .change_subscribe(&sess, "my-mod", None, 0, SubOpts::NONE, |_s, _i, _m, _x, _e, _r| {
            Ok(None)
        })
        .unwrap();
    let b = subscr
        .change_subscribe(&sess, "my-mod", None, 9, SubOpts::NONE, |_s, _i, _m, _x, _e, _r| {
            Ok(None)
        })
        .unwrap();
    let mailbox = subs_dir.join("my-mod.running.mbox");
    assert!(mailbox.exists());

    subscr.unsubscribe(a).unwrap();
    // the group still has a member, the mailbox stays
    assert!(mailbox.exists());
    subscr.unsubscribe(b).unwrap();
    assert!(!mailbox.exists());

    // oper-poll subscriptions never create a mailbox
    let count_before = std::fs::read_dir(&subs_dir).unwrap().count();
    subscr
        .oper_poll_subscribe(&sess, "/my-mod:state-tree", Duration::from_secs(1), SubOpts::NONE)
        .unwrap();
    assert_eq!(std::fs::read_dir(&subs_dir).unwrap().count(), count_before);
}

#[test]
fn session_stop_cascades_across_contexts() {
    let dir = tempfile::tempdir().unwrap();
    let (conn, subscr) = common::establish(&dir);
    let other = yangbus::Subscriptions::new(&conn);
    let sess = conn.session_start(Datastore::Running);
    let keeper = conn.session_start(Datastore::Running);

    subscr
        .change_subscribe(&sess, "my-mod", None, 0, SubOpts::NONE, |_s, _i, _m, _x, _e, _r| {
            Ok(None)
        })
        .unwrap();
    other
        .change_subscribe(&sess, "ietf-interfaces", None, 0, SubOpts::NONE, |_s, _i, _m, _x, _e, _r| {
            Ok(None)
        })
        .unwrap();
    subscr
        .change_subscribe(&keeper, "my-mod", None, 1, SubOpts::NONE, |_s, _i, _m, _x, _e, _r| {
            Ok(None)
        })
        .unwrap();

    sess.stop().unwrap();
    assert_eq!(subscr.session_count(&sess).unwrap(), 0);
    assert_eq!(other.session_count(&sess).unwrap(), 0);
    // the other session's subscription survives
    assert_eq!(subscr.session_count(&keeper).unwrap(), 1);
    assert_eq!(subscr.len().unwrap(), 1);
    assert_eq!(other.len().unwrap(), 0);
}

#[test]
fn oper_poll_cache_expiry_is_timer_driven() {
    let dir = tempfile::tempdir().unwrap();
    let (conn, subscr) = common::establish(&dir);
    let sess = conn.session_start(Datastore::Operational);

    let sub_id = subscr
        .oper_poll_subscribe(
            &sess,
            "/my-mod:state-tree",
            Duration::from_millis(40),
            SubOpts::OPER_POLL_DIFF,
        )
        .unwrap();

    // never refreshed: due immediately
    let due = subscr.oper_poll_due().unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].sub_id, sub_id);
    assert_eq!(due[0].path, "/my-mod:state-tree");
    assert!(due[0].diff);

    subscr.oper_poll_refreshed(sub_id).unwrap();
    assert!(subscr.oper_poll_due().unwrap().is_empty());

    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(subscr.oper_poll_due().unwrap().len(), 1);

    let err = subscr
        .oper_poll_subscribe(&sess, "/my-mod:state-tree", Duration::ZERO, SubOpts::NONE)
        .unwrap_err();
    assert!(matches!(err, Error::InvalArg(_)));
}
