//! Multi-phase change commits: UPDATE ordering, CHANGE priority buckets,
//! DONE delivery, ABORT targeting and shelving.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use yangbus::{change_notify, ChangeEvent, Datastore, Error, SubOpts};

const T: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Update,
    Change,
    Done,
    Abort,
}

type Trace = Arc<Mutex<Vec<(Phase, u32)>>>;

fn record(trace: &Trace, event: &ChangeEvent<'_>, priority: u32) {
    let phase = match event {
        ChangeEvent::Update { .. } => Phase::Update,
        ChangeEvent::Change { .. } => Phase::Change,
        ChangeEvent::Done => Phase::Done,
        ChangeEvent::Abort => Phase::Abort,
    };
    trace.lock().unwrap().push((phase, priority));
}

#[test]
fn update_and_change_respect_priorities() {
    let dir = tempfile::tempdir().unwrap();
    let (conn, subscr) = common::establish(&dir);
    let sess = conn.session_start(Datastore::Running);
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));

    for priority in [10u32, 5, 10] {
        let trace = Arc::clone(&trace);
        subscr
            .change_subscribe(
                &sess,
                "ietf-interfaces",
                None,
                priority,
                SubOpts::UPDATE,
                move |_sess, _id, module, _xpath, event, _rid| {
                    assert_eq!(module, "ietf-interfaces");
                    record(&trace, &event, priority);
                    Ok(None)
                },
            )
            .unwrap();
    }
    subscr.start_listen().unwrap();

    let diff = change_notify(&conn, "ietf-interfaces", Datastore::Running, b"diff", T).unwrap();
    assert_eq!(diff, b"diff");
    subscr.stop_listen();

    let trace = trace.lock().unwrap();
    let updates: Vec<u32> = trace
        .iter()
        .filter(|(p, _)| *p == Phase::Update)
        .map(|(_, prio)| *prio)
        .collect();
    // highest priority first, ties in subscription order
    assert_eq!(updates, vec![10, 10, 5]);
    let changes: Vec<u32> = trace
        .iter()
        .filter(|(p, _)| *p == Phase::Change)
        .map(|(_, prio)| *prio)
        .collect();
    assert_eq!(changes, vec![10, 10, 5]);
    let dones = trace.iter().filter(|(p, _)| *p == Phase::Done).count();
    assert_eq!(dones, 3);
    assert!(trace.iter().all(|(p, _)| *p != Phase::Abort));
}

#[test]
fn update_callbacks_extend_the_diff() {
    let dir = tempfile::tempdir().unwrap();
    let (conn, subscr) = common::establish(&dir);
    let sess = conn.session_start(Datastore::Running);
    let seen_by_change: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));

    subscr
        .change_subscribe(
            &sess,
            "my-mod",
            None,
            7,
            SubOpts::UPDATE,
            move |_sess, _id, _module, _xpath, event, _rid| match event {
                ChangeEvent::Update { diff } => {
                    let mut extended = diff.to_vec();
                    extended.extend_from_slice(b"+more");
                    Ok(Some(extended))
                }
                _ => Ok(None),
            },
        )
        .unwrap();
    {
        let seen = Arc::clone(&seen_by_change);
        subscr
            .change_subscribe(
                &sess,
                "my-mod",
                None,
                3,
                SubOpts::NONE,
                move |_sess, _id, _module, _xpath, event, _rid| {
                    if let ChangeEvent::Change { diff } = event {
                        seen.lock().unwrap().push(diff.to_vec());
                    }
                    Ok(None)
                },
            )
            .unwrap();
    }
    subscr.start_listen().unwrap();

    let diff = change_notify(&conn, "my-mod", Datastore::Running, b"base", T).unwrap();
    subscr.stop_listen();

    assert_eq!(diff, b"base+more");
    let seen = seen_by_change.lock().unwrap();
    assert_eq!(seen.as_slice(), &[b"base+more".to_vec()]);
}

#[test]
fn failing_change_aborts_only_successful_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let (conn, subscr) = common::establish(&dir);
    let sess = conn.session_start(Datastore::Running);
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));

    // priority 10 succeeds, priority 5 fails its CHANGE
    {
        let trace = Arc::clone(&trace);
        subscr
            .change_subscribe(
                &sess,
                "ietf-interfaces",
                None,
                10,
                SubOpts::NONE,
                move |_sess, _id, _module, _xpath, event, _rid| {
                    record(&trace, &event, 10);
                    Ok(None)
                },
            )
            .unwrap();
    }
    {
        let trace = Arc::clone(&trace);
        subscr
            .change_subscribe(
                &sess,
                "ietf-interfaces",
                None,
                5,
                SubOpts::NONE,
                move |_sess, _id, _module, _xpath, event, _rid| {
                    record(&trace, &event, 5);
                    match event {
                        ChangeEvent::Change { .. } => {
                            Err(Error::OperationFailed("validation refused".into()))
                        }
                        _ => Ok(None),
                    }
                },
            )
            .unwrap();
    }
    subscr.start_listen().unwrap();

    let err = change_notify(&conn, "ietf-interfaces", Datastore::Running, b"diff", T).unwrap_err();
    subscr.stop_listen();
    assert!(matches!(err, Error::OperationFailed(_)));

    let trace = trace.lock().unwrap();
    // the successful priority-10 subscriber is aborted, the failing one is not
    assert!(trace.contains(&(Phase::Abort, 10)));
    assert!(!trace.contains(&(Phase::Abort, 5)));
    assert!(trace.iter().all(|(p, _)| *p != Phase::Done));
}

#[test]
fn shelved_change_is_retried_until_processed() {
    let dir = tempfile::tempdir().unwrap();
    let (conn, subscr) = common::establish(&dir);
    let sess = conn.session_start(Datastore::Running);
    let attempts = Arc::new(Mutex::new(Vec::new()));

    {
        let attempts = Arc::clone(&attempts);
        subscr
            .change_subscribe(
                &sess,
                "my-mod",
                None,
                0,
                SubOpts::NONE,
                move |_sess, _id, _module, _xpath, event, rid| {
                    if let ChangeEvent::Change { .. } = event {
                        let mut attempts = attempts.lock().unwrap();
                        attempts.push(rid);
                        if attempts.len() == 1 {
                            return Err(Error::CallbackShelve);
                        }
                    }
                    Ok(None)
                },
            )
            .unwrap();
    }
    subscr.start_listen().unwrap();

    change_notify(&conn, "my-mod", Datastore::Running, b"diff", T).unwrap();
    subscr.stop_listen();

    let attempts = attempts.lock().unwrap();
    assert_eq!(attempts.len(), 2);
    // both attempts belong to the same request
    assert_eq!(attempts[0], attempts[1]);
}

#[test]
fn commit_without_subscribers_passes_through() {
    let dir = tempfile::tempdir().unwrap();
    let (conn, _subscr) = common::establish(&dir);
    let diff = change_notify(&conn, "my-mod", Datastore::Running, b"noop", T).unwrap();
    assert_eq!(diff, b"noop");
}
