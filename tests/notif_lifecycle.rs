//! Notification delivery, stop-time expiry and suspension.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use yangbus::{notif_send, Datastore, Error, NotifCallback, NotifType};

const T: Duration = Duration::from_secs(3);

type Signals = Arc<Mutex<Vec<NotifType>>>;

fn signal_recorder(signals: &Signals) -> NotifCallback {
    let signals = Arc::clone(signals);
    NotifCallback::Tree(Box::new(move |_sess, _id, notif_type, _path, _body, _ts| {
        signals.lock().unwrap().push(notif_type);
    }))
}

#[test]
fn realtime_notification_reaches_matching_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let (conn, subscr) = common::establish(&dir);
    let sess = conn.session_start(Datastore::Operational);
    let received = Arc::new(Mutex::new(Vec::new()));

    {
        let received = Arc::clone(&received);
        subscr
            .notif_subscribe(
                &sess,
                "my-mod",
                Some("/my-mod:alarm"),
                None,
                None,
                NotifCallback::Tree(Box::new(move |_sess, _id, notif_type, path, body, _ts| {
                    assert_eq!(notif_type, NotifType::Realtime);
                    received
                        .lock()
                        .unwrap()
                        .push((path.unwrap().to_string(), body.to_vec()));
                })),
            )
            .unwrap();
    }
    // an unrelated filter never fires
    let other = Arc::new(Mutex::new(Vec::new()));
    {
        let other = Arc::clone(&other);
        subscr
            .notif_subscribe(
                &sess,
                "my-mod",
                Some("/my-mod:config-tree"),
                None,
                None,
                NotifCallback::Tree(Box::new(move |_sess, _id, _ty, path, _body, _ts| {
                    other.lock().unwrap().push(path.map(str::to_string));
                })),
            )
            .unwrap_err();
        // config-tree selects no notifications, so the subscribe itself
        // must already fail
    }
    subscr.start_listen().unwrap();

    let notified = notif_send(
        &conn,
        "my-mod",
        "/my-mod:alarm",
        b"severity=critical",
        SystemTime::now(),
        T,
    )
    .unwrap();
    subscr.stop_listen();

    assert_eq!(notified, 1);
    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, "/my-mod:alarm");
    assert_eq!(received[0].1, b"severity=critical");
    assert!(other.lock().unwrap().is_empty());
}

#[test]
fn stop_time_expiry_terminates_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let (conn, subscr) = common::establish(&dir);
    let sess = conn.session_start(Datastore::Operational);
    let signals: Signals = Arc::new(Mutex::new(Vec::new()));

    let sub_id = subscr
        .notif_subscribe(
            &sess,
            "my-mod",
            None,
            None,
            Some(SystemTime::now() + Duration::from_millis(50)),
            signal_recorder(&signals),
        )
        .unwrap();
    subscr.start_listen().unwrap();
    std::thread::sleep(Duration::from_millis(200));
    subscr.stop_listen();

    let signals = signals.lock().unwrap();
    let terminated = signals
        .iter()
        .filter(|s| **s == NotifType::Terminated)
        .count();
    assert_eq!(terminated, 1);

    // gone from the registry and from the shared directory
    assert!(matches!(subscr.sub_info(sub_id), Err(Error::NotFound(_))));
    assert_eq!(subscr.len().unwrap(), 0);
    let notified = notif_send(
        &conn,
        "my-mod",
        "/my-mod:alarm",
        b"late",
        SystemTime::now(),
        T,
    )
    .unwrap();
    assert_eq!(notified, 0);
}

#[test]
fn stop_time_in_the_past_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (conn, subscr) = common::establish(&dir);
    let sess = conn.session_start(Datastore::Operational);
    let signals: Signals = Arc::new(Mutex::new(Vec::new()));

    let err = subscr
        .notif_subscribe(
            &sess,
            "my-mod",
            None,
            None,
            Some(SystemTime::now() - Duration::from_secs(1)),
            signal_recorder(&signals),
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalArg(_)));
    assert_eq!(subscr.len().unwrap(), 0);
}

#[test]
fn suspension_skips_delivery_and_resume_does_not_replay() {
    let dir = tempfile::tempdir().unwrap();
    let (conn, subscr) = common::establish(&dir);
    let sess = conn.session_start(Datastore::Operational);
    let signals: Signals = Arc::new(Mutex::new(Vec::new()));

    let sub_id = subscr
        .notif_subscribe(&sess, "my-mod", None, None, None, signal_recorder(&signals))
        .unwrap();
    subscr.start_listen().unwrap();

    subscr.suspend(sub_id).unwrap();
    assert!(matches!(
        subscr.suspend(sub_id),
        Err(Error::InvalArg(_))
    ));
    assert!(subscr.sub_info(sub_id).unwrap().suspended);

    // a suspended subscriber is skipped, not removed
    let notified = notif_send(
        &conn,
        "my-mod",
        "/my-mod:alarm",
        b"missed",
        SystemTime::now(),
        T,
    )
    .unwrap();
    assert_eq!(notified, 0);

    subscr.resume(sub_id).unwrap();
    let notified = notif_send(
        &conn,
        "my-mod",
        "/my-mod:alarm",
        b"seen",
        SystemTime::now(),
        T,
    )
    .unwrap();
    assert_eq!(notified, 1);
    subscr.stop_listen();

    let signals = signals.lock().unwrap();
    assert_eq!(
        signals.as_slice(),
        &[
            NotifType::Suspended,
            NotifType::Resumed,
            NotifType::Realtime
        ]
    );
}

#[test]
fn context_teardown_terminates_notification_subscriptions() {
    let dir = tempfile::tempdir().unwrap();
    let (conn, subscr) = common::establish(&dir);
    let sess = conn.session_start(Datastore::Operational);
    let signals: Signals = Arc::new(Mutex::new(Vec::new()));

    subscr
        .notif_subscribe(&sess, "my-mod", None, None, None, signal_recorder(&signals))
        .unwrap();
    subscr
        .notif_subscribe(&sess, "my-mod", None, None, None, signal_recorder(&signals))
        .unwrap();

    subscr.unsubscribe_all().unwrap();
    assert_eq!(subscr.len().unwrap(), 0);
    let signals = signals.lock().unwrap();
    let terminated = signals
        .iter()
        .filter(|s| **s == NotifType::Terminated)
        .count();
    assert_eq!(terminated, 2);
}
