//! Stop-time housekeeper.
//!
//! A small poll thread removing notification subscriptions whose stop time
//! has passed. Each expired subscription goes through the regular removal
//! path, so the ext-SHM mirror, the mailbox drain and the synthetic
//! TERMINATED signal all happen under the normal lock protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::registry::Subscriptions;

pub(crate) fn spawn(
    subscr: Weak<Subscriptions>,
    shutdown: Arc<AtomicBool>,
    period: Duration,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while !shutdown.load(Ordering::Acquire) {
            match subscr.upgrade() {
                Some(subscr) => match subscr.expire_notifs() {
                    Ok(0) => {}
                    Ok(removed) => {
                        log::debug!("removed {removed} expired notification subscription(s)")
                    }
                    Err(err) => log::warn!("notification stop-time sweep failed: {err}"),
                },
                None => break,
            }
            std::thread::sleep(period);
        }
    })
}
