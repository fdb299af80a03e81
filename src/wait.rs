//! Cross-process waiting on atomic words in shared memory.
//!
//! Blocking lock and mailbox waits go through a futex on Linux. The wait is
//! advisory: callers re-check their predicate and their own deadline after
//! every return, so spurious wakeups, `EINTR` and kernel-side timeouts are
//! all folded into `Ok(())`. `EFAULT` is also folded in: a concurrent remap
//! of the ext region can briefly invalidate the address and the caller will
//! simply retry on the fresh mapping.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

use crate::Result;

#[cfg(target_os = "linux")]
pub fn wait_u32(addr: &AtomicU32, expected: u32, timeout: Option<Duration>) -> Result<()> {
    use libc::{syscall, timespec, SYS_futex, EAGAIN, EFAULT, EINTR, ETIMEDOUT, FUTEX_WAIT};

    let mut ts = timespec { tv_sec: 0, tv_nsec: 0 };
    let ts_ptr = if let Some(timeout) = timeout {
        ts.tv_sec = timeout.as_secs() as libc::time_t;
        ts.tv_nsec = timeout.subsec_nanos() as libc::c_long;
        &ts as *const timespec
    } else {
        std::ptr::null()
    };

    let res = unsafe {
        syscall(
            SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0,
        )
    };
    if res == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == EAGAIN || code == EINTR || code == ETIMEDOUT || code == EFAULT => {
            Ok(())
        }
        _ => Err(crate::Error::Io(err)),
    }
}

#[cfg(target_os = "linux")]
pub fn wake_all(addr: &AtomicU32) -> Result<()> {
    use libc::{syscall, SYS_futex, FUTEX_WAKE};

    let res = unsafe {
        syscall(
            SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<u32>(),
            std::ptr::null::<u32>(),
            0,
        )
    };
    if res < 0 {
        return Err(crate::Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn wait_u32(_addr: &AtomicU32, _expected: u32, timeout: Option<Duration>) -> Result<()> {
    let nap = Duration::from_millis(1);
    std::thread::sleep(timeout.map_or(nap, |t| t.min(nap)));
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn wake_all(_addr: &AtomicU32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn wait_returns_on_value_mismatch() {
        let word = AtomicU32::new(7);
        // expected != current: the kernel returns EAGAIN immediately.
        wait_u32(&word, 6, Some(Duration::from_secs(1))).unwrap();
    }

    #[test]
    fn wait_times_out() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        wait_u32(&word, 0, Some(Duration::from_millis(20))).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn wake_releases_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let waiter = Arc::clone(&word);
        let handle = std::thread::spawn(move || {
            while waiter.load(Ordering::Acquire) == 0 {
                wait_u32(&waiter, 0, Some(Duration::from_secs(2))).unwrap();
            }
        });
        std::thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::Release);
        wake_all(&word).unwrap();
        handle.join().unwrap();
    }
}
