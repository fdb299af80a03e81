//! Connection liveness through lease files.
//!
//! Every connection holds an exclusive `flock` on `leases/<cid>.lease` for
//! its whole lifetime. Other processes probe liveness with a non-blocking
//! shared lock: if it can be taken the owner is gone. The file also records
//! pid and process start time for diagnostics.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;

use crate::paths::ShmLayout;
use crate::{Error, Result};

/// Connection id. Globally unique within the daemon lifetime, never zero
/// (zero marks a free slot in lock owner fields).
pub type Cid = u32;

/// An exclusive lease on a connection id. Dropping it releases the flock and
/// removes the file, which flips `is_alive` for every observer.
pub struct Lease {
    file: File,
    path: PathBuf,
}

impl Lease {
    pub fn acquire(layout: &ShmLayout, cid: Cid) -> Result<Lease> {
        std::fs::create_dir_all(layout.leases_dir())?;
        let path = layout.lease(cid);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        if !try_flock(&file, libc::LOCK_EX)? {
            return Err(Error::Exists(format!("connection {cid} lease is held")));
        }
        let (pid, start_time) = identity();
        file.set_len(0)?;
        file.write_all(format!("{pid} {start_time}\n").as_bytes())?;
        file.sync_all()?;
        Ok(Lease { file, path })
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        // unlink before the close so a probe never sees an unlocked file
        let _ = std::fs::remove_file(&self.path);
        let _ = self.file.sync_all();
    }
}

/// Probes whether the connection `cid` is still alive.
pub fn is_alive(layout: &ShmLayout, cid: Cid) -> bool {
    if cid == 0 {
        return false;
    }
    let path = layout.lease(cid);
    let file = match OpenOptions::new().read(true).open(&path) {
        Ok(file) => file,
        Err(_) => return false,
    };
    match try_flock(&file, libc::LOCK_SH) {
        // shared lock acquired: the exclusive holder is gone
        Ok(true) => {
            let _ = unsafe { libc::flock(fd(&file), libc::LOCK_UN) };
            let _ = std::fs::remove_file(&path);
            false
        }
        Ok(false) => true,
        Err(_) => false,
    }
}

/// Pid and start-time record of a lease file, for diagnostics.
pub fn read_lease_record(layout: &ShmLayout, cid: Cid) -> Result<(u32, u64)> {
    let mut contents = String::new();
    File::open(layout.lease(cid))?.read_to_string(&mut contents)?;
    let mut parts = contents.split_whitespace();
    let pid = parts
        .next()
        .and_then(|p| p.parse::<u32>().ok())
        .ok_or_else(|| Error::Internal("malformed lease record".into()))?;
    let start_time = parts
        .next()
        .and_then(|p| p.parse::<u64>().ok())
        .ok_or_else(|| Error::Internal("malformed lease record".into()))?;
    Ok((pid, start_time))
}

fn try_flock(file: &File, op: libc::c_int) -> Result<bool> {
    let res = unsafe { libc::flock(fd(file), op | libc::LOCK_NB) };
    if res == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        return Ok(false);
    }
    Err(Error::Io(err))
}

fn fd(file: &File) -> libc::c_int {
    use std::os::unix::io::AsRawFd;
    file.as_raw_fd()
}

#[cfg(target_os = "linux")]
fn identity() -> (u32, u64) {
    let pid = std::process::id();
    (pid, proc_start_time(pid).unwrap_or(0))
}

#[cfg(target_os = "linux")]
fn proc_start_time(pid: u32) -> Option<u64> {
    let mut contents = String::new();
    File::open(format!("/proc/{pid}/stat"))
        .ok()?
        .read_to_string(&mut contents)
        .ok()?;
    let end = contents.rfind(')')?;
    contents[end + 1..]
        .split_whitespace()
        .nth(19)
        .and_then(|field| field.parse::<u64>().ok())
}

#[cfg(not(target_os = "linux"))]
fn identity() -> (u32, u64) {
    (std::process::id(), 0)
}
