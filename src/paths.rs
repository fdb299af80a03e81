//! Layout of the shared-memory root directory.
//!
//! ```text
//! <root>/main.shm                  module directory
//! <root>/ext.shm                   growable descriptor heap
//! <root>/subscriptions/<module>.<tag>[.<hash>].mbox
//! <root>/leases/<cid>.lease        connection liveness
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

pub const MAIN_SHM_FILE: &str = "main.shm";
pub const EXT_SHM_FILE: &str = "ext.shm";
pub const SUBSCRIPTIONS_DIR: &str = "subscriptions";
pub const LEASES_DIR: &str = "leases";

/// Mailbox tag, part of the mailbox file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxTag {
    Startup,
    Running,
    Candidate,
    Operational,
    Oper,
    Notif,
    Rpc,
}

impl MailboxTag {
    pub fn as_str(self) -> &'static str {
        match self {
            MailboxTag::Startup => "startup",
            MailboxTag::Running => "running",
            MailboxTag::Candidate => "candidate",
            MailboxTag::Operational => "operational",
            MailboxTag::Oper => "oper",
            MailboxTag::Notif => "notif",
            MailboxTag::Rpc => "rpc",
        }
    }
}

impl fmt::Display for MailboxTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ShmLayout {
    root: PathBuf,
}

impl ShmLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn main_shm(&self) -> PathBuf {
        self.root.join(MAIN_SHM_FILE)
    }

    pub fn ext_shm(&self) -> PathBuf {
        self.root.join(EXT_SHM_FILE)
    }

    pub fn subscriptions_dir(&self) -> PathBuf {
        self.root.join(SUBSCRIPTIONS_DIR)
    }

    pub fn leases_dir(&self) -> PathBuf {
        self.root.join(LEASES_DIR)
    }

    pub fn lease(&self, cid: u32) -> PathBuf {
        self.leases_dir().join(format!("{cid}.lease"))
    }

    /// Mailbox file for one subscription group. `hash` is the
    /// `(path, priority)` discriminator of oper-get and RPC mailboxes.
    pub fn mailbox(&self, module: &str, tag: MailboxTag, hash: Option<u32>) -> Result<PathBuf> {
        validate_component("module", module)?;
        let name = match hash {
            Some(hash) => format!("{module}.{tag}.{hash:08x}.mbox"),
            None => format!("{module}.{tag}.mbox"),
        };
        Ok(self.subscriptions_dir().join(name))
    }

    /// Creates the root and its subdirectories.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.subscriptions_dir())?;
        std::fs::create_dir_all(self.leases_dir())?;
        Ok(())
    }
}

/// Unsigned 32-bit discriminator of `(path, priority)` used in mailbox file
/// names so distinct oper-get / RPC subscriptions map to distinct files.
pub fn path_hash(path: &str, priority: u32) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(path.as_bytes());
    hasher.update(&priority.to_le_bytes());
    hasher.finalize()
}

fn validate_component(field: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalArg(format!("empty path component: {field}")));
    }
    if value == "."
        || value == ".."
        || value.contains('/')
        || value.contains('\\')
        || value.contains('\0')
    {
        return Err(Error::InvalArg(format!(
            "invalid path component for {field}: {value}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_paths() {
        let layout = ShmLayout::new("/dev/shm/bus");
        let plain = layout
            .mailbox("ietf-interfaces", MailboxTag::Running, None)
            .unwrap();
        assert_eq!(
            plain,
            PathBuf::from("/dev/shm/bus/subscriptions/ietf-interfaces.running.mbox")
        );
        let hashed = layout
            .mailbox("my-mod", MailboxTag::Rpc, Some(0xdeadbeef))
            .unwrap();
        assert_eq!(
            hashed,
            PathBuf::from("/dev/shm/bus/subscriptions/my-mod.rpc.deadbeef.mbox")
        );
    }

    #[test]
    fn reject_invalid_module_component() {
        let layout = ShmLayout::new("/dev/shm/bus");
        assert!(layout.mailbox("bad/mod", MailboxTag::Notif, None).is_err());
        assert!(layout.mailbox("", MailboxTag::Notif, None).is_err());
    }

    #[test]
    fn hash_depends_on_path_and_priority() {
        let a = path_hash("/m:reset", 0);
        let b = path_hash("/m:reset", 1);
        let c = path_hash("/m:other", 0);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
