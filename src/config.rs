use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the subscription core. All of them have defaults that match
/// a single-host daemon deployment; tests override `shm_root` with a tempdir.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory holding the shared-memory files (`main.shm`,
    /// `ext.shm`, `subscriptions/`, `leases/`).
    pub shm_root: PathBuf,
    /// Timeout for acquiring or relocking the SUBS lock of a context.
    pub subscr_lock_timeout: Duration,
    /// Timeout for the per-object subscription locks in shared memory.
    pub ext_sub_lock_timeout: Duration,
    /// Default timeout a producer waits for subscriber replies.
    pub event_timeout: Duration,
    /// Poll period of the listener thread.
    pub listen_poll: Duration,
    /// Poll period of the notification stop-time housekeeper.
    pub housekeeper_poll: Duration,
}

impl Config {
    pub fn new(shm_root: impl Into<PathBuf>) -> Self {
        Config {
            shm_root: shm_root.into(),
            ..Config::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let root = std::env::var_os("YANGBUS_SHM_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_shm_root);
        Config {
            shm_root: root,
            subscr_lock_timeout: Duration::from_secs(10),
            ext_sub_lock_timeout: Duration::from_secs(2),
            event_timeout: Duration::from_secs(5),
            listen_poll: Duration::from_millis(10),
            housekeeper_poll: Duration::from_millis(20),
        }
    }
}

#[cfg(target_os = "linux")]
fn default_shm_root() -> PathBuf {
    PathBuf::from("/dev/shm/yangbus")
}

#[cfg(not(target_os = "linux"))]
fn default_shm_root() -> PathBuf {
    std::env::temp_dir().join("yangbus")
}
