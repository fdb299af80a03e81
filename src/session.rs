//! Connections, sessions and their linkage to subscription contexts.
//!
//! A connection owns the shared-memory mappings and a liveness lease; a
//! session belongs to one connection, is scoped to a datastore and keeps
//! weak back-references to the subscription contexts it has subscriptions
//! in, used only to cascade teardown. Implicit sessions are created by the
//! dispatcher for the duration of one callback and must not outlive it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::config::Config;
use crate::liveness::{self, Cid, Lease};
use crate::mailbox::EventKind;
use crate::paths::{MailboxTag, ShmLayout};
use crate::registry::Subscriptions;
use crate::schema::{NodeKind, SchemaNode, SchemaTree};
use crate::shm::ext::ExtShm;
use crate::shm::main::{MainShm, ModuleSpec};
use crate::{Error, Result};

pub const DS_COUNT: usize = 4;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datastore {
    Startup = 0,
    Running = 1,
    Candidate = 2,
    Operational = 3,
}

impl Datastore {
    pub fn from_u32(value: u32) -> Datastore {
        match value {
            0 => Datastore::Startup,
            2 => Datastore::Candidate,
            3 => Datastore::Operational,
            _ => Datastore::Running,
        }
    }

    pub fn mailbox_tag(self) -> MailboxTag {
        match self {
            Datastore::Startup => MailboxTag::Startup,
            Datastore::Running => MailboxTag::Running,
            Datastore::Candidate => MailboxTag::Candidate,
            Datastore::Operational => MailboxTag::Operational,
        }
    }
}

/// A client connection to the datastore shared memory.
pub struct Connection {
    cid: Cid,
    layout: ShmLayout,
    config: Config,
    schema: Arc<SchemaTree>,
    main: MainShm,
    ext: Mutex<ExtShm>,
    _lease: Lease,
    next_sid: AtomicU32,
}

impl Connection {
    /// Opens the shared memory (creating and seeding it from the schema if
    /// this is the first connection), allocates a connection id and takes
    /// the liveness lease.
    pub fn establish(config: Config, schema: Arc<SchemaTree>) -> Result<Arc<Connection>> {
        let layout = ShmLayout::new(&config.shm_root);
        layout.ensure_dirs()?;

        let mut ext = match ExtShm::open(&layout.ext_shm(), config.ext_sub_lock_timeout) {
            Ok(ext) => ext,
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                match ExtShm::create_new(&layout.ext_shm(), config.ext_sub_lock_timeout) {
                    Ok(ext) => ext,
                    Err(Error::Exists(_)) => {
                        ExtShm::open(&layout.ext_shm(), config.ext_sub_lock_timeout)?
                    }
                    Err(err) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        };

        let main = match MainShm::open(&layout.main_shm()) {
            Ok(main) => main,
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                let specs = module_specs(&schema);
                match MainShm::create_new(&layout.main_shm(), &mut ext, &specs) {
                    Ok(main) => main,
                    Err(Error::Exists(_)) => MainShm::open(&layout.main_shm())?,
                    Err(err) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        };

        let cid = main.new_cid()?;
        ext.set_cid(cid);
        let lease = Lease::acquire(&layout, cid)?;
        log::debug!("connection {cid} established at {}", layout.root().display());

        Ok(Arc::new(Connection {
            cid,
            layout,
            config,
            schema,
            main,
            ext: Mutex::new(ext),
            _lease: lease,
            next_sid: AtomicU32::new(1),
        }))
    }

    pub fn cid(&self) -> Cid {
        self.cid
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn layout(&self) -> &ShmLayout {
        &self.layout
    }

    pub fn schema(&self) -> &SchemaTree {
        &self.schema
    }

    pub(crate) fn main_shm(&self) -> &MainShm {
        &self.main
    }

    /// Runs `f` with the module directory and the (refreshed) ext heap.
    pub(crate) fn with_ext<R>(
        &self,
        f: impl FnOnce(&MainShm, &mut ExtShm) -> Result<R>,
    ) -> Result<R> {
        let mut ext = self
            .ext
            .lock()
            .map_err(|_| Error::Internal("ext shm mutex poisoned".into()))?;
        ext.refresh()?;
        f(&self.main, &mut ext)
    }

    /// Liveness probe for any connection id.
    pub fn is_alive(&self, cid: Cid) -> bool {
        liveness::is_alive(&self.layout, cid)
    }

    /// Starts a user session scoped to `ds`.
    pub fn session_start(self: &Arc<Self>, ds: Datastore) -> Arc<Session> {
        Arc::new(Session {
            conn: Arc::clone(self),
            sid: self.next_sid.fetch_add(1, Ordering::AcqRel),
            ds: AtomicU32::new(ds as u32),
            event: None,
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Implicit event session handed to callbacks; carries the event type
    /// and never appears in any registry.
    pub(crate) fn implicit_session(self: &Arc<Self>, ds: Datastore, event: EventKind) -> Session {
        Session {
            conn: Arc::clone(self),
            sid: 0,
            ds: AtomicU32::new(ds as u32),
            event: Some(event),
            subscriptions: Mutex::new(Vec::new()),
        }
    }
}

pub struct Session {
    conn: Arc<Connection>,
    sid: u32,
    ds: AtomicU32,
    /// Event type for implicit callback sessions, `None` for user sessions.
    event: Option<EventKind>,
    subscriptions: Mutex<Vec<Weak<Subscriptions>>>,
}

impl Session {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn id(&self) -> u32 {
        self.sid
    }

    pub fn datastore(&self) -> Datastore {
        Datastore::from_u32(self.ds.load(Ordering::Acquire))
    }

    pub fn switch_datastore(&self, ds: Datastore) {
        self.ds.store(ds as u32, Ordering::Release);
    }

    /// Event type when this is an implicit callback session.
    pub fn event(&self) -> Option<EventKind> {
        self.event
    }

    pub(crate) fn link_subscriptions(&self, subscr: &Arc<Subscriptions>) {
        let mut list = match self.subscriptions.lock() {
            Ok(list) => list,
            Err(_) => return,
        };
        let already = list
            .iter()
            .any(|w| w.upgrade().is_some_and(|s| Arc::ptr_eq(&s, subscr)));
        if !already {
            list.push(Arc::downgrade(subscr));
        }
    }

    pub(crate) fn unlink_subscriptions(&self, subscr: &Subscriptions) {
        if let Ok(mut list) = self.subscriptions.lock() {
            list.retain(|w| match w.upgrade() {
                Some(s) => !std::ptr::eq(Arc::as_ptr(&s), subscr),
                None => false,
            });
        }
    }

    /// Stops the session: removes every subscription it owns from every
    /// linked context, then drops the back-references.
    pub fn stop(self: &Arc<Self>) -> Result<()> {
        let linked: Vec<Arc<Subscriptions>> = {
            let list = self
                .subscriptions
                .lock()
                .map_err(|_| Error::Internal("session subscription list poisoned".into()))?;
            list.iter().filter_map(|w| w.upgrade()).collect()
        };
        for subscr in linked {
            subscr.session_unsubscribe(self)?;
        }
        Ok(())
    }
}

fn module_specs(schema: &SchemaTree) -> Vec<ModuleSpec> {
    schema
        .modules()
        .iter()
        .map(|module| {
            let mut rpc_paths = Vec::new();
            for node in &module.tree {
                collect_rpc_paths(&module.name, node, "", &mut rpc_paths);
            }
            ModuleSpec {
                name: module.name.clone(),
                rpc_paths,
            }
        })
        .collect()
}

/// Canonical paths of every RPC and action in the main schema context;
/// operations inside extension contexts go through the per-module
/// extension anchor instead of the per-RPC table.
fn collect_rpc_paths(module: &str, node: &SchemaNode, prefix: &str, out: &mut Vec<String>) {
    let own = if prefix.is_empty() {
        format!("/{module}:{}", node.name)
    } else {
        format!("{prefix}/{}", node.name)
    };
    if matches!(node.kind, NodeKind::Rpc | NodeKind::Action) && !node.ext_context {
        out.push(own.clone());
    }
    for child in &node.children {
        collect_rpc_paths(module, child, &own, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaModule;

    fn schema() -> Arc<SchemaTree> {
        Arc::new(SchemaTree::new(vec![SchemaModule::new(
            "my-mod",
            vec![
                SchemaNode::rpc("reset"),
                SchemaNode::container("box")
                    .with_children(vec![SchemaNode::action("reboot")]),
            ],
        )]))
    }

    #[test]
    fn establish_twice_shares_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path());
        let a = Connection::establish(config.clone(), schema()).unwrap();
        let b = Connection::establish(config, schema()).unwrap();
        assert_ne!(a.cid(), b.cid());
        assert!(a.is_alive(b.cid()));
        let b_cid = b.cid();
        drop(b);
        assert!(!a.is_alive(b_cid));
    }

    #[test]
    fn rpc_paths_are_seeded() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::establish(Config::new(dir.path()), schema()).unwrap();
        conn.with_ext(|main, ext| {
            assert!(main.find_rpc(ext, "/my-mod:reset")?.is_some());
            assert!(main.find_rpc(ext, "/my-mod:box/reboot")?.is_some());
            assert!(main.find_rpc(ext, "/my-mod:nope")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn sessions_have_distinct_ids_and_datastores() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::establish(Config::new(dir.path()), schema()).unwrap();
        let s1 = conn.session_start(Datastore::Running);
        let s2 = conn.session_start(Datastore::Candidate);
        assert_ne!(s1.id(), s2.id());
        assert_eq!(s2.datastore(), Datastore::Candidate);
        s2.switch_datastore(Datastore::Startup);
        assert_eq!(s2.datastore(), Datastore::Startup);
        assert!(s1.event().is_none());
    }
}
