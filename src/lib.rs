//! Subscription core of a YANG-backed configuration datastore daemon.
//!
//! Application processes share a schema-validated data tree over shared
//! memory. Each client opens a connection, starts sessions scoped to a
//! datastore and registers subscriptions of five kinds: configuration
//! change notifications, operational data providers (pull), operational
//! data pollers (cached pull), notification listeners and RPC/action
//! handlers. This crate implements the subscription registry, the
//! process-shared subscription directory, the lock discipline that keeps
//! them consistent across threads and processes, and the event-delivery
//! protocol (UPDATE -> CHANGE -> DONE / ABORT commits, priority-ordered
//! RPC execution, notification fan-out, dead-subscriber recovery).

pub mod config;
pub mod dispatch;
pub mod error;
mod housekeeper;
pub mod liveness;
pub mod mailbox;
pub mod mmap;
pub mod paths;
pub mod registry;
pub mod schema;
pub mod session;
pub mod shm;
pub mod wait;

pub use config::Config;
pub use dispatch::{change_notify, notif_send, oper_get_fetch, rpc_send, OperChunk};
pub use error::{Error, ErrorCode, Result};
pub use liveness::Cid;
pub use mailbox::EventKind;
pub use registry::{
    ChangeEvent, NotifCallback, NotifType, OperPollDue, PathValue, RpcCallback, RpcEvent,
    RpcValsEvent, SubId, SubInfo, SubKind, SubOpts, Subscriptions,
};
pub use schema::{OperGetKind, SchemaModule, SchemaNode, SchemaTree};
pub use session::{Connection, Datastore, Session};
