pub mod changeset;
pub mod config;
pub mod db;
pub mod interceptor;
pub mod messenger;
pub mod outbox;
pub mod request;

pub use changeset::{Change, Changeset, CommittedChangeset};
pub use config::{MessengerConfig, QueuedConfig};
pub use db::{AuditDb, ChangeRecord, ChangesetRecord};
pub use interceptor::{Interceptor, RequestScope};
pub use messenger::{
    CaptureListener, CaptureMessenger, LogMessenger, LogTransport, MemoryTransport, Messenger,
    OutboundMessage, QueuedMessenger, Transport,
};
pub use outbox::Outbox;
pub use request::{Method, Request, Response};

pub use rusqlite;
pub use rusqlite_migration;
pub use serde_rusqlite;
