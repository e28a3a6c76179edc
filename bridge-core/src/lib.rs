pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod feed;
pub mod schema;
pub mod store;
pub mod types;

pub use config::Config;
pub use context::BridgeContext;
pub use db::DbPool;
pub use error::{BridgeError, BridgeResult};
pub use feed::{Watch, WatchEvent};
pub use store::{DocumentStore, MemoryStore, PgStore};
pub use types::{
    Change, ChangeKind, DeliveryResult, Document, InboundMessage, MessageStatus,
    NewInboundMessage, NewOutboundMessage, OutboundMessage, Query, SessionState,
    SessionTransition, TenantSession,
};

#[cfg(any(test, feature = "testing"))]
pub use store::MockDocumentStore;
