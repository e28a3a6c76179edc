pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;

use crate::error::BridgeResult;
use crate::feed::Watch;
use crate::types::{
    DeliveryResult, Document, InboundMessage, NewInboundMessage, NewOutboundMessage,
    OutboundMessage, Query, SessionTransition, TenantSession,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// The document store this bridge reads work from and writes status to.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Marks a tenant's session as `requested`, creating the row if needed.
    ///
    /// A tenant whose session is still live is left untouched and its current
    /// row is returned.
    async fn request_session(&self, tenant_id: &str) -> BridgeResult<TenantSession>;

    async fn get_session(&self, tenant_id: &str) -> BridgeResult<Option<TenantSession>>;

    /// Applies a lifecycle write. Fails with `InvalidTransition` when the row is
    /// not in one of the transition's source states.
    async fn transition_session(
        &self,
        tenant_id: &str,
        transition: SessionTransition,
    ) -> BridgeResult<TenantSession>;

    async fn enqueue_outbound(&self, message: NewOutboundMessage) -> BridgeResult<OutboundMessage>;

    async fn get_outbound(&self, id: i64) -> BridgeResult<Option<OutboundMessage>>;

    /// Records the outcome of a send. Returns `false` when the message was no
    /// longer pending, in which case nothing was written.
    async fn complete_outbound(&self, id: i64, result: DeliveryResult) -> BridgeResult<bool>;

    async fn append_inbound(&self, message: NewInboundMessage) -> BridgeResult<InboundMessage>;

    async fn list_inbound(&self, tenant_id: &str) -> BridgeResult<Vec<InboundMessage>>;

    /// Evaluates a query once, in creation order.
    async fn query(&self, query: &Query) -> BridgeResult<Vec<Document>>;

    /// Opens a change feed over `query`.
    fn watch(&self, query: Query) -> Watch;
}
