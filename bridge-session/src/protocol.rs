use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to open connection: {0}")]
    Open(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("connection closed")]
    Closed,
}

/// Events a protocol client reports for one tenant connection, in the order
/// the network produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// The client needs the user to scan this payload to link the account.
    PairingNeeded(String),
    Authenticated,
    Ready,
    Disconnected(String),
    AuthFailure(String),
    MessageReceived { from: String, body: String },
}

/// Live side of an open connection.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ProtocolHandle: Send + Sync {
    async fn send(&self, recipient: &str, body: &str) -> Result<(), ProtocolError>;

    /// Closes the connection. The event channel ends once the client has
    /// released it.
    async fn close(&self);
}

pub struct ProtocolConnection {
    pub handle: Arc<dyn ProtocolHandle>,
    pub events: mpsc::Receiver<ProtocolEvent>,
}

/// Factory for tenant connections on the external chat network.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ChatProtocol: Send + Sync {
    async fn open(&self, tenant_id: &str) -> Result<ProtocolConnection, ProtocolError>;
}
