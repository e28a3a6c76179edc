use bridge_core::{BridgeError, DeliveryResult, DocumentStore, MessageStatus, OutboundMessage};
use bridge_session::SessionRegistry;
use std::sync::Arc;
use tracing;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    Failed(String),
    /// Already handled elsewhere; nothing was sent or written.
    Skipped,
}

/// Sends pending outbound messages over their tenant's live connection and
/// records the result. Each message gets exactly one status write and is
/// never retried.
pub struct DeliveryWorker {
    store: Arc<dyn DocumentStore>,
    registry: Arc<SessionRegistry>,
}

impl DeliveryWorker {
    pub fn new(store: Arc<dyn DocumentStore>, registry: Arc<SessionRegistry>) -> Self {
        Self { store, registry }
    }

    pub async fn deliver(&self, message: &OutboundMessage) -> DeliveryOutcome {
        if message.status != MessageStatus::Pending {
            return DeliveryOutcome::Skipped;
        }

        // The feed may replay a row that another delivery already completed.
        match self.store.get_outbound(message.id).await {
            Ok(Some(current)) if current.status == MessageStatus::Pending => {}
            Ok(Some(current)) => {
                tracing::debug!(
                    message_id = message.id,
                    "Message already {}, skipping",
                    current.status
                );
                return DeliveryOutcome::Skipped;
            }
            Ok(None) => {
                tracing::warn!(message_id = message.id, "Message vanished before delivery");
                return DeliveryOutcome::Skipped;
            }
            Err(e) => {
                tracing::error!(message_id = message.id, "Failed to re-read message: {}", e);
                return DeliveryOutcome::Skipped;
            }
        }

        let result = match self.registry.live_connection(&message.tenant_id).await {
            None => {
                tracing::warn!(
                    tenant_id = %message.tenant_id,
                    message_id = message.id,
                    "No live connection for tenant"
                );
                DeliveryResult::Failed(BridgeError::TenantNotConnected.to_string())
            }
            Some(connection) => match connection.send(&message.recipient, &message.body).await {
                Ok(()) => DeliveryResult::Sent,
                Err(e) => {
                    tracing::warn!(
                        tenant_id = %message.tenant_id,
                        message_id = message.id,
                        "Send failed: {}",
                        e
                    );
                    DeliveryResult::Failed(e.to_string())
                }
            },
        };

        self.record(message, result).await
    }

    async fn record(&self, message: &OutboundMessage, result: DeliveryResult) -> DeliveryOutcome {
        match self.store.complete_outbound(message.id, result.clone()).await {
            Ok(true) => tracing::info!(
                tenant_id = %message.tenant_id,
                message_id = message.id,
                "Message {}",
                result.status()
            ),
            Ok(false) => tracing::debug!(
                message_id = message.id,
                "Message was completed concurrently, keeping the stored status"
            ),
            Err(e) => tracing::error!(
                message_id = message.id,
                "Failed to record delivery result: {}",
                e
            ),
        }

        match result {
            DeliveryResult::Sent => DeliveryOutcome::Sent,
            DeliveryResult::Failed(reason) => DeliveryOutcome::Failed(reason),
        }
    }
}
