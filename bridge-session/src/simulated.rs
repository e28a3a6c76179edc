use async_trait::async_trait;
use bridge_core::config::SessionConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing;

use crate::protocol::{
    ChatProtocol, ProtocolConnection, ProtocolError, ProtocolEvent, ProtocolHandle,
};

/// Stand-in client for running the bridge without a real chat network.
///
/// Every connection asks for pairing with a placeholder payload. With a
/// pairing delay configured it then authenticates and reports ready; without
/// one it stays in pairing until closed. Sends always succeed.
pub struct SimulatedProtocol {
    event_buffer: usize,
    pairing_delay: Option<Duration>,
}

impl SimulatedProtocol {
    pub fn new(event_buffer: usize, pairing_delay: Option<Duration>) -> Self {
        Self {
            event_buffer: event_buffer.max(1),
            pairing_delay,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            config.event_buffer,
            config.simulated_pairing_delay_ms.map(Duration::from_millis),
        )
    }

    pub fn placeholder_payload(tenant_id: &str) -> String {
        format!("PLACEHOLDER_QR_CODE_FOR_{}", tenant_id)
    }
}

#[async_trait]
impl ChatProtocol for SimulatedProtocol {
    async fn open(&self, tenant_id: &str) -> Result<ProtocolConnection, ProtocolError> {
        let (tx, events) = mpsc::channel(self.event_buffer);
        let closed = CancellationToken::new();
        let handle = Arc::new(SimulatedHandle {
            tenant_id: tenant_id.to_string(),
            closed: closed.clone(),
        });

        let payload = Self::placeholder_payload(tenant_id);
        let pairing_delay = self.pairing_delay;
        tokio::spawn(async move {
            if tx.send(ProtocolEvent::PairingNeeded(payload)).await.is_err() {
                return;
            }

            if let Some(delay) = pairing_delay {
                tokio::select! {
                    _ = closed.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                for event in [ProtocolEvent::Authenticated, ProtocolEvent::Ready] {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }

            // Holding `tx` keeps the event stream open until close().
            closed.cancelled().await;
        });

        tracing::info!(tenant_id = %tenant_id, "Opened simulated connection");
        Ok(ProtocolConnection { handle, events })
    }
}

struct SimulatedHandle {
    tenant_id: String,
    closed: CancellationToken,
}

#[async_trait]
impl ProtocolHandle for SimulatedHandle {
    async fn send(&self, recipient: &str, body: &str) -> Result<(), ProtocolError> {
        if self.closed.is_cancelled() {
            return Err(ProtocolError::Closed);
        }
        tracing::info!(
            tenant_id = %self.tenant_id,
            "Simulated send to {} ({} bytes)",
            recipient,
            body.len()
        );
        Ok(())
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_pairs_then_connects_after_delay() {
        let protocol = SimulatedProtocol::new(8, Some(Duration::from_secs(2)));
        let mut connection = protocol.open("T1").await.unwrap();

        assert_eq!(
            connection.events.recv().await,
            Some(ProtocolEvent::PairingNeeded(
                "PLACEHOLDER_QR_CODE_FOR_T1".to_string()
            ))
        );
        assert_eq!(connection.events.recv().await, Some(ProtocolEvent::Authenticated));
        assert_eq!(connection.events.recv().await, Some(ProtocolEvent::Ready));

        assert!(connection.handle.send("15550100", "hi").await.is_ok());
        connection.handle.close().await;
        assert_eq!(connection.events.recv().await, None);
        assert!(matches!(
            connection.handle.send("15550100", "late").await,
            Err(ProtocolError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_delay_stays_in_pairing() {
        let protocol = SimulatedProtocol::new(8, None);
        let mut connection = protocol.open("T2").await.unwrap();

        assert!(matches!(
            connection.events.recv().await,
            Some(ProtocolEvent::PairingNeeded(_))
        ));
        let next = tokio::time::timeout(Duration::from_secs(60), connection.events.recv()).await;
        assert!(next.is_err());

        connection.handle.close().await;
        assert_eq!(connection.events.recv().await, None);
    }
}
