//! In-process view of which tenants have a running session actor and which
//! of them hold a live connection.
//!
//! Only the lifecycle manager writes here. Everyone else reads.

use bridge_core::SessionState;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::protocol::ProtocolHandle;

struct Slot {
    state: SessionState,
    handle: Option<Arc<dyn ProtocolHandle>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryEntry {
    pub tenant_id: String,
    pub state: SessionState,
    pub live: bool,
}

#[derive(Default)]
pub struct SessionRegistry {
    slots: RwLock<HashMap<String, Slot>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the tenant for a new session actor. Returns `false` when an
    /// entry already exists, in which case the caller must not start one.
    pub async fn claim(&self, tenant_id: &str) -> bool {
        let mut slots = self.slots.write().await;
        if slots.contains_key(tenant_id) {
            return false;
        }
        slots.insert(
            tenant_id.to_string(),
            Slot {
                state: SessionState::Requested,
                handle: None,
            },
        );
        true
    }

    pub async fn set_state(&self, tenant_id: &str, state: SessionState) {
        if let Some(slot) = self.slots.write().await.get_mut(tenant_id) {
            slot.state = state;
        }
    }

    pub async fn register_live(&self, tenant_id: &str, handle: Arc<dyn ProtocolHandle>) {
        if let Some(slot) = self.slots.write().await.get_mut(tenant_id) {
            slot.state = SessionState::Connected;
            slot.handle = Some(handle);
        }
    }

    /// Drops the live handle but keeps the claim.
    pub async fn deregister_live(&self, tenant_id: &str) -> Option<Arc<dyn ProtocolHandle>> {
        self.slots
            .write()
            .await
            .get_mut(tenant_id)
            .and_then(|slot| slot.handle.take())
    }

    /// Removes the tenant entirely, returning its live handle if it had one.
    pub async fn release(&self, tenant_id: &str) -> Option<Arc<dyn ProtocolHandle>> {
        self.slots
            .write()
            .await
            .remove(tenant_id)
            .and_then(|slot| slot.handle)
    }

    pub async fn live_connection(&self, tenant_id: &str) -> Option<Arc<dyn ProtocolHandle>> {
        self.slots
            .read()
            .await
            .get(tenant_id)
            .filter(|slot| slot.state == SessionState::Connected)
            .and_then(|slot| slot.handle.clone())
    }

    pub async fn contains(&self, tenant_id: &str) -> bool {
        self.slots.read().await.contains_key(tenant_id)
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(tenant_id, slot)| RegistryEntry {
                tenant_id: tenant_id.clone(),
                state: slot.state,
                live: slot.handle.is_some(),
            })
            .collect();
        entries.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MockProtocolHandle;

    #[tokio::test]
    async fn test_claim_is_exclusive_until_release() {
        let registry = SessionRegistry::new();
        assert!(registry.claim("T1").await);
        assert!(!registry.claim("T1").await);
        assert!(registry.contains("T1").await);

        registry.release("T1").await;
        assert!(!registry.contains("T1").await);
        assert!(registry.claim("T1").await);
    }

    #[tokio::test]
    async fn test_concurrent_claims_admit_one() {
        let registry = Arc::new(SessionRegistry::new());
        let attempts = (0..16).map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.claim("T1").await })
        });

        let mut granted = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_live_connection_requires_connected_handle() {
        let registry = SessionRegistry::new();
        registry.claim("T1").await;
        assert!(registry.live_connection("T1").await.is_none());

        registry
            .register_live("T1", Arc::new(MockProtocolHandle::new()))
            .await;
        assert!(registry.live_connection("T1").await.is_some());
        assert_eq!(
            registry.snapshot().await,
            vec![RegistryEntry {
                tenant_id: "T1".into(),
                state: SessionState::Connected,
                live: true,
            }]
        );

        assert!(registry.deregister_live("T1").await.is_some());
        assert!(registry.live_connection("T1").await.is_none());
        assert!(registry.contains("T1").await);
    }

    #[tokio::test]
    async fn test_register_live_without_claim_is_ignored() {
        let registry = SessionRegistry::new();
        registry
            .register_live("T9", Arc::new(MockProtocolHandle::new()))
            .await;
        assert!(registry.is_empty().await);
    }
}
