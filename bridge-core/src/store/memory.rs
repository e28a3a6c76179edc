use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{BridgeError, BridgeResult};
use crate::feed::{spawn_notified_watch, Watch};
use crate::store::DocumentStore;
use crate::types::{
    DeliveryResult, Document, InboundMessage, MessageStatus, NewInboundMessage,
    NewOutboundMessage, OutboundMessage, Query, SessionState, SessionTransition, TenantSession,
};

/// Process-local store used for development runs and tests.
///
/// Watches are re-evaluated after every write instead of polling.
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    revisions: watch::Sender<u64>,
    watches_opened: AtomicUsize,
    watches_active: Arc<AtomicUsize>,
}

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, TenantSession>,
    outbound: BTreeMap<i64, OutboundMessage>,
    inbound: Vec<InboundMessage>,
    next_outbound_id: i64,
    next_inbound_id: i64,
    clock: Option<DateTime<Utc>>,
}

impl MemoryState {
    /// Strictly increasing timestamps so every write is visible to the feed diff.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.clock {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };
        self.clock = Some(next);
        next
    }

    fn evaluate(&self, query: &Query) -> Vec<Document> {
        match query {
            Query::SessionsInState(state) => {
                let mut sessions: Vec<&TenantSession> = self
                    .sessions
                    .values()
                    .filter(|session| session.state == *state)
                    .collect();
                sessions.sort_by(|a, b| {
                    a.requested_at
                        .cmp(&b.requested_at)
                        .then_with(|| a.tenant_id.cmp(&b.tenant_id))
                });
                sessions
                    .into_iter()
                    .cloned()
                    .map(Document::Session)
                    .collect()
            }
            Query::OutboundWithStatus(status) => self
                .outbound
                .values()
                .filter(|message| message.status == *status)
                .cloned()
                .map(Document::Outbound)
                .collect(),
        }
    }
}

struct WatchGuard(Arc<AtomicUsize>);

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (revisions, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                next_outbound_id: 1,
                next_inbound_id: 1,
                ..MemoryState::default()
            })),
            revisions,
            watches_opened: AtomicUsize::new(0),
            watches_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn notify(&self) {
        self.revisions.send_modify(|revision| *revision += 1);
    }

    /// Writes a session row as-is, bypassing transition checks.
    pub fn seed_session(&self, session: TenantSession) {
        self.state
            .lock()
            .sessions
            .insert(session.tenant_id.clone(), session);
        self.notify();
    }

    pub fn outbound(&self) -> Vec<OutboundMessage> {
        self.state.lock().outbound.values().cloned().collect()
    }

    /// Total number of watches ever opened against this store.
    pub fn watches_opened(&self) -> usize {
        self.watches_opened.load(Ordering::SeqCst)
    }

    /// Watches whose feed task is still running.
    pub fn active_watches(&self) -> usize {
        self.watches_active.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn request_session(&self, tenant_id: &str) -> BridgeResult<TenantSession> {
        if tenant_id.trim().is_empty() {
            return Err(BridgeError::InvalidInput("tenant_id is required".into()));
        }

        let session = {
            let mut state = self.state.lock();
            let now = state.tick();
            match state.sessions.get_mut(tenant_id) {
                Some(existing) if existing.state.is_live() => return Ok(existing.clone()),
                Some(existing) => {
                    existing.state = SessionState::Requested;
                    existing.pairing_payload = None;
                    existing.pairing_image = None;
                    existing.last_error = None;
                    existing.requested_at = now;
                    existing.updated_at = now;
                    existing.clone()
                }
                None => {
                    let session = TenantSession::requested(tenant_id, now);
                    state
                        .sessions
                        .insert(tenant_id.to_string(), session.clone());
                    session
                }
            }
        };

        self.notify();
        Ok(session)
    }

    async fn get_session(&self, tenant_id: &str) -> BridgeResult<Option<TenantSession>> {
        Ok(self.state.lock().sessions.get(tenant_id).cloned())
    }

    async fn transition_session(
        &self,
        tenant_id: &str,
        transition: SessionTransition,
    ) -> BridgeResult<TenantSession> {
        let session = {
            let mut state = self.state.lock();
            let now = state.tick();
            let session = state
                .sessions
                .get_mut(tenant_id)
                .ok_or_else(|| BridgeError::session_not_found(tenant_id))?;

            if !transition.is_allowed_from(session.state) {
                return Err(BridgeError::InvalidTransition {
                    tenant_id: tenant_id.to_string(),
                    from: session.state,
                    to: transition.target(),
                });
            }

            session.apply(&transition, now);
            session.clone()
        };

        self.notify();
        Ok(session)
    }

    async fn enqueue_outbound(&self, message: NewOutboundMessage) -> BridgeResult<OutboundMessage> {
        let message = message.normalized()?;

        let stored = {
            let mut state = self.state.lock();
            let now = state.tick();
            let id = state.next_outbound_id;
            state.next_outbound_id += 1;

            let stored = OutboundMessage {
                id,
                tenant_id: message.tenant_id,
                recipient: message.recipient,
                body: message.body,
                status: MessageStatus::Pending,
                error: None,
                created_at: now,
                updated_at: now,
                sent_at: None,
            };
            state.outbound.insert(id, stored.clone());
            stored
        };

        self.notify();
        Ok(stored)
    }

    async fn get_outbound(&self, id: i64) -> BridgeResult<Option<OutboundMessage>> {
        Ok(self.state.lock().outbound.get(&id).cloned())
    }

    async fn complete_outbound(&self, id: i64, result: DeliveryResult) -> BridgeResult<bool> {
        {
            let mut state = self.state.lock();
            let now = state.tick();
            let message = state
                .outbound
                .get_mut(&id)
                .ok_or_else(|| BridgeError::outbound_not_found(id))?;

            if message.status != MessageStatus::Pending {
                return Ok(false);
            }

            message.status = result.status();
            message.updated_at = now;
            match result {
                DeliveryResult::Sent => {
                    message.error = None;
                    message.sent_at = Some(now);
                }
                DeliveryResult::Failed(reason) => {
                    message.error = Some(reason);
                }
            }
        }

        self.notify();
        Ok(true)
    }

    async fn append_inbound(&self, message: NewInboundMessage) -> BridgeResult<InboundMessage> {
        let mut state = self.state.lock();
        let now = state.tick();
        let id = state.next_inbound_id;
        state.next_inbound_id += 1;

        let stored = InboundMessage {
            id,
            tenant_id: message.tenant_id,
            sender: message.sender,
            body: message.body,
            received_at: now,
        };
        state.inbound.push(stored.clone());
        Ok(stored)
    }

    async fn list_inbound(&self, tenant_id: &str) -> BridgeResult<Vec<InboundMessage>> {
        Ok(self
            .state
            .lock()
            .inbound
            .iter()
            .filter(|message| message.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn query(&self, query: &Query) -> BridgeResult<Vec<Document>> {
        Ok(self.state.lock().evaluate(query))
    }

    fn watch(&self, query: Query) -> Watch {
        self.watches_opened.fetch_add(1, Ordering::SeqCst);
        self.watches_active.fetch_add(1, Ordering::SeqCst);
        let guard = WatchGuard(self.watches_active.clone());
        let state = self.state.clone();

        spawn_notified_watch(query, self.revisions.subscribe(), move |query| {
            let _guard = &guard;
            state.lock().evaluate(query)
        })
    }
}
