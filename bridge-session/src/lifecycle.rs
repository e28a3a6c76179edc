//! Per-tenant connection lifecycle.
//!
//! Each tenant gets one actor task that opens a protocol connection and then
//! consumes that connection's event channel strictly in arrival order,
//! mirroring every state change into the session registry and the store.
//! The registry claim taken before the actor starts is what keeps creation
//! idempotent: a tenant that already has an entry is never started twice.

use bridge_core::{
    BridgeError, DocumentStore, NewInboundMessage, Query, SessionState, SessionTransition,
    TenantSession,
};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing;

use crate::pairing::PairingRenderer;
use crate::protocol::{ChatProtocol, ProtocolConnection, ProtocolEvent, ProtocolHandle};
use crate::registry::SessionRegistry;

pub const SHUTDOWN_REASON: &str = "bridge shutting down";
pub const CONNECTION_CLOSED_REASON: &str = "connection closed";
pub const RESTART_REASON: &str = "bridge restarted";

struct ActorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct LifecycleManager {
    store: Arc<dyn DocumentStore>,
    registry: Arc<SessionRegistry>,
    protocol: Arc<dyn ChatProtocol>,
    renderer: Arc<dyn PairingRenderer>,
    actors: Mutex<HashMap<String, ActorHandle>>,
    shutdown_timeout: Duration,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        registry: Arc<SessionRegistry>,
        protocol: Arc<dyn ChatProtocol>,
        renderer: Arc<dyn PairingRenderer>,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            protocol,
            renderer,
            actors: Mutex::new(HashMap::new()),
            shutdown_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Starts a session actor for the tenant unless one is already running.
    /// Returns whether a new actor was started.
    pub async fn ensure_session(&self, tenant_id: &str) -> bool {
        if !self.registry.claim(tenant_id).await {
            tracing::debug!(tenant_id = %tenant_id, "Session already running, ignoring request");
            return false;
        }

        let cancel = CancellationToken::new();
        let actor = SessionActor {
            tenant_id: tenant_id.to_string(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            protocol: self.protocol.clone(),
            renderer: self.renderer.clone(),
            cancel: cancel.clone(),
            state: SessionState::Requested,
            handle: None,
        };
        let task = tokio::spawn(actor.run());

        let mut actors = self.actors.lock();
        actors.retain(|_, actor| !actor.task.is_finished());
        actors.insert(tenant_id.to_string(), ActorHandle { cancel, task });

        tracing::info!(tenant_id = %tenant_id, "Started session actor");
        true
    }

    /// Stops one tenant's actor and waits for it to record its final state.
    pub async fn shutdown_session(&self, tenant_id: &str) -> bool {
        let Some(actor) = self.actors.lock().remove(tenant_id) else {
            return false;
        };

        actor.cancel.cancel();
        let mut task = actor.task;
        match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(tenant_id = %tenant_id, "Session actor ended abnormally: {}", e)
            }
            Err(_) => {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    "Session actor did not stop in time, aborting"
                );
                task.abort();
            }
        }
        true
    }

    /// Stops every actor. Returns once all of them finished or the shutdown
    /// timeout elapsed.
    pub async fn shutdown_all(&self) {
        let actors: Vec<(String, ActorHandle)> = self.actors.lock().drain().collect();
        if actors.is_empty() {
            return;
        }

        tracing::info!("Shutting down {} session actors", actors.len());
        for (_, actor) in &actors {
            actor.cancel.cancel();
        }

        let mut tasks: Vec<JoinHandle<()>> =
            actors.into_iter().map(|(_, actor)| actor.task).collect();
        if tokio::time::timeout(self.shutdown_timeout, join_all(tasks.iter_mut()))
            .await
            .is_err()
        {
            let stuck = tasks.iter().filter(|task| !task.is_finished()).count();
            tracing::warn!(
                "{} session actors did not stop within {:?}, aborting",
                stuck,
                self.shutdown_timeout
            );
            for task in &tasks {
                task.abort();
            }
        }
    }

    /// Marks sessions left live by a previous process as failed so they can
    /// be requested again. Only rows with no actor in this process are touched.
    pub async fn recover_orphans(&self) -> usize {
        let mut recovered = 0;
        for state in [SessionState::Pairing, SessionState::Connected] {
            let documents = match self.store.query(&Query::SessionsInState(state)).await {
                Ok(documents) => documents,
                Err(e) => {
                    tracing::warn!("Failed to load {} sessions for recovery: {}", state, e);
                    continue;
                }
            };

            for document in documents {
                let tenant_id = document.id();
                if self.registry.contains(&tenant_id).await {
                    continue;
                }
                let transition = SessionTransition::Failed {
                    reason: RESTART_REASON.to_string(),
                };
                match self.store.transition_session(&tenant_id, transition).await {
                    Ok(_) => recovered += 1,
                    Err(e) => tracing::warn!(
                        tenant_id = %tenant_id,
                        "Failed to recover orphaned session: {}",
                        e
                    ),
                }
            }
        }

        if recovered > 0 {
            tracing::info!("Marked {} orphaned sessions as failed", recovered);
        }
        recovered
    }
}

struct SessionActor {
    tenant_id: String,
    store: Arc<dyn DocumentStore>,
    registry: Arc<SessionRegistry>,
    protocol: Arc<dyn ChatProtocol>,
    renderer: Arc<dyn PairingRenderer>,
    cancel: CancellationToken,
    state: SessionState,
    handle: Option<Arc<dyn ProtocolHandle>>,
}

impl SessionActor {
    async fn run(mut self) {
        tracing::info!(tenant_id = %self.tenant_id, "Opening chat connection");

        let opened = self.protocol.open(&self.tenant_id).await;
        let ProtocolConnection { handle, events } = match opened {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!(tenant_id = %self.tenant_id, "Failed to open connection: {}", e);
                self.registry.release(&self.tenant_id).await;
                self.write(SessionTransition::Failed {
                    reason: e.to_string(),
                })
                .await;
                return;
            }
        };
        self.handle = Some(handle);

        self.consume(events).await;
        tracing::info!(
            tenant_id = %self.tenant_id,
            "Session actor stopped in state {}",
            self.state
        );
    }

    async fn consume(&mut self, mut events: mpsc::Receiver<ProtocolEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.stop(SHUTDOWN_REASON).await;
                    return;
                }
                event = events.recv() => event,
            };

            let flow = match event {
                Some(event) => self.handle_event(event).await,
                None => {
                    tracing::info!(tenant_id = %self.tenant_id, "Event channel closed by client");
                    self.on_disconnected(CONNECTION_CLOSED_REASON.to_string()).await
                }
            };
            if flow.is_break() {
                return;
            }
        }
    }

    async fn handle_event(&mut self, event: ProtocolEvent) -> ControlFlow<()> {
        match event {
            ProtocolEvent::PairingNeeded(payload) => {
                // An unrenderable payload is still written so the tenant can pair
                // from the raw string; the session is not failed over it.
                let image = match self.renderer.render(&payload) {
                    Ok(image) => Some(image),
                    Err(e) => {
                        tracing::warn!(
                            tenant_id = %self.tenant_id,
                            "Failed to render pairing payload: {}",
                            e
                        );
                        None
                    }
                };
                if self.write(SessionTransition::Pairing { payload, image }).await {
                    tracing::info!(tenant_id = %self.tenant_id, "Waiting for pairing");
                }
                ControlFlow::Continue(())
            }
            ProtocolEvent::Authenticated => {
                tracing::info!(tenant_id = %self.tenant_id, "Pairing accepted");
                self.write(SessionTransition::Authenticated).await;
                ControlFlow::Continue(())
            }
            ProtocolEvent::Ready => {
                if self.state != SessionState::Pairing {
                    tracing::warn!(
                        tenant_id = %self.tenant_id,
                        "Ignoring ready event while {}",
                        self.state
                    );
                    return ControlFlow::Continue(());
                }
                if let Some(handle) = &self.handle {
                    self.registry.register_live(&self.tenant_id, handle.clone()).await;
                }
                if self.write(SessionTransition::Connected).await {
                    tracing::info!(tenant_id = %self.tenant_id, "Session connected");
                } else {
                    self.registry.deregister_live(&self.tenant_id).await;
                    self.registry.set_state(&self.tenant_id, self.state).await;
                }
                ControlFlow::Continue(())
            }
            ProtocolEvent::Disconnected(reason) => self.on_disconnected(reason).await,
            ProtocolEvent::AuthFailure(reason) => {
                tracing::warn!(tenant_id = %self.tenant_id, "Authentication failed: {}", reason);
                self.fail(reason).await;
                ControlFlow::Break(())
            }
            ProtocolEvent::MessageReceived { from, body } => {
                let message = NewInboundMessage {
                    tenant_id: self.tenant_id.clone(),
                    sender: from,
                    body,
                };
                match self.store.append_inbound(message).await {
                    Ok(stored) => tracing::debug!(
                        tenant_id = %self.tenant_id,
                        message_id = stored.id,
                        "Stored inbound message"
                    ),
                    Err(e) => tracing::error!(
                        tenant_id = %self.tenant_id,
                        "Failed to store inbound message: {}",
                        e
                    ),
                }
                ControlFlow::Continue(())
            }
        }
    }

    async fn on_disconnected(&mut self, reason: String) -> ControlFlow<()> {
        if self.state != SessionState::Connected {
            // Losing the connection before it was ever up is a pairing failure.
            tracing::warn!(
                tenant_id = %self.tenant_id,
                "Disconnected before connecting: {}",
                reason
            );
            self.fail(reason).await;
            return ControlFlow::Break(());
        }

        tracing::info!(tenant_id = %self.tenant_id, "Session disconnected: {}", reason);
        self.teardown().await;
        self.write(SessionTransition::Disconnected { reason }).await;
        ControlFlow::Break(())
    }

    async fn fail(&mut self, reason: String) {
        self.teardown().await;
        self.write(SessionTransition::Failed { reason }).await;
    }

    async fn stop(&mut self, reason: &str) {
        tracing::info!(tenant_id = %self.tenant_id, "Stopping session: {}", reason);
        let reason = reason.to_string();
        if self.state == SessionState::Connected {
            self.teardown().await;
            self.write(SessionTransition::Disconnected { reason }).await;
        } else {
            self.fail(reason).await;
        }
    }

    /// Closes the connection and frees the tenant's registry entry.
    async fn teardown(&mut self) {
        self.registry.release(&self.tenant_id).await;
        if let Some(handle) = self.handle.take() {
            handle.close().await;
        }
    }

    /// Applies a transition to the stored row. Rejected transitions are
    /// logged and leave the actor's state unchanged.
    async fn write(&mut self, transition: SessionTransition) -> bool {
        match self.store.transition_session(&self.tenant_id, transition).await {
            Ok(TenantSession { state, .. }) => {
                self.state = state;
                if state.is_live() {
                    self.registry.set_state(&self.tenant_id, state).await;
                }
                true
            }
            Err(e @ BridgeError::InvalidTransition { .. }) => {
                tracing::warn!(tenant_id = %self.tenant_id, "Ignoring rejected write: {}", e);
                false
            }
            Err(e) => {
                tracing::error!(
                    tenant_id = %self.tenant_id,
                    "Failed to write session state: {}",
                    e
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::{MockPairingRenderer, QrPairingRenderer};
    use crate::protocol::{MockChatProtocol, ProtocolError};
    use async_trait::async_trait;
    use bridge_core::MemoryStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingHandle {
        closed: AtomicBool,
    }

    #[async_trait]
    impl ProtocolHandle for RecordingHandle {
        async fn send(&self, _recipient: &str, _body: &str) -> Result<(), ProtocolError> {
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Hands out connections whose events the test pushes by hand.
    #[derive(Default)]
    struct ScriptedProtocol {
        opened: AtomicUsize,
        senders: parking_lot::Mutex<HashMap<String, mpsc::Sender<ProtocolEvent>>>,
        handles: parking_lot::Mutex<HashMap<String, Arc<RecordingHandle>>>,
    }

    impl ScriptedProtocol {
        async fn emit(&self, tenant_id: &str, event: ProtocolEvent) {
            let sender = self.senders.lock().get(tenant_id).cloned();
            sender.expect("connection opened").send(event).await.unwrap();
        }

        fn hang_up(&self, tenant_id: &str) {
            self.senders.lock().remove(tenant_id);
        }

        fn handle(&self, tenant_id: &str) -> Arc<RecordingHandle> {
            self.handles.lock().get(tenant_id).cloned().expect("connection opened")
        }
    }

    #[async_trait]
    impl ChatProtocol for ScriptedProtocol {
        async fn open(&self, tenant_id: &str) -> Result<ProtocolConnection, ProtocolError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let (tx, events) = mpsc::channel(16);
            let handle = Arc::new(RecordingHandle::default());
            self.senders.lock().insert(tenant_id.to_string(), tx);
            self.handles.lock().insert(tenant_id.to_string(), handle.clone());
            Ok(ProtocolConnection { handle, events })
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        registry: Arc<SessionRegistry>,
        protocol: Arc<ScriptedProtocol>,
        manager: LifecycleManager,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(SessionRegistry::new());
        let protocol = Arc::new(ScriptedProtocol::default());
        let manager = LifecycleManager::new(
            store.clone(),
            registry.clone(),
            protocol.clone(),
            Arc::new(QrPairingRenderer::default()),
            Duration::from_secs(5),
        );
        Harness {
            store,
            registry,
            protocol,
            manager,
        }
    }

    impl Harness {
        async fn start(&self, tenant_id: &str) {
            self.store.request_session(tenant_id).await.unwrap();
            assert!(self.manager.ensure_session(tenant_id).await);
            self.wait_until_opened(1).await;
        }

        async fn wait_until_opened(&self, count: usize) {
            for _ in 0..200 {
                if self.protocol.opened.load(Ordering::SeqCst) >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("connection was never opened");
        }

        async fn wait_for<F>(&self, tenant_id: &str, done: F) -> TenantSession
        where
            F: Fn(&TenantSession) -> bool,
        {
            for _ in 0..200 {
                if let Some(session) = self.store.get_session(tenant_id).await.unwrap() {
                    if done(&session) {
                        return session;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("session {} never reached the expected state", tenant_id);
        }

        async fn wait_for_state(&self, tenant_id: &str, state: SessionState) -> TenantSession {
            self.wait_for(tenant_id, |session| session.state == state).await
        }

        async fn connect(&self, tenant_id: &str) {
            self.start(tenant_id).await;
            self.protocol
                .emit(tenant_id, ProtocolEvent::PairingNeeded("QR-1".into()))
                .await;
            self.protocol.emit(tenant_id, ProtocolEvent::Authenticated).await;
            self.protocol.emit(tenant_id, ProtocolEvent::Ready).await;
            self.wait_for_state(tenant_id, SessionState::Connected).await;
        }
    }

    #[tokio::test]
    async fn test_pairing_then_connect() {
        let h = harness();
        h.start("T1").await;

        h.protocol
            .emit("T1", ProtocolEvent::PairingNeeded("QR-1".into()))
            .await;
        let pairing = h.wait_for_state("T1", SessionState::Pairing).await;
        assert_eq!(pairing.pairing_payload.as_deref(), Some("QR-1"));
        assert!(pairing
            .pairing_image
            .as_deref()
            .is_some_and(|image| image.starts_with("data:image/svg+xml;base64,")));
        assert!(pairing.pairing_started_at.is_some());

        h.protocol.emit("T1", ProtocolEvent::Authenticated).await;
        let authenticated = h
            .wait_for("T1", |session| session.pairing_payload.is_none())
            .await;
        assert_eq!(authenticated.state, SessionState::Pairing);

        h.protocol.emit("T1", ProtocolEvent::Ready).await;
        let connected = h.wait_for_state("T1", SessionState::Connected).await;
        assert!(connected.connected_at.is_some());
        assert!(connected.pairing_image.is_none());
        assert!(h.registry.live_connection("T1").await.is_some());
    }

    #[tokio::test]
    async fn test_repeated_requests_open_one_connection() {
        let h = harness();
        h.store.request_session("T1").await.unwrap();

        let (a, b, c) = tokio::join!(
            h.manager.ensure_session("T1"),
            h.manager.ensure_session("T1"),
            h.manager.ensure_session("T1"),
        );
        assert_eq!([a, b, c].iter().filter(|started| **started).count(), 1);

        h.wait_until_opened(1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.protocol.opened.load(Ordering::SeqCst), 1);
        assert_eq!(h.registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_disconnect_from_connected_records_reason() {
        let h = harness();
        h.connect("T1").await;

        h.protocol
            .emit("T1", ProtocolEvent::Disconnected("phone offline".into()))
            .await;
        let session = h.wait_for_state("T1", SessionState::Disconnected).await;

        assert_eq!(session.last_error.as_deref(), Some("phone offline"));
        assert!(session.disconnected_at.is_some());
        assert!(!h.registry.contains("T1").await);
        assert!(h.protocol.handle("T1").closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_disconnect_while_pairing_is_a_failure() {
        let h = harness();
        h.start("T1").await;
        h.protocol
            .emit("T1", ProtocolEvent::PairingNeeded("QR-1".into()))
            .await;
        h.wait_for_state("T1", SessionState::Pairing).await;

        h.protocol
            .emit("T1", ProtocolEvent::Disconnected("pairing timed out".into()))
            .await;
        let session = h.wait_for_state("T1", SessionState::Failed).await;
        assert_eq!(session.last_error.as_deref(), Some("pairing timed out"));
        assert!(session.pairing_payload.is_none());
        assert!(!h.registry.contains("T1").await);
    }

    #[tokio::test]
    async fn test_auth_failure_marks_failed() {
        let h = harness();
        h.start("T1").await;
        h.protocol
            .emit("T1", ProtocolEvent::AuthFailure("bad credentials".into()))
            .await;

        let session = h.wait_for_state("T1", SessionState::Failed).await;
        assert_eq!(session.last_error.as_deref(), Some("bad credentials"));
        assert!(!h.registry.contains("T1").await);
    }

    #[tokio::test]
    async fn test_closed_channel_counts_as_disconnect() {
        let h = harness();
        h.connect("T1").await;

        h.protocol.hang_up("T1");
        let session = h.wait_for_state("T1", SessionState::Disconnected).await;
        assert_eq!(session.last_error.as_deref(), Some(CONNECTION_CLOSED_REASON));
    }

    #[tokio::test]
    async fn test_inbound_message_is_stored_without_state_change() {
        let h = harness();
        h.connect("T1").await;

        h.protocol
            .emit(
                "T1",
                ProtocolEvent::MessageReceived {
                    from: "15550100".into(),
                    body: "hello".into(),
                },
            )
            .await;

        let mut inbound = Vec::new();
        for _ in 0..200 {
            inbound = h.store.list_inbound("T1").await.unwrap();
            if !inbound.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].sender, "15550100");
        assert_eq!(inbound[0].body, "hello");

        let session = h.store.get_session("T1").await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Connected);
    }

    #[tokio::test]
    async fn test_rejected_transition_keeps_actor_running() {
        let h = harness();
        h.start("T1").await;

        // Ready before pairing is ignored.
        h.protocol.emit("T1", ProtocolEvent::Ready).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.registry.live_connection("T1").await.is_none());
        let session = h.store.get_session("T1").await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Requested);

        h.protocol
            .emit("T1", ProtocolEvent::PairingNeeded("QR-2".into()))
            .await;
        h.wait_for_state("T1", SessionState::Pairing).await;
        assert!(h.registry.contains("T1").await);
    }

    #[tokio::test]
    async fn test_render_failure_still_records_payload() {
        let store = Arc::new(MemoryStore::new());
        let protocol = Arc::new(ScriptedProtocol::default());
        let mut renderer = MockPairingRenderer::new();
        renderer
            .expect_render()
            .returning(|_| Err(BridgeError::Render("boom".into())));
        let manager = LifecycleManager::new(
            store.clone(),
            Arc::new(SessionRegistry::new()),
            protocol.clone(),
            Arc::new(renderer),
            Duration::from_secs(5),
        );

        store.request_session("T1").await.unwrap();
        manager.ensure_session("T1").await;
        for _ in 0..200 {
            if protocol.opened.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        protocol
            .emit("T1", ProtocolEvent::PairingNeeded("QR-3".into()))
            .await;

        let mut session = None;
        for _ in 0..200 {
            session = store.get_session("T1").await.unwrap();
            if session.as_ref().is_some_and(|s| s.state == SessionState::Pairing) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let session = session.unwrap();
        assert_eq!(session.pairing_payload.as_deref(), Some("QR-3"));
        assert!(session.pairing_image.is_none());
    }

    #[tokio::test]
    async fn test_open_failure_marks_failed_and_frees_tenant() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(SessionRegistry::new());
        let mut protocol = MockChatProtocol::new();
        protocol
            .expect_open()
            .times(1)
            .returning(|_| Err(ProtocolError::Open("network unreachable".into())));
        let manager = LifecycleManager::new(
            store.clone(),
            registry.clone(),
            Arc::new(protocol),
            Arc::new(QrPairingRenderer::default()),
            Duration::from_secs(5),
        );

        store.request_session("T1").await.unwrap();
        assert!(manager.ensure_session("T1").await);

        let mut state = SessionState::Requested;
        for _ in 0..200 {
            state = store.get_session("T1").await.unwrap().unwrap().state;
            if state == SessionState::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(state, SessionState::Failed);
        let session = store.get_session("T1").await.unwrap().unwrap();
        assert_eq!(
            session.last_error.as_deref(),
            Some("failed to open connection: network unreachable")
        );
        assert!(!registry.contains("T1").await);
    }

    #[tokio::test]
    async fn test_shutdown_all_records_final_states() {
        let h = harness();
        h.connect("T1").await;

        h.store.request_session("T2").await.unwrap();
        assert!(h.manager.ensure_session("T2").await);
        h.wait_until_opened(2).await;
        h.protocol
            .emit("T2", ProtocolEvent::PairingNeeded("QR-2".into()))
            .await;
        h.wait_for_state("T2", SessionState::Pairing).await;

        h.manager.shutdown_all().await;

        let connected = h.store.get_session("T1").await.unwrap().unwrap();
        assert_eq!(connected.state, SessionState::Disconnected);
        assert_eq!(connected.last_error.as_deref(), Some(SHUTDOWN_REASON));
        let pairing = h.store.get_session("T2").await.unwrap().unwrap();
        assert_eq!(pairing.state, SessionState::Failed);
        assert_eq!(pairing.last_error.as_deref(), Some(SHUTDOWN_REASON));

        assert!(h.protocol.handle("T1").closed.load(Ordering::SeqCst));
        assert!(h.protocol.handle("T2").closed.load(Ordering::SeqCst));
        assert!(h.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_shutdown_session_allows_new_request() {
        let h = harness();
        h.connect("T1").await;

        assert!(h.manager.shutdown_session("T1").await);
        assert!(!h.manager.shutdown_session("T1").await);

        h.store.request_session("T1").await.unwrap();
        assert!(h.manager.ensure_session("T1").await);
        h.wait_until_opened(2).await;
    }

    #[tokio::test]
    async fn test_recover_orphans_fails_stale_live_rows() {
        let h = harness();
        let mut stale = TenantSession::requested("T9", chrono::Utc::now());
        stale.state = SessionState::Connected;
        h.store.seed_session(stale);

        assert_eq!(h.manager.recover_orphans().await, 1);
        let session = h.store.get_session("T9").await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Failed);
        assert_eq!(session.last_error.as_deref(), Some(RESTART_REASON));
    }

    #[tokio::test]
    async fn test_early_ready_never_exposes_live_handle() {
        let mut store = bridge_core::MockDocumentStore::new();
        store.expect_transition_session().never();
        let registry = Arc::new(SessionRegistry::new());
        let protocol = Arc::new(ScriptedProtocol::default());
        let manager = LifecycleManager::new(
            Arc::new(store),
            registry.clone(),
            protocol.clone(),
            Arc::new(QrPairingRenderer::default()),
            Duration::from_secs(5),
        );

        assert!(manager.ensure_session("T1").await);
        for _ in 0..200 {
            if protocol.opened.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        protocol.emit("T1", ProtocolEvent::Ready).await;
        for _ in 0..20 {
            assert!(registry.live_connection("T1").await.is_none());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(registry.contains("T1").await);
    }
}
