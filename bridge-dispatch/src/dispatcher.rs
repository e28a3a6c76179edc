//! Routes store changes to the component that acts on them.
//!
//! Newly requested sessions go to the lifecycle manager and pending outbound
//! messages go to the delivery worker. Each feed has exactly one consumer
//! task, so work from a feed is handled one change at a time in store order.

use bridge_core::{BridgeError, Change, Document, MessageStatus, Query, SessionState};
use bridge_delivery::{DeliveryOutcome, DeliveryWorker};
use bridge_session::LifecycleManager;
use bridge_watch::{DataCallback, ErrorCallback, Subscription, SubscriptionManager};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing;

struct Running {
    subscriptions: Vec<Subscription>,
    consumers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

pub struct ChangeFeedDispatcher {
    subscriptions: Arc<SubscriptionManager>,
    lifecycle: Arc<LifecycleManager>,
    worker: Arc<DeliveryWorker>,
    running: Mutex<Option<Running>>,
}

impl ChangeFeedDispatcher {
    pub fn new(
        subscriptions: Arc<SubscriptionManager>,
        lifecycle: Arc<LifecycleManager>,
        worker: Arc<DeliveryWorker>,
    ) -> Self {
        Self {
            subscriptions,
            lifecycle,
            worker,
            running: Mutex::new(None),
        }
    }

    pub fn sessions_query() -> Query {
        Query::SessionsInState(SessionState::Requested)
    }

    pub fn outbound_query() -> Query {
        Query::OutboundWithStatus(MessageStatus::Pending)
    }

    /// Subscribes to both feeds. Calling it while already running is a no-op.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            tracing::debug!("Dispatcher already running");
            return;
        }

        let cancel = CancellationToken::new();

        let (sessions, session_changes) = self.subscribe(Self::sessions_query());
        let lifecycle = self.lifecycle.clone();
        let sessions_task = tokio::spawn(consume(
            session_changes,
            cancel.clone(),
            move |change| {
                let lifecycle = lifecycle.clone();
                async move {
                    if let Document::Session(session) = change.document {
                        if session.state == SessionState::Requested {
                            lifecycle.ensure_session(&session.tenant_id).await;
                        }
                    }
                }
            },
        ));

        let (outbound, outbound_changes) = self.subscribe(Self::outbound_query());
        let worker = self.worker.clone();
        let outbound_task = tokio::spawn(consume(
            outbound_changes,
            cancel.clone(),
            move |change| {
                let worker = worker.clone();
                async move {
                    if let Document::Outbound(message) = change.document {
                        match worker.deliver(&message).await {
                            DeliveryOutcome::Skipped => {
                                tracing::debug!(message_id = message.id, "Delivery skipped")
                            }
                            outcome => tracing::debug!(
                                message_id = message.id,
                                "Delivery finished: {:?}",
                                outcome
                            ),
                        }
                    }
                }
            },
        ));

        *running = Some(Running {
            subscriptions: vec![sessions, outbound],
            consumers: vec![sessions_task, outbound_task],
            cancel,
        });
        tracing::info!("Change-feed dispatcher started");
    }

    /// Cancels both subscriptions and waits for the consumers to finish the
    /// change they are working on.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        for subscription in running.subscriptions {
            subscription.cancel();
        }
        running.cancel.cancel();

        for consumer in running.consumers {
            if let Err(e) = consumer.await {
                tracing::error!("Dispatcher consumer ended abnormally: {}", e);
            }
        }
        tracing::info!("Change-feed dispatcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    fn subscribe(&self, query: Query) -> (Subscription, mpsc::UnboundedReceiver<Change>) {
        let key = query.key();
        let (tx, rx) = mpsc::unbounded_channel();

        let on_data: DataCallback = Arc::new(move |changes: &[Change]| {
            for change in changes.iter().filter(|change| change.is_upsert()) {
                if tx.send(change.clone()).is_err() {
                    return;
                }
            }
        });
        let feed = key.clone();
        let on_error: ErrorCallback = Arc::new(move |e: &BridgeError| {
            tracing::warn!("Feed {} reported an error, waiting for the next poll: {}", feed, e);
        });

        let subscription = self
            .subscriptions
            .subscribe(&key, query, on_data, Some(on_error));
        (subscription, rx)
    }
}

async fn consume<F, Fut>(
    mut changes: mpsc::UnboundedReceiver<Change>,
    cancel: CancellationToken,
    handle: F,
) where
    F: Fn(Change) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        let change = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            change = changes.recv() => change,
        };
        match change {
            Some(change) => handle(change).await,
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::config::SubscriptionConfig;
    use bridge_core::{
        DocumentStore, MemoryStore, NewOutboundMessage, OutboundMessage, TenantSession,
    };
    use bridge_session::{QrPairingRenderer, SessionRegistry, SimulatedProtocol};
    use std::time::Duration;

    struct Bridge {
        store: Arc<MemoryStore>,
        subscriptions: Arc<SubscriptionManager>,
        lifecycle: Arc<LifecycleManager>,
        dispatcher: ChangeFeedDispatcher,
    }

    fn bridge(pairing_delay: Option<Duration>) -> Bridge {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(SessionRegistry::new());
        let subscriptions =
            SubscriptionManager::start(store.clone(), &SubscriptionConfig::default());
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            registry.clone(),
            Arc::new(SimulatedProtocol::new(16, pairing_delay)),
            Arc::new(QrPairingRenderer::default()),
            Duration::from_secs(5),
        ));
        let worker = Arc::new(DeliveryWorker::new(store.clone(), registry));
        let dispatcher =
            ChangeFeedDispatcher::new(subscriptions.clone(), lifecycle.clone(), worker);
        Bridge {
            store,
            subscriptions,
            lifecycle,
            dispatcher,
        }
    }

    impl Bridge {
        async fn session_in(&self, tenant_id: &str, state: SessionState) -> TenantSession {
            for _ in 0..400 {
                if let Some(session) = self.store.get_session(tenant_id).await.unwrap() {
                    if session.state == state {
                        return session;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("session {} never reached {}", tenant_id, state);
        }

        async fn message_in(&self, id: i64, status: MessageStatus) -> OutboundMessage {
            for _ in 0..400 {
                let message = self.store.get_outbound(id).await.unwrap().unwrap();
                if message.status == status {
                    return message;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("message {} never reached {}", id, status);
        }

        async fn enqueue(&self, tenant_id: &str, body: &str) -> OutboundMessage {
            self.store
                .enqueue_outbound(NewOutboundMessage {
                    tenant_id: tenant_id.into(),
                    recipient: "555 0100".into(),
                    body: body.into(),
                })
                .await
                .unwrap()
        }

        async fn shutdown(&self) {
            self.dispatcher.stop().await;
            self.lifecycle.shutdown_all().await;
            self.subscriptions.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_requested_session_pairs_and_connects() {
        let bridge = bridge(Some(Duration::from_millis(20)));
        bridge.dispatcher.start();

        bridge.store.request_session("T1").await.unwrap();
        let connected = bridge.session_in("T1", SessionState::Connected).await;
        assert!(connected.pairing_payload.is_none());
        assert!(connected.connected_at.is_some());
        assert!(bridge.lifecycle.registry().live_connection("T1").await.is_some());

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_pending_message_is_sent_over_live_session() {
        let bridge = bridge(Some(Duration::from_millis(10)));
        bridge.dispatcher.start();
        bridge.store.request_session("T1").await.unwrap();
        bridge.session_in("T1", SessionState::Connected).await;

        let message = bridge.enqueue("T1", "order shipped").await;
        let sent = bridge.message_in(message.id, MessageStatus::Sent).await;
        assert!(sent.sent_at.is_some());

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_message_for_unpaired_tenant_fails() {
        let bridge = bridge(None);
        bridge.dispatcher.start();
        bridge.store.request_session("T1").await.unwrap();
        bridge.session_in("T1", SessionState::Pairing).await;

        let message = bridge.enqueue("T1", "too early").await;
        let failed = bridge.message_in(message.id, MessageStatus::Failed).await;
        assert_eq!(failed.error.as_deref(), Some("tenant not connected"));

        bridge.shutdown().await;
        let session = bridge.store.get_session("T1").await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Failed);
    }

    #[tokio::test]
    async fn test_existing_work_is_picked_up_on_start() {
        let bridge = bridge(None);
        bridge.store.request_session("T1").await.unwrap();
        let message = bridge.enqueue("T2", "queued before start").await;

        bridge.dispatcher.start();
        bridge.session_in("T1", SessionState::Pairing).await;
        bridge.message_in(message.id, MessageStatus::Failed).await;

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_leaves_new_work_untouched() {
        let bridge = bridge(None);
        bridge.dispatcher.start();
        assert!(bridge.dispatcher.is_running());
        bridge.dispatcher.stop().await;
        assert!(!bridge.dispatcher.is_running());
        assert_eq!(bridge.subscriptions.stats().idle, 2);

        let message = bridge.enqueue("T1", "after stop").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stored = bridge.store.get_outbound(message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Pending);

        bridge.subscriptions.shutdown().await;
    }
}
