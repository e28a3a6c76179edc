//! Reference-counted store watches.
//!
//! Every key owns at most one underlying [`Watch`]. Subscribers to the same key
//! share it and each batch is fanned out to all of them. Cancelling the last
//! subscription only marks the key idle; a periodic sweep tears the watch
//! down once it has been idle for longer than the configured timeout, so a
//! quick unsubscribe/resubscribe cycle keeps the feed open.

use bridge_core::config::SubscriptionConfig;
use bridge_core::{BridgeError, Change, DocumentStore, Query, WatchEvent};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing;

pub type DataCallback = Arc<dyn Fn(&[Change]) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&BridgeError) + Send + Sync>;

type EntryTable = Mutex<HashMap<String, Entry>>;

#[derive(Clone)]
struct Listener {
    id: u64,
    on_data: DataCallback,
    on_error: Option<ErrorCallback>,
}

struct Entry {
    ref_count: i64,
    last_used: Instant,
    cancel: CancellationToken,
    listeners: Arc<RwLock<Vec<Listener>>>,
}

impl Entry {
    fn is_idle(&self) -> bool {
        self.ref_count <= 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
}

pub struct SubscriptionManager {
    store: Arc<dyn DocumentStore>,
    entries: Arc<EntryTable>,
    idle_timeout: Duration,
    next_listener_id: AtomicU64,
    sweeper: CancellationToken,
    sweeper_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionManager {
    /// Creates the manager and starts its idle sweep on the current runtime.
    pub fn start(store: Arc<dyn DocumentStore>, config: &SubscriptionConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            store,
            entries: Arc::new(Mutex::new(HashMap::new())),
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            next_listener_id: AtomicU64::new(1),
            sweeper: CancellationToken::new(),
            sweeper_handle: Mutex::new(None),
        });

        let handle = spawn_sweeper(
            Arc::downgrade(&manager),
            Duration::from_millis(config.sweep_interval_ms.max(1)),
            manager.sweeper.clone(),
        );
        *manager.sweeper_handle.lock() = Some(handle);

        tracing::info!(
            "Subscription manager started (sweep every {}ms, idle timeout {}ms)",
            config.sweep_interval_ms,
            config.idle_timeout_ms
        );
        manager
    }

    pub fn subscribe(
        &self,
        key: &str,
        query: Query,
        on_data: DataCallback,
        on_error: Option<ErrorCallback>,
    ) -> Subscription {
        let listener = Listener {
            id: self.next_listener_id.fetch_add(1, Ordering::Relaxed),
            on_data,
            on_error,
        };
        let listener_id = listener.id;

        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.ref_count += 1;
                entry.last_used = Instant::now();
                entry.listeners.write().push(listener);
                tracing::debug!(
                    "Reusing watch for {} (ref_count {})",
                    key,
                    entry.ref_count
                );
            }
            None => {
                let (events, cancel) = self.store.watch(query).into_parts();
                let listeners = Arc::new(RwLock::new(vec![listener]));
                tokio::spawn(fan_out(
                    key.to_string(),
                    events,
                    cancel.clone(),
                    listeners.clone(),
                    Arc::downgrade(&self.entries),
                ));
                entries.insert(
                    key.to_string(),
                    Entry {
                        ref_count: 1,
                        last_used: Instant::now(),
                        cancel,
                        listeners,
                    },
                );
                tracing::info!("Opened watch for {}", key);
            }
        }

        Subscription {
            key: key.to_string(),
            listener_id,
            entries: Some(Arc::downgrade(&self.entries)),
        }
    }

    /// Tears down every idle key whose idle time exceeds the timeout.
    /// Returns how many watches were closed.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| {
                entry.is_idle() && now.duration_since(entry.last_used) > self.idle_timeout
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = entries.remove(key) {
                entry.cancel.cancel();
                tracing::info!("Closed idle watch for {}", key);
            }
        }

        expired.len()
    }

    /// Tears down one key immediately, whatever its reference count.
    pub fn force_cleanup(&self, key: &str) -> bool {
        match self.entries.lock().remove(key) {
            Some(entry) => {
                entry.cancel.cancel();
                tracing::info!(
                    "Force-closed watch for {} ({} subscribers dropped)",
                    key,
                    entry.ref_count.max(0)
                );
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> SubscriptionStats {
        let entries = self.entries.lock();
        let idle = entries.values().filter(|entry| entry.is_idle()).count();
        SubscriptionStats {
            total: entries.len(),
            active: entries.len() - idle,
            idle,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Stops the sweep and closes every watch.
    pub async fn shutdown(&self) {
        self.sweeper.cancel();

        let drained: Vec<(String, Entry)> = self.entries.lock().drain().collect();
        for (key, entry) in &drained {
            entry.cancel.cancel();
            tracing::debug!("Closed watch for {} on shutdown", key);
        }

        let handle = self.sweeper_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Subscription sweeper ended abnormally: {}", e);
            }
        }

        tracing::info!("Subscription manager shut down ({} watches closed)", drained.len());
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.sweeper.cancel();
        for entry in self.entries.lock().values() {
            entry.cancel.cancel();
        }
    }
}

/// Handle for one listener. Cancelling (or dropping) it stops deliveries to
/// that listener; the shared watch stays open until the idle sweep.
pub struct Subscription {
    key: String,
    listener_id: u64,
    entries: Option<Weak<EntryTable>>,
}

impl Subscription {
    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(entries) = self.entries.take().and_then(|weak| weak.upgrade()) else {
            return;
        };

        let mut entries = entries.lock();
        let Some(entry) = entries.get_mut(&self.key) else {
            return;
        };

        let removed = {
            let mut listeners = entry.listeners.write();
            let before = listeners.len();
            listeners.retain(|listener| listener.id != self.listener_id);
            listeners.len() < before
        };
        // A force-cleaned key may have been reopened by other subscribers.
        if !removed {
            return;
        }

        entry.ref_count -= 1;
        entry.last_used = Instant::now();
        if entry.is_idle() {
            tracing::debug!("Watch for {} has no subscribers, marked idle", self.key);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

async fn fan_out(
    key: String,
    mut events: mpsc::Receiver<WatchEvent>,
    cancel: CancellationToken,
    listeners: Arc<RwLock<Vec<Listener>>>,
    entries: Weak<EntryTable>,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        // Snapshot so callbacks may subscribe or cancel without deadlocking.
        let current: Vec<Listener> = listeners.read().clone();
        match event {
            Some(WatchEvent::Batch(changes)) => {
                for listener in &current {
                    (listener.on_data)(&changes);
                }
            }
            Some(WatchEvent::Error(e)) => {
                tracing::warn!("Watch {} reported an error: {}", key, e);
                for listener in &current {
                    if let Some(on_error) = &listener.on_error {
                        on_error(&e);
                    }
                }
            }
            None => {
                tracing::warn!("Watch {} closed its event stream, dropping it", key);
                // Drop the entry so the next subscriber opens a fresh watch.
                if let Some(entries) = entries.upgrade() {
                    let mut entries = entries.lock();
                    let same = entries
                        .get(&key)
                        .is_some_and(|entry| Arc::ptr_eq(&entry.listeners, &listeners));
                    if same {
                        entries.remove(&key);
                    }
                }
                break;
            }
        }
    }

    cancel.cancel();
}

fn spawn_sweeper(
    manager: Weak<SubscriptionManager>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(manager) = manager.upgrade() else { break };
                    let closed = manager.sweep_idle();
                    if closed > 0 {
                        tracing::debug!("Idle sweep closed {} watches", closed);
                    }
                }
            }
        }
    })
}
