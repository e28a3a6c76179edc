//! Change-feed primitives shared by every store backend.
//!
//! A watch re-evaluates a [`Query`] and diffs the result against the previous
//! evaluation, producing `Added`, `Modified` and `Removed` changes in the order
//! the store returned the rows. The first evaluation reports the whole result
//! set as `Added`. Evaluation errors are reported on the same channel and the
//! watch keeps running, so consumers never have to re-open it.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing;

use crate::error::{BridgeError, BridgeResult};
use crate::types::{Change, ChangeKind, Document, Query};

const WATCH_BUFFER: usize = 64;
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum WatchEvent {
    Batch(Vec<Change>),
    Error(BridgeError),
}

/// Receiving end of a running watch plus the token that stops it.
pub struct Watch {
    events: mpsc::Receiver<WatchEvent>,
    cancel: CancellationToken,
}

impl Watch {
    pub fn new(events: mpsc::Receiver<WatchEvent>, cancel: CancellationToken) -> Self {
        Self { events, cancel }
    }

    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn into_parts(self) -> (mpsc::Receiver<WatchEvent>, CancellationToken) {
        (self.events, self.cancel)
    }
}

/// Last observed result set of a query, keyed by document id.
#[derive(Default)]
pub struct FeedSnapshot {
    documents: HashMap<String, Document>,
}

impl FeedSnapshot {
    pub fn diff(&mut self, documents: Vec<Document>) -> Vec<Change> {
        let mut next = HashMap::with_capacity(documents.len());
        let mut changes = Vec::new();

        for document in documents {
            let id = document.id();
            let kind = match self.documents.get(&id) {
                None => Some(ChangeKind::Added),
                Some(previous) if version_changed(previous.updated_at(), document.updated_at()) => {
                    Some(ChangeKind::Modified)
                }
                Some(_) => None,
            };
            if let Some(kind) = kind {
                changes.push(Change {
                    kind,
                    document: document.clone(),
                });
            }
            next.insert(id, document);
        }

        let mut removed: Vec<Document> = self
            .documents
            .drain()
            .filter(|(id, _)| !next.contains_key(id))
            .map(|(_, document)| document)
            .collect();
        removed.sort_by_key(|document| document.id());
        changes.extend(removed.into_iter().map(|document| Change {
            kind: ChangeKind::Removed,
            document,
        }));

        self.documents = next;
        changes
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

fn version_changed(previous: DateTime<Utc>, current: DateTime<Utc>) -> bool {
    previous != current
}

/// Spawns a watch that re-runs `fetch` every `interval`.
pub fn spawn_polling_watch<F, Fut>(query: Query, interval: Duration, fetch: F) -> Watch
where
    F: Fn(Query) -> Fut + Send + 'static,
    Fut: Future<Output = BridgeResult<Vec<Document>>> + Send,
{
    let (tx, rx) = mpsc::channel(WATCH_BUFFER);
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        let key = query.key();
        let mut snapshot = FeedSnapshot::default();
        tracing::debug!("Starting polling watch for {}", key);

        loop {
            let result = tokio::select! {
                _ = token.cancelled() => break,
                result = fetch(query) => result,
            };

            let wait = match result {
                Ok(documents) => {
                    let changes = snapshot.diff(documents);
                    if !changes.is_empty() && tx.send(WatchEvent::Batch(changes)).await.is_err() {
                        break;
                    }
                    interval
                }
                Err(e) => {
                    tracing::warn!("Watch {} failed to evaluate: {}", key, e);
                    if tx.send(WatchEvent::Error(e)).await.is_err() {
                        break;
                    }
                    ERROR_BACKOFF.max(interval)
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        tracing::debug!("Polling watch for {} stopped", key);
    });

    Watch::new(rx, cancel)
}

/// Spawns a watch that re-runs `evaluate` every time `revisions` changes.
pub fn spawn_notified_watch<F>(
    query: Query,
    mut revisions: watch::Receiver<u64>,
    evaluate: F,
) -> Watch
where
    F: Fn(&Query) -> Vec<Document> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(WATCH_BUFFER);
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        let mut snapshot = FeedSnapshot::default();

        loop {
            revisions.borrow_and_update();
            let changes = snapshot.diff(evaluate(&query));
            if !changes.is_empty() {
                tokio::select! {
                    _ = token.cancelled() => break,
                    sent = tx.send(WatchEvent::Batch(changes)) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                changed = revisions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        // `evaluate` is dropped here, which is how owners observe teardown.
        drop(evaluate);
    });

    Watch::new(rx, cancel)
}
