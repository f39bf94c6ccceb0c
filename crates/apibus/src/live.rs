//! Live-query channel cache.
//!
//! A `live` call asks a backend to open a change feed for a query and
//! returns the pub/sub channel where changes will be published. Identical
//! queries must share one upstream feed and one channel, so each generator
//! owns a [`LiveCache`] keyed by a content hash of the endpoint path and
//! the validated params.
//!
//! Entries are reserved with a pending slot before the backend call, so
//! two concurrent identical requests trigger the backend exactly once.
//! A forwarding task translates feed events into publishes; a publish that
//! reaches zero subscribers tears the entry down immediately, and a
//! periodic sweep evicts entries that have sat idle with no subscribers.

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use anyhow::anyhow;

use crate::client::WeakApiHandle;
use crate::endpoint::{BoxFuture, NodeContext};
use crate::error::{ApiError, ApiResult};
use crate::types::ChannelReference;

/// Default sweep period, and the default idle threshold derived from it.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(10);

/// A single change observed by an upstream feed.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub record: Value,
    pub position: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "insert",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
        }
    }
}

/// Upstream subscription handle; dropping the feed alone must not leak the
/// backend cursor, so teardown goes through this.
#[async_trait]
pub trait FeedHandle: Send + Sync {
    async fn unsubscribe(&self);
}

/// What a `live` backend returns: the event stream plus its teardown handle.
pub struct LiveFeed {
    pub events: mpsc::Receiver<ChangeEvent>,
    pub handle: Arc<dyn FeedHandle>,
}

impl LiveFeed {
    pub fn new(events: mpsc::Receiver<ChangeEvent>, handle: Arc<dyn FeedHandle>) -> Self {
        Self { events, handle }
    }
}

/// Backend callback opening an upstream feed for validated query params.
pub type LiveBackend =
    Arc<dyn Fn(NodeContext, Value) -> BoxFuture<ApiResult<LiveFeed>> + Send + Sync>;

/// Optional per-event record transform applied before publishing.
pub type LiveMapper = Arc<dyn Fn(Value, ChangeOp) -> Value + Send + Sync>;

enum Slot {
    /// Reservation held by the request that is currently calling the
    /// backend; waiters park on the receiver. A backend failure is
    /// broadcast as the failure reason and rejects every waiter.
    Pending(watch::Receiver<Option<String>>),
    Ready(Entry),
}

struct Entry {
    channel: ChannelReference,
    feed: Arc<dyn FeedHandle>,
    forward: AbortHandle,
    last_used: Instant,
    generation: u64,
}

struct LiveState {
    gc_interval: Duration,
    idle_threshold: Duration,
    entries: Mutex<HashMap<String, Slot>>,
    generation: AtomicU64,
    sweeper_started: AtomicBool,
    api: OnceLock<WeakApiHandle>,
}

/// Deduplicating channel cache, one per mounted live-capable endpoint.
#[derive(Clone)]
pub struct LiveCache {
    inner: Arc<LiveState>,
}

impl LiveCache {
    pub fn new(gc_interval: Duration, idle_threshold: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(LiveState {
                gc_interval,
                idle_threshold: idle_threshold.unwrap_or(gc_interval),
                entries: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                sweeper_started: AtomicBool::new(false),
                api: OnceLock::new(),
            }),
        }
    }

    /// Number of resolved entries, pending reservations excluded.
    pub async fn len(&self) -> usize {
        self.inner
            .entries
            .lock()
            .await
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Returns the shared channel for this query, opening the upstream feed
    /// if no live entry exists yet.
    ///
    /// `scope` partitions the key space (`"live"` vs `"map"`), so queries
    /// from different operations never collide even with equal params.
    pub async fn acquire(
        &self,
        ctx: &NodeContext,
        scope: &str,
        params: &Value,
        mapper: Option<LiveMapper>,
        backend: &LiveBackend,
    ) -> ApiResult<ChannelReference> {
        let key = cache_key(scope, &ctx.path, params);
        self.ensure_sweeper(ctx);

        // Claim the key or join an existing entry/reservation.
        let notify = loop {
            let mut entries = self.inner.entries.lock().await;
            match entries.get_mut(&key) {
                Some(Slot::Ready(entry)) => {
                    entry.last_used = Instant::now();
                    let channel = entry.channel.clone();
                    debug!(channel = %channel, "live query cache hit");
                    return Ok(channel);
                }
                Some(Slot::Pending(rx)) => {
                    let mut rx = rx.clone();
                    drop(entries);
                    // The reservation holder resolves the slot or reports
                    // why it could not; waiters never retry the backend.
                    if rx.changed().await.is_err() {
                        return Err(ApiError::Other(anyhow!("live feed setup aborted")));
                    }
                    let failed = rx.borrow().clone();
                    if let Some(reason) = failed {
                        return Err(ApiError::Other(anyhow!(
                            "live feed setup failed: {reason}"
                        )));
                    }
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    entries.insert(key.clone(), Slot::Pending(rx));
                    break tx;
                }
            }
        };

        let feed = match (backend)(ctx.clone(), params.clone()).await {
            Ok(feed) => feed,
            Err(err) => {
                self.inner.entries.lock().await.remove(&key);
                let _ = notify.send(Some(err.to_string()));
                return Err(err);
            }
        };

        let channel = ChannelReference::new(
            ctx.api.service(),
            ctx.path.clone(),
            format!("live_{key}"),
        );
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // The forwarder must not publish before the entry is visible, or a
        // zero-subscriber teardown could miss it.
        let (ready_tx, ready_rx) = oneshot::channel();
        let forward = tokio::spawn(forward_events(
            Arc::downgrade(&self.inner),
            key.clone(),
            generation,
            ctx.clone(),
            channel.clone(),
            mapper,
            feed.events,
            ready_rx,
        ))
        .abort_handle();

        {
            let mut entries = self.inner.entries.lock().await;
            entries.insert(
                key.clone(),
                Slot::Ready(Entry {
                    channel: channel.clone(),
                    feed: feed.handle,
                    forward,
                    last_used: Instant::now(),
                    generation,
                }),
            );
        }
        let _ = ready_tx.send(());
        let _ = notify.send(None);

        debug!(channel = %channel, "live query feed opened");
        Ok(channel)
    }

    fn ensure_sweeper(&self, ctx: &NodeContext) {
        let _ = self.inner.api.set(ctx.api.downgrade());
        if !self.inner.sweeper_started.swap(true, Ordering::SeqCst) {
            tokio::spawn(sweep_loop(Arc::downgrade(&self.inner)));
        }
    }
}

impl LiveState {
    /// Removes the entry only if it is still the same generation; a key
    /// reused by a newer feed must not be torn down by a stale task.
    async fn remove_if(&self, key: &str, generation: u64) -> Option<Entry> {
        let mut entries = self.entries.lock().await;
        let current = matches!(
            entries.get(key),
            Some(Slot::Ready(entry)) if entry.generation == generation
        );
        if !current {
            return None;
        }
        match entries.remove(key) {
            Some(Slot::Ready(entry)) => Some(entry),
            _ => None,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn forward_events(
    state: Weak<LiveState>,
    key: String,
    generation: u64,
    ctx: NodeContext,
    channel: ChannelReference,
    mapper: Option<LiveMapper>,
    mut events: mpsc::Receiver<ChangeEvent>,
    ready: oneshot::Receiver<()>,
) {
    if ready.await.is_err() {
        return;
    }
    while let Some(event) = events.recv().await {
        let record = match &mapper {
            Some(map) => map(event.record, event.op),
            None => event.record,
        };
        let message = json!({
            "op": event.op.as_str(),
            "record": record,
            "position": event.position,
        });
        match ctx.api.publish(&channel, message).await {
            Ok(0) => {
                // Nobody is listening; tear the feed down right away
                // instead of waiting for the sweep.
                if let Some(state) = state.upgrade() {
                    if let Some(entry) = state.remove_if(&key, generation).await {
                        entry.feed.unsubscribe().await;
                        debug!(channel = %channel, "live channel lost all subscribers");
                    }
                }
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(channel = %channel, error = %err, "live publish failed");
            }
        }
    }
}

async fn sweep_loop(state: Weak<LiveState>) {
    let Some(period) = state.upgrade().map(|s| s.gc_interval) else {
        return;
    };
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(state) = state.upgrade() else {
            return;
        };
        let Some(api) = state.api.get().and_then(|weak| weak.upgrade()) else {
            return;
        };
        let now = Instant::now();
        let candidates: Vec<(String, ChannelReference, u64)> = {
            let entries = state.entries.lock().await;
            entries
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(entry)
                        if now.duration_since(entry.last_used) >= state.idle_threshold =>
                    {
                        Some((key.clone(), entry.channel.clone(), entry.generation))
                    }
                    _ => None,
                })
                .collect()
        };
        for (key, channel, generation) in candidates {
            match api.subscribers(&channel).await {
                Ok(0) => {
                    if let Some(entry) = state.remove_if(&key, generation).await {
                        entry.forward.abort();
                        entry.feed.unsubscribe().await;
                        debug!(channel = %channel, "evicted idle live channel");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(channel = %channel, error = %err, "subscriber probe failed");
                }
            }
        }
    }
}

/// Hex SHA-256 over scope, endpoint path and canonical params JSON.
/// `serde_json` maps are key-ordered, so equal params always serialize
/// identically.
fn cache_key(scope: &str, path: &str, params: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope.as_bytes());
    hasher.update(b":");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    hasher.update(serde_json::to_string(params).unwrap_or_default().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cache_key_is_deterministic() {
        let a = cache_key("live", "/users", &json!({"where": {"a": 1}, "limit": 10}));
        let b = cache_key("live", "/users", &json!({"limit": 10, "where": {"a": 1}}));
        assert_eq!(a, b);
    }

    #[test]
    fn cache_key_separates_path_scope_and_params() {
        let base = cache_key("live", "/users", &json!({"limit": 10}));
        assert_ne!(base, cache_key("live", "/groups", &json!({"limit": 10})));
        assert_ne!(base, cache_key("map", "/users", &json!({"limit": 10})));
        assert_ne!(base, cache_key("live", "/users", &json!({"limit": 11})));
    }
}
