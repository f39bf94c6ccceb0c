//! Broker-facing client and the dispatch engine.
//!
//! [`ApiClient`] is what a service owns: it mounts endpoint factories on
//! the root, accepts a [`Connection`] to the broker, and feeds inbound
//! calls/messages into the tree. [`ApiHandle`] is the cheap-clone context
//! every node and resolver holds; it carries the service name, the
//! connection slot and the local subscription tables.
//!
//! Dispatch is a strictly sequential left fold over the non-empty path
//! segments, fail-fast, ending in a method invocation on the final node.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::debug;

use crate::endpoint::{BoxFuture, DescriptorMeta, PropertyHandler, Root};
use crate::error::{ApiError, ApiResult};
use crate::types::{split_path, ApiReference, ChannelReference};

/// Broker contract: the only surface the framework needs from a transport.
/// `publish` reports how many subscribers received the message, which the
/// live cache uses for teardown.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn call(
        &self,
        service: &str,
        path: &str,
        method: &str,
        params: Value,
    ) -> ApiResult<Value>;

    async fn subscribe(&self, channel: &ChannelReference) -> ApiResult<()>;
    async fn unsubscribe(&self, channel: &ChannelReference) -> ApiResult<()>;
    async fn publish(&self, channel: &ChannelReference, message: Value) -> ApiResult<u64>;
    async fn subscribers(&self, channel: &ChannelReference) -> ApiResult<u64>;

    async fn subscribe_queue(&self, queue: &str) -> ApiResult<()>;
    async fn unsubscribe_queue(&self, queue: &str) -> ApiResult<()>;
    async fn enqueue(&self, queue: &str, message: Value) -> ApiResult<()>;
}

/// Channel message callback; invoked inline from [`ApiHandle::handle_message`].
pub type MessageCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Queue consumer callback; its result answers the queue delivery.
pub type QueueCallback = Arc<dyn Fn(&str, Value) -> BoxFuture<ApiResult<Value>> + Send + Sync>;

/// Removable channel subscription returned by [`ApiHandle::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    pub channel: ChannelReference,
    id: u64,
}

struct Shared {
    service: String,
    root: Root,
    connection: RwLock<Option<Arc<dyn Connection>>>,
    subscriptions: RwLock<BTreeMap<String, Vec<(u64, MessageCallback)>>>,
    queue_subscriptions: RwLock<BTreeMap<String, QueueCallback>>,
    next_subscription: AtomicU64,
}

/// Shared service context handed to every endpoint node.
#[derive(Clone)]
pub struct ApiHandle {
    inner: Arc<Shared>,
}

pub(crate) struct WeakApiHandle {
    inner: Weak<Shared>,
}

impl WeakApiHandle {
    pub(crate) fn upgrade(&self) -> Option<ApiHandle> {
        self.inner.upgrade().map(|inner| ApiHandle { inner })
    }
}

impl ApiHandle {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Shared {
                service: service.into(),
                root: Root::new(),
                connection: RwLock::new(None),
                subscriptions: RwLock::new(BTreeMap::new()),
                queue_subscriptions: RwLock::new(BTreeMap::new()),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub(crate) fn downgrade(&self) -> WeakApiHandle {
        WeakApiHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub async fn connect(&self, connection: Arc<dyn Connection>) {
        *self.inner.connection.write().await = Some(connection);
    }

    pub async fn disconnect(&self) {
        *self.inner.connection.write().await = None;
    }

    async fn connection(&self) -> ApiResult<Arc<dyn Connection>> {
        self.inner
            .connection
            .read()
            .await
            .clone()
            .ok_or(ApiError::NotConnected)
    }

    /// Mounts a top-level endpoint factory on the root.
    pub async fn endpoint(&self, name: impl Into<String>, handler: PropertyHandler) {
        self.inner
            .root
            .add_property(name, DescriptorMeta::new(), handler)
            .await;
    }

    pub async fn endpoint_with_meta(
        &self,
        name: impl Into<String>,
        meta: DescriptorMeta,
        handler: PropertyHandler,
    ) {
        self.inner.root.add_property(name, meta, handler).await;
    }

    /// Inbound call dispatch: walk the path from the root, then invoke.
    ///
    /// A resolution miss anywhere along the walk reports the caller's full
    /// path, not the partially resolved one.
    pub async fn handle_call(&self, path: &str, method: &str, params: Value) -> ApiResult<Value> {
        debug!(path = %path, method = %method, "dispatching call");
        let mut node = self.inner.root.node(self.clone()).await;
        for segment in split_path(path) {
            node = match node.resolve_property(segment).await {
                Ok(node) => node,
                Err(ApiError::EndpointNotFound { .. }) => {
                    return Err(ApiError::EndpointNotFound {
                        path: path.to_string(),
                    })
                }
                Err(err) => return Err(err),
            };
        }
        node.invoke_method(method, params).await
    }

    /// Inbound channel message fan-out to local subscription callbacks.
    pub async fn handle_message(&self, channel: &str, message: &Value) {
        let callbacks: Vec<MessageCallback> = {
            let table = self.inner.subscriptions.read().await;
            match table.get(channel) {
                Some(list) => list.iter().map(|(_, cb)| cb.clone()).collect(),
                None => return,
            }
        };
        for callback in callbacks {
            callback(channel, message);
        }
    }

    /// Inbound queue delivery; resolves to the consumer's result, or null
    /// when no consumer is registered.
    pub async fn handle_queue_message(&self, queue: &str, message: Value) -> ApiResult<Value> {
        let callback = {
            self.inner
                .queue_subscriptions
                .read()
                .await
                .get(queue)
                .cloned()
        };
        match callback {
            Some(callback) => callback(queue, message).await,
            None => Ok(Value::Null),
        }
    }

    /// Outbound RPC through the broker.
    pub async fn call(
        &self,
        service: &str,
        path: &str,
        method: &str,
        params: Value,
    ) -> ApiResult<Value> {
        let connection = self.connection().await?;
        connection.call(service, path, method, params).await
    }

    /// Outbound RPC addressed by reference string; a method embedded in the
    /// reference wins over `default_method`.
    pub async fn call_uri(
        &self,
        uri: &str,
        default_method: &str,
        params: Value,
    ) -> ApiResult<Value> {
        let reference: ApiReference = uri.parse()?;
        let method = reference.method.as_deref().unwrap_or(default_method);
        self.call(&reference.service, &reference.path, method, params)
            .await
    }

    /// Subscribes a callback to a channel; the broker subscription is
    /// opened for the first callback only.
    pub async fn subscribe<F>(
        &self,
        channel: &ChannelReference,
        callback: F,
    ) -> ApiResult<Subscription>
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        let connection = self.connection().await?;
        let key = channel.to_string();
        // The whole bookkeeping happens under one write lock; a concurrent
        // first subscribe to the same channel must not reach the broker twice.
        let mut table = self.inner.subscriptions.write().await;
        if !table.contains_key(&key) {
            connection.subscribe(channel).await?;
        }
        let id = self.inner.next_subscription.fetch_add(1, Ordering::SeqCst);
        table.entry(key).or_default().push((id, Arc::new(callback)));
        Ok(Subscription {
            channel: channel.clone(),
            id,
        })
    }

    /// Removes one callback from its channel's callback list. The broker
    /// subscription is closed only when the last callback goes; other
    /// channels are never touched.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> ApiResult<bool> {
        let connection = self.connection().await?;
        let key = subscription.channel.to_string();
        let removed_last = {
            let mut table = self.inner.subscriptions.write().await;
            let Some(callbacks) = table.get_mut(&key) else {
                return Ok(false);
            };
            let before = callbacks.len();
            callbacks.retain(|(id, _)| *id != subscription.id);
            if callbacks.len() == before {
                return Ok(false);
            }
            if callbacks.is_empty() {
                table.remove(&key);
                true
            } else {
                false
            }
        };
        if removed_last {
            connection.unsubscribe(&subscription.channel).await?;
        }
        Ok(true)
    }

    pub async fn publish(&self, channel: &ChannelReference, message: Value) -> ApiResult<u64> {
        let connection = self.connection().await?;
        connection.publish(channel, message).await
    }

    pub async fn subscribers(&self, channel: &ChannelReference) -> ApiResult<u64> {
        let connection = self.connection().await?;
        connection.subscribers(channel).await
    }

    /// Registers the queue consumer; queues are single-consumer per client.
    pub async fn subscribe_queue<F, Fut>(&self, queue: &str, callback: F) -> ApiResult<()>
    where
        F: Fn(&str, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ApiResult<Value>> + Send + 'static,
    {
        let connection = self.connection().await?;
        {
            let table = self.inner.queue_subscriptions.read().await;
            if table.contains_key(queue) {
                return Err(ApiError::QueueBusy(queue.to_string()));
            }
        }
        connection.subscribe_queue(queue).await?;
        self.inner.queue_subscriptions.write().await.insert(
            queue.to_string(),
            Arc::new(move |queue, message| Box::pin(callback(queue, message))),
        );
        Ok(())
    }

    pub async fn unsubscribe_queue(&self, queue: &str) -> ApiResult<bool> {
        let connection = self.connection().await?;
        if !self
            .inner
            .queue_subscriptions
            .read()
            .await
            .contains_key(queue)
        {
            return Ok(false);
        }
        connection.unsubscribe_queue(queue).await?;
        self.inner.queue_subscriptions.write().await.remove(queue);
        Ok(true)
    }

    pub async fn enqueue(&self, queue: &str, message: Value) -> ApiResult<()> {
        let connection = self.connection().await?;
        connection.enqueue(queue, message).await
    }
}

/// A service's API client: the owning entry point around an [`ApiHandle`].
pub struct ApiClient {
    handle: ApiHandle,
}

impl ApiClient {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            handle: ApiHandle::new(service),
        }
    }

    pub fn handle(&self) -> &ApiHandle {
        &self.handle
    }

    pub fn service(&self) -> &str {
        self.handle.service()
    }

    pub async fn connect(&self, connection: Arc<dyn Connection>) {
        self.handle.connect(connection).await;
    }

    pub async fn disconnect(&self) {
        self.handle.disconnect().await;
    }

    pub async fn endpoint(&self, name: impl Into<String>, handler: PropertyHandler) {
        self.handle.endpoint(name, handler).await;
    }

    pub async fn handle_call(&self, path: &str, method: &str, params: Value) -> ApiResult<Value> {
        self.handle.handle_call(path, method, params).await
    }

    pub async fn handle_message(&self, channel: &str, message: &Value) {
        self.handle.handle_message(channel, message).await;
    }

    pub async fn handle_queue_message(&self, queue: &str, message: Value) -> ApiResult<Value> {
        self.handle.handle_queue_message(queue, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct MockConnection {
        subscribed: Mutex<Vec<String>>,
        unsubscribed: Mutex<Vec<String>>,
        subscribe_delay: Duration,
    }

    #[async_trait]
    impl Connection for MockConnection {
        async fn call(&self, _: &str, _: &str, _: &str, _: Value) -> ApiResult<Value> {
            Ok(Value::Null)
        }
        async fn subscribe(&self, channel: &ChannelReference) -> ApiResult<()> {
            tokio::time::sleep(self.subscribe_delay).await;
            self.subscribed.lock().unwrap().push(channel.to_string());
            Ok(())
        }
        async fn unsubscribe(&self, channel: &ChannelReference) -> ApiResult<()> {
            self.unsubscribed.lock().unwrap().push(channel.to_string());
            Ok(())
        }
        async fn publish(&self, _: &ChannelReference, _: Value) -> ApiResult<u64> {
            Ok(1)
        }
        async fn subscribers(&self, _: &ChannelReference) -> ApiResult<u64> {
            Ok(0)
        }
        async fn subscribe_queue(&self, _: &str) -> ApiResult<()> {
            Ok(())
        }
        async fn unsubscribe_queue(&self, _: &str) -> ApiResult<()> {
            Ok(())
        }
        async fn enqueue(&self, _: &str, _: Value) -> ApiResult<()> {
            Ok(())
        }
    }

    fn channel(path: &str, id: &str) -> ChannelReference {
        ChannelReference::new("test", path, id)
    }

    #[tokio::test]
    async fn operations_fail_before_connect() {
        let api = ApiHandle::new("test");
        let err = api.call("other", "/x", "get", json!({})).await.unwrap_err();
        assert!(matches!(err, ApiError::NotConnected));
        let err = api
            .subscribe(&channel("/x", "c"), |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotConnected));
    }

    #[tokio::test]
    async fn unsubscribe_only_touches_its_own_channel() {
        let api = ApiHandle::new("test");
        let conn = Arc::new(MockConnection::default());
        api.connect(conn.clone()).await;

        let a = api.subscribe(&channel("/a", "c"), |_, _| {}).await.unwrap();
        let b = api.subscribe(&channel("/b", "c"), |_, _| {}).await.unwrap();

        assert!(api.unsubscribe(&a).await.unwrap());
        assert_eq!(
            conn.unsubscribed.lock().unwrap().as_slice(),
            &[a.channel.to_string()]
        );

        // The other channel's callback list is intact.
        let seen = Arc::new(Mutex::new(0));
        drop(b);
        let b_key = channel("/b", "c").to_string();
        {
            let seen = seen.clone();
            let _sub = api
                .subscribe(&channel("/b", "c"), move |_, _| {
                    *seen.lock().unwrap() += 1;
                })
                .await
                .unwrap();
            api.handle_message(&b_key, &json!({"x": 1})).await;
        }
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_first_subscribes_reach_broker_once() {
        let api = ApiHandle::new("test");
        let conn = Arc::new(MockConnection {
            subscribe_delay: Duration::from_millis(20),
            ..Default::default()
        });
        api.connect(conn.clone()).await;

        let ch = channel("/a", "c");
        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let api = api.clone();
                let ch = ch.clone();
                tokio::spawn(async move { api.subscribe(&ch, |_, _| {}).await })
            })
            .collect();
        let mut subscriptions = Vec::new();
        for task in tasks {
            subscriptions.push(task.await.unwrap().unwrap());
        }
        assert_eq!(conn.subscribed.lock().unwrap().len(), 1);

        // Both callers still hold removable subscriptions; the broker
        // unsubscribe goes out with the last one.
        for subscription in &subscriptions {
            assert!(api.unsubscribe(subscription).await.unwrap());
        }
        assert_eq!(conn.unsubscribed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn broker_unsubscribe_waits_for_last_callback() {
        let api = ApiHandle::new("test");
        let conn = Arc::new(MockConnection::default());
        api.connect(conn.clone()).await;

        let ch = channel("/a", "c");
        let first = api.subscribe(&ch, |_, _| {}).await.unwrap();
        let second = api.subscribe(&ch, |_, _| {}).await.unwrap();
        // Only the first subscribe reached the broker.
        assert_eq!(conn.subscribed.lock().unwrap().len(), 1);

        assert!(api.unsubscribe(&first).await.unwrap());
        assert!(conn.unsubscribed.lock().unwrap().is_empty());
        assert!(api.unsubscribe(&second).await.unwrap());
        assert_eq!(conn.unsubscribed.lock().unwrap().len(), 1);

        // Unknown subscription is a no-op.
        assert!(!api.unsubscribe(&second).await.unwrap());
    }

    #[tokio::test]
    async fn queue_subscription_is_exclusive() {
        let api = ApiHandle::new("test");
        api.connect(Arc::new(MockConnection::default())).await;

        api.subscribe_queue("jobs", |_, m| async move { Ok(m) })
            .await
            .unwrap();
        let err = api
            .subscribe_queue("jobs", |_, m| async move { Ok(m) })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::QueueBusy(q) if q == "jobs"));

        let out = api
            .handle_queue_message("jobs", json!({"task": 1}))
            .await
            .unwrap();
        assert_eq!(out, json!({"task": 1}));
        assert!(api.unsubscribe_queue("jobs").await.unwrap());
        assert_eq!(
            api.handle_queue_message("jobs", json!({})).await.unwrap(),
            Value::Null
        );
    }
}
