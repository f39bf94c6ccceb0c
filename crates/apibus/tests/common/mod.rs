#![allow(dead_code)]

//! Scripted in-memory broker shared by the integration suites. Calls are
//! routed to registered clients' dispatch engines; channel subscriber
//! counts are controlled by the test.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use apibus::client::{ApiClient, ApiHandle, Connection};
use apibus::error::{ApiError, ApiResult};
use apibus::types::ChannelReference;

#[derive(Default)]
pub struct MockBroker {
    clients: Mutex<HashMap<String, ApiHandle>>,
    subscribers: Mutex<HashMap<String, u64>>,
    queues: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<(String, String, String)>>,
    published: Mutex<Vec<(String, Value)>>,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers the client for routing and hands it a connection.
    pub async fn register(self: &Arc<Self>, client: &ApiClient) {
        self.clients
            .lock()
            .unwrap()
            .insert(client.service().to_string(), client.handle().clone());
        client
            .connect(Arc::new(MockConnection {
                broker: self.clone(),
                service: client.service().to_string(),
            }))
            .await;
    }

    /// Overrides the subscriber count reported for a channel.
    pub fn set_subscribers(&self, channel: &str, count: u64) {
        self.subscribers
            .lock()
            .unwrap()
            .insert(channel.to_string(), count);
    }

    pub fn subscriber_count(&self, channel: &str) -> u64 {
        self.subscribers
            .lock()
            .unwrap()
            .get(channel)
            .copied()
            .unwrap_or(0)
    }

    /// Call log as `(service, path, method)` triples.
    pub fn calls(&self) -> Vec<(String, String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, service: &str, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _, m)| s == service && m == method)
            .count()
    }

    pub fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().unwrap().clone()
    }

    fn client(&self, service: &str) -> Option<ApiHandle> {
        self.clients.lock().unwrap().get(service).cloned()
    }
}

pub struct MockConnection {
    broker: Arc<MockBroker>,
    service: String,
}

#[async_trait]
impl Connection for MockConnection {
    async fn call(
        &self,
        service: &str,
        path: &str,
        method: &str,
        params: Value,
    ) -> ApiResult<Value> {
        self.broker.calls.lock().unwrap().push((
            service.to_string(),
            path.to_string(),
            method.to_string(),
        ));
        let Some(target) = self.broker.client(service) else {
            return Err(ApiError::Other(anyhow::anyhow!(
                "unknown service '{service}'"
            )));
        };
        target.handle_call(path, method, params).await
    }

    async fn subscribe(&self, channel: &ChannelReference) -> ApiResult<()> {
        *self
            .broker
            .subscribers
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn unsubscribe(&self, channel: &ChannelReference) -> ApiResult<()> {
        let mut subscribers = self.broker.subscribers.lock().unwrap();
        if let Some(count) = subscribers.get_mut(&channel.to_string()) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }

    async fn publish(&self, channel: &ChannelReference, message: Value) -> ApiResult<u64> {
        let key = channel.to_string();
        let count = self.broker.subscriber_count(&key);
        self.broker
            .published
            .lock()
            .unwrap()
            .push((key.clone(), message.clone()));
        let targets: Vec<ApiHandle> =
            self.broker.clients.lock().unwrap().values().cloned().collect();
        for target in targets {
            target.handle_message(&key, &message).await;
        }
        Ok(count)
    }

    async fn subscribers(&self, channel: &ChannelReference) -> ApiResult<u64> {
        Ok(self.broker.subscriber_count(&channel.to_string()))
    }

    async fn subscribe_queue(&self, queue: &str) -> ApiResult<()> {
        self.broker.bind_queue(queue, &self.service);
        Ok(())
    }

    async fn unsubscribe_queue(&self, queue: &str) -> ApiResult<()> {
        self.broker.queues.lock().unwrap().remove(queue);
        Ok(())
    }

    async fn enqueue(&self, queue: &str, message: Value) -> ApiResult<()> {
        let target = self.broker.queues.lock().unwrap().get(queue).cloned();
        if let Some(service) = target {
            if let Some(handle) = self.broker.client(&service) {
                handle.handle_queue_message(queue, message).await?;
            }
        }
        Ok(())
    }
}

impl MockBroker {
    /// Binds a queue to the given service for `enqueue` routing.
    pub fn bind_queue(&self, queue: &str, service: &str) {
        self.queues
            .lock()
            .unwrap()
            .insert(queue.to_string(), service.to_string());
    }
}
