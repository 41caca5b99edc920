//! Message-bus client.
//!
//! A [`BusClient`] publishes to and consumes from named queues declared in
//! the pool configuration. Consumption is batched: up to `prefetch_count`
//! messages (or whatever arrived within `max_loop_duration`) are handed to
//! the handler at once, and the whole batch is settled with a single
//! cumulative ack. The AMQP implementation lives in [`RabbitBackend`]; an
//! in-memory backend backs the tests.

mod consumer;
mod memory;
mod rabbit;

pub use consumer::{BatchConsumer, HandlerError};
pub use memory::{AckRecord, MemoryBus};
pub use rabbit::RabbitBackend;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

const SOURCE: &str = "bus";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection failed: {message}")]
    Connect { message: String },
    #[error("publish to `{queue}` failed: {message}")]
    Publish { queue: String, message: String },
    #[error("consume from `{queue}` failed: {message}")]
    Consume { queue: String, message: String },
    #[error("queue `{name}` is not declared")]
    UnknownQueue { name: String },
    #[error("no message bus is registered")]
    NotConfigured,
    #[error("message handler failed: {0}")]
    Handler(#[source] HandlerError),
    #[error("malformed queue payload: {message}")]
    Payload { message: String },
}

impl BusError {
    pub(crate) fn payload(message: impl Into<String>) -> Self {
        Self::Payload {
            message: message.into(),
        }
    }
}

/// Declaration of one queue, mirroring the configuration file section.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    pub name: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub autodelete: bool,
    #[serde(default = "default_prefetch")]
    pub prefetch_count: u16,
    /// Exchange this queue binds to; empty for direct queue publishing.
    #[serde(default)]
    pub router: String,
    #[serde(default)]
    pub router_keys: Vec<String>,
}

fn default_prefetch() -> u16 {
    1
}

impl QueueSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            autodelete: false,
            prefetch_count: 1,
            router: String::new(),
            router_keys: Vec::new(),
        }
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    pub fn router(mut self, router: impl Into<String>, keys: Vec<String>) -> Self {
        self.router = router.into();
        self.router_keys = keys;
        self
    }
}

/// Declaration of one exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterSettings {
    pub name: String,
    /// `direct`, `fanout` or `topic`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub durable: bool,
    /// Declared as an `x-delayed-message` exchange; deliveries honour a
    /// per-message delay header.
    #[serde(default)]
    pub delayed: bool,
}

/// One received message.
#[derive(Debug, Clone)]
pub struct BusDelivery {
    pub tag: u64,
    pub body: Vec<u8>,
}

/// Wire seam: publishing and raw delivery streams.
#[async_trait]
pub trait BusBackend: Send + Sync {
    async fn publish(
        &self,
        queue: &QueueSettings,
        router: Option<&RouterSettings>,
        routing_key: &str,
        body: &[u8],
        delay: Option<Duration>,
    ) -> Result<(), BusError>;

    async fn open_source(
        &self,
        queue: &QueueSettings,
        router: Option<&RouterSettings>,
        consumer_name: &str,
    ) -> Result<Box<dyn BusSource>, BusError>;
}

/// A raw delivery stream for one queue.
#[async_trait]
pub trait BusSource: Send {
    /// Wait up to `wait` for the next delivery; `None` on timeout.
    async fn next(&mut self, wait: Duration) -> Result<Option<BusDelivery>, BusError>;

    /// Acknowledge every delivery up to and including `up_to_tag`.
    async fn ack_batch(&mut self, up_to_tag: u64) -> Result<(), BusError>;
}

/// Typed facade over one bus pool: queue registry plus backend.
#[derive(Clone)]
pub struct BusClient {
    pool_name: String,
    backend: Arc<dyn BusBackend>,
    queues: HashMap<String, QueueSettings>,
    routers: HashMap<String, RouterSettings>,
}

impl BusClient {
    pub fn new(
        pool_name: impl Into<String>,
        backend: Arc<dyn BusBackend>,
        queues: Vec<QueueSettings>,
        routers: Vec<RouterSettings>,
    ) -> Self {
        Self {
            pool_name: pool_name.into(),
            backend,
            queues: queues.into_iter().map(|q| (q.name.clone(), q)).collect(),
            routers: routers.into_iter().map(|r| (r.name.clone(), r)).collect(),
        }
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    fn queue(&self, name: &str) -> Result<&QueueSettings, BusError> {
        self.queues.get(name).ok_or_else(|| BusError::UnknownQueue {
            name: name.to_string(),
        })
    }

    fn router_for(&self, queue: &QueueSettings) -> Option<&RouterSettings> {
        if queue.router.is_empty() {
            None
        } else {
            self.routers.get(&queue.router)
        }
    }

    pub async fn publish(&self, queue_name: &str, body: &[u8]) -> Result<(), BusError> {
        let queue = self.queue(queue_name)?;
        let key = queue
            .router_keys
            .first()
            .map(String::as_str)
            .unwrap_or(&queue.name);
        debug!(target: SOURCE, pool = %self.pool_name, queue = queue_name, bytes = body.len(), "publish");
        self.backend
            .publish(queue, self.router_for(queue), key, body, None)
            .await
    }

    pub async fn publish_delayed(
        &self,
        queue_name: &str,
        body: &[u8],
        delay: Duration,
    ) -> Result<(), BusError> {
        let queue = self.queue(queue_name)?;
        let key = queue
            .router_keys
            .first()
            .map(String::as_str)
            .unwrap_or(&queue.name);
        self.backend
            .publish(queue, self.router_for(queue), key, body, Some(delay))
            .await
    }

    /// Open a batched consumer over `queue_name`.
    pub async fn consumer(
        &self,
        queue_name: &str,
        consumer_name: &str,
    ) -> Result<BatchConsumer, BusError> {
        let queue = self.queue(queue_name)?;
        let source = self
            .backend
            .open_source(queue, self.router_for(queue), consumer_name)
            .await?;
        Ok(BatchConsumer::new(
            queue.name.clone(),
            queue.prefetch_count,
            source,
        ))
    }
}
