//! Work queue transport
//!
//! Layers, bottom up:
//! - `broker`: the raw broker contract (dial, channels, queues, deliveries)
//!   with an AMQP implementation and an in-memory one
//! - `Connection`: one live broker connection plus a watcher that redials
//!   after the broker drops it
//! - `Channel`/`Queue`: a flow-controlled (prefetch 1) publish/consume context
//! - `PublisherFactory`: a dedicated connection per publisher, closed when the
//!   owner cancels
//!
//! Nothing in here knows about crawling; payloads are opaque bytes.

mod amqp;
mod broker;
mod channel;
mod connection;
#[cfg(any(test, feature = "mock"))]
mod memory;
mod publisher;

pub use amqp::{AmqpBroker, MAX_PRIORITY};
pub use broker::{Broker, BrokerChannel, BrokerConnection, ConnectionEvent};
pub use channel::{Channel, Queue, PREFETCH};
pub use connection::{Connection, ReconnectSettings};
#[cfg(any(test, feature = "mock"))]
pub use memory::{MemoryBroker, PublishedMessage};
pub use publisher::PublisherFactory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors raised by the transport layer
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to broker: {0}")]
    Dial(String),

    #[error("Failed to open channel: {0}")]
    Channel(String),

    #[error("Failed to publish: {0}")]
    Publish(String),

    #[error("Failed to consume: {0}")]
    Consume(String),

    #[error("Failed to acknowledge delivery: {0}")]
    Ack(String),

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Broker connection lost after {attempts} reconnect attempts")]
    ConnectionLost { attempts: u32 },
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Stream of deliveries from one subscription
///
/// The stream ends when the consuming context is cancelled or the underlying
/// channel goes away. It cannot be restarted; subscribe again instead.
pub type DeliveryStream = BoxStream<'static, TransportResult<Delivery>>;

/// Settles one delivery with the broker
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> TransportResult<()>;
    async fn nack(&self, requeue: bool) -> TransportResult<()>;
}

/// A message received from a queue
///
/// Until it is acked or nacked the delivery occupies the consumer's single
/// prefetch slot.
pub struct Delivery {
    body: Vec<u8>,
    redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, redelivered: bool, acker: Box<dyn Acker>) -> Self {
        Self {
            body,
            redelivered,
            acker,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// True when the broker delivered this message before
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Acknowledges the delivery, removing it from the queue
    pub async fn ack(self) -> TransportResult<()> {
        self.acker.ack().await
    }

    /// Rejects the delivery, optionally putting it back on the queue
    pub async fn nack(self, requeue: bool) -> TransportResult<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Publishes payloads onto a named queue
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes one message; failures are returned, never retried here
    async fn publish(&self, payload: Vec<u8>, priority: u8) -> TransportResult<()>;
}

/// Subscribes to a named queue
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Starts a subscription that ends when `cancel` fires
    async fn consume(&self, cancel: &CancellationToken) -> TransportResult<DeliveryStream>;
}
