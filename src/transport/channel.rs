//! Flow-controlled channels and named queues
//!
//! A [`Channel`] opens its broker channel lazily and reopens it after the
//! connection was redialed or the broker closed the channel on its own, so a
//! `Channel` (and every `Queue` on it) stays usable across reconnects.
//! Consumers are limited to [`PREFETCH`] unacknowledged deliveries, which is
//! what back-pressures the broker when a worker is slow.

use crate::transport::{
    BrokerChannel, Connection, Consumer, DeliveryStream, Publisher, TransportResult,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Unacknowledged deliveries allowed per consumer
pub const PREFETCH: u16 = 1;

struct OpenChannel {
    generation: u64,
    channel: Arc<dyn BrokerChannel>,
}

/// One publish/consume context on a [`Connection`]
pub struct Channel {
    connection: Connection,
    open: Mutex<Option<OpenChannel>>,
    declared: Mutex<Vec<String>>,
}

impl Channel {
    pub(crate) fn new(connection: Connection) -> Self {
        Self {
            connection,
            open: Mutex::new(None),
            declared: Mutex::new(Vec::new()),
        }
    }

    /// Declares `name` and returns a queue handle bound to this channel
    pub async fn queue(self: Arc<Self>, name: &str) -> TransportResult<Queue> {
        let raw = self.raw().await?;
        if let Err(e) = raw.declare_queue(name).await {
            self.discard(&raw).await;
            return Err(e);
        }

        let mut declared = self.declared.lock().await;
        if !declared.iter().any(|existing| existing == name) {
            declared.push(name.to_string());
        }
        drop(declared);

        tracing::debug!("Declared queue {}", name);

        Ok(Queue {
            channel: self,
            name: name.to_string(),
        })
    }

    /// Returns the broker channel for the current connection generation
    async fn raw(&self) -> TransportResult<Arc<dyn BrokerChannel>> {
        let (generation, connection) = self.connection.current().await?;

        let mut open = self.open.lock().await;
        if let Some(existing) = open.as_ref() {
            if existing.generation == generation && existing.channel.is_open() {
                return Ok(Arc::clone(&existing.channel));
            }
            tracing::debug!("Reopening channel on connection generation {}", generation);
        }

        let channel = connection.open_channel().await?;
        channel.set_prefetch(PREFETCH).await?;

        for name in self.declared.lock().await.iter() {
            channel.declare_queue(name).await?;
        }

        *open = Some(OpenChannel {
            generation,
            channel: Arc::clone(&channel),
        });
        Ok(channel)
    }

    /// Forgets `failed` so the next call opens a fresh broker channel
    ///
    /// A channel reopened by another caller in the meantime is kept.
    async fn discard(&self, failed: &Arc<dyn BrokerChannel>) {
        let mut open = self.open.lock().await;
        let current = open
            .as_ref()
            .is_some_and(|existing| same_channel(&existing.channel, failed));
        if current {
            tracing::debug!("Dropping failed channel");
            *open = None;
        }
    }
}

fn same_channel(a: &Arc<dyn BrokerChannel>, b: &Arc<dyn BrokerChannel>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// A named queue on a [`Channel`]
#[derive(Clone)]
pub struct Queue {
    channel: Arc<Channel>,
    name: String,
}

impl Queue {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The connection this queue's channel lives on
    pub fn connection(&self) -> &Connection {
        &self.channel.connection
    }
}

#[async_trait]
impl Publisher for Queue {
    async fn publish(&self, payload: Vec<u8>, priority: u8) -> TransportResult<()> {
        let channel = self.channel.raw().await?;
        let result = channel.publish(&self.name, payload, priority).await;
        if result.is_err() {
            self.channel.discard(&channel).await;
        }
        result
    }
}

#[async_trait]
impl Consumer for Queue {
    async fn consume(&self, cancel: &CancellationToken) -> TransportResult<DeliveryStream> {
        let channel = self.channel.raw().await?;
        let deliveries = match channel.consume(&self.name).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                self.channel.discard(&channel).await;
                return Err(e);
            }
        };

        tracing::debug!("Consuming from {}", self.name);

        let cancel = cancel.clone();
        Ok(deliveries
            .take_until(async move { cancel.cancelled().await })
            .boxed())
    }
}
