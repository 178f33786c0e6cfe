//! Raw broker contract
//!
//! `Connection` and `Channel` are written against these traits so the same
//! reconnect and flow-control logic runs over AMQP and over the in-memory
//! broker used in tests.

use crate::transport::{DeliveryStream, TransportResult};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// Notifications a live connection reports to its watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The broker stopped accepting publishes (resource alarm)
    Blocked { reason: String },
    Unblocked,
    /// The connection is gone and must be redialed
    Closed { reason: String },
}

/// Something that can open broker connections
#[async_trait]
pub trait Broker: Send + Sync {
    async fn dial(&self) -> TransportResult<Arc<dyn BrokerConnection>>;

    /// Human-readable address for log lines, without credentials
    fn describe(&self) -> String;
}

/// One live broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> TransportResult<Arc<dyn BrokerChannel>>;

    /// Hands out the event receiver; only the first caller gets it
    fn take_events(&self) -> Option<UnboundedReceiver<ConnectionEvent>>;

    async fn close(&self) -> TransportResult<()>;
}

/// One channel on a broker connection
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Limits unacknowledged deliveries per consumer on this channel
    async fn set_prefetch(&self, count: u16) -> TransportResult<()>;

    /// Declares a durable queue; declaring an existing queue is a no-op
    async fn declare_queue(&self, name: &str) -> TransportResult<()>;

    async fn publish(&self, queue: &str, payload: Vec<u8>, priority: u8) -> TransportResult<()>;

    async fn consume(&self, queue: &str) -> TransportResult<DeliveryStream>;

    /// False once the broker closed this channel, even if the connection lives on
    fn is_open(&self) -> bool;
}
